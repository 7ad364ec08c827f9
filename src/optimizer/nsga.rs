//! NSGA-II over evaluations that may run anywhere.

use async_trait::async_trait;
use rand::{rngs::StdRng, SeedableRng};
use tracing::{info, instrument};
use typed_builder::TypedBuilder;

use crate::{
  archive::ParetoArchive,
  codec::BoundSpec,
  diversity::DiversityGuard,
  error::{Error, ReportError},
  evaluation::{BatchObserver, Evaluator},
  hypervolume::HypervolumeLog,
  individual::Individual,
  optimizer::{Candidate, Optimizer, Report, Reporter},
  protocol::Progress,
  selection::select_nsga2,
  termination::Terminator,
  variation::{random_genes, var_or, Variation},
};

/// NSGA-II with an optional cluster-based diversity guard.
///
/// Each generation breeds `pop_size` offspring with [`var_or`], evaluates
/// those whose genes changed, and keeps the `pop_size` best of parents and
/// offspring. Progress is reported once per generation, plus
/// `report_frequency` times per evaluation batch.
#[derive(TypedBuilder, Debug)]
pub struct Nsga2<Ter: Terminator + Send> {
  bounds: Vec<BoundSpec>,
  /// One weight per objective: positive maximizes, otherwise minimizes.
  weights: Vec<f64>,
  pop_size: usize,
  variation: Variation,
  terminator: Ter,
  /// Reported as `iteration_total`.
  iteration_total: usize,
  #[builder(default)]
  diversity: Option<DiversityGuard>,
  #[builder(default)]
  report_frequency: usize,
  #[builder(default = StdRng::from_entropy())]
  rng: StdRng,
}

/// Reports while a batch of generation `iteration` is being evaluated.
struct BatchProgress<'a> {
  reporter: &'a mut dyn Reporter,
  frequency: usize,
  progress: Progress,
  candidates: Vec<Candidate>,
}

#[async_trait]
impl BatchObserver for BatchProgress<'_> {
  async fn on_evaluated(&mut self, done: usize, total: usize) -> Result<(), ReportError> {
    if self.frequency == 0 || done % (total / self.frequency).max(1) != 0 {
      return Ok(());
    }
    let report = Report {
      progress: Progress {
        simulation: done,
        simulation_total: total,
        ..self.progress.clone()
      },
      prior: Vec::new(),
      candidates: self.candidates.clone(),
    };
    self.reporter.report(report).await
  }
}

fn candidates(archive: &ParetoArchive) -> Vec<Candidate> {
  archive
    .members()
    .iter()
    .filter_map(Candidate::from_individual)
    .collect()
}

/// Evaluates the individuals without a fitness. Returns the batch size.
async fn evaluate_invalid(
  population: &mut [Individual],
  evaluator: &dyn Evaluator,
  observer: &mut dyn BatchObserver,
) -> Result<usize, Error> {
  let invalid: Vec<usize> = population
    .iter()
    .enumerate()
    .filter(|(_, ind)| !ind.is_valid())
    .map(|(idx, _)| idx)
    .collect();
  let batch: Vec<Vec<f64>> = invalid
    .iter()
    .map(|&idx| population[idx].genes().to_vec())
    .collect();
  let scores = evaluator.evaluate_batch(&batch, observer).await?;
  for (idx, fitness) in invalid.into_iter().zip(scores) {
    population[idx].set_fitness(fitness);
  }
  Ok(batch.len())
}

impl<Ter: Terminator + Send> Nsga2<Ter> {
  fn batch_progress<'a>(
    &self,
    reporter: &'a mut dyn Reporter,
    iteration: usize,
    hypervolumes: &HypervolumeLog,
    archive: &ParetoArchive,
  ) -> BatchProgress<'a> {
    BatchProgress {
      reporter,
      frequency: self.report_frequency,
      progress: Progress {
        progress_log: hypervolumes.values().to_vec(),
        iteration,
        iteration_total: self.iteration_total,
        ..Progress::default()
      },
      candidates: candidates(archive),
    }
  }
}

#[async_trait]
impl<Ter: Terminator + Send> Optimizer for Nsga2<Ter> {
  #[instrument(level = "info", skip_all, fields(pop_size = self.pop_size))]
  async fn optimize(
    mut self,
    evaluator: &dyn Evaluator,
    reporter: &mut dyn Reporter,
  ) -> Result<Vec<Individual>, Error> {
    if self.pop_size == 0 {
      return Err(Error::EmptyPopulation);
    }
    let weights = self.weights.clone();
    let mut archive = ParetoArchive::new(weights.clone());
    let mut hypervolumes = HypervolumeLog::new(weights.clone());

    let mut population: Vec<Individual> = (0..self.pop_size)
      .map(|_| Individual::new(random_genes(&self.bounds, &mut self.rng)))
      .collect();
    let mut iteration = 0;
    let mut observer =
      self.batch_progress(reporter, iteration, &hypervolumes, &archive);
    let mut evaluated =
      evaluate_invalid(&mut population, evaluator, &mut observer).await?;
    // rank the whole population to annotate crowding distances
    let len = population.len();
    population = select_nsga2(population, len, &weights);

    loop {
      archive.update(&population);
      let hypervolume = hypervolumes.record(&population);
      info!(iteration, hypervolume, archived = archive.len(), "generation done");

      let last = self.terminator.terminate(&population);
      let report = Report {
        progress: Progress {
          progress_log: hypervolumes.values().to_vec(),
          simulation: evaluated,
          simulation_total: evaluated,
          iteration,
          iteration_total: self.iteration_total,
          is_final: last,
        },
        prior: Vec::new(),
        candidates: candidates(&archive),
      };
      reporter.report(report).await?;
      if last {
        break;
      }

      iteration += 1;
      let mut offspring = var_or(
        &population,
        self.pop_size,
        &self.variation,
        &self.bounds,
        &mut self.rng,
      );
      let mut observer =
        self.batch_progress(reporter, iteration, &hypervolumes, &archive);
      evaluated =
        evaluate_invalid(&mut offspring, evaluator, &mut observer).await?;

      let mut combined = population;
      combined.append(&mut offspring);
      population = match self.diversity.as_mut() {
        Some(guard) => guard.select(combined, self.pop_size, &weights),
        None => select_nsga2(combined, self.pop_size, &weights),
      };
    }

    Ok(archive.members().to_vec())
  }
}
