//! Nelder-Mead local search over a scalarized objective.
//!
//! The simplex itself is `argmin`'s. Its executor runs on a blocking thread
//! and hands every cost evaluation back to the async side, which evaluates
//! the point, keeps the evaluation budget and reports progress.

use std::collections::VecDeque;

use argmin::{
  core::{
    observers::{Observe, ObserverMode},
    CostFunction, Error as ArgminError, Executor, KV,
  },
  solver::neldermead::NelderMead as SimplexSolver,
};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::{
  codec::BoundSpec,
  error::Error,
  evaluation::Evaluator,
  individual::Individual,
  optimizer::{Candidate, Optimizer, Report, Reporter},
  protocol::{Progress, Solution},
  scalarization::Scalarization,
  score::Scores,
};

/// Relative step of the initial simplex along each axis.
const INITIAL_STEP: f64 = 0.05;
/// Step along an axis whose starting coordinate is zero.
const ZERO_STEP: f64 = 0.00025;

/// Nelder-Mead simplex search from a single starting point, kept inside the
/// bounds. Stops after `maxf` evaluations, once the simplex costs deviate
/// less than `ftol`, or once the last `n + 1` evaluated points lie within
/// `xtol` of each other in every coordinate and within `ftol` in scalar
/// fitness.
///
/// The reported result is the best point ever evaluated, by strict
/// improvement of the scalar, published alongside the `prior` solutions.
#[derive(TypedBuilder, Debug)]
pub struct NelderMead {
  initial: Vec<f64>,
  bounds: Vec<BoundSpec>,
  scalarization: Scalarization,
  #[builder(default = 50)]
  maxf: usize,
  #[builder(default = 1e-4)]
  xtol: f64,
  #[builder(default = 1e-4)]
  ftol: f64,
  /// Solutions of earlier runs, published with the result.
  #[builder(default)]
  prior: Vec<Solution>,
  /// Id of the result. A prior solution with the same id is replaced.
  #[builder(default)]
  solution_id: Option<String>,
}

/// Why a cost evaluation was refused. Ends the argmin run.
#[derive(Debug, Error)]
enum Halt {
  #[error("evaluation budget spent")]
  Budget,
  #[error("simplex converged")]
  Converged,
  #[error("evaluation failed")]
  Failed,
  #[error("search abandoned")]
  Abandoned,
}

enum Message {
  Evaluate(Vec<f64>, oneshot::Sender<Result<f64, Halt>>),
  Iteration,
}

fn clamp(x: &[f64], bounds: &[BoundSpec]) -> Vec<f64> {
  x.iter()
    .zip(bounds)
    .map(|(value, bound)| value.clamp(bound.lower, bound.upper))
    .collect()
}

/// Cost function seen by argmin: the scalar fitness of a point clamped into
/// bounds, computed by the async side.
struct Problem {
  bounds: Vec<BoundSpec>,
  requests: mpsc::Sender<Message>,
}

impl CostFunction for Problem {
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> Result<Self::Output, ArgminError> {
    let (reply, answer) = oneshot::channel();
    self
      .requests
      .blocking_send(Message::Evaluate(clamp(x, &self.bounds), reply))
      .map_err(|_| Halt::Abandoned)?;
    let scalar = answer.blocking_recv().map_err(|_| Halt::Abandoned)??;
    Ok(scalar)
  }
}

/// Signals the end of every simplex iteration.
struct Ticks(mpsc::Sender<Message>);

impl<I> Observe<I> for Ticks {
  fn observe_iter(&mut self, _state: &I, _kv: &KV) -> Result<(), ArgminError> {
    self
      .0
      .blocking_send(Message::Iteration)
      .map_err(|_| Halt::Abandoned)?;
    Ok(())
  }
}

#[derive(Clone, Debug)]
struct Best {
  scalar: f64,
  fitness: Scores,
  variables: Vec<f64>,
}

/// A point with its scalar fitness.
type Vertex = (Vec<f64>, f64);

struct Search<'e> {
  evaluator: &'e dyn Evaluator,
  scalarization: &'e Scalarization,
  maxf: usize,
  xtol: f64,
  ftol: f64,
  evaluations: usize,
  best: Option<Best>,
  recent: VecDeque<Vertex>,
  window: usize,
  converged: bool,
  failure: Option<Error>,
}

impl Search<'_> {
  /// Scalar fitness of `x`, or why the search must end instead.
  async fn eval(&mut self, x: Vec<f64>) -> Result<f64, Halt> {
    if self.failure.is_some() {
      return Err(Halt::Failed);
    }
    if self.converged {
      return Err(Halt::Converged);
    }
    if self.evaluations >= self.maxf {
      return Err(Halt::Budget);
    }
    let fitness = match self.evaluator.evaluate(&x).await {
      Ok(fitness) => fitness,
      Err(err) => {
        self.failure = Some(err.into());
        return Err(Halt::Failed);
      }
    };
    self.evaluations += 1;
    let scalar = self.scalarization.scalarize(&fitness);
    debug!(evaluations = self.evaluations, scalar, "evaluated point");

    if self.best.as_ref().map_or(true, |best| scalar < best.scalar) {
      self.best = Some(Best {
        scalar,
        fitness,
        variables: x.clone(),
      });
    }
    self.remember(x, scalar);
    Ok(scalar)
  }

  fn remember(&mut self, x: Vec<f64>, scalar: f64) {
    if self.recent.len() == self.window {
      self.recent.pop_front();
    }
    self.recent.push_back((x, scalar));
    if self.recent.len() < self.window {
      return;
    }
    let (x0, f0) = &self.recent[0];
    self.converged = self.recent.iter().all(|(x, f)| {
      (f - f0).abs() <= self.ftol
        && x.iter().zip(x0).all(|(a, b)| (a - b).abs() <= self.xtol)
    });
  }

  fn fail(&mut self, err: impl Into<Error>) {
    if self.failure.is_none() {
      self.failure = Some(err.into());
    }
  }
}

impl NelderMead {
  /// The starting point plus one point per axis, moved by [`INITIAL_STEP`].
  fn initial_simplex(&self) -> Vec<Vec<f64>> {
    let mut simplex = vec![self.initial.clone()];
    for (d, &x) in self.initial.iter().enumerate() {
      let mut point = self.initial.clone();
      point[d] = if x == 0.0 {
        ZERO_STEP
      } else {
        x * (1.0 + INITIAL_STEP)
      };
      simplex.push(point);
    }
    simplex
  }

  fn report(&self, id: &str, best: &Best, progress: Progress) -> Report {
    Report {
      progress,
      prior: self
        .prior
        .iter()
        .filter(|s| s.id != id)
        .cloned()
        .collect(),
      candidates: vec![Candidate {
        id: Some(id.to_string()),
        variables: best.variables.clone(),
        fitness: best.fitness.clone(),
        locally_optimized: true,
      }],
    }
  }

  fn progress(
    &self,
    search: &Search<'_>,
    log: &[f64],
    iteration: usize,
  ) -> Progress {
    Progress {
      progress_log: log.to_vec(),
      simulation: search.evaluations,
      simulation_total: self.maxf,
      iteration,
      iteration_total: self.maxf,
      is_final: false,
    }
  }
}

#[async_trait]
impl Optimizer for NelderMead {
  #[instrument(
    level = "info",
    skip_all,
    fields(dims = self.initial.len(), maxf = self.maxf)
  )]
  async fn optimize(
    self,
    evaluator: &dyn Evaluator,
    reporter: &mut dyn Reporter,
  ) -> Result<Vec<Individual>, Error> {
    let id = self
      .solution_id
      .clone()
      .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut search = Search {
      evaluator,
      scalarization: &self.scalarization,
      maxf: self.maxf.max(1),
      xtol: self.xtol,
      ftol: self.ftol,
      evaluations: 0,
      best: None,
      recent: VecDeque::new(),
      window: self.initial.len() + 1,
      converged: false,
      failure: None,
    };

    let mut log = Vec::new();
    let mut iteration = 0;
    if self.initial.is_empty() {
      // nothing to move, the starting point is the result
      let _ = search.eval(Vec::new()).await;
    } else {
      let solver: SimplexSolver<Vec<f64>, f64> =
        SimplexSolver::new(self.initial_simplex())
          .with_sd_tolerance(self.ftol)
          .map_err(|err| Error::Simplex(err.to_string()))?;
      let (requests, mut inbox) = mpsc::channel(1);
      let problem = Problem {
        bounds: self.bounds.clone(),
        requests: requests.clone(),
      };
      let ticks = Ticks(requests);
      let max_iters = self.maxf as u64;
      let run = tokio::task::spawn_blocking(move || {
        Executor::new(problem, solver)
          .configure(|state| state.max_iters(max_iters))
          .add_observer(ticks, ObserverMode::Always)
          .run()
          .map(|_| ())
      });

      // ends once the executor dropped both senders
      while let Some(message) = inbox.recv().await {
        match message {
          Message::Evaluate(x, reply) => {
            let answer = search.eval(x).await;
            let _ = reply.send(answer);
          }
          Message::Iteration => {
            iteration += 1;
            let Some(best) = search.best.as_ref() else {
              continue;
            };
            log.push(best.scalar);
            let report =
              self.report(&id, best, self.progress(&search, &log, iteration));
            if let Err(err) = reporter.report(report).await {
              search.fail(err);
            }
          }
        }
      }

      let finished =
        run.await.map_err(|err| Error::Simplex(err.to_string()))?;
      if let Some(err) = search.failure.take() {
        return Err(err);
      }
      let evaluations = search.evaluations;
      match finished {
        Ok(()) => info!(iteration, evaluations, "simplex search finished"),
        Err(err) => match err.downcast_ref::<Halt>() {
          Some(halt) => {
            info!(iteration, evaluations, %halt, "simplex search stopped")
          }
          None => return Err(Error::Simplex(err.to_string())),
        },
      }
    }

    if let Some(err) = search.failure.take() {
      return Err(err);
    }
    let best = search.best.clone().ok_or(Error::EmptyPopulation)?;
    log.push(best.scalar);
    let progress = Progress {
      is_final: true,
      ..self.progress(&search, &log, iteration + 1)
    };
    reporter.report(self.report(&id, &best, progress)).await?;
    info!(scalar = best.scalar, fitness = ?best.fitness, "local search done");

    let mut individual = Individual::new(best.variables);
    individual.set_fitness(best.fitness);
    Ok(vec![individual])
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

  use super::*;
  use crate::{error::EvalError, evaluation::LocalEvaluator};

  fn bounds(upper: f64) -> Vec<BoundSpec> {
    (0..2)
      .map(|index| BoundSpec {
        index,
        lower: 0.0,
        upper,
        integer: false,
      })
      .collect()
  }

  fn paraboloid(genes: &[f64]) -> Result<Vec<f64>, String> {
    Ok(vec![(genes[0] - 3.0).powi(2) + (genes[1] - 1.0).powi(2)])
  }

  fn prior(id: &str) -> Solution {
    Solution {
      id: id.into(),
      fitness: vec![9.0],
      variables: vec![0.0, 0.0],
      objects: vec![],
      locally_optimized: false,
    }
  }

  #[tokio::test]
  async fn test_finds_minimum() {
    let simplex = NelderMead::builder()
      .initial(vec![5.0, 5.0])
      .bounds(bounds(10.0))
      .scalarization(Scalarization::Linear { weights: vec![-1.0] })
      .maxf(300)
      .xtol(1e-6)
      .ftol(1e-8)
      .build();
    let mut reports: Vec<Report> = Vec::new();
    let best = simplex
      .optimize(&LocalEvaluator(paraboloid), &mut reports)
      .await
      .unwrap();

    let fitness = best[0].fitness().unwrap();
    assert!(fitness[0] < 1e-3, "fitness {fitness:?}");
    let last = reports.last().unwrap();
    assert!(last.progress.is_final);
    assert_eq!(reports.iter().filter(|r| r.progress.is_final).count(), 1);
    // best-so-far never gets worse
    assert!(last
      .progress
      .progress_log
      .windows(2)
      .all(|w| w[1] <= w[0]));
  }

  #[tokio::test]
  async fn test_respects_budget_and_bounds() {
    let calls = AtomicUsize::new(0);
    let evaluator = LocalEvaluator(|genes: &[f64]| -> Result<Vec<f64>, String> {
      calls.fetch_add(1, AtomicOrdering::SeqCst);
      assert!(genes.iter().all(|g| (0.0..=2.0).contains(g)));
      Ok(vec![-(genes[0] + genes[1])])
    });
    let simplex = NelderMead::builder()
      .initial(vec![1.0, 1.0])
      .bounds(bounds(2.0))
      .scalarization(Scalarization::Linear { weights: vec![-1.0] })
      .maxf(7)
      .build();
    let mut reports: Vec<Report> = Vec::new();
    simplex.optimize(&evaluator, &mut reports).await.unwrap();
    assert_eq!(calls.load(AtomicOrdering::SeqCst), 7);
    assert!(reports.last().unwrap().progress.is_final);
  }

  #[tokio::test]
  async fn test_result_replaces_initial_solution() {
    let simplex = NelderMead::builder()
      .initial(vec![5.0, 5.0])
      .bounds(bounds(10.0))
      .scalarization(Scalarization::Linear { weights: vec![-1.0] })
      .maxf(10)
      .prior(vec![prior("a"), prior("b")])
      .solution_id(Some("b".to_string()))
      .build();
    let mut reports: Vec<Report> = Vec::new();
    simplex
      .optimize(&LocalEvaluator(paraboloid), &mut reports)
      .await
      .unwrap();

    let last = reports.last().unwrap();
    let prior_ids: Vec<_> = last.prior.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(prior_ids, ["a"]);
    assert_eq!(last.candidates.len(), 1);
    assert_eq!(last.candidates[0].id.as_deref(), Some("b"));
    assert!(last.candidates[0].locally_optimized);
  }

  #[tokio::test]
  async fn test_new_solution_id_is_stable() {
    let simplex = NelderMead::builder()
      .initial(vec![5.0, 5.0])
      .bounds(bounds(10.0))
      .scalarization(Scalarization::Linear { weights: vec![-1.0] })
      .maxf(12)
      .build();
    let mut reports: Vec<Report> = Vec::new();
    simplex
      .optimize(&LocalEvaluator(paraboloid), &mut reports)
      .await
      .unwrap();
    let ids: Vec<_> = reports
      .iter()
      .map(|r| r.candidates[0].id.clone().unwrap())
      .collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
  }

  #[tokio::test]
  async fn test_failed_evaluation_ends_search() {
    let calls = AtomicUsize::new(0);
    let evaluator = LocalEvaluator(|genes: &[f64]| -> Result<Vec<f64>, String> {
      if calls.fetch_add(1, AtomicOrdering::SeqCst) == 4 {
        return Err("simulation crashed".to_string());
      }
      paraboloid(genes)
    });
    let simplex = NelderMead::builder()
      .initial(vec![5.0, 5.0])
      .bounds(bounds(10.0))
      .scalarization(Scalarization::Linear { weights: vec![-1.0] })
      .maxf(50)
      .build();
    let mut reports: Vec<Report> = Vec::new();
    let result = simplex.optimize(&evaluator, &mut reports).await;

    match result {
      Err(Error::Eval(EvalError::Worker { message })) => {
        assert_eq!(message, "simulation crashed")
      }
      other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(calls.load(AtomicOrdering::SeqCst), 5);
    assert!(reports.iter().all(|r| !r.progress.is_final));
  }
}
