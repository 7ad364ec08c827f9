//! Search engines and the channel they report progress through.

use async_trait::async_trait;

use crate::{
  error::{Error, ReportError},
  evaluation::Evaluator,
  individual::Individual,
  protocol::{Progress, Solution},
  score::Scores,
};

pub mod nsga;
pub mod simplex;

/// A decision vector found by an engine, together with its fitness.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
  /// Id the candidate is published under. Engines that do not track
  /// identities leave it to the reporter.
  pub id: Option<String>,
  pub variables: Vec<f64>,
  pub fitness: Scores,
  pub locally_optimized: bool,
}

impl Candidate {
  /// Candidate from an evaluated individual. `None` if it has no fitness.
  pub fn from_individual(ind: &Individual) -> Option<Self> {
    Some(Self {
      id: None,
      variables: ind.genes().to_vec(),
      fitness: ind.fitness()?.to_vec(),
      locally_optimized: false,
    })
  }
}

/// One progress update of a run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Report {
  pub progress: Progress,
  /// Results carried over verbatim from the job request.
  pub prior: Vec<Solution>,
  /// Best results of the run so far.
  pub candidates: Vec<Candidate>,
}

/// Receives progress updates of a run. The last update of a successful run
/// has `progress.is_final` set.
#[async_trait]
pub trait Reporter: Send {
  async fn report(&mut self, report: Report) -> Result<(), ReportError>;
}

/// Keeps every report in memory.
#[async_trait]
impl Reporter for Vec<Report> {
  async fn report(&mut self, report: Report) -> Result<(), ReportError> {
    self.push(report);
    Ok(())
  }
}

/// Represents an abstract optimizer.
#[async_trait]
pub trait Optimizer: Sized + Send {
  /// Runs the optimizer until its termination condition is met, reporting
  /// progress along the way, then returns the best individuals found.
  async fn optimize(
    self,
    evaluator: &dyn Evaluator,
    reporter: &mut dyn Reporter,
  ) -> Result<Vec<Individual>, Error>;
}
