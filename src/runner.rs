//! The optimization runner: the process that drives the search engine of
//! one job.
//!
//! The runner reads the start request the orchestrator persisted, runs the
//! engine it names against the job's worker pool and publishes every
//! progress update on the orchestrator's response queue. Whatever happens,
//! the job ends with exactly one final message, after which the workers are
//! sent home and the job's queues deleted.

use std::sync::Arc;

use async_trait::async_trait;
use rand::{rngs::StdRng, SeedableRng};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
  broker::{publish_json, Broker},
  codec::Encoding,
  config::{JobQueues, Settings},
  diversity::DiversityGuard,
  error::{ConfigError, Error, ReportError},
  evaluation::{EvaluationClient, Evaluator},
  optimizer::{nsga::Nsga2, simplex::NelderMead, Optimizer, Report, Reporter},
  protocol::{
    JobId, JobRequest, Method, OptimizationSpec, Progress, ProgressMessage,
    Sentinel, Solution, StatusCode,
  },
  scalarization::Scalarization,
  termination::GenerationTerminator,
  variation::Variation,
};

/// How a run ended. Either way its final message has been published.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
  Succeeded,
  Failed,
}

/// Publishes reports as progress messages, decoding every candidate back
/// into the objects it stands for.
pub struct BrokerReporter<'a> {
  broker: &'a dyn Broker,
  queue: &'a str,
  job_id: &'a str,
  encoding: &'a Encoding,
}

impl<'a> BrokerReporter<'a> {
  pub fn new(
    broker: &'a dyn Broker,
    queue: &'a str,
    job_id: &'a str,
    encoding: &'a Encoding,
  ) -> Self {
    Self {
      broker,
      queue,
      job_id,
      encoding,
    }
  }

  fn message(&self, report: Report) -> Result<ProgressMessage, ReportError> {
    let mut solutions = report.prior;
    for candidate in report.candidates {
      solutions.push(Solution {
        id: candidate
          .id
          .unwrap_or_else(|| Uuid::new_v4().to_string()),
        objects: self.encoding.decode(&candidate.variables)?,
        fitness: candidate.fitness,
        variables: candidate.variables,
        locally_optimized: candidate.locally_optimized,
      });
    }
    Ok(ProgressMessage {
      optimization_id: self.job_id.to_string(),
      status_code: StatusCode::OK,
      message: String::new(),
      progress: report.progress,
      solutions,
    })
  }
}

#[async_trait]
impl Reporter for BrokerReporter<'_> {
  async fn report(&mut self, report: Report) -> Result<(), ReportError> {
    let message = self.message(report)?;
    publish_json(self.broker, self.queue, &message).await
  }
}

/// Reads the start request persisted for `job_id`.
pub async fn load_request(
  settings: &Settings,
  job_id: &str,
) -> Result<OptimizationSpec, Error> {
  let path = settings.runner_model_path(job_id);
  info!(path = %path.display(), "reading job request");
  let raw = tokio::fs::read(&path).await?;
  let request: JobRequest =
    serde_json::from_slice(&raw).map_err(ConfigError::from)?;
  match request {
    JobRequest::OptimizationStart { optimization, .. } => {
      optimization.validate()?;
      Ok(optimization)
    }
    JobRequest::OptimizationStop { .. } => Err(
      ConfigError::UnknownType("optimization_stop".to_string()).into(),
    ),
  }
}

async fn optimize(
  spec: &OptimizationSpec,
  evaluator: &dyn Evaluator,
  reporter: &mut dyn Reporter,
  bounds: Vec<crate::codec::BoundSpec>,
  initial: Vec<f64>,
) -> Result<(), Error> {
  let p = &spec.parameters;
  match p.method {
    Method::Ga => {
      let rng = match p.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
      };
      let diversity = p
        .diversity_flg
        .then(|| DiversityGuard::for_population(p.ncls, p.qbound, p.pop_size));
      Nsga2::builder()
        .bounds(bounds)
        .weights(spec.weights())
        .pop_size(p.pop_size)
        .variation(Variation {
          cxpb: p.cxpb,
          mutpb: p.mutpb,
          eta: p.eta,
          indpb: p.indpb,
        })
        .terminator(GenerationTerminator::total(p.ngen))
        .iteration_total(p.ngen)
        .diversity(diversity)
        .report_frequency(p.report_frequency)
        .rng(rng)
        .build()
        .optimize(evaluator, reporter)
        .await?;
    }
    Method::Simplex => {
      NelderMead::builder()
        .initial(initial)
        .bounds(bounds)
        .scalarization(Scalarization::for_objectives(
          &spec.objectives,
          &spec.solutions,
        ))
        .maxf(p.maxf)
        .xtol(p.xtol)
        .ftol(p.ftol)
        .prior(spec.solutions.clone())
        .solution_id(p.initial_solution_id.clone())
        .build()
        .optimize(evaluator, reporter)
        .await?;
    }
  }
  Ok(())
}

async fn run(
  settings: &Settings,
  job_id: &str,
  broker: Arc<dyn Broker>,
  spec: &OptimizationSpec,
  queues: JobQueues,
) -> Result<(), Error> {
  let encoding = Encoding::encode(spec.template())?;
  info!(variables = encoding.len(), "encoded candidate template");
  let client = EvaluationClient::connect(
    broker.clone(),
    job_id.to_string(),
    queues,
    encoding.clone(),
    spec.objectives.len(),
  )
  .await?
  .with_failure_policy(spec.parameters.failure_policy, spec.penalty())
  .with_timeout(settings.evaluation_timeout());

  let mut reporter = BrokerReporter::new(
    broker.as_ref(),
    &settings.optimization_response_queue,
    job_id,
    &encoding,
  );
  optimize(
    spec,
    &client,
    &mut reporter,
    encoding.bounds().to_vec(),
    encoding.initial_values().to_vec(),
  )
  .await
}

/// Runs job `job_id` to its end. An `Err` means the failure could not even
/// be reported.
#[instrument(level = "info", skip(settings, broker))]
pub async fn run_job(
  settings: &Settings,
  job_id: &JobId,
  broker: Arc<dyn Broker>,
) -> Result<Outcome, Error> {
  let queues = settings.scoped_queues();
  // without a readable request, assume the largest pool to release
  let (workers, result) = match load_request(settings, job_id).await {
    Ok(spec) => (
      settings.workers_for(spec.parameters.method),
      run(settings, job_id, broker.clone(), &spec, queues.clone()).await,
    ),
    Err(err) => (settings.workers_for(Method::Ga), Err(err)),
  };

  let outcome = match result {
    Ok(()) => {
      info!("optimization finished");
      Outcome::Succeeded
    }
    Err(err) => {
      error!(%err, "optimization failed");
      let message = ProgressMessage {
        optimization_id: job_id.clone(),
        status_code: StatusCode::ERROR,
        message: err.to_string(),
        progress: Progress {
          is_final: true,
          ..Progress::default()
        },
        solutions: Vec::new(),
      };
      publish_json(
        broker.as_ref(),
        &settings.optimization_response_queue,
        &message,
      )
      .await?;
      Outcome::Failed
    }
  };

  for _ in 0..workers {
    if let Err(err) =
      publish_json(broker.as_ref(), &queues.request, &Sentinel::SHUTDOWN).await
    {
      warn!(%err, "failed to send shutdown sentinel");
      break;
    }
  }
  for queue in [&queues.request, &queues.response] {
    if let Err(err) = broker.delete_queue(queue).await {
      warn!(%err, %queue, "failed to delete queue");
    }
  }
  Ok(outcome)
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::{
    broker::memory::InMemoryBroker,
    optimizer::Candidate,
  };

  #[tokio::test]
  async fn test_reporter_decodes_candidates_after_prior() {
    let encoding = Encoding::encode(&[json!({
      "id": "well",
      "rate": {"min": 0.0, "max": 10.0},
    })])
    .unwrap();
    let broker = InMemoryBroker::new();
    broker.declare_queue("out").await.unwrap();
    let mut reporter = BrokerReporter::new(&broker, "out", "1", &encoding);
    let prior = Solution {
      id: "old".into(),
      fitness: vec![1.0],
      variables: vec![1.0],
      objects: vec![],
      locally_optimized: false,
    };
    let report = Report {
      progress: Progress::default(),
      prior: vec![prior.clone()],
      candidates: vec![Candidate {
        id: Some("new".into()),
        variables: vec![4.0],
        fitness: vec![2.0],
        locally_optimized: true,
      }],
    };
    let message = reporter.message(report.clone()).unwrap();
    assert_eq!(message.solutions[0], prior);
    assert_eq!(message.solutions[1].id, "new");
    assert_eq!(message.solutions[1].objects[0]["rate"]["result"], json!(4.0));
    reporter.report(report).await.unwrap();
    assert_eq!(broker.pending("out"), 1);
  }

  #[tokio::test]
  async fn test_missing_request_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
      host_temp_folder: dir.path().to_path_buf(),
      ..Settings::default()
    };
    let broker = Arc::new(InMemoryBroker::new());
    broker
      .declare_queue(&settings.optimization_response_queue)
      .await
      .unwrap();
    let outcome = run_job(&settings, &"2".to_string(), broker.clone())
      .await
      .unwrap();
    assert_eq!(outcome, Outcome::Failed);
    assert_eq!(broker.pending(&settings.optimization_response_queue), 1);
  }
}
