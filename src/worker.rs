//! Evaluation workers: consume evaluation requests of one job, run the
//! simulation and publish its fitness.

use std::{path::PathBuf, process::Stdio, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info, instrument, warn};

use crate::{
  broker::{publish_json, Broker},
  config::JobQueues,
  error::ReportError,
  protocol::{
    EvaluationRequest, EvaluationResponse, Sentinel, StatusCode, WorkerMessage,
  },
  score::Scores,
};

/// Computes the fitness of a materialized candidate.
#[async_trait]
pub trait Simulator: Send + Sync {
  /// Returns one value per objective, or a message explaining the failure.
  async fn simulate(&self, request: &EvaluationRequest) -> Result<Scores, String>;
}

#[async_trait]
impl<F> Simulator for F
where
  F: Fn(&EvaluationRequest) -> Result<Scores, String> + Send + Sync,
{
  async fn simulate(&self, request: &EvaluationRequest) -> Result<Scores, String> {
    self(request)
  }
}

/// Runs an external program per evaluation. The request goes to its stdin
/// as json, the fitness is read from its stdout as a json array.
#[derive(Clone, Debug)]
pub struct ProcessSimulator {
  program: PathBuf,
  args: Vec<String>,
}

impl ProcessSimulator {
  pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
    Self {
      program: program.into(),
      args,
    }
  }
}

#[async_trait]
impl Simulator for ProcessSimulator {
  async fn simulate(&self, request: &EvaluationRequest) -> Result<Scores, String> {
    let input = serde_json::to_vec(request).map_err(|err| err.to_string())?;
    let mut child = Command::new(&self.program)
      .args(&self.args)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|err| format!("failed to run {}: {err}", self.program.display()))?;
    if let Some(mut stdin) = child.stdin.take() {
      stdin.write_all(&input).await.map_err(|err| err.to_string())?;
    }
    let output = child
      .wait_with_output()
      .await
      .map_err(|err| err.to_string())?;
    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      return Err(format!("simulation {}: {}", output.status, stderr.trim()));
    }
    serde_json::from_slice(&output.stdout)
      .map_err(|err| format!("unreadable simulation output: {err}"))
  }
}

async fn answer(
  broker: &dyn Broker,
  queue: &str,
  request: &EvaluationRequest,
  simulator: &dyn Simulator,
) -> Result<(), ReportError> {
  let response = match simulator.simulate(request).await {
    Ok(fitness) => EvaluationResponse {
      status_code: StatusCode::OK,
      ind_id: Some(request.ind_id.clone()),
      fitness: Some(fitness),
      message: String::new(),
    },
    Err(message) => {
      warn!(ind_id = %request.ind_id, %message, "simulation failed");
      EvaluationResponse {
        status_code: StatusCode::ERROR,
        ind_id: Some(request.ind_id.clone()),
        fitness: None,
        message,
      }
    }
  };
  publish_json(broker, queue, &response).await
}

/// Serves evaluation requests until a shutdown sentinel arrives or the
/// request queue is deleted. Every request is acknowledged after its
/// response is published. Returns how many requests were answered.
#[instrument(level = "info", skip_all, fields(queue = %queues.request))]
pub async fn run_worker(
  broker: Arc<dyn Broker>,
  queues: &JobQueues,
  simulator: &dyn Simulator,
) -> Result<usize, ReportError> {
  broker.declare_queue(&queues.request).await?;
  broker.declare_queue(&queues.response).await?;
  let mut requests = broker.consume(&queues.request).await?;
  info!("awaiting evaluation requests");

  let mut answered = 0;
  while let Some(delivery) = requests.next().await {
    let mut delivery = delivery?;
    match serde_json::from_slice::<WorkerMessage>(&delivery.payload) {
      Ok(WorkerMessage::Shutdown(Sentinel { time_to_die: true })) => {
        delivery.ack().await?;
        info!(answered, "received shutdown sentinel");
        return Ok(answered);
      }
      Ok(WorkerMessage::Shutdown(sentinel)) => {
        warn!(?sentinel, "skipping sentinel that does not ask to exit")
      }
      Ok(WorkerMessage::Evaluate(request)) => {
        debug!(ind_id = %request.ind_id, "evaluating");
        answer(broker.as_ref(), &queues.response, &request, simulator).await?;
        answered += 1;
      }
      Err(err) => warn!(%err, "skipping malformed request"),
    }
    delivery.ack().await?;
  }
  info!(answered, "request queue closed");
  Ok(answered)
}
