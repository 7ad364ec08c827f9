//! The orchestrator process: accepts job requests, provisions a container
//! pool per job and reclaims it once the job is over.
//!
//! Requests arrive on `OPTIMIZATION_REQUEST_QUEUE`. Every answer, and the
//! final progress message of jobs the orchestrator ends itself, goes to
//! `OPTIMIZATION_RESPONSE_QUEUE`, next to the progress messages the runners
//! publish there.

use std::{
  collections::{HashMap, VecDeque},
  sync::Arc,
};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::{
  broker::{publish_json, Broker},
  config::Settings,
  error::{ConfigError, Error, ProvisioningError, RuntimeError},
  job::{Job, JobStatus},
  pool::{ContainerRuntime, PoolManager, Role},
  protocol::{
    read_job_id, JobId, JobRequest, JobResponse, OptimizationSpec, Outbound,
    Progress, ProgressMessage, Sentinel, StatusCode,
  },
};

/// Exit code of a runner that already published its own failure.
pub const REPORTED_FAILURE: i64 = 1;

/// Number of ended jobs whose status stays queryable.
const ENDED_JOBS_KEPT: usize = 64;

fn error_message(err: impl std::fmt::Display) -> String {
  format!("Error. {err}")
}

fn final_message(
  job_id: &str,
  status_code: StatusCode,
  message: impl Into<String>,
) -> Outbound {
  Outbound::Progress(ProgressMessage {
    optimization_id: job_id.to_string(),
    status_code,
    message: message.into(),
    progress: Progress {
      is_final: true,
      ..Progress::default()
    },
    solutions: Vec::new(),
  })
}

/// Known jobs. Only the most recently ended ones are remembered.
struct Jobs {
  by_id: HashMap<JobId, Job>,
  ended: VecDeque<JobId>,
  capacity: usize,
}

impl Jobs {
  fn new(capacity: usize) -> Self {
    Self {
      by_id: HashMap::new(),
      ended: VecDeque::new(),
      capacity,
    }
  }

  fn mark_ended(&mut self, job_id: &str) {
    self.ended.retain(|id| id != job_id);
    self.ended.push_back(job_id.to_string());
    while self.ended.len() > self.capacity {
      let Some(oldest) = self.ended.pop_front() else {
        break;
      };
      // a restarted job is live again and stays
      if self
        .by_id
        .get(&oldest)
        .is_some_and(|job| job.status().is_terminal())
      {
        self.by_id.remove(&oldest);
      }
    }
  }
}

/// Handles job requests one at a time.
pub struct Orchestrator {
  settings: Settings,
  broker: Arc<dyn Broker>,
  pool: PoolManager,
  jobs: Mutex<Jobs>,
}

impl Orchestrator {
  pub fn new(
    settings: Settings,
    broker: Arc<dyn Broker>,
    runtime: Arc<dyn ContainerRuntime>,
  ) -> Self {
    Self {
      pool: PoolManager::new(runtime, settings.clone()),
      settings,
      broker,
      jobs: Mutex::new(Jobs::new(ENDED_JOBS_KEPT)),
    }
  }

  /// Status of job `job_id`, if it is running or ended recently.
  pub async fn status(&self, job_id: &str) -> Option<JobStatus> {
    self.jobs.lock().await.by_id.get(job_id).map(Job::status)
  }

  pub fn pool(&self) -> &PoolManager {
    &self.pool
  }

  /// Publishes `message` on the response queue and keeps it in `out`.
  async fn emit(&self, out: &mut Vec<Outbound>, message: Outbound) {
    let queue = &self.settings.optimization_response_queue;
    if let Err(err) = publish_json(self.broker.as_ref(), queue, &message).await {
      error!(%err, %queue, "failed to publish response");
    }
    out.push(message);
  }

  async fn respond(
    &self,
    out: &mut Vec<Outbound>,
    status_code: StatusCode,
    job_id: Option<&str>,
    message: impl Into<String>,
  ) {
    let response =
      JobResponse::new(status_code, job_id.map(str::to_string), message);
    self.emit(out, Outbound::Job(response)).await;
  }

  /// Handles one raw request and returns everything published in response,
  /// in publishing order.
  pub async fn handle(&self, payload: &[u8]) -> Vec<Outbound> {
    let mut out = Vec::new();
    match self.pool.remove_exited().await {
      Ok(0) => {}
      Ok(removed) => debug!(removed, "removed exited containers"),
      Err(err) => warn!(%err, "failed to remove exited containers"),
    }

    let message: Value = match serde_json::from_slice(payload) {
      Ok(message) => message,
      Err(err) => {
        let err = ConfigError::from(err);
        warn!(%err, "rejecting request");
        self.respond(&mut out, StatusCode::ERROR, None, error_message(err)).await;
        return out;
      }
    };
    let Some(job_id) = read_job_id(&message) else {
      warn!("request without an optimization id");
      let err = ConfigError::MissingId;
      self.respond(&mut out, StatusCode::ERROR, None, error_message(err)).await;
      return out;
    };
    let kind = message
      .get("type")
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();
    info!(job = %job_id, %kind, "received request");

    match kind.as_str() {
      "optimization_start" | "optimization_stop" => {}
      _ => {
        let err = ConfigError::UnknownType(kind.clone());
        self
          .respond(&mut out, StatusCode::ERROR, Some(&job_id), error_message(err))
          .await;
        return out;
      }
    }
    let request = serde_json::from_value::<JobRequest>(message)
      .map_err(ConfigError::from)
      .and_then(|request| match request {
        JobRequest::OptimizationStart { optimization, .. } => {
          optimization.validate()?;
          Ok(Some(optimization))
        }
        JobRequest::OptimizationStop { .. } => Ok(None),
      });

    match request {
      Ok(Some(optimization)) => {
        self.start(&mut out, &job_id, &optimization, payload).await
      }
      Ok(None) => {
        self.stop(&mut out, &job_id).await;
        self
          .respond(
            &mut out,
            StatusCode::OK,
            Some(&job_id),
            "Successfully terminated optimization.",
          )
          .await;
      }
      Err(err) => {
        warn!(job = %job_id, %err, "rejecting request");
        self
          .respond(&mut out, StatusCode::ERROR, Some(&job_id), error_message(err))
          .await;
      }
    }
    out
  }

  #[instrument(level = "info", skip_all, fields(job = %job_id))]
  async fn start(
    &self,
    out: &mut Vec<Outbound>,
    job_id: &str,
    optimization: &OptimizationSpec,
    payload: &[u8],
  ) {
    let running = self
      .jobs
      .lock()
      .await
      .by_id
      .get(job_id)
      .is_some_and(|job| !job.status().is_terminal());
    if running {
      info!("job is already running, stopping it first");
      self.stop(out, job_id).await;
    }

    let method = optimization.parameters.method;
    let workers = self.settings.workers_for(method);
    let mut job = Job::new(job_id.to_string(), method, workers);
    job.transition(JobStatus::Provisioning);
    self.jobs.lock().await.by_id.insert(job_id.to_string(), job);
    self
      .respond(out, StatusCode::ACCEPTED, Some(job_id), "Request accepted")
      .await;

    let provisioned = match self.persist(job_id, payload).await {
      Ok(()) => self.pool.provision(job_id, workers).await.map(|_| ()),
      Err(err) => Err(err),
    };
    match provisioned {
      Ok(()) => {
        self.set_status(job_id, JobStatus::Running).await;
        info!(workers, "job is running");
        let message = format!(
          "Successfully started 1 optimization and {workers} model solver containers."
        );
        self.respond(out, StatusCode::OK, Some(job_id), message).await;
      }
      Err(err) => {
        error!(%err, "failed to start job");
        self.set_status(job_id, JobStatus::Failed).await;
        self.delete_queues(job_id).await;
        self.remove_folder(job_id).await;
        // a runner that failed before the check has published its own end
        let reported = matches!(
          err,
          ProvisioningError::Exited {
            role: Role::Runner,
            code: REPORTED_FAILURE,
            ..
          }
        );
        let message = error_message(err);
        self
          .respond(out, StatusCode::ERROR, Some(job_id), message.clone())
          .await;
        if !reported {
          self
            .emit(out, final_message(job_id, StatusCode::ERROR, message))
            .await;
        }
      }
    }
  }

  /// Writes the start request where the runner of the job will read it.
  async fn persist(&self, job_id: &str, payload: &[u8]) -> Result<(), ProvisioningError> {
    let path = self.settings.model_path(job_id);
    let persist_error = |source| ProvisioningError::Persist {
      path: path.display().to_string(),
      source,
    };
    tokio::fs::create_dir_all(self.settings.job_folder(job_id))
      .await
      .map_err(persist_error)?;
    tokio::fs::write(&path, payload).await.map_err(persist_error)?;
    debug!(path = %path.display(), "persisted job request");
    Ok(())
  }

  /// Stops job `job_id` if it is known. Emits the final progress message of
  /// jobs that had not ended yet.
  #[instrument(level = "info", skip_all, fields(job = %job_id))]
  async fn stop(&self, out: &mut Vec<Outbound>, job_id: &str) {
    let job = self.jobs.lock().await.by_id.get(job_id).cloned();
    let workers = job.as_ref().map_or(0, |job| job.workers);
    self.reclaim(job_id, workers).await;

    if job.is_some_and(|job| !job.status().is_terminal()) {
      self.set_status(job_id, JobStatus::Stopped).await;
      info!("job stopped");
      self
        .emit(out, final_message(job_id, StatusCode::OK, "Optimization stopped."))
        .await;
    }
  }

  /// Best-effort release of everything job `job_id` holds: its workers are
  /// told to exit, its containers removed, its queues and folder deleted.
  async fn reclaim(&self, job_id: &str, workers: usize) {
    let queues = self.settings.job_queues(job_id);
    for _ in 0..workers {
      if let Err(err) =
        publish_json(self.broker.as_ref(), &queues.request, &Sentinel::SHUTDOWN).await
      {
        warn!(%err, "failed to send shutdown sentinel");
        break;
      }
    }
    if let Err(err) = self.pool.teardown(job_id).await {
      warn!(%err, "failed to remove job containers");
    }
    self.delete_queues(job_id).await;
    self.remove_folder(job_id).await;
  }

  async fn delete_queues(&self, job_id: &str) {
    let queues = self.settings.job_queues(job_id);
    for queue in [&queues.request, &queues.response] {
      if let Err(err) = self.broker.delete_queue(queue).await {
        warn!(%err, %queue, "failed to delete queue");
      }
    }
  }

  async fn remove_folder(&self, job_id: &str) {
    let folder = self.settings.job_folder(job_id);
    if let Err(err) = tokio::fs::remove_dir_all(&folder).await {
      debug!(%err, folder = %folder.display(), "could not delete job folder");
    }
  }

  async fn set_status(&self, job_id: &str, status: JobStatus) {
    let mut jobs = self.jobs.lock().await;
    let Some(job) = jobs.by_id.get_mut(job_id) else {
      return;
    };
    if !job.transition(status) {
      warn!(job = %job_id, from = %job.status(), to = %status, "ignoring status change");
      return;
    }
    if status.is_terminal() {
      jobs.mark_ended(job_id);
    }
  }

  /// Ends every running job whose runner has exited and reclaims its
  /// resources. A runner exiting with 0 completed its job. One exiting
  /// with [`REPORTED_FAILURE`] already published its final message; for
  /// any other exit the orchestrator publishes it with the runner's logs.
  pub async fn reap(&self) -> Vec<Outbound> {
    let mut out = Vec::new();
    let running: Vec<Job> = self
      .jobs
      .lock()
      .await
      .by_id
      .values()
      .filter(|job| job.status() == JobStatus::Running)
      .cloned()
      .collect();

    for job in running {
      let code = match self.pool.runner_state(&job.id).await {
        Some(Ok(state)) => match state.exit_code {
          Some(code) if !state.running => code,
          _ => continue,
        },
        Some(Err(RuntimeError::NotFound(_))) | None => {
          warn!(job = %job.id, "runner container is gone");
          self.set_status(&job.id, JobStatus::Failed).await;
          self.reclaim(&job.id, job.workers).await;
          let message = error_message("Optimization container is gone.");
          self
            .emit(&mut out, final_message(&job.id, StatusCode::ERROR, message))
            .await;
          continue;
        }
        Some(Err(err)) => {
          warn!(job = %job.id, %err, "failed to inspect runner");
          continue;
        }
      };

      let status = match code {
        0 => JobStatus::Completed,
        _ => JobStatus::Failed,
      };
      info!(job = %job.id, code, %status, "runner exited");
      if code != 0 && code != REPORTED_FAILURE {
        let logs = match self.pool.runner_logs(&job.id).await {
          Some(Ok(logs)) => logs,
          Some(Err(err)) => format!("<logs unavailable: {err}>"),
          None => String::new(),
        };
        let message =
          error_message(format!("Optimization exited with code {code}.\r\n{logs}"));
        self
          .emit(&mut out, final_message(&job.id, StatusCode::ERROR, message))
          .await;
      }
      self.set_status(&job.id, status).await;
      self.reclaim(&job.id, job.workers).await;
    }
    out
  }

  /// Consumes job requests until the request queue goes away, reaping
  /// finished jobs in between. Each request is acknowledged once its
  /// responses are published.
  pub async fn serve(&self) -> Result<(), Error> {
    let requests = &self.settings.optimization_request_queue;
    self.broker.declare_queue(requests).await?;
    self
      .broker
      .declare_queue(&self.settings.optimization_response_queue)
      .await?;
    let mut deliveries = self.broker.consume(requests).await?;
    let mut reaper = tokio::time::interval(self.settings.reap_interval());
    info!(queue = %requests, "awaiting requests");

    loop {
      tokio::select! {
        delivery = deliveries.next() => {
          let Some(delivery) = delivery else {
            info!("request queue closed");
            return Ok(());
          };
          let mut delivery = delivery?;
          self.handle(&delivery.payload).await;
          delivery.ack().await?;
        }
        _ = reaper.tick() => {
          self.reap().await;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use futures::FutureExt;
  use serde_json::json;

  use super::*;
  use crate::{
    broker::memory::InMemoryBroker,
    pool::{task::TaskRuntime, ContainerSpec, Role},
  };

  fn settings(dir: &std::path::Path) -> Settings {
    Settings {
      host_temp_folder: dir.to_path_buf(),
      settle_delay_ms: 10,
      num_solvers_ga: 2,
      ..Settings::default()
    }
  }

  fn idle() -> Arc<TaskRuntime> {
    Arc::new(TaskRuntime::new(|_spec| {
      async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
      }
      .boxed()
    }))
  }

  fn start(id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
      "type": "optimization_start",
      "optimization_id": id,
      "optimization": {
        "parameters": {"method": "GA", "pop_size": 4, "ngen": 2},
        "objectives": [{"weight": 1}],
        "objects": [],
      }
    }))
    .unwrap()
  }

  fn stop(id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({"type": "optimization_stop", "optimization_id": id}))
      .unwrap()
  }

  fn summary(out: &[Outbound]) -> Vec<(u16, bool)> {
    out
      .iter()
      .map(|o| match o {
        Outbound::Job(r) => (r.status_code.0, false),
        Outbound::Progress(p) => (p.status_code.0, p.progress.is_final),
      })
      .collect()
  }

  fn message(out: &Outbound) -> &str {
    match out {
      Outbound::Job(r) => &r.message,
      Outbound::Progress(p) => &p.message,
    }
  }

  #[tokio::test]
  async fn test_start_then_stop() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(InMemoryBroker::new());
    let runtime = idle();
    let orchestrator =
      Orchestrator::new(settings(dir.path()), broker.clone(), runtime.clone());
    broker.declare_queue("optimization_response").await.unwrap();

    let out = orchestrator.handle(&start("5")).await;
    assert_eq!(summary(&out), [(202, false), (200, false)]);
    assert_eq!(
      message(&out[1]),
      "Successfully started 1 optimization and 2 model solver containers."
    );
    assert!(dir.path().join("5").join("config.json").exists());
    assert_eq!(runtime.count(), 3);
    assert_eq!(orchestrator.status("5").await, Some(JobStatus::Running));
    assert_eq!(broker.pending("optimization_response"), 2);

    broker.declare_queue("simulation_request5").await.unwrap();
    let out = orchestrator.handle(&stop("5")).await;
    assert_eq!(summary(&out), [(200, true), (200, false)]);
    assert_eq!(message(&out[1]), "Successfully terminated optimization.");
    assert_eq!(runtime.count(), 0);
    assert!(!broker.queue_exists("simulation_request5"));
    assert!(!dir.path().join("5").exists());
    assert_eq!(orchestrator.status("5").await, Some(JobStatus::Stopped));

    // a second stop has nothing left to end
    let out = orchestrator.handle(&stop("5")).await;
    assert_eq!(summary(&out), [(200, false)]);
  }

  #[tokio::test]
  async fn test_restart_stops_running_job() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(InMemoryBroker::new());
    let runtime = idle();
    let orchestrator = Orchestrator::new(settings(dir.path()), broker, runtime.clone());
    orchestrator.handle(&start("6")).await;
    let out = orchestrator.handle(&start("6")).await;
    assert_eq!(summary(&out), [(200, true), (202, false), (200, false)]);
    assert_eq!(runtime.count(), 3);
  }

  #[tokio::test]
  async fn test_rejects_malformed_requests() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator =
      Orchestrator::new(settings(dir.path()), Arc::new(InMemoryBroker::new()), idle());

    let out = orchestrator.handle(br#"{"type": "optimization_stop"}"#).await;
    assert_eq!(message(&out[0]), "Error. Failed to read optimization ID");

    let out = orchestrator
      .handle(br#"{"type": "optimization_pause", "optimization_id": 3}"#)
      .await;
    assert_eq!(message(&out[0]), "Error. Unknown request type: optimization_pause");

    let out = orchestrator
      .handle(
        br#"{"type": "optimization_start", "optimization_id": 3,
             "optimization": {"parameters": {"method": "PSO"}, "objectives": []}}"#,
      )
      .await;
    assert_eq!(summary(&out), [(500, false)]);
    assert!(message(&out[0]).contains("unknown optimization method: PSO"));
    assert_eq!(orchestrator.status("3").await, None);
  }

  #[tokio::test]
  async fn test_worker_dying_on_startup_fails_job() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(TaskRuntime::new(|spec: ContainerSpec| {
      async move {
        if spec.role == Role::Worker {
          return Err("model not found".to_string());
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
      }
      .boxed()
    }));
    let orchestrator = Orchestrator::new(
      settings(dir.path()),
      Arc::new(InMemoryBroker::new()),
      runtime.clone(),
    );
    let out = orchestrator.handle(&start("7")).await;
    assert_eq!(summary(&out), [(202, false), (500, false), (500, true)]);
    assert!(message(&out[1]).contains("model not found"));
    assert_eq!(message(&out[2]), message(&out[1]));
    let finals = out
      .iter()
      .filter(|o| matches!(o, Outbound::Progress(p) if p.progress.is_final))
      .count();
    assert_eq!(finals, 1);
    assert_eq!(orchestrator.status("7").await, Some(JobStatus::Failed));
    assert_eq!(runtime.count(), 0);
    assert!(!dir.path().join("7").exists());
  }

  #[tokio::test]
  async fn test_runner_failing_on_startup_is_not_reported_twice() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(TaskRuntime::new(|spec: ContainerSpec| {
      async move {
        if spec.role == Role::Runner {
          return Err("unreadable request".to_string());
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
      }
      .boxed()
    }));
    let orchestrator = Orchestrator::new(
      settings(dir.path()),
      Arc::new(InMemoryBroker::new()),
      runtime,
    );
    let out = orchestrator.handle(&start("9")).await;
    assert_eq!(summary(&out), [(202, false), (500, false)]);
    assert_eq!(orchestrator.status("9").await, Some(JobStatus::Failed));
  }

  #[tokio::test]
  async fn test_reap_killed_runner() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(TaskRuntime::new(|spec: ContainerSpec| {
      async move {
        if spec.role == Role::Runner {
          tokio::time::sleep(Duration::from_millis(30)).await;
          return Err("out of memory".to_string());
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
      }
      .boxed()
    }));
    let orchestrator = Orchestrator::new(
      settings(dir.path()),
      Arc::new(InMemoryBroker::new()),
      runtime.clone(),
    );
    orchestrator.handle(&start("8")).await;
    assert!(orchestrator.reap().await.is_empty());

    tokio::time::sleep(Duration::from_millis(60)).await;
    // exit code 1 means the runner reported the failure itself
    assert!(orchestrator.reap().await.is_empty());
    assert_eq!(orchestrator.status("8").await, Some(JobStatus::Failed));
    assert_eq!(runtime.count(), 0);
  }

  #[tokio::test]
  async fn test_only_recent_ended_jobs_are_kept() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator =
      Orchestrator::new(settings(dir.path()), Arc::new(InMemoryBroker::new()), idle());
    orchestrator.jobs.lock().await.capacity = 1;

    orchestrator.handle(&start("a")).await;
    orchestrator.handle(&stop("a")).await;
    assert_eq!(orchestrator.status("a").await, Some(JobStatus::Stopped));

    orchestrator.handle(&start("b")).await;
    assert_eq!(orchestrator.status("a").await, Some(JobStatus::Stopped));
    orchestrator.handle(&stop("b")).await;
    assert_eq!(orchestrator.status("a").await, None);
    assert_eq!(orchestrator.status("b").await, Some(JobStatus::Stopped));

    // restarting an ended job keeps it while it runs
    orchestrator.handle(&start("b")).await;
    orchestrator.handle(&start("c")).await;
    orchestrator.handle(&stop("c")).await;
    assert_eq!(orchestrator.status("b").await, Some(JobStatus::Running));
    assert_eq!(orchestrator.status("c").await, Some(JobStatus::Stopped));
  }
}
