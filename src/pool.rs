//! Containers that run the optimization runner and evaluation workers of
//! each job.
//!
//! [`PoolManager`] owns the containers of every job on top of a
//! [`ContainerRuntime`]: Docker in production, tokio tasks in tests.

use std::{
  collections::{HashMap, HashSet},
  fmt,
  sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::{
  config::Settings,
  error::{ProvisioningError, RuntimeError, TeardownError},
  protocol::JobId,
};

#[cfg(feature = "docker")]
pub mod docker;
pub mod task;

/// What a container of a job does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
  /// Runs the search engine of the job.
  Runner,
  /// Evaluates candidates.
  Worker,
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Role::Runner => f.write_str("runner"),
      Role::Worker => f.write_str("worker"),
    }
  }
}

/// Everything needed to launch one container.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerSpec {
  pub name: String,
  pub role: Role,
  pub job_id: JobId,
  pub image: String,
  pub env: Vec<(String, String)>,
  /// `host:container` bind mounts.
  pub binds: Vec<String>,
}

/// Observed state of a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerState {
  pub running: bool,
  /// Set once the container has exited.
  pub exit_code: Option<i64>,
}

/// Launches and controls containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
  /// Starts a container and returns its id.
  async fn launch(&self, spec: ContainerSpec) -> Result<String, RuntimeError>;
  async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError>;
  /// Output of the container so far.
  async fn logs(&self, id: &str) -> Result<String, RuntimeError>;
  async fn stop(&self, id: &str) -> Result<(), RuntimeError>;
  async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
  /// Ids of every exited container this runtime manages.
  async fn list_exited(&self) -> Result<Vec<String>, RuntimeError>;
}

/// A launched container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Container {
  pub id: String,
  pub name: String,
  pub role: Role,
}

/// Tracks the containers of every job.
pub struct PoolManager {
  runtime: Arc<dyn ContainerRuntime>,
  settings: Settings,
  jobs: Mutex<HashMap<JobId, Vec<Container>>>,
}

impl PoolManager {
  pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: Settings) -> Self {
    Self {
      runtime,
      settings,
      jobs: Mutex::new(HashMap::new()),
    }
  }

  fn spec(&self, job_id: &str, role: Role, idx: usize) -> ContainerSpec {
    let (name, image) = match role {
      Role::Runner => (
        format!("optimization-{job_id}"),
        self.settings.optimization_image.clone(),
      ),
      Role::Worker => (
        format!("simulation-{job_id}-{idx}"),
        self.settings.simulation_image.clone(),
      ),
    };
    let binds = match &self.settings.optimization_data_folder_in_container {
      Some(target) => vec![format!(
        "{}:{}",
        self.settings.host_temp_folder.display(),
        target.display()
      )],
      None => Vec::new(),
    };
    ContainerSpec {
      name,
      role,
      job_id: job_id.to_string(),
      image,
      env: self.settings.job_env(job_id),
      binds,
    }
  }

  /// Launches the runner and `workers` evaluation workers of `job_id`, then
  /// after the settle delay checks that none of them has exited, unless the
  /// runner already completed the job. On failure whatever was launched is
  /// torn down again.
  #[instrument(level = "info", skip(self), fields(job = %job_id))]
  pub async fn provision(
    &self,
    job_id: &str,
    workers: usize,
  ) -> Result<Vec<Container>, ProvisioningError> {
    let specs = std::iter::once(self.spec(job_id, Role::Runner, 0))
      .chain((0..workers).map(|idx| self.spec(job_id, Role::Worker, idx)));

    let mut launched = Vec::with_capacity(workers + 1);
    for spec in specs {
      let (name, role) = (spec.name.clone(), spec.role);
      match self.runtime.launch(spec).await {
        Ok(id) => {
          debug!(name, %role, id, "launched container");
          launched.push(Container { id, name, role });
        }
        Err(err) => {
          error!(name, %err, "failed to launch container");
          self.remove_all(&launched).await;
          return Err(err.into());
        }
      }
    }

    tokio::time::sleep(self.settings.settle_delay()).await;
    let mut states = Vec::with_capacity(launched.len());
    for container in &launched {
      match self.runtime.inspect(&container.id).await {
        Ok(state) => states.push(state),
        Err(err) => {
          self.remove_all(&launched).await;
          return Err(err.into());
        }
      }
    }
    // a runner may finish a tiny job, and release its workers, before the
    // check. Otherwise any exit is a startup failure.
    let finished = states
      .first()
      .is_some_and(|state| !state.running && state.exit_code == Some(0));
    let exited = launched.iter().zip(&states).find(|(_, state)| {
      !state.running && !(finished && state.exit_code == Some(0))
    });
    if let Some((container, state)) = exited {
      let code = state.exit_code.unwrap_or(-1);
      let logs = self
        .runtime
        .logs(&container.id)
        .await
        .unwrap_or_else(|err| format!("<logs unavailable: {err}>"));
      error!(name = container.name, code, "container exited on startup");
      self.remove_all(&launched).await;
      return Err(ProvisioningError::Exited {
        name: container.name.clone(),
        role: container.role,
        code,
        logs,
      });
    }

    info!(workers, "job containers are up");
    self
      .jobs
      .lock()
      .await
      .insert(job_id.to_string(), launched.clone());
    Ok(launched)
  }

  async fn remove_all(&self, containers: &[Container]) -> Vec<String> {
    let mut failures = Vec::new();
    for container in containers {
      if let Err(err) = self.runtime.stop(&container.id).await {
        debug!(name = container.name, %err, "stop failed");
      }
      if let Err(err) = self.runtime.remove(&container.id).await {
        warn!(name = container.name, %err, "failed to remove container");
        failures.push(format!("{}: {err}", container.name));
      }
    }
    failures
  }

  /// Stops and removes every container of `job_id`. Unknown jobs are a
  /// no-op.
  #[instrument(level = "info", skip(self), fields(job = %job_id))]
  pub async fn teardown(&self, job_id: &str) -> Result<(), TeardownError> {
    let Some(containers) = self.jobs.lock().await.remove(job_id) else {
      debug!("no containers to tear down");
      return Ok(());
    };
    let failures = self.remove_all(&containers).await;
    if failures.is_empty() {
      info!(count = containers.len(), "removed job containers");
      Ok(())
    } else {
      Err(TeardownError { failures })
    }
  }

  /// Removes every exited container of the runtime, whichever job it
  /// belonged to. Runners of tracked jobs are left for the reaper, which
  /// reads their exit code. Returns how many were removed.
  pub async fn remove_exited(&self) -> Result<usize, RuntimeError> {
    let exited = self.runtime.list_exited().await?;
    let mut jobs = self.jobs.lock().await;
    let runners: HashSet<String> = jobs
      .values()
      .flatten()
      .filter(|c| c.role == Role::Runner)
      .map(|c| c.id.clone())
      .collect();

    let mut removed = HashSet::new();
    for id in exited.into_iter().filter(|id| !runners.contains(id)) {
      match self.runtime.remove(&id).await {
        Ok(()) => {
          removed.insert(id);
        }
        Err(err) => warn!(id, %err, "failed to remove exited container"),
      }
    }
    if !removed.is_empty() {
      debug!(removed = removed.len(), "removed exited containers");
      for containers in jobs.values_mut() {
        containers.retain(|c| !removed.contains(&c.id));
      }
    }
    Ok(removed.len())
  }

  async fn runner(&self, job_id: &str) -> Option<Container> {
    self
      .jobs
      .lock()
      .await
      .get(job_id)?
      .iter()
      .find(|c| c.role == Role::Runner)
      .cloned()
  }

  /// State of the runner container of `job_id`, if the job has one.
  pub async fn runner_state(
    &self,
    job_id: &str,
  ) -> Option<Result<ContainerState, RuntimeError>> {
    let runner = self.runner(job_id).await?;
    Some(self.runtime.inspect(&runner.id).await)
  }

  /// Output of the runner container of `job_id`, if the job has one.
  pub async fn runner_logs(
    &self,
    job_id: &str,
  ) -> Option<Result<String, RuntimeError>> {
    let runner = self.runner(job_id).await?;
    Some(self.runtime.logs(&runner.id).await)
  }

  pub async fn containers(&self, job_id: &str) -> Vec<Container> {
    self
      .jobs
      .lock()
      .await
      .get(job_id)
      .cloned()
      .unwrap_or_default()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use futures::FutureExt;

  use super::{task::TaskRuntime, *};

  fn settings() -> Settings {
    Settings {
      settle_delay_ms: 20,
      ..Settings::default()
    }
  }

  fn idle_runtime() -> Arc<TaskRuntime> {
    Arc::new(TaskRuntime::new(|_spec| {
      async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
      }
      .boxed()
    }))
  }

  #[tokio::test]
  async fn test_provision_and_teardown() {
    let runtime = idle_runtime();
    let pool = PoolManager::new(runtime.clone(), settings());
    let containers = pool.provision("7", 3).await.unwrap();
    assert_eq!(containers.len(), 4);
    assert_eq!(containers[0].role, Role::Runner);
    assert_eq!(containers[0].name, "optimization-7");
    assert_eq!(containers[3].name, "simulation-7-2");
    assert!(pool.runner_state("7").await.unwrap().unwrap().running);

    pool.teardown("7").await.unwrap();
    assert!(pool.containers("7").await.is_empty());
    assert_eq!(runtime.count(), 0);
    // unknown jobs are fine
    pool.teardown("7").await.unwrap();
  }

  #[tokio::test]
  async fn test_exit_on_startup_fails_provisioning() {
    let runtime = Arc::new(TaskRuntime::new(|spec: ContainerSpec| {
      async move {
        match spec.role {
          Role::Worker => Err("no license server".to_string()),
          Role::Runner => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
          }
        }
      }
      .boxed()
    }));
    let pool = PoolManager::new(runtime.clone(), settings());
    let err = pool.provision("8", 2).await.unwrap_err();
    match err {
      ProvisioningError::Exited { code, logs, .. } => {
        assert_eq!(code, 1);
        assert!(logs.contains("no license server"));
      }
      other => panic!("unexpected error {other}"),
    }
    assert_eq!(runtime.count(), 0);
    assert!(pool.containers("8").await.is_empty());
  }

  #[tokio::test]
  async fn test_worker_leaving_early_fails_provisioning() {
    let runtime = Arc::new(TaskRuntime::new(|spec: ContainerSpec| {
      async move {
        if spec.role == Role::Runner {
          tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
      }
      .boxed()
    }));
    let pool = PoolManager::new(runtime.clone(), settings());
    let err = pool.provision("10", 1).await.unwrap_err();
    assert!(
      matches!(err, ProvisioningError::Exited { code: 0, ref name, .. } if name == "simulation-10-0"),
      "unexpected error {err}"
    );
    assert_eq!(runtime.count(), 0);
  }

  #[tokio::test]
  async fn test_job_finished_before_check_is_provisioned() {
    let runtime = Arc::new(TaskRuntime::new(|_spec| async { Ok(()) }.boxed()));
    let pool = PoolManager::new(runtime, settings());
    let containers = pool.provision("11", 2).await.unwrap();
    assert_eq!(containers.len(), 3);
    let state = pool.runner_state("11").await.unwrap().unwrap();
    assert!(!state.running);
    assert_eq!(state.exit_code, Some(0));
  }

  #[tokio::test]
  async fn test_remove_exited() {
    let runtime = Arc::new(TaskRuntime::new(|spec: ContainerSpec| {
      async move {
        if spec.role == Role::Worker {
          tokio::time::sleep(Duration::from_millis(50)).await;
        } else {
          tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
      }
      .boxed()
    }));
    let pool = PoolManager::new(runtime.clone(), settings());
    pool.provision("9", 2).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.remove_exited().await.unwrap(), 2);
    let left = pool.containers("9").await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].role, Role::Runner);
  }
}
