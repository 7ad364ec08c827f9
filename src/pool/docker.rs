//! [`ContainerRuntime`] on a Docker daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
  container::{
    Config, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StopContainerOptions,
  },
  errors::Error as DockerError,
  models::HostConfig,
  Docker,
};
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

use super::{ContainerRuntime, ContainerSpec, ContainerState};
use crate::error::RuntimeError;

/// Label carrying the job id of every container this runtime launches.
const JOB_LABEL: &str = "dmoga.job";
const ROLE_LABEL: &str = "dmoga.role";
/// Seconds a container gets to exit before it is killed.
const STOP_TIMEOUT: i64 = 10;
/// Log lines kept when a container fails on startup.
const LOG_TAIL: &str = "200";

pub struct DockerRuntime {
  docker: Docker,
}

impl DockerRuntime {
  /// Connects to the local daemon and checks it answers.
  pub async fn connect() -> Result<Self, RuntimeError> {
    let docker = Docker::connect_with_local_defaults()?;
    docker.ping().await?;
    info!("connected to the docker daemon");
    Ok(Self { docker })
  }
}

fn not_found(id: &str, err: DockerError) -> RuntimeError {
  match err {
    DockerError::DockerResponseServerError {
      status_code: 404, ..
    } => RuntimeError::NotFound(id.to_string()),
    err => err.into(),
  }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
  #[instrument(level = "debug", skip_all, fields(name = %spec.name, image = %spec.image))]
  async fn launch(&self, spec: ContainerSpec) -> Result<String, RuntimeError> {
    let env: Vec<String> = spec
      .env
      .iter()
      .map(|(k, v)| format!("{k}={v}"))
      .collect();
    let labels = HashMap::from([
      (JOB_LABEL.to_string(), spec.job_id.clone()),
      (ROLE_LABEL.to_string(), spec.role.to_string()),
    ]);
    let host_config = HostConfig {
      binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
      ..Default::default()
    };
    let config = Config {
      image: Some(spec.image.clone()),
      env: Some(env),
      labels: Some(labels),
      host_config: Some(host_config),
      ..Default::default()
    };
    let options = CreateContainerOptions {
      name: spec.name.clone(),
      platform: None,
    };

    let container = self
      .docker
      .create_container(Some(options), config)
      .await
      .map_err(|err| RuntimeError::Launch {
        name: spec.name.clone(),
        reason: err.to_string(),
      })?;
    for warning in &container.warnings {
      warn!(warning, "docker warning");
    }
    self
      .docker
      .start_container::<String>(&container.id, None)
      .await
      .map_err(|err| RuntimeError::Launch {
        name: spec.name.clone(),
        reason: err.to_string(),
      })?;
    debug!(id = container.id, "started container");
    Ok(container.id)
  }

  async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
    let response = self
      .docker
      .inspect_container(id, None::<InspectContainerOptions>)
      .await
      .map_err(|err| not_found(id, err))?;
    let state = response.state.unwrap_or_default();
    let running = state.running.unwrap_or(false);
    Ok(ContainerState {
      running,
      exit_code: if running { None } else { state.exit_code },
    })
  }

  async fn logs(&self, id: &str) -> Result<String, RuntimeError> {
    let options = LogsOptions::<String> {
      stdout: true,
      stderr: true,
      tail: LOG_TAIL.to_string(),
      ..Default::default()
    };
    let mut stream = self.docker.logs(id, Some(options));
    let mut logs = String::new();
    while let Some(output) = stream.next().await {
      match output.map_err(|err| not_found(id, err))? {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message } => {
          logs.push_str(&String::from_utf8_lossy(&message));
        }
        LogOutput::StdIn { .. } => {}
      }
    }
    Ok(logs)
  }

  async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
    self
      .docker
      .stop_container(id, Some(StopContainerOptions { t: STOP_TIMEOUT }))
      .await
      .map_err(|err| not_found(id, err))
  }

  async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
    let options = RemoveContainerOptions {
      force: true,
      ..Default::default()
    };
    self
      .docker
      .remove_container(id, Some(options))
      .await
      .map_err(|err| not_found(id, err))
  }

  async fn list_exited(&self) -> Result<Vec<String>, RuntimeError> {
    let filters = HashMap::from([
      ("status".to_string(), vec!["exited".to_string()]),
      ("label".to_string(), vec![JOB_LABEL.to_string()]),
    ]);
    let options = ListContainersOptions {
      all: true,
      filters,
      ..Default::default()
    };
    let containers = self.docker.list_containers(Some(options)).await?;
    Ok(containers.into_iter().filter_map(|c| c.id).collect())
  }
}
