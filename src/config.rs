//! Process settings shared by the orchestrator, the runner and the workers.
//!
//! Settings are layered: built-in defaults, then an optional json file, then
//! environment variables named after the fields in `SCREAMING_SNAKE_CASE`.
//! The orchestrator hands each launched container a job-scoped copy of its
//! settings through [`Settings::job_env`].

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable that carries the job id into runner and worker
/// containers.
pub const OPTIMIZATION_ID: &str = "OPTIMIZATION_ID";

/// Connection, queue, container and storage settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Settings {
  pub rabbitmq_host: String,
  pub rabbitmq_port: u16,
  pub rabbitmq_virtual_host: String,
  pub rabbitmq_user: String,
  pub rabbitmq_password: String,
  pub optimization_request_queue: String,
  pub optimization_response_queue: String,
  pub simulation_request_queue: String,
  pub simulation_response_queue: String,
  /// Evaluation workers started for a GA job. Simplex jobs always get one.
  pub num_solvers_ga: usize,
  pub optimization_image: String,
  pub simulation_image: String,
  /// Folder on the orchestrator's host where job configs are persisted.
  pub host_temp_folder: PathBuf,
  /// Folder the runner reads job configs from. Falls back to
  /// `host_temp_folder` when unset.
  pub optimization_data_folder: Option<PathBuf>,
  /// Mount point of `host_temp_folder` inside containers.
  pub optimization_data_folder_in_container: Option<PathBuf>,
  pub model_file_name: String,
  pub settle_delay_ms: u64,
  pub reap_interval_ms: u64,
  /// Unset means an evaluation batch waits for its responses forever.
  pub evaluation_timeout_secs: Option<u64>,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      rabbitmq_host: "localhost".into(),
      rabbitmq_port: 5672,
      rabbitmq_virtual_host: "/".into(),
      rabbitmq_user: "guest".into(),
      rabbitmq_password: "guest".into(),
      optimization_request_queue: "optimization_request".into(),
      optimization_response_queue: "optimization_response".into(),
      simulation_request_queue: "simulation_request".into(),
      simulation_response_queue: "simulation_response".into(),
      num_solvers_ga: 4,
      optimization_image: "dmoga-runner:latest".into(),
      simulation_image: "dmoga-worker:latest".into(),
      host_temp_folder: std::env::temp_dir().join("dmoga"),
      optimization_data_folder: None,
      optimization_data_folder_in_container: None,
      model_file_name: "config.json".into(),
      settle_delay_ms: 3000,
      reap_interval_ms: 5000,
      evaluation_timeout_secs: None,
    }
  }
}

/// The pair of queues that isolates one job from every other job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobQueues {
  pub request: String,
  pub response: String,
}

impl Settings {
  /// Loads defaults, overlays `path` if given, then the process environment.
  pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
    let mut settings = match path {
      Some(path) => serde_json::from_slice(&std::fs::read(path)?)?,
      None => Settings::default(),
    };
    settings.apply_env(std::env::vars())?;
    Ok(settings)
  }

  /// Overrides fields with matching variables. Unknown variables are
  /// ignored, so the whole process environment can be passed in.
  pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
  where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
  {
    fn parse<T: std::str::FromStr>(
      var: &str,
      value: String,
    ) -> Result<T, ConfigError> {
      value.parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value,
      })
    }

    for (key, value) in vars {
      let key = key.as_ref();
      let value: String = value.into();
      match key {
        "RABBITMQ_HOST" => self.rabbitmq_host = value,
        "RABBITMQ_PORT" => self.rabbitmq_port = parse(key, value)?,
        "RABBITMQ_VIRTUAL_HOST" => self.rabbitmq_virtual_host = value,
        "RABBITMQ_USER" => self.rabbitmq_user = value,
        "RABBITMQ_PASSWORD" => self.rabbitmq_password = value,
        "OPTIMIZATION_REQUEST_QUEUE" => self.optimization_request_queue = value,
        "OPTIMIZATION_RESPONSE_QUEUE" => {
          self.optimization_response_queue = value
        }
        "SIMULATION_REQUEST_QUEUE" => self.simulation_request_queue = value,
        "SIMULATION_RESPONSE_QUEUE" => self.simulation_response_queue = value,
        "NUM_SOLVERS_GA" => self.num_solvers_ga = parse(key, value)?,
        "OPTIMIZATION_IMAGE" => self.optimization_image = value,
        "SIMULATION_IMAGE" => self.simulation_image = value,
        "HOST_TEMP_FOLDER" => self.host_temp_folder = value.into(),
        "OPTIMIZATION_DATA_FOLDER" => {
          self.optimization_data_folder = Some(value.into())
        }
        "OPTIMIZATION_DATA_FOLDER_IN_CONTAINER" => {
          self.optimization_data_folder_in_container = Some(value.into())
        }
        "MODEL_FILE_NAME" => self.model_file_name = value,
        "SETTLE_DELAY_MS" => self.settle_delay_ms = parse(key, value)?,
        "REAP_INTERVAL_MS" => self.reap_interval_ms = parse(key, value)?,
        "EVALUATION_TIMEOUT_SECS" => {
          self.evaluation_timeout_secs = match value.as_str() {
            "" => None,
            _ => Some(parse(key, value)?),
          }
        }
        _ => {}
      }
    }
    Ok(())
  }

  /// AMQP connection uri assembled from the `RABBITMQ_*` settings.
  pub fn amqp_uri(&self) -> String {
    let vhost = match self.rabbitmq_virtual_host.as_str() {
      "/" => "%2f".to_string(),
      vhost => vhost.trim_start_matches('/').to_string(),
    };
    format!(
      "amqp://{}:{}@{}:{}/{}",
      self.rabbitmq_user,
      self.rabbitmq_password,
      self.rabbitmq_host,
      self.rabbitmq_port,
      vhost
    )
  }

  /// Evaluation queues of job `job_id`: base names suffixed with the id.
  pub fn job_queues(&self, job_id: &str) -> JobQueues {
    JobQueues {
      request: format!("{}{}", self.simulation_request_queue, job_id),
      response: format!("{}{}", self.simulation_response_queue, job_id),
    }
  }

  /// Queues as seen from inside a job's container, where the settings have
  /// already been scoped by [`Settings::job_env`].
  pub fn scoped_queues(&self) -> JobQueues {
    JobQueues {
      request: self.simulation_request_queue.clone(),
      response: self.simulation_response_queue.clone(),
    }
  }

  /// Folder holding everything persisted for job `job_id` on this host.
  pub fn job_folder(&self, job_id: &str) -> PathBuf {
    self.host_temp_folder.join(job_id)
  }

  /// Path the orchestrator persists the job-start request of `job_id` to.
  pub fn model_path(&self, job_id: &str) -> PathBuf {
    self.job_folder(job_id).join(&self.model_file_name)
  }

  /// Path the runner of job `job_id` reads its request from.
  pub fn runner_model_path(&self, job_id: &str) -> PathBuf {
    self
      .optimization_data_folder
      .as_ref()
      .unwrap_or(&self.host_temp_folder)
      .join(job_id)
      .join(&self.model_file_name)
  }

  /// Number of evaluation workers a job of `method` gets.
  pub fn workers_for(&self, method: crate::protocol::Method) -> usize {
    match method {
      crate::protocol::Method::Ga => self.num_solvers_ga.max(1),
      crate::protocol::Method::Simplex => 1,
    }
  }

  pub fn settle_delay(&self) -> Duration {
    Duration::from_millis(self.settle_delay_ms)
  }

  pub fn reap_interval(&self) -> Duration {
    Duration::from_millis(self.reap_interval_ms.max(1))
  }

  pub fn evaluation_timeout(&self) -> Option<Duration> {
    self.evaluation_timeout_secs.map(Duration::from_secs)
  }

  /// Environment for a container of job `job_id`: every setting, with the
  /// evaluation queues scoped to the job and the data folder remapped to the
  /// container's mount point.
  pub fn job_env(&self, job_id: &str) -> Vec<(String, String)> {
    let queues = self.job_queues(job_id);
    let data_folder = self
      .optimization_data_folder_in_container
      .as_ref()
      .unwrap_or(&self.host_temp_folder);
    let mut env = vec![
      (OPTIMIZATION_ID.to_string(), job_id.to_string()),
      ("RABBITMQ_HOST".into(), self.rabbitmq_host.clone()),
      ("RABBITMQ_PORT".into(), self.rabbitmq_port.to_string()),
      (
        "RABBITMQ_VIRTUAL_HOST".into(),
        self.rabbitmq_virtual_host.clone(),
      ),
      ("RABBITMQ_USER".into(), self.rabbitmq_user.clone()),
      ("RABBITMQ_PASSWORD".into(), self.rabbitmq_password.clone()),
      (
        "OPTIMIZATION_REQUEST_QUEUE".into(),
        self.optimization_request_queue.clone(),
      ),
      (
        "OPTIMIZATION_RESPONSE_QUEUE".into(),
        self.optimization_response_queue.clone(),
      ),
      ("SIMULATION_REQUEST_QUEUE".into(), queues.request),
      ("SIMULATION_RESPONSE_QUEUE".into(), queues.response),
      ("NUM_SOLVERS_GA".into(), self.num_solvers_ga.to_string()),
      (
        "OPTIMIZATION_DATA_FOLDER".into(),
        data_folder.display().to_string(),
      ),
      ("MODEL_FILE_NAME".into(), self.model_file_name.clone()),
    ];
    if let Some(secs) = self.evaluation_timeout_secs {
      env.push(("EVALUATION_TIMEOUT_SECS".into(), secs.to_string()));
    }
    env
  }
}
