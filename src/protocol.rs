//! Wire messages exchanged over the broker.
//!
//! Every message is a json document. Status codes travel as strings
//! (`"200"`) but numbers are accepted too.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::ConfigError;

/// A job id. Numeric ids are accepted and kept in their decimal form.
pub type JobId = String;

/// An HTTP-like status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
  pub const OK: StatusCode = StatusCode(200);
  pub const ACCEPTED: StatusCode = StatusCode(202);
  pub const ERROR: StatusCode = StatusCode(500);

  pub fn is_error(self) -> bool {
    self.0 >= 400
  }
}

impl fmt::Display for StatusCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

impl Serialize for StatusCode {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for StatusCode {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
      Number(u16),
      Text(String),
    }
    match Raw::deserialize(deserializer)? {
      Raw::Number(code) => Ok(StatusCode(code)),
      Raw::Text(text) => text
        .trim()
        .parse()
        .map(StatusCode)
        .map_err(serde::de::Error::custom),
    }
  }
}

fn job_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<JobId, D::Error> {
  match Value::deserialize(deserializer)? {
    Value::String(id) => Ok(id),
    Value::Number(id) => Ok(id.to_string()),
    other => Err(serde::de::Error::custom(format!("invalid optimization_id {other}"))),
  }
}

/// Reads the job id of a raw inbound message.
pub fn read_job_id(message: &Value) -> Option<JobId> {
  match message.get("optimization_id")? {
    Value::String(id) => Some(id.clone()),
    Value::Number(id) => Some(id.to_string()),
    _ => None,
  }
}

/// Search algorithm of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Method {
  /// NSGA-II.
  Ga,
  /// Nelder-Mead simplex search over a scalarized objective.
  Simplex,
}

impl TryFrom<String> for Method {
  type Error = ConfigError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    match value.as_str() {
      "GA" => Ok(Method::Ga),
      "Simplex" => Ok(Method::Simplex),
      _ => Err(ConfigError::UnknownMethod(value)),
    }
  }
}

impl From<Method> for String {
  fn from(method: Method) -> Self {
    match method {
      Method::Ga => "GA".into(),
      Method::Simplex => "Simplex".into(),
    }
  }
}

/// What happens when a worker fails to evaluate a candidate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
  /// The whole run fails.
  #[default]
  Abort,
  /// The candidate gets every objective's `penalty_value` and the run goes
  /// on.
  Penalize,
}

/// Algorithm parameters of a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
  pub method: Method,
  #[serde(default = "defaults::ngen")]
  pub ngen: usize,
  #[serde(default = "defaults::pop_size")]
  pub pop_size: usize,
  #[serde(default = "defaults::mutpb")]
  pub mutpb: f64,
  #[serde(default = "defaults::cxpb")]
  pub cxpb: f64,
  #[serde(default = "defaults::eta")]
  pub eta: f64,
  #[serde(default = "defaults::indpb")]
  pub indpb: f64,
  #[serde(default = "defaults::ncls")]
  pub ncls: usize,
  #[serde(default = "defaults::qbound")]
  pub qbound: f64,
  #[serde(default)]
  pub diversity_flg: bool,
  #[serde(default)]
  pub report_frequency: usize,
  #[serde(default = "defaults::maxf")]
  pub maxf: usize,
  #[serde(default = "defaults::tol")]
  pub xtol: f64,
  #[serde(default = "defaults::tol")]
  pub ftol: f64,
  /// Prior solution whose objects seed the template.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub initial_solution_id: Option<String>,
  #[serde(default)]
  pub failure_policy: FailurePolicy,
  /// Seed of the engine's random generator.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub seed: Option<u64>,
}

mod defaults {
  pub fn ngen() -> usize {
    10
  }
  pub fn pop_size() -> usize {
    10
  }
  pub fn mutpb() -> f64 {
    0.2
  }
  pub fn cxpb() -> f64 {
    0.7
  }
  pub fn eta() -> f64 {
    20.0
  }
  pub fn indpb() -> f64 {
    0.1
  }
  pub fn ncls() -> usize {
    1
  }
  pub fn qbound() -> f64 {
    0.5
  }
  pub fn maxf() -> usize {
    50
  }
  pub fn tol() -> f64 {
    1e-4
  }
}

/// One optimization objective.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Objective {
  /// Positive weights maximize, non-positive weights minimize.
  pub weight: f64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target: Option<f64>,
  #[serde(default)]
  pub summary_method: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub penalty_value: Option<f64>,
}

/// A result of an earlier or the current run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Solution {
  pub id: String,
  #[serde(default)]
  pub fitness: Vec<f64>,
  #[serde(default)]
  pub variables: Vec<f64>,
  #[serde(default)]
  pub objects: Vec<Value>,
  #[serde(default)]
  pub locally_optimized: bool,
}

/// The `optimization` section of a job-start request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSpec {
  pub parameters: Parameters,
  pub objectives: Vec<Objective>,
  #[serde(default)]
  pub objects: Vec<Value>,
  #[serde(default)]
  pub solutions: Vec<Solution>,
}

impl OptimizationSpec {
  pub fn weights(&self) -> Vec<f64> {
    self.objectives.iter().map(|o| o.weight).collect()
  }

  /// Objects the decision variables are laid over: those of the prior
  /// solution named by `initial_solution_id`, else the request's objects.
  pub fn template(&self) -> &[Value] {
    self
      .parameters
      .initial_solution_id
      .as_ref()
      .and_then(|id| self.solutions.iter().find(|s| &s.id == id))
      .map_or(self.objects.as_slice(), |s| s.objects.as_slice())
  }

  /// Penalty fitness, if every objective defines one.
  pub fn penalty(&self) -> Option<Vec<f64>> {
    self.objectives.iter().map(|o| o.penalty_value).collect()
  }

  /// Rejects parameter combinations no engine can run.
  pub fn validate(&self) -> Result<(), ConfigError> {
    let p = &self.parameters;
    let invalid = |field, reason: &str| {
      Err(ConfigError::Invalid {
        field,
        reason: reason.to_string(),
      })
    };
    if self.objectives.is_empty() {
      return invalid("objectives", "at least one objective is required");
    }
    if p.report_frequency > p.pop_size.max(1) {
      return invalid("report_frequency", "must not exceed pop_size");
    }
    if p.failure_policy == FailurePolicy::Penalize && self.penalty().is_none() {
      return invalid("failure_policy", "every objective needs a penalty_value");
    }
    match p.method {
      Method::Ga => {
        if p.pop_size == 0 {
          return invalid("pop_size", "must be positive");
        }
        if p.ngen == 0 {
          return invalid("ngen", "must be positive");
        }
        if !(0.0..=1.0).contains(&(p.cxpb + p.mutpb)) || p.cxpb < 0.0 || p.mutpb < 0.0 {
          return invalid("cxpb", "cxpb and mutpb must be non-negative and sum to at most 1");
        }
      }
      Method::Simplex => {
        if p.maxf == 0 {
          return invalid("maxf", "must be positive");
        }
      }
    }
    Ok(())
  }
}

/// Inbound message of the orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobRequest {
  OptimizationStart {
    #[serde(deserialize_with = "job_id")]
    optimization_id: JobId,
    optimization: OptimizationSpec,
  },
  OptimizationStop {
    #[serde(deserialize_with = "job_id")]
    optimization_id: JobId,
  },
}

/// Acknowledgement of a job request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobResponse {
  pub status_code: StatusCode,
  pub optimization_id: Option<JobId>,
  pub message: String,
}

impl JobResponse {
  pub fn new(
    status_code: StatusCode,
    optimization_id: Option<JobId>,
    message: impl Into<String>,
  ) -> Self {
    Self {
      status_code,
      optimization_id,
      message: message.into(),
    }
  }
}

/// Progress counters of a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
  /// Hypervolume per generation, or best scalar fitness per simplex step.
  pub progress_log: Vec<f64>,
  /// Evaluations completed in the current batch.
  pub simulation: usize,
  pub simulation_total: usize,
  pub iteration: usize,
  pub iteration_total: usize,
  #[serde(rename = "final")]
  pub is_final: bool,
}

/// Progress or result of a run, published on the orchestrator's response
/// queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
  pub optimization_id: JobId,
  pub status_code: StatusCode,
  #[serde(default)]
  pub message: String,
  pub progress: Progress,
  #[serde(default)]
  pub solutions: Vec<Solution>,
}

/// Anything published on the orchestrator's response queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outbound {
  Progress(ProgressMessage),
  Job(JobResponse),
}

/// Request to evaluate one candidate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
  pub ind_id: String,
  pub simulation_id: String,
  pub objects_data: Vec<Value>,
  pub optimization_id: JobId,
}

/// Result of evaluating one candidate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResponse {
  pub status_code: StatusCode,
  #[serde(default)]
  pub ind_id: Option<String>,
  #[serde(default)]
  pub fitness: Option<Vec<f64>>,
  #[serde(default)]
  pub message: String,
}

/// Tells a worker to leave its consume loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentinel {
  pub time_to_die: bool,
}

impl Sentinel {
  pub const SHUTDOWN: Sentinel = Sentinel { time_to_die: true };
}

/// Anything a worker may find on its request queue.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
  Shutdown(Sentinel),
  Evaluate(EvaluationRequest),
}
