//! Error types of every layer of the engine.
//!
//! Each concern owns a dedicated enum so callers can tell a malformed job
//! request apart from a dying worker pool or a crashed simulation. The
//! crate-level [`Error`] composes them for code that spans several layers,
//! like the optimization runner.

use thiserror::Error;

/// A malformed job request or process configuration. Rejected before any
/// resources are provisioned.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Failed to read optimization ID")]
  MissingId,
  #[error("Unknown request type: {0}")]
  UnknownType(String),
  #[error("unknown optimization method: {0}")]
  UnknownMethod(String),
  #[error("invalid parameter `{field}`: {reason}")]
  Invalid { field: &'static str, reason: String },
  #[error("missing setting `{0}`")]
  Missing(&'static str),
  #[error("environment variable `{var}` has invalid value `{value}`")]
  Env { var: String, value: String },
  #[error("malformed json: {0}")]
  Json(#[from] serde_json::Error),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Schema(#[from] SchemaError),
}

/// A candidate template that cannot be encoded into a flat vector.
#[derive(Debug, Error)]
pub enum SchemaError {
  #[error("object at position {0} has no `id`")]
  MissingId(usize),
  #[error("object at position {0} is not a json object")]
  NotAnObject(usize),
  #[error("leaf `{path}` has inverted bounds [{min}, {max}]")]
  InvertedBounds { path: String, min: f64, max: f64 },
  #[error("leaf `{path}` has a non-numeric `{key}`")]
  NotANumber { path: String, key: &'static str },
  #[error(
    "ragged bounds under `{path}`: expected {expected} entries, found {found}"
  )]
  RaggedShape {
    path: String,
    expected: usize,
    found: usize,
  },
  #[error("`{path}` needs a period level above its bound pairs")]
  MissingPeriod { path: String },
  #[error("expected {expected} variable values, got {found}")]
  LengthMismatch { expected: usize, found: usize },
}

/// A failure to obtain a fitness vector for a candidate.
#[derive(Debug, Error)]
pub enum EvalError {
  #[error("Error during evaluation occurred.\r\n{message}")]
  Worker { message: String },
  #[error("evaluation timed out with {outstanding} responses outstanding")]
  Timeout { outstanding: usize },
  #[error("response stream closed with {outstanding} responses outstanding")]
  Closed { outstanding: usize },
  #[error("worker returned {found} fitness values, expected {expected}")]
  FitnessLength { expected: usize, found: usize },
  #[error("no fitness in a successful response for `{0}`")]
  MissingFitness(String),
  #[error(transparent)]
  Broker(#[from] BrokerError),
  #[error(transparent)]
  Codec(#[from] serde_json::Error),
  #[error(transparent)]
  Schema(#[from] SchemaError),
  #[error(transparent)]
  Report(#[from] ReportError),
}

/// A message broker failure.
#[derive(Debug, Error)]
pub enum BrokerError {
  #[error("queue `{0}` does not exist")]
  QueueNotFound(String),
  #[error("broker connection closed")]
  Closed,
  #[error("delivery was already acknowledged")]
  AlreadyAcked,
  #[cfg(feature = "amqp")]
  #[error("amqp error: {0}")]
  Amqp(#[from] lapin::Error),
}

/// A container runtime failure.
#[derive(Debug, Error)]
pub enum RuntimeError {
  #[error("container `{0}` not found")]
  NotFound(String),
  #[error("failed to launch `{name}`: {reason}")]
  Launch { name: String, reason: String },
  #[error("container runtime error: {0}")]
  Backend(String),
  #[cfg(feature = "docker")]
  #[error("docker error: {0}")]
  Docker(#[from] bollard::errors::Error),
}

/// A worker pool that failed to start, or died right after starting.
#[derive(Debug, Error)]
pub enum ProvisioningError {
  #[error("Failed to start workers. {0}")]
  Runtime(#[from] RuntimeError),
  #[error("container `{name}` exited on startup with code {code}.\r\n{logs}")]
  Exited {
    name: String,
    role: crate::pool::Role,
    code: i64,
    logs: String,
  },
  #[error("Could not write model configuration to {path}. {source}")]
  Persist {
    path: String,
    source: std::io::Error,
  },
}

/// Best-effort cleanup that did not fully succeed. Logged, never fatal.
#[derive(Debug, Error)]
#[error("teardown finished with {} failures: {}", failures.len(), failures.join("; "))]
pub struct TeardownError {
  pub failures: Vec<String>,
}

/// A progress message that could not be delivered.
#[derive(Debug, Error)]
pub enum ReportError {
  #[error(transparent)]
  Broker(#[from] BrokerError),
  #[error(transparent)]
  Schema(#[from] SchemaError),
  #[error(transparent)]
  Codec(#[from] serde_json::Error),
}

/// Any failure of an optimization run.
#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Schema(#[from] SchemaError),
  #[error(transparent)]
  Eval(#[from] EvalError),
  #[error(transparent)]
  Broker(#[from] BrokerError),
  #[error(transparent)]
  Report(#[from] ReportError),
  #[error(transparent)]
  Runtime(#[from] RuntimeError),
  #[error(transparent)]
  Provisioning(#[from] ProvisioningError),
  #[error("empty population")]
  EmptyPopulation,
  #[error("simplex search failed: {0}")]
  Simplex(String),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_worker_message_is_verbatim() {
    let err = Error::from(EvalError::Worker {
      message: "sim crashed".into(),
    });
    assert!(err.to_string().contains("sim crashed"));
  }

  #[test]
  fn test_teardown_lists_failures() {
    let err = TeardownError {
      failures: vec!["a".into(), "b".into()],
    };
    assert_eq!(err.to_string(), "teardown finished with 2 failures: a; b");
  }
}
