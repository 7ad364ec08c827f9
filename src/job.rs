//! Lifecycle of an optimization job as seen by the orchestrator.

use std::fmt;

use crate::protocol::{JobId, Method};

/// `Received -> Provisioning -> Running -> {Completed | Failed | Stopped}`.
/// A job may also fail straight out of `Provisioning`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobStatus {
  Received,
  Provisioning,
  Running,
  Completed,
  Failed,
  Stopped,
}

impl JobStatus {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
    )
  }

  /// Whether the job may move from `self` to `next`.
  pub fn can_become(self, next: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
      (self, next),
      (Received, Provisioning)
        | (Received, Failed)
        | (Provisioning, Running)
        | (Provisioning, Failed)
        | (Provisioning, Stopped)
        | (Running, Completed)
        | (Running, Failed)
        | (Running, Stopped)
    )
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Job {
  pub id: JobId,
  pub method: Method,
  /// Evaluation workers provisioned for the job.
  pub workers: usize,
  status: JobStatus,
}

impl Job {
  pub fn new(id: JobId, method: Method, workers: usize) -> Self {
    Self {
      id,
      method,
      workers,
      status: JobStatus::Received,
    }
  }

  pub fn status(&self) -> JobStatus {
    self.status
  }

  /// Moves the job to `next`. Returns `false`, leaving the job unchanged, if
  /// the transition is not allowed.
  pub fn transition(&mut self, next: JobStatus) -> bool {
    let allowed = self.status.can_become(next);
    if allowed {
      self.status = next;
    }
    allowed
  }
}
