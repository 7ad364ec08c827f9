//! [`ContainerRuntime`] that runs each "container" as a tokio task.
//!
//! Every launch hands the spec to a launcher closure that returns the body
//! of the container. A body that returns `Ok` exits with code 0, one that
//! returns `Err` exits with code 1 and its message as logs. Stopping aborts
//! the task.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::{ContainerRuntime, ContainerSpec, ContainerState};
use crate::error::RuntimeError;

/// Exit code of a task that was aborted, like a killed process.
pub const KILLED: i64 = 137;

type Launcher =
  dyn Fn(ContainerSpec) -> BoxFuture<'static, Result<(), String>> + Send + Sync;

#[derive(Clone, Debug)]
struct Exit {
  code: i64,
  logs: String,
}

struct Task {
  name: String,
  handle: JoinHandle<()>,
  exit: Arc<Mutex<Option<Exit>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Task {
  fn exit(&self) -> Option<Exit> {
    let exit = lock(&self.exit).clone();
    match exit {
      Some(exit) => Some(exit),
      // panicked or aborted
      None if self.handle.is_finished() => Some(Exit {
        code: KILLED,
        logs: String::new(),
      }),
      None => None,
    }
  }
}

/// Runs containers as tasks of the current tokio runtime.
pub struct TaskRuntime {
  launcher: Box<Launcher>,
  tasks: Mutex<HashMap<String, Task>>,
}

impl TaskRuntime {
  pub fn new<F>(launcher: F) -> Self
  where
    F: Fn(ContainerSpec) -> BoxFuture<'static, Result<(), String>>
      + Send
      + Sync
      + 'static,
  {
    Self {
      launcher: Box::new(launcher),
      tasks: Mutex::new(HashMap::new()),
    }
  }

  /// Number of tasks launched and not yet removed.
  pub fn count(&self) -> usize {
    lock(&self.tasks).len()
  }

  /// Names of the tasks launched and not yet removed.
  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> =
      lock(&self.tasks).values().map(|t| t.name.clone()).collect();
    names.sort();
    names
  }

  fn with_task<T>(
    &self,
    id: &str,
    f: impl FnOnce(&Task) -> T,
  ) -> Result<T, RuntimeError> {
    lock(&self.tasks)
      .get(id)
      .map(f)
      .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
  }
}

#[async_trait]
impl ContainerRuntime for TaskRuntime {
  async fn launch(&self, spec: ContainerSpec) -> Result<String, RuntimeError> {
    let id = Uuid::new_v4().to_string();
    let name = spec.name.clone();
    let body = (self.launcher)(spec);
    let exit = Arc::new(Mutex::new(None));
    let handle = tokio::spawn({
      let exit = exit.clone();
      let name = name.clone();
      async move {
        let outcome = match body.await {
          Ok(()) => Exit {
            code: 0,
            logs: String::new(),
          },
          Err(logs) => Exit { code: 1, logs },
        };
        debug!(name, code = outcome.code, "task exited");
        *lock(&exit) = Some(outcome);
      }
    });
    lock(&self.tasks).insert(id.clone(), Task { name, handle, exit });
    Ok(id)
  }

  async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
    self.with_task(id, |task| {
      let exit = task.exit();
      ContainerState {
        running: exit.is_none(),
        exit_code: exit.map(|e| e.code),
      }
    })
  }

  async fn logs(&self, id: &str) -> Result<String, RuntimeError> {
    self.with_task(id, |task| task.exit().map(|e| e.logs).unwrap_or_default())
  }

  async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
    self.with_task(id, |task| {
      task.handle.abort();
      lock(&task.exit).get_or_insert(Exit {
        code: KILLED,
        logs: String::new(),
      });
    })
  }

  async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
    let task = lock(&self.tasks)
      .remove(id)
      .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
    task.handle.abort();
    Ok(())
  }

  async fn list_exited(&self) -> Result<Vec<String>, RuntimeError> {
    Ok(
      lock(&self.tasks)
        .iter()
        .filter(|(_, task)| task.exit().is_some())
        .map(|(id, _)| id.clone())
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use futures::FutureExt;

  use super::*;
  use crate::pool::Role;

  fn spec(name: &str) -> ContainerSpec {
    ContainerSpec {
      name: name.into(),
      role: Role::Worker,
      job_id: "1".into(),
      image: "img".into(),
      env: vec![],
      binds: vec![],
    }
  }

  #[tokio::test]
  async fn test_exit_codes_and_logs() {
    let runtime = TaskRuntime::new(|spec: ContainerSpec| {
      async move {
        match spec.name.as_str() {
          "ok" => Ok(()),
          "bad" => Err("boom".to_string()),
          _ => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
          }
        }
      }
      .boxed()
    });
    let ok = runtime.launch(spec("ok")).await.unwrap();
    let bad = runtime.launch(spec("bad")).await.unwrap();
    let slow = runtime.launch(spec("slow")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(runtime.inspect(&ok).await.unwrap().exit_code, Some(0));
    assert_eq!(runtime.inspect(&bad).await.unwrap().exit_code, Some(1));
    assert_eq!(runtime.logs(&bad).await.unwrap(), "boom");
    assert!(runtime.inspect(&slow).await.unwrap().running);

    let mut exited = runtime.list_exited().await.unwrap();
    exited.sort();
    let mut expected = vec![ok.clone(), bad.clone()];
    expected.sort();
    assert_eq!(exited, expected);

    runtime.stop(&slow).await.unwrap();
    assert_eq!(
      runtime.inspect(&slow).await.unwrap().exit_code,
      Some(KILLED)
    );
    runtime.remove(&slow).await.unwrap();
    assert!(matches!(
      runtime.inspect(&slow).await,
      Err(RuntimeError::NotFound(_))
    ));
    assert_eq!(runtime.names(), ["bad", "ok"]);
  }
}
