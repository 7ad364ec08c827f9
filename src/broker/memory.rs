//! An in-process broker on top of tokio primitives.
//!
//! Used to run a whole optimization inside one process, mainly in tests.
//! Messages are handed over on delivery, acknowledgement only confirms it.

use std::{
  collections::{HashMap, VecDeque},
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use futures::{stream::BoxStream, FutureExt, StreamExt};
use tokio::sync::Notify;
use tracing::trace;

use super::{Broker, Delivery};
use crate::error::BrokerError;

#[derive(Default)]
struct QueueState {
  messages: VecDeque<Vec<u8>>,
  closed: bool,
}

#[derive(Default)]
struct Queue {
  state: Mutex<QueueState>,
  notify: Notify,
}

impl Queue {
  fn state(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Waits for the next message. `None` once the queue is deleted.
  async fn next(self: Arc<Self>) -> Option<(Vec<u8>, Arc<Self>)> {
    loop {
      let notified = self.notify.notified();
      let payload = {
        let mut state = self.state();
        if state.closed {
          return None;
        }
        let payload = state.messages.pop_front();
        if payload.is_some() && !state.messages.is_empty() {
          // hand the rest to another idle consumer
          self.notify.notify_one();
        }
        payload
      };
      match payload {
        Some(payload) => {
          drop(notified);
          return Some((payload, self));
        }
        None => notified.await,
      }
    }
  }
}

/// A broker that lives in the memory of the current process. Cloning yields
/// another handle to the same queues.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
  queues: Arc<Mutex<HashMap<String, Arc<Queue>>>>,
}

impl InMemoryBroker {
  pub fn new() -> Self {
    Self::default()
  }

  fn queues(&self) -> MutexGuard<'_, HashMap<String, Arc<Queue>>> {
    self.queues.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn queue(&self, name: &str) -> Option<Arc<Queue>> {
    self.queues().get(name).cloned()
  }

  pub fn queue_exists(&self, name: &str) -> bool {
    self.queues().contains_key(name)
  }

  /// Number of messages waiting in `name`.
  pub fn pending(&self, name: &str) -> usize {
    self.queue(name).map_or(0, |q| q.state().messages.len())
  }
}

#[async_trait]
impl Broker for InMemoryBroker {
  async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
    self.queues().entry(queue.to_string()).or_default();
    Ok(())
  }

  async fn publish(
    &self,
    queue: &str,
    payload: Vec<u8>,
  ) -> Result<(), BrokerError> {
    match self.queue(queue) {
      Some(q) => {
        q.state().messages.push_back(payload);
        q.notify.notify_one();
      }
      // unroutable messages are dropped, like on an AMQP default exchange
      None => trace!(queue, "dropping message to an undeclared queue"),
    }
    Ok(())
  }

  async fn consume(
    &self,
    queue: &str,
  ) -> Result<BoxStream<'static, Result<Delivery, BrokerError>>, BrokerError> {
    let q = self
      .queue(queue)
      .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
    let stream = futures::stream::unfold(q, |q| async move {
      let (payload, q) = q.next().await?;
      let delivery = Delivery::new(payload, || async { Ok(()) }.boxed());
      Some((Ok(delivery), q))
    });
    Ok(stream.boxed())
  }

  async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
    if let Some(q) = self.queues().remove(queue) {
      q.state().closed = true;
      q.notify.notify_waiters();
      // a consumer between its check and its wait holds a permit instead
      q.notify.notify_one();
    }
    Ok(())
  }
}
