//! Message broker abstraction.
//!
//! Queues are named, durable and point-to-point: each message is handed to
//! exactly one consumer and stays owned by it until acknowledged. Two
//! implementations exist: an in-process broker and an AMQP client.

use std::fmt;

use async_trait::async_trait;
use futures::{future::BoxFuture, stream::BoxStream};
use serde::Serialize;

use crate::error::{BrokerError, ReportError};

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

/// One message taken from a queue.
pub struct Delivery {
  pub payload: Vec<u8>,
  acker: Option<Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BrokerError>> + Send>>,
}

impl Delivery {
  /// A delivery that runs `ack` when acknowledged.
  pub fn new<F>(payload: Vec<u8>, ack: F) -> Self
  where
    F: FnOnce() -> BoxFuture<'static, Result<(), BrokerError>> + Send + 'static,
  {
    Self {
      payload,
      acker: Some(Box::new(ack)),
    }
  }

  /// Confirms the message was handled. Must be called at most once.
  pub async fn ack(&mut self) -> Result<(), BrokerError> {
    match self.acker.take() {
      Some(ack) => ack().await,
      None => Err(BrokerError::AlreadyAcked),
    }
  }
}

impl fmt::Debug for Delivery {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Delivery")
      .field("payload", &String::from_utf8_lossy(&self.payload))
      .field("acked", &self.acker.is_none())
      .finish()
  }
}

/// A message broker with durable, point-to-point queues.
#[async_trait]
pub trait Broker: Send + Sync {
  /// Creates `queue` if it does not exist.
  async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

  /// Publishes a persistent message to `queue`.
  async fn publish(
    &self,
    queue: &str,
    payload: Vec<u8>,
  ) -> Result<(), BrokerError>;

  /// Subscribes to `queue`. The stream ends when the queue is deleted or the
  /// connection closes.
  async fn consume(
    &self,
    queue: &str,
  ) -> Result<BoxStream<'static, Result<Delivery, BrokerError>>, BrokerError>;

  /// Deletes `queue` with every message still in it.
  async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError>;
}

/// Serializes `message` as json and publishes it.
pub async fn publish_json<B, T>(
  broker: &B,
  queue: &str,
  message: &T,
) -> Result<(), ReportError>
where
  B: Broker + ?Sized,
  T: Serialize + Sync,
{
  let payload = serde_json::to_vec(message)?;
  broker.publish(queue, payload).await?;
  Ok(())
}
