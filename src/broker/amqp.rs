//! [`Broker`] over AMQP 0-9-1, for RabbitMQ.

use async_trait::async_trait;
use futures::{stream::BoxStream, FutureExt, StreamExt, TryStreamExt};
use lapin::{
  options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions, QueueDeleteOptions,
  },
  types::FieldTable,
  BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{Broker, Delivery};
use crate::error::BrokerError;

/// Persistent delivery mode of AMQP messages.
const PERSISTENT: u8 = 2;

/// One connection with one channel. Consumers get one unacknowledged message
/// at a time, so work spreads evenly over the subscribers of a queue.
pub struct AmqpBroker {
  _connection: Connection,
  channel: Channel,
}

impl AmqpBroker {
  #[instrument(level = "info", skip(uri))]
  pub async fn connect(uri: &str) -> Result<Self, BrokerError> {
    let connection =
      Connection::connect(uri, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    channel.basic_qos(1, BasicQosOptions::default()).await?;
    info!("connected to the message broker");
    Ok(Self {
      _connection: connection,
      channel,
    })
  }
}

#[async_trait]
impl Broker for AmqpBroker {
  async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
    self
      .channel
      .queue_declare(
        queue,
        QueueDeclareOptions {
          durable: true,
          ..Default::default()
        },
        FieldTable::default(),
      )
      .await?;
    Ok(())
  }

  async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
    self
      .channel
      .basic_publish(
        "",
        queue,
        BasicPublishOptions::default(),
        &payload,
        BasicProperties::default().with_delivery_mode(PERSISTENT),
      )
      .await?
      .await?;
    Ok(())
  }

  async fn consume(
    &self,
    queue: &str,
  ) -> Result<BoxStream<'static, Result<Delivery, BrokerError>>, BrokerError> {
    let tag = format!("{queue}-{}", Uuid::new_v4());
    let consumer = self
      .channel
      .basic_consume(
        queue,
        &tag,
        BasicConsumeOptions::default(),
        FieldTable::default(),
      )
      .await?;
    debug!(queue, tag, "subscribed");
    let stream = consumer.map_err(BrokerError::from).map_ok(|delivery| {
      let acker = delivery.acker;
      Delivery::new(delivery.data, move || {
        async move {
          acker.ack(BasicAckOptions::default()).await?;
          Ok(())
        }
        .boxed()
      })
    });
    Ok(stream.boxed())
  }

  async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
    let purged = self
      .channel
      .queue_delete(queue, QueueDeleteOptions::default())
      .await?;
    debug!(queue, purged, "deleted queue");
    Ok(())
  }
}
