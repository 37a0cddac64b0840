// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module defines the broker seam of the crate and its lapin implementation.
//!
//! - [`AmqpChannel`]: the operations the reliability layer issues on a channel.
//! - [`AmqpConnection`]: a live connection that can be closed.
//! - [`AmqpConnector`]: opens a connection plus channel and reports unexpected closes.
//!
//! [`LapinChannel`] serializes every operation through a mutex, so the single shared
//! channel is never used by two tasks at once.

use crate::{
    config::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Message,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error};

/// Reply code sent to the broker on a graceful close
const AMQP_REPLY_SUCCESS: u16 = 200;

/// Stream of deliveries produced by a subscription.
pub type DeliveryStream = BoxStream<'static, Result<Message, AmqpError>>;

/// Operations issued on the shared broker channel.
///
/// Declarations are idempotent on the broker side: repeating one with identical
/// arguments succeeds, a mismatching one closes the channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares an exchange.
    ///
    /// # Parameters
    /// * `def` - Name, kind, durability and arguments of the exchange
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes without waiting for a publisher confirm.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange
    /// * `routing_key` - Routing key of the message
    /// * `payload` - Message body
    /// * `properties` - Content type, message id, headers and other AMQP properties
    ///
    /// # Returns
    /// Ok(()) once the frame is handed to the connection, or [`AmqpError::Publishing`]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Acknowledges a single delivery. Tags are only valid on the delivering channel.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejects a single delivery, dropping it unless `requeue` is set.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Starts a manual-ack subscription.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume from
    /// * `consumer_tag` - Tag identifying the subscription, unique per channel
    ///
    /// # Returns
    /// A stream of deliveries that ends when the subscription is cancelled
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A live broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn close(&self) -> Result<(), AmqpError>;
}

/// A connection together with its channel and the signal fired when the broker side
/// goes away. The signal carries the reason; it is dropped without firing when the
/// connection is released normally.
pub struct AmqpSession {
    pub connection: Arc<dyn AmqpConnection>,
    pub channel: Arc<dyn AmqpChannel>,
    pub closed: oneshot::Receiver<String>,
}

/// Opens broker sessions.
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    /// Opens a connection and a channel on it.
    ///
    /// # Returns
    /// The session, or the error of whichever step failed
    async fn connect(&self) -> Result<AmqpSession, AmqpError>;
}

/// Reports the loss of a session once, whichever of its connection or channel fails
/// first.
#[derive(Clone)]
pub(crate) struct CloseSignal {
    sender: Arc<StdMutex<Option<oneshot::Sender<String>>>>,
}

impl CloseSignal {
    pub(crate) fn new() -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        let signal = CloseSignal {
            sender: Arc::new(StdMutex::new(Some(tx))),
        };
        (signal, rx)
    }

    pub(crate) fn fire(&self, reason: String) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(tx) = sender {
            let _ = tx.send(reason);
        }
    }
}

/// Connector backed by lapin.
pub struct LapinConnector {
    uri: String,
    connection_name: String,
}

impl LapinConnector {
    /// Creates a connector for the broker described by `cfg`.
    ///
    /// # Parameters
    /// * `cfg` - Broker address, credentials and connection name
    pub fn new(cfg: &RabbitMQConfigs) -> Self {
        LapinConnector {
            uri: cfg.uri(),
            connection_name: cfg.connection_name.clone(),
        }
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self) -> Result<AmqpSession, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::connection(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let (closed, closed_rx) = CloseSignal::new();
        {
            let closed = closed.clone();
            conn.on_error(move |err| closed.fire(format!("connection error: {err}")));
        }

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::Channel(err.to_string()))
            }
        }?;
        debug!("channel created");

        channel.on_error(move |err| closed.fire(format!("channel error: {err}")));

        Ok(AmqpSession {
            connection: Arc::new(LapinConnection { inner: conn }),
            channel: Arc::new(LapinChannel::new(channel)),
            closed: closed_rx,
        })
    }
}

pub struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(AMQP_REPLY_SUCCESS, "closing connection")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                AmqpError::connection(err.to_string())
            })
    }
}

/// lapin channel with serialized access.
pub struct LapinChannel {
    channel: Channel,
    lock: Mutex<()>,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> Self {
        LapinChannel {
            channel,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;

        self.channel
            .exchange_declare(
                def.name(),
                def.kind().into(),
                ExchangeDeclareOptions {
                    durable: def.is_durable(),
                    ..Default::default()
                },
                def.params().clone(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchange(def.name().to_owned())
            })
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;

        self.channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    durable: def.is_durable(),
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name = def.name(), "error to declare the queue");
                AmqpError::DeclareQueue(def.name().to_owned())
            })
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;

        self.channel
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueue(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                )
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map(|_confirm| ())
            .map_err(|err| {
                error!(error = err.to_string(), exchange, routing_key, "error publishing message");
                AmqpError::Publishing(err.to_string())
            })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;

        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessage
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;

        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                AmqpError::NackMessage
            })
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;

        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclaration(err.to_string())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let _guard = self.lock.lock().await;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::Consumer(err.to_string())
            })?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(Message::from)
                    .map_err(|err| AmqpError::Consumer(err.to_string()))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;

        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "failure to cancel consumer");
                AmqpError::Consumer(err.to_string())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;

        self.channel
            .close(AMQP_REPLY_SUCCESS, "closing channel")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the channel");
                AmqpError::Channel(err.to_string())
            })
    }
}
