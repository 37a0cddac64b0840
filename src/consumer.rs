// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! [`RabbitMQConsumer`] subscribes to one queue and hands every delivery, decoded as JSON,
//! to an injected [`ConsumerHandler`]. Successful deliveries are acknowledged. Failures
//! are classified and routed through the [`DlqHandler`]: non-retryable errors go straight
//! to the dead-letter queue, everything else (undecodable payloads included) is retried
//! with backoff. A message whose failure cannot be routed is rejected without requeue and
//! reported loudly.
//!
//! The subscription survives reconnections: `start` registers a hook on the
//! [`ConnectionManager`] that subscribes again on the new channel. A delivery whose
//! channel was replaced while it was being handled is neither acked nor routed; the
//! broker redelivers it on the new subscription.

use crate::{
    config::ConsumerConfigs,
    connection::ConnectionManager,
    dlq::DlqHandler,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Message,
    otel,
    queue::{QueueBinding, QueueDefinition},
    topology::AmqpTopology,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::types::FieldTable;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use serde_json::Value;
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info, info_span, warn, Instrument};

const TRACER_NAME: &str = "rabbitmq-reliability";

/// A decoded delivery as seen by a [`ConsumerHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub headers: FieldTable,
    pub content: Value,
}

/// Business logic invoked for each delivery.
///
/// Return [`AmqpError::NonRetryable`] for failures that retrying cannot fix; any other
/// error schedules a delayed retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Handles one delivery.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context extracted from the message headers
    /// * `msg` - The delivery with its payload decoded as JSON
    ///
    /// # Returns
    /// Ok(()) to acknowledge the message, or the error deciding its retry path
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError>;
}

/// Sequential consumer of one queue with retry and dead-letter routing.
pub struct RabbitMQConsumer {
    connection: ConnectionManager,
    cfg: ConsumerConfigs,
    dlq: DlqHandler,
    handler: Arc<dyn ConsumerHandler>,
    tracer: BoxedTracer,
    running: AtomicBool,
    resubscribe_registered: AtomicBool,
}

impl RabbitMQConsumer {
    /// Creates a stopped consumer.
    ///
    /// # Parameters
    /// * `connection` - Manager providing the channel, shared with `dlq`
    /// * `cfg` - Queue, exchange, consumer tag, prefetch and binding keys
    /// * `dlq` - Retry and dead-letter routing for failed deliveries
    /// * `handler` - Business logic invoked for every delivery
    ///
    /// # Returns
    /// The consumer, or [`AmqpError::Configuration`] naming the invalid field
    pub fn new(
        connection: ConnectionManager,
        cfg: ConsumerConfigs,
        dlq: DlqHandler,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Arc<Self>, AmqpError> {
        cfg.validate()?;

        Ok(Arc::new(RabbitMQConsumer {
            connection,
            cfg,
            dlq,
            handler,
            tracer: global::tracer(TRACER_NAME),
            running: AtomicBool::new(false),
            resubscribe_registered: AtomicBool::new(false),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The consumer's exchange and queue, bound under every binding key to both the
    /// exchange and the delay exchange, so delayed retries route back to the queue.
    pub fn topology(&self) -> AmqpTopology {
        let delay_exchange = &self.dlq.names().delay_exchange;

        self.cfg.bindings.iter().fold(
            AmqpTopology::new()
                .exchange(ExchangeDefinition::new(&self.cfg.exchange).topic().durable())
                .queue(QueueDefinition::new(&self.cfg.queue).durable()),
            |topology, key| {
                topology
                    .queue_binding(
                        QueueBinding::new(&self.cfg.queue)
                            .exchange(&self.cfg.exchange)
                            .routing_key(key),
                    )
                    .queue_binding(
                        QueueBinding::new(&self.cfg.queue)
                            .exchange(delay_exchange)
                            .routing_key(key),
                    )
            },
        )
    }

    /// Asserts the retry/dead-letter topology, then the consumer's own.
    pub async fn setup(&self) -> Result<(), AmqpError> {
        self.dlq.setup().await?;

        let channel = self.connection.get_channel()?;
        self.topology().install(channel.as_ref()).await?;

        info!(
            queue = self.cfg.queue,
            exchange = self.cfg.exchange,
            "consumer topology ready"
        );
        Ok(())
    }

    /// Subscribes to the queue and processes deliveries one at a time in a spawned task.
    ///
    /// Calling it on a running consumer does nothing.
    pub async fn start(self: &Arc<Self>) -> Result<(), AmqpError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(queue = self.cfg.queue, "consumer already started");
            return Ok(());
        }

        if let Err(err) = self.subscribe().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }

        if !self.resubscribe_registered.swap(true, Ordering::SeqCst) {
            let consumer = Arc::downgrade(self);
            self.connection.on_reconnected(move || {
                let Some(consumer) = consumer.upgrade() else {
                    return;
                };
                if !consumer.is_running() {
                    return;
                }

                tokio::spawn(async move {
                    if let Err(err) = consumer.subscribe().await {
                        error!(
                            error = err.to_string(),
                            queue = consumer.cfg.queue,
                            "failure to resubscribe after reconnection"
                        );
                    }
                });
            });
        }

        Ok(())
    }

    /// Cancels the subscription. A delivery already being handled runs to completion.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        self.running.store(false, Ordering::SeqCst);

        self.connection
            .get_channel()?
            .cancel(&self.cfg.consumer_tag)
            .await?;

        info!(queue = self.cfg.queue, "consumer stopped");
        Ok(())
    }

    async fn subscribe(self: &Arc<Self>) -> Result<(), AmqpError> {
        let channel = self.connection.get_channel()?;

        channel.qos(self.cfg.prefetch).await?;
        let mut deliveries = channel
            .consume(&self.cfg.queue, &self.cfg.consumer_tag)
            .await?;

        let span = info_span!(
            "amqp_consumer",
            queue = %self.cfg.queue,
            service = %self.dlq.service_name()
        );
        let consumer = self.clone();

        tokio::spawn(
            async move {
                while let Some(delivery) = deliveries.next().await {
                    let message = match delivery {
                        Ok(message) => message.with_delivery_channel(channel.clone()),
                        Err(err) => {
                            error!(error = err.to_string(), "delivery stream failed");
                            break;
                        }
                    };

                    if let Err(err) = consumer.handle_delivery(Some(message)).await {
                        error!(error = err.to_string(), code = err.code(), "failure handling delivery");
                    }
                }

                debug!("delivery stream ended");
            }
            .instrument(span),
        );

        info!(
            queue = self.cfg.queue,
            consumer_tag = self.cfg.consumer_tag,
            prefetch = self.cfg.prefetch,
            "consumer subscribed"
        );
        Ok(())
    }

    /// Processes one delivery.
    ///
    /// # Parameters
    /// * `delivery` - The message, or `None` when the subscription was cancelled
    ///
    /// # Returns
    /// Ok(()) once the message is acked, routed, or left to redelivery; otherwise the ack
    /// failure or [`AmqpError::DeadLetterRouting`] when the failed message was rejected
    pub async fn handle_delivery(&self, delivery: Option<Message>) -> Result<(), AmqpError> {
        let Some(message) = delivery else {
            debug!("empty delivery ignored");
            return Ok(());
        };

        let headers = message.headers();
        let (ctx, mut span) = otel::new_span(&headers, &self.tracer, &self.cfg.queue);

        debug!(
            routing_key = message.routing_key,
            delivery_tag = message.delivery_tag,
            redelivered = message.redelivered,
            "received message"
        );

        let result = match message.decode_json() {
            Ok(content) => {
                let msg = ConsumerMessage {
                    queue: self.cfg.queue.clone(),
                    routing_key: message.routing_key.clone(),
                    delivery_tag: message.delivery_tag,
                    redelivered: message.redelivered,
                    headers,
                    content,
                };
                self.handler.exec(&ctx, &msg).await
            }
            Err(err) => Err(err),
        };

        if !self.connection.is_current_delivery(&message) {
            warn!(
                queue = self.cfg.queue,
                delivery_tag = message.delivery_tag,
                "channel replaced while handling the message, leaving it to broker redelivery"
            );
            span.set_status(Status::Error {
                description: Cow::from("delivery channel replaced"),
            });
            return Ok(());
        }

        match result {
            Ok(()) => {
                debug!("message successfully processed");
                let channel = self.connection.channel_for(&message)?;
                if let Err(err) = channel.ack(message.delivery_tag).await {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    return Err(err);
                }
                span.set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                self.route_failure(&message, &err).await
            }
        }
    }

    async fn route_failure(&self, message: &Message, err: &AmqpError) -> Result<(), AmqpError> {
        let routed = if err.is_retryable() {
            self.dlq.handle_retryable_error(message, err).await
        } else {
            self.dlq.handle_non_retryable_error(message, err).await
        };

        let routing_err = match routed {
            Ok(action) => {
                debug!(?action, "failed message routed");
                return Ok(());
            }
            Err(routing_err) => routing_err,
        };

        error!(
            queue = self.cfg.queue,
            error = err.to_string(),
            routing_error = routing_err.to_string(),
            "failure to route failed message, rejecting it without requeue"
        );

        match self.connection.channel_for(message) {
            Ok(channel) => {
                if let Err(nack_err) = channel.nack(message.delivery_tag, false).await {
                    error!(error = nack_err.to_string(), "error whiling nack msg");
                }
            }
            Err(channel_err) => {
                error!(error = channel_err.to_string(), "no channel to reject the message");
            }
        }

        Err(AmqpError::DeadLetterRouting(routing_err.to_string()))
    }
}
