// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead-Letter and Retry Routing
//!
//! [`DlqHandler`] decides the fate of a message whose processing failed:
//!
//! - a retryable failure below the retry limit is republished to the delay exchange
//!   `{exchange}.delay` with an exponentially growing `x-delay`;
//! - an exhausted or non-retryable failure is published to the dead-letter exchange
//!   `{exchange}.dlq` (bound to `{queue}.dlq`) and an [`AlertRecord`] is published on the
//!   `notifications` exchange under `notifications.dlq.{service}`.
//!
//! In both cases the original delivery is acknowledged: ownership of the message moves
//! to the delay exchange or to the dead-letter queue. Publishes do not wait for
//! publisher confirms, and broker errors are returned to the caller untouched.

use crate::{
    channel::AmqpChannel,
    config::DlqConfigs,
    connection::ConnectionManager,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Message,
    publisher::JSON_CONTENT_TYPE,
    queue::{QueueBinding, QueueDefinition},
    retry::{now_iso8601, retry_delay_ms, RetryMetadata, AMQP_HEADERS_DELAY},
    topology::AmqpTopology,
};
use lapin::types::{AMQPValue, LongLongInt, ShortString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

/// Exchange shared by every service for operator alerts
pub const NOTIFICATIONS_EXCHANGE: &str = "notifications";

/// Broker object names derived from the configured exchange, queue and service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqNames {
    pub delay_exchange: String,
    pub dlq_exchange: String,
    pub dlq_queue: String,
    pub dlq_routing_key: String,
    pub notifications_exchange: String,
    pub alert_routing_key: String,
}

impl DlqNames {
    pub fn new(cfg: &DlqConfigs) -> Self {
        DlqNames {
            delay_exchange: format!("{}.delay", cfg.exchange),
            dlq_exchange: format!("{}.dlq", cfg.exchange),
            dlq_queue: format!("{}.dlq", cfg.queue),
            dlq_routing_key: cfg.queue.clone(),
            notifications_exchange: NOTIFICATIONS_EXCHANGE.to_owned(),
            alert_routing_key: format!("notifications.dlq.{}", cfg.service_name),
        }
    }
}

/// Alert published once per dead-lettered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub service: String,
    pub queue: String,
    pub error: String,
    pub retry_count: u32,
    /// The payload as JSON, or as raw text when it is not valid JSON
    pub original_message: Value,
    pub timestamp: String,
}

/// Outcome of routing a failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Republished to the delay exchange as retry number `attempt`.
    Scheduled { attempt: u32, delay_ms: u64 },
    /// Published to the dead-letter queue and alerted on.
    DeadLettered,
}

/// Retry and dead-letter routing for one consumed queue.
///
/// Every publish and the final ack of a failed message happen on the channel the
/// message was delivered on.
pub struct DlqHandler {
    connection: ConnectionManager,
    cfg: DlqConfigs,
    names: DlqNames,
}

impl DlqHandler {
    /// Creates a handler for the queue named in `cfg`.
    ///
    /// # Parameters
    /// * `connection` - Manager providing the channel for topology setup
    /// * `cfg` - Base exchange, consumed queue, service name and retry limit
    ///
    /// # Returns
    /// The handler, or [`AmqpError::Configuration`] naming the invalid field
    pub fn new(connection: ConnectionManager, cfg: DlqConfigs) -> Result<Self, AmqpError> {
        cfg.validate()?;
        let names = DlqNames::new(&cfg);

        Ok(DlqHandler {
            connection,
            cfg,
            names,
        })
    }

    pub fn names(&self) -> &DlqNames {
        &self.names
    }

    pub fn service_name(&self) -> &str {
        &self.cfg.service_name
    }

    pub fn max_retries(&self) -> u32 {
        self.cfg.max_retries
    }

    /// The four broker objects backing retries and dead-lettering.
    pub fn topology(&self) -> AmqpTopology {
        AmqpTopology::new()
            .exchange(
                ExchangeDefinition::new(&self.names.delay_exchange)
                    .delayed_topic()
                    .durable(),
            )
            .exchange(ExchangeDefinition::new(&self.names.dlq_exchange).topic().durable())
            .exchange(
                ExchangeDefinition::new(&self.names.notifications_exchange)
                    .topic()
                    .durable(),
            )
            .queue(QueueDefinition::new(&self.names.dlq_queue).durable())
            .queue_binding(
                QueueBinding::new(&self.names.dlq_queue)
                    .exchange(&self.names.dlq_exchange)
                    .routing_key(&self.names.dlq_routing_key),
            )
    }

    /// Asserts the retry/dead-letter topology. Safe to call any number of times.
    pub async fn setup(&self) -> Result<(), AmqpError> {
        let channel = self.connection.get_channel()?;

        self.topology().install(channel.as_ref()).await.map_err(|err| {
            error!(
                error = err.to_string(),
                exchange = self.names.delay_exchange,
                "failure to set up dlq topology, is the delayed message plugin installed?"
            );
            err
        })?;

        info!(
            queue = self.cfg.queue,
            dlq = self.names.dlq_queue,
            "dlq and delayed retry topology ready"
        );
        Ok(())
    }

    /// Schedules a delayed retry, or dead-letters once `max_retries` is reached.
    ///
    /// The retry copy keeps the payload, routing key, properties and headers of the
    /// original, with `x-retry-count` incremented, `x-last-error` refreshed and `x-delay`
    /// set. The original delivery is acked once the copy is published.
    ///
    /// # Parameters
    /// * `message` - The delivery whose processing failed
    /// * `error` - The failure, recorded as `x-last-error`
    ///
    /// # Returns
    /// The action taken, or the broker error that prevented it (the delivery is then
    /// left unacknowledged)
    pub async fn handle_retryable_error(
        &self,
        message: &Message,
        error: &AmqpError,
    ) -> Result<RetryAction, AmqpError> {
        let channel = self.connection.channel_for(message)?;
        let meta = RetryMetadata::from_headers(&message.headers());
        let error_message = error.to_string();

        warn!(
            queue = self.cfg.queue,
            error = error_message,
            retry_count = meta.retry_count,
            "retryable failure"
        );

        if meta.retry_count >= self.cfg.max_retries {
            warn!(
                queue = self.cfg.queue,
                retry_count = meta.retry_count,
                max_retries = self.cfg.max_retries,
                "retries exhausted, dead-lettering message"
            );
            self.dead_letter(channel.as_ref(), message, &meta.with_error(&error_message))
                .await?;
            return Ok(RetryAction::DeadLettered);
        }

        let delay_ms = retry_delay_ms(meta.retry_count);
        let next = meta.next_attempt(&error_message);

        let mut headers = next.merge_into(&message.headers());
        headers.insert(
            ShortString::from(AMQP_HEADERS_DELAY),
            AMQPValue::LongLongInt(LongLongInt::try_from(delay_ms).unwrap_or(LongLongInt::MAX)),
        );

        channel
            .publish(
                &self.names.delay_exchange,
                &message.routing_key,
                &message.data,
                message.properties.clone().with_headers(headers),
            )
            .await?;
        channel.ack(message.delivery_tag).await?;

        info!(
            queue = self.cfg.queue,
            attempt = next.retry_count,
            delay_ms,
            "message scheduled for retry"
        );

        Ok(RetryAction::Scheduled {
            attempt: next.retry_count,
            delay_ms,
        })
    }

    /// Dead-letters the message right away, leaving its retry count untouched.
    ///
    /// # Parameters
    /// * `message` - The delivery whose processing failed
    /// * `error` - The failure, recorded as `x-last-error` and in the alert
    ///
    /// # Returns
    /// [`RetryAction::DeadLettered`], or the broker error that prevented it
    pub async fn handle_non_retryable_error(
        &self,
        message: &Message,
        error: &AmqpError,
    ) -> Result<RetryAction, AmqpError> {
        let channel = self.connection.channel_for(message)?;
        let error_message = error.to_string();
        let meta = RetryMetadata::from_headers(&message.headers()).with_error(&error_message);

        warn!(
            queue = self.cfg.queue,
            error = error_message,
            retry_count = meta.retry_count,
            "non-retryable failure, dead-lettering message"
        );

        self.dead_letter(channel.as_ref(), message, &meta).await?;
        Ok(RetryAction::DeadLettered)
    }

    /// Builds the alert for a dead-lettered message.
    pub fn alert_for(&self, message: &Message, meta: &RetryMetadata) -> AlertRecord {
        AlertRecord {
            service: self.cfg.service_name.clone(),
            queue: self.cfg.queue.clone(),
            error: meta.last_error.clone().unwrap_or_default(),
            retry_count: meta.retry_count,
            original_message: message.content_or_text(),
            timestamp: now_iso8601(),
        }
    }

    async fn dead_letter(
        &self,
        channel: &dyn AmqpChannel,
        message: &Message,
        meta: &RetryMetadata,
    ) -> Result<(), AmqpError> {
        let headers = meta.merge_into(&message.headers());

        channel
            .publish(
                &self.names.dlq_exchange,
                &self.names.dlq_routing_key,
                &message.data,
                message.properties.clone().with_headers(headers),
            )
            .await?;

        self.publish_alert(channel, &self.alert_for(message, meta)).await?;
        channel.ack(message.delivery_tag).await?;

        error!(
            queue = self.cfg.queue,
            dlq = self.names.dlq_queue,
            retry_count = meta.retry_count,
            error = meta.last_error.as_deref().unwrap_or_default(),
            "message sent to dlq"
        );
        Ok(())
    }

    async fn publish_alert(
        &self,
        channel: &dyn AmqpChannel,
        alert: &AlertRecord,
    ) -> Result<(), AmqpError> {
        let payload =
            serde_json::to_vec(alert).map_err(|err| AmqpError::Publishing(err.to_string()))?;

        channel
            .publish(
                &self.names.notifications_exchange,
                &self.names.alert_routing_key,
                &payload,
                lapin::BasicProperties::default()
                    .with_content_type(ShortString::from(JSON_CONTENT_TYPE)),
            )
            .await
    }
}
