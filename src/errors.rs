// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Reliability Layer
//!
//! This module provides the error taxonomy shared by the connection manager, the
//! dead-letter handler and the consumer loop. Besides the broker operation failures,
//! `AmqpError` carries the classification tags used to pick a retry path:
//! `Retryable` errors are scheduled for a delayed redelivery, `NonRetryable` errors
//! are dead-lettered immediately.

use std::collections::BTreeMap;
use thiserror::Error;

/// Optional structured diagnostics attached to an error.
pub type ErrorContext = BTreeMap<String, String>;

/// Represents errors that can occur during AMQP/RabbitMQ operations and message handling.
///
/// Every variant exposes a stable code through [`AmqpError::code`], so callers can
/// match on failures without parsing messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Transient processing failure, the message is retried with backoff
    #[error("{message}")]
    Retryable {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Permanent processing failure, the message goes straight to the dead-letter queue
    #[error("{message}")]
    NonRetryable {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Broker connectivity failure or no channel available
    #[error("connection error: {message}")]
    Connection {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Invalid setup parameter
    #[error("invalid configuration for `{field}`: {message}")]
    Configuration { field: String, message: String },

    /// Error creating or using a channel
    #[error("channel error: {0}")]
    Channel(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchange(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueue(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueue(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    Publishing(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessage,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessage,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclaration(String),

    /// Error creating or cancelling a consumer
    #[error("consumer error: {0}")]
    Consumer(String),

    /// Payload could not be decoded as JSON
    #[error("failure to parse payload: {0}")]
    ParsePayload(String),

    /// The failed message could not be routed to the retry or dead-letter path
    /// and was dropped from its queue
    #[error("failure to route message to the dead-letter path: {0}")]
    DeadLetterRouting(String),
}

impl AmqpError {
    pub fn retryable(message: impl Into<String>) -> Self {
        AmqpError::Retryable {
            message: message.into(),
            context: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        AmqpError::NonRetryable {
            message: message.into(),
            context: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        AmqpError::Connection {
            message: message.into(),
            context: None,
        }
    }

    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        AmqpError::Configuration {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Attaches a context entry. Variants without a context slot are returned unchanged.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self {
            AmqpError::Retryable { context, .. }
            | AmqpError::NonRetryable { context, .. }
            | AmqpError::Connection { context, .. } => {
                context
                    .get_or_insert_with(ErrorContext::new)
                    .insert(key.into(), value.into());
            }
            _ => {}
        }
        self
    }

    /// Stable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            AmqpError::Retryable { .. } => "RETRYABLE_ERROR",
            AmqpError::NonRetryable { .. } => "NON_RETRYABLE_ERROR",
            AmqpError::Connection { .. } => "CONNECTION_ERROR",
            AmqpError::Configuration { .. } => "CONFIGURATION_ERROR",
            AmqpError::Channel(_) => "CHANNEL_ERROR",
            AmqpError::DeclareExchange(_) => "DECLARE_EXCHANGE_ERROR",
            AmqpError::DeclareQueue(_) => "DECLARE_QUEUE_ERROR",
            AmqpError::BindingExchangeToQueue(_, _) => "BINDING_ERROR",
            AmqpError::Publishing(_) => "PUBLISHING_ERROR",
            AmqpError::AckMessage => "ACK_ERROR",
            AmqpError::NackMessage => "NACK_ERROR",
            AmqpError::QoSDeclaration(_) => "QOS_ERROR",
            AmqpError::Consumer(_) => "CONSUMER_ERROR",
            AmqpError::ParsePayload(_) => "PARSE_PAYLOAD_ERROR",
            AmqpError::DeadLetterRouting(_) => "DEAD_LETTER_ROUTING_ERROR",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            AmqpError::Retryable { context, .. }
            | AmqpError::NonRetryable { context, .. }
            | AmqpError::Connection { context, .. } => context.as_ref(),
            _ => None,
        }
    }

    /// Only errors explicitly tagged as non-retryable skip the retry path.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AmqpError::NonRetryable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_errors_are_retryable() {
        assert!(AmqpError::retryable("db timeout").is_retryable());
        assert!(AmqpError::ParsePayload("eof".into()).is_retryable());
        assert!(AmqpError::Publishing("closed".into()).is_retryable());
        assert!(!AmqpError::non_retryable("bad schema").is_retryable());
    }

    #[test]
    fn test_context_is_attached_to_classified_errors() {
        let err = AmqpError::connection("gave up").with_context("lastError", "refused");

        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert_eq!(
            err.context().and_then(|c| c.get("lastError")).map(String::as_str),
            Some("refused")
        );
        assert_eq!(err.to_string(), "connection error: gave up");
    }

    #[test]
    fn test_context_is_ignored_for_operation_errors() {
        let err = AmqpError::AckMessage.with_context("tag", "1");
        assert_eq!(err, AmqpError::AckMessage);
        assert!(err.context().is_none());
    }

    #[test]
    fn test_configuration_error_names_the_field() {
        let err = AmqpError::configuration("queue", "must not be empty");
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
        assert_eq!(
            err.to_string(),
            "invalid configuration for `queue`: must not be empty"
        );
    }
}
