// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Reliability Layer
//!
//! Resilient RabbitMQ consumption for services: a self-healing connection with bounded
//! exponential backoff, delayed retries through the delayed-message exchange plugin,
//! dead-lettering with operator alerts, and a consumer loop that classifies handler
//! failures and routes them.
//!
//! ```no_run
//! use rabbitmq_reliability::{
//!     channel::LapinConnector, config::RabbitMQConfigs, connection::ConnectionManager,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), rabbitmq_reliability::errors::AmqpError> {
//! let cfg = RabbitMQConfigs::from_env()?;
//! let manager = ConnectionManager::new(Arc::new(LapinConnector::new(&cfg)), cfg);
//! manager.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dlq;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod otel;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;

#[cfg(test)]
mod testing;

pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{ConsumerHandler, ConsumerMessage, RabbitMQConsumer};
pub use dlq::{AlertRecord, DlqHandler, RetryAction};
pub use errors::AmqpError;
pub use publisher::RabbitMQPublisher;
