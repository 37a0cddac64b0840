// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes JSON messages to a topic exchange, asserting the exchange once per
//! publisher and propagating OpenTelemetry trace context in the message headers.
//! Publishing is fire-and-forget: the broker confirm is not awaited and nothing is retried.

use crate::{
    connection::ConnectionManager, errors::AmqpError, exchange::ExchangeDefinition, otel,
};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publisher bound to a single durable topic exchange.
pub struct RabbitMQPublisher {
    connection: ConnectionManager,
    exchange: ExchangeDefinition,
    declared: OnceCell<()>,
}

impl RabbitMQPublisher {
    pub fn new(connection: ConnectionManager, exchange: impl Into<String>) -> Self {
        RabbitMQPublisher {
            connection,
            exchange: ExchangeDefinition::new(exchange).topic().durable(),
            declared: OnceCell::new(),
        }
    }

    pub fn exchange(&self) -> &str {
        self.exchange.name()
    }

    /// Publishes `payload` as JSON under `routing_key`, carrying the current trace context.
    pub async fn publish<T>(&self, routing_key: &str, payload: &T) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.publish_with_context(&Context::current(), routing_key, payload)
            .await
    }

    pub async fn publish_with_context<T>(
        &self,
        ctx: &Context,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let data = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize message");
            AmqpError::Publishing(err.to_string())
        })?;

        self.ensure_exchange().await?;

        let mut headers = FieldTable::default();
        otel::inject_context(ctx, &mut headers);

        let message_id = Uuid::new_v4().to_string();
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(message_id.clone()))
            .with_headers(headers);

        self.connection
            .get_channel()?
            .publish(self.exchange.name(), routing_key, &data, properties)
            .await?;

        debug!(
            exchange = self.exchange.name(),
            routing_key, message_id, "message published"
        );
        Ok(())
    }

    /// Asserts the exchange on first use. A failed assertion is retried on the next publish.
    async fn ensure_exchange(&self) -> Result<(), AmqpError> {
        self.declared
            .get_or_try_init(|| async {
                let channel = self.connection.get_channel()?;
                channel.exchange_declare(&self.exchange).await
            })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::MockAmqpChannel, testing::connected_manager};
    use serde_json::{json, Value};
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
    };

    #[tokio::test]
    async fn test_publish_sends_json_with_message_id() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_exchange_declare()
            .withf(|def| def.name() == "orders" && def.is_durable())
            .times(1)
            .returning(|_| Ok(()));
        {
            let sent = sent.clone();
            channel
                .expect_publish()
                .times(2)
                .returning(move |exchange, routing_key, payload, properties| {
                    sent.lock().unwrap().push((
                        exchange.to_owned(),
                        routing_key.to_owned(),
                        payload.to_vec(),
                        properties,
                    ));
                    Ok(())
                });
        }

        let publisher = RabbitMQPublisher::new(connected_manager(channel).await, "orders");
        publisher
            .publish("orders.created", &json!({"orderId": 1}))
            .await
            .unwrap();
        publisher
            .publish("orders.created", &json!({"orderId": 2}))
            .await
            .unwrap();

        let sent = sent.lock().unwrap();
        let (exchange, routing_key, payload, properties) = &sent[0];
        assert_eq!(exchange, "orders");
        assert_eq!(routing_key, "orders.created");
        assert_eq!(
            serde_json::from_slice::<Value>(payload).unwrap(),
            json!({"orderId": 1})
        );
        assert_eq!(
            properties.content_type().as_ref().map(|ct| ct.as_str()),
            Some(JSON_CONTENT_TYPE)
        );

        let ids: Vec<String> = sent
            .iter()
            .map(|(_, _, _, props)| props.message_id().as_ref().unwrap().as_str().to_owned())
            .collect();
        assert!(ids.iter().all(|id| Uuid::parse_str(id).is_ok()));
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_failed_exchange_assertion_is_retried() {
        let mut channel = MockAmqpChannel::new();
        let mut calls = 0;
        channel
            .expect_exchange_declare()
            .times(2)
            .returning(move |def| {
                calls += 1;
                if calls == 1 {
                    Err(AmqpError::DeclareExchange(def.name().to_owned()))
                } else {
                    Ok(())
                }
            });
        channel
            .expect_publish()
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let publisher = RabbitMQPublisher::new(connected_manager(channel).await, "orders");

        assert_eq!(
            publisher.publish("orders.created", &json!({})).await,
            Err(AmqpError::DeclareExchange("orders".to_owned()))
        );
        assert!(publisher.publish("orders.created", &json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_unserializable_payload_is_rejected_before_publishing() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_exchange_declare().never();
        channel.expect_publish().never();

        let publisher = RabbitMQPublisher::new(connected_manager(channel).await, "orders");
        let mut payload = BTreeMap::new();
        payload.insert(vec![1u8], 1);

        let err = publisher.publish("orders.created", &payload).await.unwrap_err();
        assert_eq!(err.code(), "PUBLISHING_ERROR");
    }
}
