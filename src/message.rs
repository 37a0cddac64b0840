// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! A broker-independent view of a delivered message: payload, headers, routing key and
//! the delivery tag used for acknowledgment.
//!
//! Delivery tags are scoped to the channel that delivered the message, so a consumed
//! message remembers that channel and is acknowledged there.

use crate::{channel::AmqpChannel, errors::AmqpError};
use lapin::{message::Delivery, types::FieldTable, BasicProperties};
use serde_json::Value;
use std::{fmt, sync::Arc};

/// The channel a message was delivered on.
#[derive(Clone)]
struct DeliveryChannel(Arc<dyn AmqpChannel>);

impl fmt::Debug for DeliveryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeliveryChannel")
    }
}

/// A delivered message.
#[derive(Debug, Clone)]
pub struct Message {
    pub data: Vec<u8>,
    pub routing_key: String,
    pub exchange: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub properties: BasicProperties,
    delivered_on: Option<DeliveryChannel>,
}

impl Message {
    pub fn new(data: impl Into<Vec<u8>>, routing_key: impl Into<String>) -> Self {
        Message {
            data: data.into(),
            routing_key: routing_key.into(),
            exchange: String::new(),
            delivery_tag: 0,
            redelivered: false,
            properties: BasicProperties::default(),
            delivered_on: None,
        }
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.properties = self.properties.with_headers(headers);
        self
    }

    pub fn with_delivery_tag(mut self, delivery_tag: u64) -> Self {
        self.delivery_tag = delivery_tag;
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Records the channel the message arrived on; acks and nacks go to that channel.
    pub fn with_delivery_channel(mut self, channel: Arc<dyn AmqpChannel>) -> Self {
        self.delivered_on = Some(DeliveryChannel(channel));
        self
    }

    /// The channel the message arrived on, `None` when built outside a subscription.
    pub fn delivery_channel(&self) -> Option<&Arc<dyn AmqpChannel>> {
        self.delivered_on.as_ref().map(|c| &c.0)
    }

    /// A copy of the header table, empty when the message carried none.
    pub fn headers(&self) -> FieldTable {
        self.properties.headers().clone().unwrap_or_default()
    }

    /// Decodes the payload as JSON.
    pub fn decode_json(&self) -> Result<Value, AmqpError> {
        serde_json::from_slice(&self.data).map_err(|e| AmqpError::ParsePayload(e.to_string()))
    }

    /// The payload as JSON when decodable, otherwise as lossy UTF-8 text.
    pub fn content_or_text(&self) -> Value {
        self.decode_json()
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.data).into_owned()))
    }
}

impl From<Delivery> for Message {
    fn from(delivery: Delivery) -> Self {
        Message {
            data: delivery.data,
            routing_key: delivery.routing_key.to_string(),
            exchange: delivery.exchange.to_string(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            delivered_on: None,
        }
    }
}
