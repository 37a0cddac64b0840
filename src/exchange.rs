// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Declarative description of the exchanges asserted by the reliability layer: the
//! consumer's topic exchange, its delayed-message twin, the dead-letter exchange and the
//! shared notifications exchange.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};

/// Argument naming the routing behaviour of a delayed-message exchange
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Exchange type provided by the rabbitmq-delayed-message-exchange plugin
pub const DELAYED_MESSAGE_EXCHANGE_TYPE: &str = "x-delayed-message";

/// Exchange types used by the reliability layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom(DELAYED_MESSAGE_EXCHANGE_TYPE.to_owned())
            }
        }
    }
}

/// Definition of a RabbitMQ exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) params: FieldTable,
}

impl ExchangeDefinition {
    /// Creates a non-durable direct exchange definition.
    pub fn new(name: impl Into<String>) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.into(),
            kind: ExchangeKind::Direct,
            durable: false,
            params: FieldTable::default(),
        }
    }

    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Turns the exchange into a delayed-message exchange routing like a topic exchange.
    ///
    /// Requires the rabbitmq-delayed-message-exchange plugin on the broker.
    pub fn delayed_topic(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from("topic")),
        );
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn params(&self) -> &FieldTable {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delayed_topic_sets_plugin_type_and_argument() {
        let def = ExchangeDefinition::new("orders.delay").delayed_topic().durable();

        assert_eq!(def.kind(), &ExchangeKind::XMessageDelayed);
        assert!(def.is_durable());
        assert_eq!(
            def.params()
                .inner()
                .get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE)
                .and_then(|v| v.as_long_string())
                .map(|v| v.to_string()),
            Some("topic".to_owned())
        );
        assert!(matches!(
            lapin::ExchangeKind::from(def.kind()),
            lapin::ExchangeKind::Custom(ref kind) if kind == "x-delayed-message"
        ));
    }
}
