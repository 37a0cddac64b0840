// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Collects exchange, queue and binding definitions and asserts them on a channel.
//! Definitions are de-duplicated on registration, so a topology never asserts the same
//! binding twice, and installing it again only repeats the (idempotent) broker-side
//! assertions.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::debug;

/// A set of exchanges, queues and bindings to assert.
#[derive(Debug, Clone, Default)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// Adds an exchange; a later definition with the same name replaces the earlier one.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        match self.exchanges.iter_mut().find(|e| e.name == def.name) {
            Some(existing) => *existing = def,
            None => self.exchanges.push(def),
        }
        self
    }

    /// Adds a queue; a later definition with the same name replaces the earlier one.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        match self.queues.iter_mut().find(|q| q.name == def.name) {
            Some(existing) => *existing = def,
            None => self.queues.push(def),
        }
        self
    }

    /// Adds a queue-to-exchange binding unless the same binding is already registered.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        if !self.queues_binding.contains(&binding) {
            self.queues_binding.push(binding);
        }
        self
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.queues_binding
    }

    /// Asserts exchanges, then queues, then bindings.
    pub async fn install(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            channel.exchange_declare(exch).await?;
        }

        for queue in &self.queues {
            debug!("creating queue: {}", queue.name);
            channel.queue_declare(queue).await?;
        }

        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            channel.queue_bind(binding).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAmqpChannel;
    use mockall::Sequence;

    #[test]
    fn test_duplicate_definitions_are_collapsed() {
        let topology = AmqpTopology::new()
            .exchange(ExchangeDefinition::new("orders.dlq"))
            .exchange(ExchangeDefinition::new("orders.dlq").topic().durable())
            .queue(QueueDefinition::new("orders.created.dlq").durable())
            .queue(QueueDefinition::new("orders.created.dlq").durable())
            .queue_binding(
                QueueBinding::new("orders.created.dlq")
                    .exchange("orders.dlq")
                    .routing_key("orders.created"),
            )
            .queue_binding(
                QueueBinding::new("orders.created.dlq")
                    .exchange("orders.dlq")
                    .routing_key("orders.created"),
            );

        assert_eq!(topology.exchanges().len(), 1);
        assert!(topology.exchanges()[0].is_durable());
        assert_eq!(topology.queues().len(), 1);
        assert_eq!(topology.bindings().len(), 1);
    }

    #[tokio::test]
    async fn test_install_declares_exchanges_then_queues_then_bindings() {
        let mut channel = MockAmqpChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_exchange_declare()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_queue_declare()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_queue_bind()
            .withf(|b| b.queue_name() == "q" && b.exchange_name() == "ex" && b.key() == "q")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let topology = AmqpTopology::new()
            .queue_binding(QueueBinding::new("q").exchange("ex").routing_key("q"))
            .queue(QueueDefinition::new("q"))
            .exchange(ExchangeDefinition::new("ex"));

        topology.install(&channel).await.unwrap();
    }

    #[tokio::test]
    async fn test_install_stops_on_first_failure() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_exchange_declare()
            .times(1)
            .returning(|def| Err(AmqpError::DeclareExchange(def.name().to_owned())));
        channel.expect_queue_declare().never();

        let topology = AmqpTopology::new()
            .exchange(ExchangeDefinition::new("ex"))
            .queue(QueueDefinition::new("q"));

        assert_eq!(
            topology.install(&channel).await,
            Err(AmqpError::DeclareExchange("ex".to_owned()))
        );
    }
}
