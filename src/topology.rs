// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the queues the RPC client depends on. The topology is
//! installed on every freshly established channel, so declarations must be
//! idempotent: a queue that already exists with the same flags is left as is.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: the request queues plus the single reply queue

use crate::{
    broker::BrokerChannel, configs::RabbitMQConfigs, errors::AmqpError, queue::QueueDefinition,
    supervisor::ChannelSetup,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self
    where
        Self: Sized;

    /// Declares every queue of the topology on the given channel.
    async fn install(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError>;
}

/// The fixed set of queues an RPC client instance works with.
#[derive(Debug, Clone, Default)]
pub struct AmqpTopology {
    pub(crate) queues: Vec<QueueDefinition>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology { queues: vec![] }
    }

    /// Builds the topology from the configured request queues and reply queue,
    /// all durable and never auto-deleted.
    pub fn from_configs(cfg: &RabbitMQConfigs) -> AmqpTopology {
        cfg.request_queues
            .iter()
            .chain(std::iter::once(&cfg.reply_queue))
            .fold(AmqpTopology::new(), |topology, name| {
                topology.queue(QueueDefinition::new(name).durable())
            })
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    /// Adds a queue definition; a later definition with the same name replaces
    /// the earlier one.
    fn queue(mut self, def: QueueDefinition) -> Self {
        match self.queues.iter_mut().find(|q| q.name == def.name) {
            Some(existing) => *existing = def,
            None => self.queues.push(def),
        }
        self
    }

    async fn install(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!(queue = %def.name, "declaring queue");
            channel.declare_queue(def).await?;
        }

        debug!(queues = self.queues.len(), "topology installed");
        Ok(())
    }
}

#[async_trait]
impl ChannelSetup for AmqpTopology {
    async fn setup(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        self.install(channel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    fn topology() -> AmqpTopology {
        AmqpTopology::from_configs(
            &RabbitMQConfigs::default()
                .with_request_queue("A")
                .with_request_queue("B")
                .with_reply_queue("R"),
        )
    }

    #[test]
    fn test_from_configs() {
        let binding = topology();
        let names: Vec<&str> = binding.queues().iter().map(|q| q.name()).collect();
        assert_eq!(names, vec!["A", "B", "R"]);
        assert!(topology()
            .queues()
            .iter()
            .all(|q| q.is_durable() && !q.is_auto_delete()));
    }

    #[test]
    fn test_duplicate_names_collapse() {
        let topology = AmqpTopology::new()
            .queue(QueueDefinition::new("A"))
            .queue(QueueDefinition::new("A").durable());

        assert_eq!(topology.queues().len(), 1);
        assert!(topology.queues()[0].is_durable());
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let broker = MemoryBroker::new();
        let channel: Arc<dyn BrokerChannel> = broker.channel();

        topology().install(&channel).await.unwrap();
        topology().install(&channel).await.unwrap();

        assert_eq!(broker.queue_names(), vec!["A", "B", "R"]);
    }

    #[tokio::test]
    async fn test_install_rejects_conflicting_flags() {
        let broker = MemoryBroker::new();
        let channel: Arc<dyn BrokerChannel> = broker.channel();
        channel
            .declare_queue(&QueueDefinition::new("R").delete())
            .await
            .unwrap();

        let err = topology().install(&channel).await.unwrap_err();
        assert_eq!(err, AmqpError::DeclareQueueError("R".to_owned()));
    }
}
