// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! Traits separating the RPC machinery from a concrete AMQP library.
//! A `Connector` opens a connection and derives a single channel from it;
//! the resulting `BrokerChannel` is what every publish and consume runs on.
//!
//! Connection and channel failures are not surfaced through callbacks into
//! the client. Implementations forward them as `LifecycleEvent`s to the
//! sender they were given at connect time, and the connection supervisor
//! reacts to them from its own task.

use crate::{
    errors::AmqpError,
    message::{InboundDelivery, OutboundMessage},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stream of deliveries from one consumer registration.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Sending half of the lifecycle event queue.
pub type LifecycleSender = mpsc::UnboundedSender<LifecycleEvent>;

/// A failure observed on a live connection or channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    ConnectionLost { generation: u64, reason: String },
    ChannelLost { generation: u64, reason: String },
}

impl LifecycleEvent {
    /// The connect generation the failing connection belonged to.
    pub fn generation(&self) -> u64 {
        match self {
            LifecycleEvent::ConnectionLost { generation, .. } => *generation,
            LifecycleEvent::ChannelLost { generation, .. } => *generation,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            LifecycleEvent::ConnectionLost { reason, .. } => reason,
            LifecycleEvent::ChannelLost { reason, .. } => reason,
        }
    }
}

/// Opens broker sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects, derives a channel, and wires the connection and channel
    /// error observers to `events`, tagging every event with `generation`.
    async fn connect(
        &self,
        generation: u64,
        events: LifecycleSender,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// A channel plus the connection it was derived from.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Generation of the connect that produced this channel.
    fn generation(&self) -> u64;

    fn is_open(&self) -> bool;

    /// Declares the queue if it does not exist yet.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Publishes through the default exchange, routed by queue name.
    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Closes the channel, then the connection.
    async fn close(&self) -> Result<(), AmqpError>;
}
