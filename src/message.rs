// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelopes
//!
//! Broker-neutral representations of an outbound message and of an inbound
//! delivery awaiting manual acknowledgement.

use crate::errors::AmqpError;
use async_trait::async_trait;
use std::{collections::BTreeMap, fmt, time::Duration};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message to be published to a queue through the default exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub persistent: bool,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<Duration>,
    pub headers: BTreeMap<String, String>,
}

impl OutboundMessage {
    /// Creates a persistent message addressed to `routing_key`.
    pub fn new(routing_key: &str, payload: Vec<u8>) -> Self {
        OutboundMessage {
            routing_key: routing_key.to_owned(),
            payload,
            persistent: true,
            correlation_id: None,
            reply_to: None,
            expiration: None,
            headers: BTreeMap::default(),
        }
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message received from a queue, consumed in manual-ack mode.
pub struct InboundDelivery {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub data: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub persistent: bool,
    pub expiration: Option<Duration>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl InboundDelivery {
    pub fn new(data: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        InboundDelivery {
            correlation_id: None,
            reply_to: None,
            data,
            headers: BTreeMap::default(),
            persistent: false,
            expiration: None,
            redelivered: false,
            acker,
        }
    }

    /// Builds the delivery a broker would hand out for a published message.
    #[cfg(any(test, feature = "test-utils"))]
    pub(crate) fn from_outbound(
        msg: OutboundMessage,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        InboundDelivery {
            correlation_id: msg.correlation_id,
            reply_to: msg.reply_to,
            data: msg.payload,
            headers: msg.headers,
            persistent: msg.persistent,
            expiration: msg.expiration,
            redelivered,
            acker,
        }
    }

    /// Positively acknowledges the delivery, removing it from the queue.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Negatively acknowledges the delivery.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("bytes", &self.data.len())
            .field("persistent", &self.persistent)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
