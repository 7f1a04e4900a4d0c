// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ RPC Client
//!
//! This module provides the error type shared by every layer of the client.
//! The `AmqpError` enum represents the failures that can happen while connecting,
//! declaring queues, publishing requests, consuming replies and waiting on calls.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ RPC operations.
///
/// Every variant carries owned data only, so errors can be sent across tasks
/// (e.g. from the timeout path to the waiting caller) and compared in tests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// A configuration value could not be parsed
    #[error("invalid configuration `{0}`")]
    InvalidConfig(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The channel was closed underneath an operation
    #[error("channel closed")]
    ChannelClosed,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error serializing an outbound payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error requeuing a message
    #[error("failure to requeuing message")]
    RequeuingMessageError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// A call with this correlation id is already waiting
    #[error("correlation id `{0}` already in flight")]
    DuplicateCorrelationId(String),

    /// No reply arrived before the call deadline
    #[error("no reply for `{correlation_id}` within {timeout_ms}ms")]
    RpcTimeout {
        correlation_id: String,
        timeout_ms: u64,
    },
}

impl AmqpError {
    /// Returns true when the error is an RPC deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AmqpError::RpcTimeout { .. })
    }

    /// Returns true when the error comes from the broker session itself.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_) | AmqpError::ChannelError(_) | AmqpError::ChannelClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_distinguishable() {
        let err = AmqpError::RpcTimeout {
            correlation_id: "abc".to_owned(),
            timeout_ms: 200,
        };

        assert!(err.is_timeout());
        assert!(!err.is_connection_error());
        assert_eq!(err.to_string(), "no reply for `abc` within 200ms");
    }

    #[test]
    fn test_connection_errors() {
        assert!(AmqpError::ConnectionError("refused".to_owned()).is_connection_error());
        assert!(AmqpError::ChannelClosed.is_connection_error());
        assert!(!AmqpError::PublishingError("x".to_owned()).is_connection_error());
    }
}
