// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ RPC Client
//!
//! Request/response on top of RabbitMQ queues: requests go to named request
//! queues, replies come back on one shared reply queue and are matched to
//! their callers by correlation id. The connection is supervised and
//! re-established after broker-side failures.

mod otel;

pub mod broker;
pub mod channel;
pub mod client;
pub mod configs;
pub mod consumer;
pub mod correlation;
pub mod dispatcher;
pub mod errors;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod message;
pub mod queue;
pub mod registry;
pub mod supervisor;
pub mod topology;

pub use client::RabbitMQClient;
pub use configs::RabbitMQConfigs;
pub use errors::AmqpError;
pub use supervisor::ConnectionState;
