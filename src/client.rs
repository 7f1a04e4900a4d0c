// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ RPC Client
//!
//! The service object callers hold. It owns one connection supervisor, one
//! correlation registry and one reply consumer, and exposes fire-and-forget
//! and request/response sends on top of them.
//!
//! ```no_run
//! use rabbitmq_rpc::{client::RabbitMQClient, configs::RabbitMQConfigs};
//! use serde_json::{json, Value};
//!
//! # async fn run() -> Result<(), rabbitmq_rpc::errors::AmqpError> {
//! let client = RabbitMQClient::new(RabbitMQConfigs::from_env()?);
//! client.connect().await?;
//!
//! let project: Value = client
//!     .send_request_and_wait_response("projects", &json!({ "id": 7 }))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    broker::Connector,
    channel::LapinConnector,
    configs::RabbitMQConfigs,
    consumer::ReplyConsumer,
    dispatcher::RequestDispatcher,
    errors::AmqpError,
    registry::CorrelationRegistry,
    supervisor::{ChannelSetup, ConnectionState, ConnectionSupervisor},
    topology::AmqpTopology,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::debug;

pub struct RabbitMQClient {
    supervisor: Arc<ConnectionSupervisor>,
    registry: Arc<CorrelationRegistry>,
    replies: Arc<ReplyConsumer>,
    dispatcher: RequestDispatcher,
}

impl RabbitMQClient {
    /// Creates a client talking to the RabbitMQ server described by `cfg`.
    ///
    /// Nothing is opened until `connect` or the first send.
    pub fn new(cfg: RabbitMQConfigs) -> RabbitMQClient {
        let connector = Arc::new(LapinConnector::new(&cfg));
        RabbitMQClient::with_connector(cfg, connector)
    }

    /// Creates a client on top of any broker connector.
    pub fn with_connector(cfg: RabbitMQConfigs, connector: Arc<dyn Connector>) -> RabbitMQClient {
        let registry = CorrelationRegistry::new();
        let replies = ReplyConsumer::new(&cfg.reply_queue, registry.clone());

        let setups: Vec<Arc<dyn ChannelSetup>> =
            vec![Arc::new(AmqpTopology::from_configs(&cfg)), replies.clone()];
        let supervisor = ConnectionSupervisor::new(connector, cfg.reconnect_policy(), setups);

        let dispatcher =
            RequestDispatcher::new(supervisor.clone(), registry.clone(), replies.clone(), &cfg);

        RabbitMQClient {
            supervisor,
            registry,
            replies,
            dispatcher,
        }
    }

    /// Opens the connection and declares the queue topology, retrying per the
    /// reconnect policy. Returns immediately when already connected.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.supervisor.connect().await
    }

    /// Stops consuming replies and closes the channel and connection.
    ///
    /// Calls still waiting keep their timers and fail with a timeout unless the
    /// client reconnects and their reply shows up first.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.replies.detach().await;
        let result = self.supervisor.close().await;
        debug!(pending = self.registry.len(), "rabbitmq client closed");
        result
    }

    /// Publishes `payload` to `queue` without waiting for a reply.
    pub async fn send_request<T>(&self, queue: &str, payload: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.dispatcher.send_request(queue, payload).await
    }

    /// Publishes `payload` to `queue` and waits for the reply using the
    /// configured RPC timeout.
    pub async fn send_request_and_wait_response<T, R>(
        &self,
        queue: &str,
        payload: &T,
    ) -> Result<R, AmqpError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.dispatcher
            .send_request_and_wait_response(queue, payload)
            .await
    }

    pub async fn send_request_and_wait_response_with_timeout<T, R>(
        &self,
        queue: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, AmqpError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.dispatcher
            .send_request_and_wait_response_with_timeout(queue, payload, timeout)
            .await
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.subscribe_state()
    }

    /// Calls currently waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.registry.len()
    }
}
