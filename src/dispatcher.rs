// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Request Dispatcher
//!
//! This module publishes requests to the named request queues. It supports
//! plain fire-and-forget sends and RPC-style sends that suspend the caller
//! until the matching reply arrives or the call times out.
//!
//! Every send first obtains a live channel from the connection supervisor, so a
//! send issued while the session is down triggers (or waits for) a reconnect
//! instead of failing outright.

use crate::{
    configs::RabbitMQConfigs,
    consumer::ReplyConsumer,
    correlation::CorrelationIdGenerator,
    errors::AmqpError,
    message::OutboundMessage,
    otel,
    registry::{CallResult, CorrelationRegistry},
    supervisor::ConnectionSupervisor,
};
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Fresh ids drawn before giving up on a correlation id collision.
const MAX_ID_DRAWS: usize = 8;

pub struct RequestDispatcher {
    supervisor: Arc<ConnectionSupervisor>,
    registry: Arc<CorrelationRegistry>,
    replies: Arc<ReplyConsumer>,
    ids: CorrelationIdGenerator,
    rpc_timeout: Duration,
}

impl RequestDispatcher {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        registry: Arc<CorrelationRegistry>,
        replies: Arc<ReplyConsumer>,
        cfg: &RabbitMQConfigs,
    ) -> RequestDispatcher {
        RequestDispatcher {
            supervisor,
            registry,
            replies,
            ids: CorrelationIdGenerator::new(cfg.correlation),
            rpc_timeout: cfg.rpc_timeout,
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Publishes `payload` to the `target` queue without waiting for a reply.
    pub async fn send_request<T>(&self, target: &str, payload: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let data = encode(payload)?;
        let channel = self.supervisor.channel().await?;

        let msg = OutboundMessage::new(target, data).headers(otel::inject(&Context::current()));
        channel.publish(&msg).await.map_err(|err| {
            error!(error = err.to_string(), queue = target, "error publishing request");
            err
        })?;

        debug!(queue = target, "request published");
        Ok(())
    }

    /// Publishes `payload` to `target` and waits for the reply, using the
    /// configured RPC timeout.
    pub async fn send_request_and_wait_response<T, R>(
        &self,
        target: &str,
        payload: &T,
    ) -> Result<R, AmqpError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.send_request_and_wait_response_with_timeout(target, payload, self.rpc_timeout)
            .await
    }

    /// Publishes `payload` to `target` and waits at most `timeout` for the reply.
    pub async fn send_request_and_wait_response_with_timeout<T, R>(
        &self,
        target: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, AmqpError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let reply = self.call(target, encode(payload)?, timeout).await?;
        serde_json::from_value(reply).map_err(|err| {
            error!(error = err.to_string(), queue = target, "reply does not match the expected type");
            AmqpError::ParsePayloadError(err.to_string())
        })
    }

    async fn call(&self, target: &str, data: Vec<u8>, timeout: Duration) -> Result<Value, AmqpError> {
        let channel = self.supervisor.channel().await?;
        let (id, waiter) = self.register(timeout)?;

        if let Err(err) = self.replies.ensure_attached(&channel).await {
            self.registry.cancel(&id);
            error!(error = err.to_string(), "failure to attach the reply consumer");
            return Err(err);
        }

        let msg = OutboundMessage::new(target, data)
            .correlation_id(&id)
            .reply_to(self.replies.queue())
            .expiration(timeout)
            .headers(otel::inject(&Context::current()));

        if let Err(err) = channel.publish(&msg).await {
            self.registry.cancel(&id);
            error!(
                error = err.to_string(),
                queue = target,
                correlation_id = %id,
                "error publishing rpc request"
            );
            return Err(err);
        }

        debug!(queue = target, correlation_id = %id, "rpc request published");
        wait(waiter).await
    }

    fn register(&self, timeout: Duration) -> Result<(String, oneshot::Receiver<CallResult>), AmqpError> {
        let mut last = AmqpError::InternalError;
        for _ in 0..MAX_ID_DRAWS {
            let id = self.ids.next_id();
            match self.registry.register(&id, timeout) {
                Ok(waiter) => return Ok((id, waiter)),
                Err(err) => last = err,
            }
        }
        Err(last)
    }
}

async fn wait(waiter: oneshot::Receiver<CallResult>) -> Result<Value, AmqpError> {
    match waiter.await {
        Ok(result) => result,
        Err(_) => {
            error!("rpc waiter dropped without completion");
            Err(AmqpError::InternalError)
        }
    }
}

fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(payload).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize payload");
        AmqpError::SerializePayloadError(err.to_string())
    })
}
