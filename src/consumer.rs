// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Reply Consumer
//!
//! This module consumes the reply queue and hands each reply to the caller
//! waiting on its correlation id. Exactly one consumer runs per channel; it is
//! attached the first time an RPC call is made and reattached by the
//! connection supervisor on every channel that replaces it.
//!
//! A reply is positively acknowledged only after a waiter took its payload.
//! Replies nobody is waiting for (the caller timed out, or the reply belongs to
//! another client instance) and replies whose payload is not valid JSON are
//! rejected with requeue, so another consumer can pick them up. A reply whose
//! call this client already resolved is a duplicate (its first ack was lost)
//! and is rejected without requeue.

use crate::{
    broker::{BrokerChannel, DeliveryStream},
    errors::AmqpError,
    message::InboundDelivery,
    otel,
    registry::CorrelationRegistry,
    supervisor::ChannelSetup,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use serde_json::Value;
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, error, warn};
use uuid::Uuid;

struct Attachment {
    generation: u64,
    task: JoinHandle<()>,
}

/// Single consumption loop bound to the reply queue.
pub struct ReplyConsumer {
    queue: String,
    registry: Arc<CorrelationRegistry>,
    active: AtomicBool,
    attached: Mutex<Option<Attachment>>,
}

impl ReplyConsumer {
    pub fn new(queue: &str, registry: Arc<CorrelationRegistry>) -> Arc<ReplyConsumer> {
        Arc::new(ReplyConsumer {
            queue: queue.to_owned(),
            registry,
            active: AtomicBool::new(false),
            attached: Mutex::new(None),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether a consumer loop is currently running.
    pub async fn is_attached(&self) -> bool {
        self.attached
            .lock()
            .await
            .as_ref()
            .is_some_and(|a| !a.task.is_finished())
    }

    /// Makes sure a consumer loop runs on `channel`.
    ///
    /// Does nothing when a live loop already runs on this channel or on a
    /// newer one; otherwise replaces the previous loop.
    pub async fn ensure_attached(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        self.active.store(true, Ordering::SeqCst);

        let mut attached = self.attached.lock().await;
        if let Some(current) = attached.as_ref() {
            let alive = !current.task.is_finished();
            if current.generation > channel.generation()
                || (current.generation == channel.generation() && alive)
            {
                return Ok(());
            }
        }

        if let Some(previous) = attached.take() {
            previous.task.abort();
        }

        let tag = format!("rpc-reply-{}", Uuid::new_v4());
        let deliveries = channel.consume(&self.queue, &tag).await?;
        debug!(queue = %self.queue, consumer_tag = %tag, "reply consumer attached");

        let task = tokio::spawn(run(deliveries, self.registry.clone(), self.queue.clone()));
        *attached = Some(Attachment {
            generation: channel.generation(),
            task,
        });

        Ok(())
    }

    /// Stops the consumer loop until the next RPC call.
    pub async fn detach(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(previous) = self.attached.lock().await.take() {
            previous.task.abort();
        }
    }
}

#[async_trait]
impl ChannelSetup for ReplyConsumer {
    async fn setup(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.ensure_attached(channel).await
    }
}

impl Drop for ReplyConsumer {
    fn drop(&mut self) {
        if let Some(previous) = self.attached.get_mut().take() {
            previous.task.abort();
        }
    }
}

async fn run(mut deliveries: DeliveryStream, registry: Arc<CorrelationRegistry>, queue: String) {
    let tracer = global::tracer("amqp rpc reply consumer");

    while let Some(result) = deliveries.next().await {
        match result {
            Ok(delivery) => {
                if let Err(err) = consume(&tracer, &delivery, &registry).await {
                    error!(error = err.to_string(), "error consume reply");
                }
            }
            Err(err) => error!(error = err.to_string(), "errors consume reply"),
        }
    }

    debug!(queue = %queue, "reply consumer stopped");
}

/// Routes one reply to its waiter.
///
/// 1. Extracts the correlation id
/// 2. Requeues the reply when no waiter is registered for it
/// 3. Decodes the payload, requeuing it when it is not valid JSON
/// 4. Resolves the waiter, then acknowledges the reply
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &InboundDelivery,
    registry: &CorrelationRegistry,
) -> Result<(), AmqpError> {
    let (_ctx, mut span) = otel::new_span(&delivery.headers, tracer, "rpc reply");

    let Some(id) = delivery.correlation_id.as_deref() else {
        warn!("reply without correlation id, requeuing");
        span.set_status(Status::Error {
            description: Cow::from("missing correlation id"),
        });
        return requeue(delivery, &mut span).await;
    };

    if !registry.contains(id) {
        if registry.was_resolved(id) {
            warn!(correlation_id = id, "duplicate reply for a resolved call, discarding");
            return discard(delivery, &mut span).await;
        }
        debug!(correlation_id = id, "no waiter for reply, requeuing");
        return requeue(delivery, &mut span).await;
    }

    let payload: Value = match serde_json::from_slice(&delivery.data) {
        Ok(value) => value,
        Err(err) => {
            warn!(
                correlation_id = id,
                error = err.to_string(),
                "malformed reply payload, requeuing"
            );
            let err = AmqpError::ParsePayloadError(err.to_string());
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("malformed reply payload"),
            });
            return requeue(delivery, &mut span).await;
        }
    };

    if !registry.resolve(id, payload) {
        debug!(correlation_id = id, "waiter expired before the reply, requeuing");
        return requeue(delivery, &mut span).await;
    }

    debug!(correlation_id = id, "reply delivered to waiter");
    match delivery.ack().await {
        Err(e) => {
            error!("error whiling ack reply");
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(e)
        }
        _ => {
            span.set_status(Status::Ok);
            Ok(())
        }
    }
}

async fn requeue<S: Span>(delivery: &InboundDelivery, span: &mut S) -> Result<(), AmqpError> {
    match delivery.nack(true).await {
        Ok(_) => Ok(()),
        Err(e) => {
            error!("error whiling requeuing reply");
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to requeuing msg"),
            });
            Err(AmqpError::RequeuingMessageError)
        }
    }
}

async fn discard<S: Span>(delivery: &InboundDelivery, span: &mut S) -> Result<(), AmqpError> {
    match delivery.nack(false).await {
        Ok(_) => Ok(()),
        Err(e) => {
            error!("error whiling discarding reply");
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to discard msg"),
            });
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::MemoryBroker, message::OutboundMessage, queue::QueueDefinition};
    use serde_json::json;
    use std::time::Duration;

    async fn reply_queue(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let channel: Arc<dyn BrokerChannel> = broker.channel();
        channel
            .declare_queue(&QueueDefinition::new("R").durable())
            .await
            .unwrap();
        channel
    }

    async fn publish_reply(channel: &Arc<dyn BrokerChannel>, id: &str, body: &[u8]) {
        channel
            .publish(&OutboundMessage::new("R", body.to_vec()).correlation_id(id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_matched_reply_is_acked() {
        let broker = MemoryBroker::new();
        let channel = reply_queue(&broker).await;
        let registry = CorrelationRegistry::new();
        let rx = registry.register("c1", Duration::from_secs(30)).unwrap();

        publish_reply(&channel, "c1", br#"{"id":1}"#).await;
        let mut deliveries = channel.consume("R", "t").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        consume(&global::tracer("test"), &delivery, &registry)
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap(), Ok(json!({"id": 1})));
        assert_eq!(broker.queue_len("R"), Some(0));
        assert_eq!(broker.unacked("R"), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_requeued() {
        let broker = MemoryBroker::new();
        let channel = reply_queue(&broker).await;
        let registry = CorrelationRegistry::new();

        publish_reply(&channel, "unknown", br#"{"id":1}"#).await;
        let mut deliveries = channel.consume("R", "t").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        consume(&global::tracer("test"), &delivery, &registry)
            .await
            .unwrap();
        assert_eq!(broker.queue_len("R"), Some(1));

        // a later consumer gets the same reply again
        let again = deliveries.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.correlation_id.as_deref(), Some("unknown"));
        assert_eq!(again.data, br#"{"id":1}"#);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_requeued_and_waiter_kept() {
        let broker = MemoryBroker::new();
        let channel = reply_queue(&broker).await;
        let registry = CorrelationRegistry::new();
        let _rx = registry.register("c1", Duration::from_secs(30)).unwrap();

        publish_reply(&channel, "c1", b"not json").await;
        let mut deliveries = channel.consume("R", "t").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        consume(&global::tracer("test"), &delivery, &registry)
            .await
            .unwrap();

        assert!(registry.contains("c1"));
        assert_eq!(broker.queue_len("R"), Some(1));
    }

    #[tokio::test]
    async fn test_reply_without_correlation_id_is_requeued() {
        let broker = MemoryBroker::new();
        let channel = reply_queue(&broker).await;
        channel
            .publish(&OutboundMessage::new("R", b"{}".to_vec()))
            .await
            .unwrap();

        let mut deliveries = channel.consume("R", "t").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        consume(&global::tracer("test"), &delivery, &CorrelationRegistry::new())
            .await
            .unwrap();

        assert_eq!(broker.queue_len("R"), Some(1));
    }

    #[tokio::test]
    async fn test_reply_redelivered_after_lost_ack_is_discarded() {
        let broker = MemoryBroker::new();
        let channel = reply_queue(&broker).await;
        let registry = CorrelationRegistry::new();
        let rx = registry.register("c1", Duration::from_secs(30)).unwrap();

        publish_reply(&channel, "c1", b"42").await;
        let mut deliveries = channel.consume("R", "t").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        // the channel dies between delivery and ack
        channel.close().await.unwrap();
        let err = consume(&global::tracer("test"), &delivery, &registry)
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::AckMessageError);
        assert_eq!(rx.await.unwrap(), Ok(json!(42)));
        assert_eq!(broker.queue_len("R"), Some(1));

        let fresh: Arc<dyn BrokerChannel> = broker.channel();
        let mut deliveries = fresh.consume("R", "t").await.unwrap();
        let again = deliveries.next().await.unwrap().unwrap();
        assert!(again.redelivered);

        consume(&global::tracer("test"), &again, &registry)
            .await
            .unwrap();
        assert_eq!(broker.queue_len("R"), Some(0));
        assert_eq!(broker.unacked("R"), 0);
    }

    #[tokio::test]
    async fn test_ensure_attached_once_per_channel() {
        let broker = MemoryBroker::new();
        let channel = reply_queue(&broker).await;
        let registry = CorrelationRegistry::new();
        let replies = ReplyConsumer::new("R", registry.clone());

        replies.ensure_attached(&channel).await.unwrap();
        replies.ensure_attached(&channel).await.unwrap();
        assert!(replies.is_attached().await);

        let rx = registry.register("c1", Duration::from_secs(30)).unwrap();
        publish_reply(&channel, "c1", b"42").await;
        assert_eq!(rx.await.unwrap(), Ok(json!(42)));

        replies.detach().await;
        assert!(!replies.is_attached().await);
    }

    #[tokio::test]
    async fn test_setup_is_noop_until_first_call() {
        let broker = MemoryBroker::new();
        let channel = reply_queue(&broker).await;
        let replies = ReplyConsumer::new("R", CorrelationRegistry::new());

        replies.setup(&channel).await.unwrap();
        assert!(!replies.is_attached().await);

        replies.ensure_attached(&channel).await.unwrap();
        let newer: Arc<dyn BrokerChannel> = broker.channel();
        replies.setup(&newer).await.unwrap();
        assert!(replies.is_attached().await);
    }
}
