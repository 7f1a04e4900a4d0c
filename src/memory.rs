// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local broker that follows RabbitMQ's queueing rules closely enough
//! to exercise the RPC client without a server:
//!
//! - messages are routed through the default exchange by queue name; messages
//!   for an undeclared queue are dropped
//! - redeclaring a queue with different `durable` / `auto_delete` flags fails
//! - deliveries stay unacked until settled; `nack(requeue = true)` puts the
//!   message back at the head of the queue flagged as redelivered
//! - consumers behave as with an unlimited prefetch: a requeued message is
//!   held back for `REDELIVERY_DELAY` while the messages behind it keep
//!   flowing, so one message that is rejected over and over never blocks the
//!   rest of the queue
//! - closing a channel requeues everything it had not settled
//! - a message whose expiration elapsed while queued is discarded
//!
//! It also lets tests refuse connections, fail publishes and sever every live
//! channel, which reports `ChannelLost` to whoever connected it.

use crate::{
    broker::{BrokerChannel, Connector, DeliveryStream, LifecycleEvent, LifecycleSender},
    errors::AmqpError,
    message::{Acknowledger, InboundDelivery, OutboundMessage},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};
use tracing::debug;

/// Hold on a requeued message before it is handed out again.
pub const REDELIVERY_DELAY: Duration = Duration::from_millis(1);

#[derive(Clone)]
struct Envelope {
    message: OutboundMessage,
    enqueued_at: Instant,
    ready_at: Instant,
    redelivered: bool,
}

impl Envelope {
    fn expired(&self) -> bool {
        self.message
            .expiration
            .is_some_and(|ttl| self.enqueued_at.elapsed() >= ttl)
    }
}

struct MemoryQueue {
    durable: bool,
    auto_delete: bool,
    ready: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl MemoryQueue {
    fn push(&self, envelope: Envelope) {
        self.ready.lock().push_back(envelope);
        self.notify.notify_waiters();
    }

    fn requeue(&self, mut envelope: Envelope) {
        envelope.redelivered = true;
        envelope.ready_at = Instant::now() + REDELIVERY_DELAY;
        self.ready.lock().push_front(envelope);
        self.notify.notify_waiters();
    }

    /// Takes the first live message that is not held back.
    fn next(&self) -> Next {
        let now = Instant::now();
        let mut ready = self.ready.lock();
        ready.retain(|envelope| !envelope.expired());

        match ready.iter().position(|envelope| envelope.ready_at <= now) {
            Some(index) => ready.remove(index).map_or(Next::Empty, Next::Ready),
            None => ready
                .iter()
                .map(|envelope| envelope.ready_at)
                .min()
                .map_or(Next::Empty, Next::HeldUntil),
        }
    }
}

enum Next {
    Ready(Envelope),
    HeldUntil(Instant),
    Empty,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    channels: Mutex<Vec<Weak<ChannelCore>>>,
    refuse_connections: AtomicBool,
    fail_publishes: AtomicBool,
    connect_attempts: AtomicU32,
}

impl BrokerState {
    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.queues.lock().get(name).cloned()
    }

    fn wake_all(&self) {
        for queue in self.queues.lock().values() {
            queue.notify.notify_waiters();
        }
    }
}

/// Handle to an in-process broker. Clones share the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// A connector opening channels on this broker.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    /// Opens a channel directly, without lifecycle reporting. Useful for
    /// playing the responder side in tests.
    pub fn channel(&self) -> Arc<MemoryChannel> {
        self.open(0, None)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.state.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Connection attempts seen through `connector()`, refused ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Names of the declared queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages ready for delivery in `queue`.
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.state.queue(queue).map(|q| q.ready.lock().len())
    }

    /// Deliveries from `queue` handed out and not yet settled, across channels.
    pub fn unacked(&self, queue: &str) -> usize {
        let Some(target) = self.state.queue(queue) else {
            return 0;
        };

        self.live_channels()
            .iter()
            .map(|core| {
                core.unacked
                    .lock()
                    .values()
                    .filter(|(q, _)| Arc::ptr_eq(q, &target))
                    .count()
            })
            .sum()
    }

    /// Closes every live channel as if the broker had dropped them.
    pub fn sever(&self) {
        for core in self.live_channels() {
            core.close(&self.state);
            if let Some(events) = &core.events {
                let _ = events.send(LifecycleEvent::ChannelLost {
                    generation: core.generation,
                    reason: "channel severed by broker".to_owned(),
                });
            }
        }
    }

    fn live_channels(&self) -> Vec<Arc<ChannelCore>> {
        let mut channels = self.state.channels.lock();
        channels.retain(|c| c.strong_count() > 0);
        channels
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .collect()
    }

    fn open(&self, generation: u64, events: Option<LifecycleSender>) -> Arc<MemoryChannel> {
        let core = Arc::new(ChannelCore {
            generation,
            closed: AtomicBool::new(false),
            unacked: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            events,
        });
        self.state.channels.lock().push(Arc::downgrade(&core));

        Arc::new(MemoryChannel {
            core,
            broker: self.state.clone(),
        })
    }
}

struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        generation: u64,
        events: LifecycleSender,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.broker
            .state
            .connect_attempts
            .fetch_add(1, Ordering::SeqCst);

        if self.broker.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        Ok(self.broker.open(generation, Some(events)))
    }
}

struct ChannelCore {
    generation: u64,
    closed: AtomicBool,
    unacked: Mutex<HashMap<u64, (Arc<MemoryQueue>, Envelope)>>,
    next_tag: AtomicU64,
    events: Option<LifecycleSender>,
}

impl ChannelCore {
    fn close(&self, broker: &BrokerState) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let outstanding: Vec<_> = self.unacked.lock().drain().collect();
        for (_, (queue, envelope)) in outstanding {
            queue.requeue(envelope);
        }
        broker.wake_all();
    }

    fn settle(&self, tag: u64) -> Option<(Arc<MemoryQueue>, Envelope)> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.unacked.lock().remove(&tag)
    }
}

/// A channel on the in-memory broker.
pub struct MemoryChannel {
    core: Arc<ChannelCore>,
    broker: Arc<BrokerState>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn generation(&self) -> u64 {
        self.core.generation
    }

    fn is_open(&self) -> bool {
        !self.core.closed.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelClosed);
        }

        let mut queues = self.broker.queues.lock();
        match queues.get(&def.name) {
            Some(existing) if existing.durable != def.durable || existing.auto_delete != def.delete => {
                debug!(queue = %def.name, "inequivalent queue redeclaration");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                queues.insert(
                    def.name.clone(),
                    Arc::new(MemoryQueue {
                        durable: def.durable,
                        auto_delete: def.delete,
                        ready: Mutex::new(VecDeque::new()),
                        notify: Notify::new(),
                    }),
                );
                Ok(())
            }
        }
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::PublishingError("channel closed".to_owned()));
        }
        if self.broker.fail_publishes.load(Ordering::SeqCst) {
            return Err(AmqpError::PublishingError("publish rejected".to_owned()));
        }

        match self.broker.queue(&msg.routing_key) {
            Some(queue) => {
                let now = Instant::now();
                queue.push(Envelope {
                    message: msg.clone(),
                    enqueued_at: now,
                    ready_at: now,
                    redelivered: false,
                })
            }
            None => debug!(queue = %msg.routing_key, "unroutable message dropped"),
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelClosed);
        }
        let Some(target) = self.broker.queue(queue) else {
            return Err(AmqpError::BindingConsumerError(consumer_tag.to_owned()));
        };

        let stream = stream::unfold((self.core.clone(), target), |(core, queue)| async move {
            loop {
                let waker = queue.clone();
                let notified = waker.notify.notified();

                if core.closed.load(Ordering::SeqCst) {
                    return None;
                }

                match queue.next() {
                    Next::Ready(envelope) => {
                        let tag = core.next_tag.fetch_add(1, Ordering::SeqCst);
                        core.unacked
                            .lock()
                            .insert(tag, (queue.clone(), envelope.clone()));

                        let acker = MemoryAcker {
                            core: core.clone(),
                            tag,
                        };
                        let delivery = InboundDelivery::from_outbound(
                            envelope.message,
                            envelope.redelivered,
                            Box::new(acker),
                        );
                        return Some((Ok::<_, AmqpError>(delivery), (core, queue)));
                    }
                    Next::HeldUntil(at) => {
                        tokio::select! {
                            _ = notified => {}
                            _ = tokio::time::sleep_until(at) => {}
                        }
                    }
                    Next::Empty => notified.await,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.core.close(&self.broker);
        Ok(())
    }
}

struct MemoryAcker {
    core: Arc<ChannelCore>,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.core
            .settle(self.tag)
            .map(|_| ())
            .ok_or(AmqpError::AckMessageError)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        let (queue, envelope) = self
            .core
            .settle(self.tag)
            .ok_or(AmqpError::RequeuingMessageError)?;

        if requeue {
            queue.requeue(envelope);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn declared(broker: &MemoryBroker, name: &str) -> Arc<MemoryChannel> {
        let channel = broker.channel();
        channel
            .declare_queue(&QueueDefinition::new(name).durable())
            .await
            .unwrap();
        channel
    }

    #[tokio::test]
    async fn test_publish_and_ack() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker, "jobs").await;

        channel
            .publish(&OutboundMessage::new("jobs", b"{}".to_vec()).correlation_id("c1"))
            .await
            .unwrap();
        assert_eq!(broker.queue_len("jobs"), Some(1));

        let mut deliveries = channel.consume("jobs", "t").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.correlation_id.as_deref(), Some("c1"));
        assert!(delivery.persistent);
        assert_eq!(broker.unacked("jobs"), 1);

        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked("jobs"), 0);
        assert_eq!(broker.queue_len("jobs"), Some(0));

        // settling twice is refused
        assert_eq!(delivery.ack().await, Err(AmqpError::AckMessageError));
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker, "jobs").await;
        channel
            .publish(&OutboundMessage::new("jobs", b"1".to_vec()))
            .await
            .unwrap();

        let mut deliveries = channel.consume("jobs", "t").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let again = deliveries.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.data, b"1");

        again.nack(false).await.unwrap();
        assert_eq!(broker.queue_len("jobs"), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_message_does_not_block_the_queue() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker, "jobs").await;
        for body in [b"stray", b"match"] {
            channel
                .publish(&OutboundMessage::new("jobs", body.to_vec()))
                .await
                .unwrap();
        }

        let mut deliveries = channel.consume("jobs", "t").await.unwrap();
        let stray = deliveries.next().await.unwrap().unwrap();
        assert_eq!(stray.data, b"stray");
        stray.nack(true).await.unwrap();

        let next = deliveries.next().await.unwrap().unwrap();
        assert_eq!(next.data, b"match");
        assert!(!next.redelivered);
        next.ack().await.unwrap();

        let again = deliveries.next().await.unwrap().unwrap();
        assert_eq!(again.data, b"stray");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_close_requeues_unacked() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker, "jobs").await;
        channel
            .publish(&OutboundMessage::new("jobs", b"1".to_vec()))
            .await
            .unwrap();

        let mut deliveries = channel.consume("jobs", "t").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        channel.close().await.unwrap();

        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.queue_len("jobs"), Some(1));
        assert_eq!(delivery.ack().await, Err(AmqpError::AckMessageError));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_messages_are_dropped() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker, "jobs").await;
        channel
            .publish(
                &OutboundMessage::new("jobs", b"1".to_vec()).expiration(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        channel
            .publish(&OutboundMessage::new("jobs", b"2".to_vec()))
            .await
            .unwrap();

        let mut deliveries = channel.consume("jobs", "t").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.data, b"2");
    }

    #[tokio::test]
    async fn test_unroutable_and_unknown_queue() {
        let broker = MemoryBroker::new();
        let channel = broker.channel();

        channel
            .publish(&OutboundMessage::new("nowhere", b"1".to_vec()))
            .await
            .unwrap();
        assert_eq!(broker.queue_len("nowhere"), None);

        assert!(matches!(
            channel.consume("nowhere", "t").await,
            Err(AmqpError::BindingConsumerError(_))
        ));
    }

    #[tokio::test]
    async fn test_refuse_and_fail_publish() {
        let broker = MemoryBroker::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        broker.refuse_connections(true);
        assert!(broker.connector().connect(1, tx.clone()).await.is_err());
        broker.refuse_connections(false);
        let channel = broker.connector().connect(2, tx).await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);

        broker.fail_publishes(true);
        assert!(matches!(
            channel.publish(&OutboundMessage::new("x", vec![])).await,
            Err(AmqpError::PublishingError(_))
        ));
    }

    #[tokio::test]
    async fn test_sever_reports_channel_lost() {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let channel = broker.connector().connect(7, tx).await.unwrap();

        broker.sever();

        assert!(!channel.is_open());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.generation(), 7);
        assert!(matches!(event, LifecycleEvent::ChannelLost { .. }));
    }
}
