// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Correlation Registry
//!
//! Tracks the RPC calls that are waiting for a reply. Each pending call owns a
//! oneshot sender and a timer task. An entry leaves the map exactly once,
//! either through `resolve` (a matching reply arrived) or through `evict` (the
//! timer fired). Both paths remove the entry under the same lock before
//! completing the caller, so a reply racing a timeout can never fire twice.
//!
//! The ids of the last `RESOLVED_HISTORY` resolved calls are remembered, so a
//! reply the broker hands out again after its ack was lost can be recognised
//! as a duplicate instead of being requeued forever.

use crate::errors::AmqpError;
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, warn};

/// Resolved correlation ids kept for duplicate detection.
pub const RESOLVED_HISTORY: usize = 1024;

/// Outcome delivered to a waiting caller.
pub type CallResult = Result<Value, AmqpError>;

struct PendingCall {
    completion: oneshot::Sender<CallResult>,
    timer: JoinHandle<()>,
    timeout: Duration,
}

#[derive(Default)]
struct ResolvedIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl ResolvedIds {
    fn remember(&mut self, id: &str) {
        if !self.ids.insert(id.to_owned()) {
            return;
        }
        self.order.push_back(id.to_owned());
        if self.order.len() > RESOLVED_HISTORY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// Concurrent map from correlation id to pending call.
#[derive(Default)]
pub struct CorrelationRegistry {
    pending: Mutex<HashMap<String, PendingCall>>,
    resolved: Mutex<ResolvedIds>,
}

impl CorrelationRegistry {
    pub fn new() -> Arc<CorrelationRegistry> {
        Arc::new(CorrelationRegistry::default())
    }

    /// Registers a waiter for `id` and arms its timeout.
    ///
    /// Fails with `DuplicateCorrelationId` if a call with the same id is still
    /// pending; the existing waiter is left untouched.
    pub fn register(
        self: &Arc<Self>,
        id: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<CallResult>, AmqpError> {
        let mut pending = self.pending.lock();
        if pending.contains_key(id) {
            warn!(correlation_id = id, "correlation id already in flight");
            return Err(AmqpError::DuplicateCorrelationId(id.to_owned()));
        }

        let (completion, receiver) = oneshot::channel();
        let timer = tokio::spawn(expire(Arc::downgrade(self), id.to_owned(), timeout));

        pending.insert(
            id.to_owned(),
            PendingCall {
                completion,
                timer,
                timeout,
            },
        );

        Ok(receiver)
    }

    /// Completes the waiter for `id` with `payload`.
    ///
    /// Returns true if a waiter existed and was resolved.
    pub fn resolve(&self, id: &str, payload: Value) -> bool {
        let Some(call) = self.pending.lock().remove(id) else {
            return false;
        };

        call.timer.abort();
        self.resolved.lock().remember(id);
        if call.completion.send(Ok(payload)).is_err() {
            debug!(correlation_id = id, "caller went away before the reply");
        }
        true
    }

    /// Removes the waiter for `id` and fails it with a timeout error.
    ///
    /// Returns true if a waiter existed.
    pub fn evict(&self, id: &str) -> bool {
        let Some(call) = self.pending.lock().remove(id) else {
            return false;
        };

        warn!(
            correlation_id = id,
            timeout_ms = call.timeout.as_millis() as u64,
            "rpc call timed out"
        );

        let _ = call.completion.send(Err(AmqpError::RpcTimeout {
            correlation_id: id.to_owned(),
            timeout_ms: call.timeout.as_millis() as u64,
        }));
        true
    }

    /// Drops the waiter for `id` without completing it, e.g. after the
    /// request could not be published. The caller gets the publish error
    /// instead.
    pub fn cancel(&self, id: &str) -> bool {
        match self.pending.lock().remove(id) {
            Some(call) => {
                call.timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.lock().contains_key(id)
    }

    /// Whether a call with this id was recently resolved by a reply.
    pub fn was_resolved(&self, id: &str) -> bool {
        self.resolved.lock().ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl Drop for CorrelationRegistry {
    fn drop(&mut self) {
        for (_, call) in self.pending.get_mut().drain() {
            call.timer.abort();
        }
    }
}

async fn expire(registry: Weak<CorrelationRegistry>, id: String, timeout: Duration) {
    sleep(timeout).await;
    if let Some(registry) = registry.upgrade() {
        registry.evict(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = CorrelationRegistry::new();
        let rx = registry.register("a", Duration::from_secs(30)).unwrap();
        assert_eq!(registry.len(), 1);

        assert!(registry.resolve("a", json!({"ok": true})));
        assert!(registry.is_empty());
        assert_eq!(rx.await.unwrap(), Ok(json!({"ok": true})));

        // second resolve finds nothing
        assert!(!registry.resolve("a", json!(null)));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let registry = CorrelationRegistry::new();
        let _rx = registry.register("a", Duration::from_secs(30)).unwrap();

        assert_eq!(
            registry.register("a", Duration::from_secs(30)).unwrap_err(),
            AmqpError::DuplicateCorrelationId("a".to_owned())
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_evicts() {
        let registry = CorrelationRegistry::new();
        let started = Instant::now();
        let rx = registry.register("a", Duration::from_millis(200)).unwrap();

        let result = rx.await.unwrap();
        assert_eq!(
            result,
            Err(AmqpError::RpcTimeout {
                correlation_id: "a".to_owned(),
                timeout_ms: 200,
            })
        );
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(registry.is_empty());

        // a late reply is not matched
        assert!(!registry.resolve("a", json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_cancels_timer() {
        let registry = CorrelationRegistry::new();
        let rx = registry.register("a", Duration::from_millis(100)).unwrap();
        assert!(registry.resolve("a", json!(1)));

        sleep(Duration::from_millis(500)).await;
        assert!(!registry.evict("a"));
        assert_eq!(rx.await.unwrap(), Ok(json!(1)));
    }

    #[tokio::test]
    async fn test_cancel_drops_waiter() {
        let registry = CorrelationRegistry::new();
        let rx = registry.register("a", Duration::from_secs(30)).unwrap();

        assert!(registry.cancel("a"));
        assert!(!registry.contains("a"));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_resolved_ids_are_remembered() {
        let registry = CorrelationRegistry::new();
        let _rx = registry.register("a", Duration::from_secs(30)).unwrap();
        let _timed_out = registry.register("b", Duration::from_secs(30)).unwrap();

        assert!(!registry.was_resolved("a"));
        assert!(registry.resolve("a", json!(1)));
        assert!(registry.evict("b"));

        assert!(registry.was_resolved("a"));
        assert!(!registry.was_resolved("b"));
    }

    #[tokio::test]
    async fn test_resolved_history_is_bounded() {
        let registry = CorrelationRegistry::new();
        for i in 0..=RESOLVED_HISTORY {
            let id = i.to_string();
            let _rx = registry.register(&id, Duration::from_secs(30)).unwrap();
            registry.resolve(&id, json!(null));
        }

        assert!(!registry.was_resolved("0"));
        assert!(registry.was_resolved("1"));
        assert!(registry.was_resolved(&RESOLVED_HISTORY.to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_once_under_races() {
        let registry = CorrelationRegistry::new();
        let mut receivers = vec![];

        for i in 0..200 {
            let id = format!("call-{i}");
            receivers.push(registry.register(&id, Duration::from_millis(20)).unwrap());
        }

        let resolver = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut resolved = 0;
                for i in 0..200 {
                    if registry.resolve(&format!("call-{i}"), json!(i)) {
                        resolved += 1;
                    }
                    if i % 10 == 0 {
                        sleep(Duration::from_millis(1)).await;
                    }
                }
                resolved
            })
        };

        let resolved = resolver.await.unwrap();
        let mut replies = 0;
        let mut timeouts = 0;
        for rx in receivers {
            match rx.await.unwrap() {
                Ok(_) => replies += 1,
                Err(err) => {
                    assert!(err.is_timeout());
                    timeouts += 1;
                }
            }
        }

        assert_eq!(replies, resolved);
        assert_eq!(replies + timeouts, 200);
        assert!(registry.is_empty());
    }
}
