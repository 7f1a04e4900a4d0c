// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Correlation Identifiers
//!
//! Generates the opaque tokens that bind an outbound request to its reply.

use crate::errors::AmqpError;
use std::{
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

/// The sequential counter wraps at this value.
pub const COUNTER_MODULUS: u64 = 1_000_000;

/// How correlation identifiers are produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CorrelationStrategy {
    /// A random 128-bit UUID per call.
    #[default]
    Random,
    /// `<unix millis>-<counter>`, the counter wrapping at `COUNTER_MODULUS`.
    Sequential,
}

impl FromStr for CorrelationStrategy {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "random" | "uuid" => Ok(CorrelationStrategy::Random),
            "sequential" | "counter" => Ok(CorrelationStrategy::Sequential),
            other => Err(AmqpError::InvalidConfig(format!(
                "unknown correlation strategy `{other}`"
            ))),
        }
    }
}

/// Thread-safe correlation id source, one per client.
#[derive(Debug, Default)]
pub struct CorrelationIdGenerator {
    strategy: CorrelationStrategy,
    counter: AtomicU64,
}

impl CorrelationIdGenerator {
    pub fn new(strategy: CorrelationStrategy) -> Self {
        Self {
            strategy,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        match self.strategy {
            CorrelationStrategy::Random => Uuid::new_v4().to_string(),
            CorrelationStrategy::Sequential => {
                let seq = self.counter.fetch_add(1, Ordering::Relaxed) % COUNTER_MODULUS;
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or_default();
                format!("{millis}-{seq}")
            }
        }
    }
}
