// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Descriptor for the queues the RPC client depends on: the request queues it
//! publishes work to and the reply queue it consumes from.

/// A queue and the flags it is declared with.
///
/// Declaration is create-if-absent, so the flags must match whatever the
/// broker already holds under the same name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
}

impl QueueDefinition {
    /// A transient queue named `name`.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Survives broker restarts. Request and reply queues are always durable.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Removed by the broker once its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }
}
