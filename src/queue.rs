// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management
//!
//! `QueueOptions` is what callers pass to `consume`. It resolves into a
//! `QueueDefinition`, the declaration actually sent to the broker, where the
//! queue is durable unless the caller said otherwise and limits such as TTL
//! or maximum length become `x-` arguments.

use crate::broker::HeaderValue;
use std::collections::BTreeMap;

/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Caller-side queue options.
///
/// Every field left unset falls back to the client's default: a durable,
/// shared, non-auto-deleted queue without arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub(crate) durable: Option<bool>,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) arguments: BTreeMap<String, HeaderValue>,
}

impl QueueOptions {
    pub fn new() -> QueueOptions {
        QueueOptions::default()
    }

    /// Overrides durability. Queues are durable by default.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Only checks that the queue exists instead of creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a broker-specific declaration argument.
    ///
    /// Typed settings such as [`ttl`](QueueOptions::ttl) take precedence over
    /// an argument with the same name.
    pub fn argument(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    pub(crate) fn into_definition(self, name: &str) -> QueueDefinition {
        let mut arguments = self.arguments;

        if let Some(ttl) = self.ttl {
            arguments.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), HeaderValue::from(ttl));
        }

        if let Some(max) = self.max_length {
            arguments.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), HeaderValue::from(max));
        }

        if let Some(max_bytes) = self.max_length_bytes {
            arguments.insert(
                AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(),
                HeaderValue::from(max_bytes),
            );
        }

        QueueDefinition {
            name: name.to_owned(),
            durable: self.durable.unwrap_or(true),
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            passive: self.passive,
            arguments,
        }
    }
}

/// Queue declaration as sent to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub passive: bool,
    pub arguments: BTreeMap<String, HeaderValue>,
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue_name: String,
    pub exchange_name: String,
    pub binding_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and binding key start empty and are set with
    /// [`exchange`](QueueBinding::exchange) and
    /// [`binding_key`](QueueBinding::binding_key).
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..Default::default()
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn binding_key(mut self, key: &str) -> Self {
        self.binding_key = key.to_owned();
        self
    }
}
