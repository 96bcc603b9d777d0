// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capability
//!
//! The client never talks to the wire protocol directly. It drives a broker
//! through the three traits in this module: [`Broker`] opens connections,
//! [`BrokerConnection`] opens channels and reports connection events, and
//! [`BrokerChannel`] carries the exchange, queue, publish and consume
//! operations. [`LapinBroker`](crate::channel::LapinBroker) implements them over RabbitMQ.

use crate::{
    exchange::ExchangeDefinition,
    publisher::MessageProperties,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::Stream;
use std::{collections::BTreeMap, pin::Pin, sync::Arc};
use thiserror::Error;

/// Error reported by a broker implementation. The client maps it to the
/// [`AmqpError`](crate::errors::AmqpError) of the step that failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BrokerError(pub String);

impl BrokerError {
    pub fn new(msg: impl Into<String>) -> Self {
        BrokerError(msg.into())
    }
}

/// Stream of deliveries for one subscription. The stream ends when the
/// subscription is cancelled or the channel goes away.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Invoked for every error the connection reports.
pub type ErrorHook = Box<dyn Fn(BrokerError) + Send + Sync>;

/// Invoked once when the connection is closed, with the reason if known.
pub type CloseHook = Box<dyn Fn(Option<String>) + Send + Sync>;

/// Whether the broker took a published message without backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// The message was handed over.
    Sent,
    /// The message is still queued locally. It has not been dropped.
    Buffered,
}

/// A header or argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Int(value as i64)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// A message received from a queue.
///
/// `delivery_tag` is the handle used to acknowledge or reject the message on
/// the channel it arrived on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
}

/// Queue state reported by a declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Opens connections to a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn open(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    fn on_error(&self, hook: ErrorHook);

    /// Registers the hook fired when the connection closes. Implementations
    /// fire it for broker-initiated closes; firing it after an explicit
    /// [`close`](BrokerConnection::close) is allowed.
    fn on_close(&self, hook: CloseHook);

    async fn close(&self) -> Result<(), BrokerError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Puts the channel in publisher-confirm mode.
    async fn enable_confirms(&self) -> Result<(), BrokerError>;

    /// Declares an exchange, succeeding if it already exists with the same type.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BrokerError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, BrokerError>;

    async fn bind(&self, binding: &QueueBinding) -> Result<(), BrokerError>;

    /// Limits the number of unacknowledged deliveries pushed to consumers.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    async fn transmit(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<Handoff, BrokerError>;

    /// Starts a manually acknowledged subscription on `queue`.
    async fn subscribe(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
