// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod dispatcher;
mod otel;

pub mod broker;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod routing;

pub use broker::{Delivery, Handoff, HeaderValue};
pub use client::AmqpClient;
pub use codec::{Codec, JsonCodec};
pub use config::{ClientConfig, ReconnectPolicy};
pub use consumer::{handler_fn, ConsumeOptions, ConsumerHandler, HandlerResult};
pub use errors::{AmqpError, ErrorKind};
pub use publisher::PublishOptions;
pub use queue::QueueOptions;
pub use routing::MATCH_ALL;
