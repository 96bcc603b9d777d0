// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! Every delivery goes through the same state machine: decode the body, run
//! the handler, then acknowledge on success or reject without requeue on any
//! failure. A malformed or failing message is dropped instead of being
//! redelivered forever, and it never takes the consumer down with it.

use crate::{
    broker::{BrokerChannel, Delivery},
    codec::Codec,
    errors::AmqpError,
    otel,
    queue::QueueOptions,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, future::Future, panic::AssertUnwindSafe};
use tracing::{debug, error, warn};

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Processes decoded messages.
///
/// Returning an error rejects the delivery without requeue.
#[async_trait]
pub trait ConsumerHandler<T: Send + 'static>: Send + Sync {
    async fn exec(&self, ctx: &Context, content: T, delivery: &Delivery) -> HandlerResult;
}

/// Handler built from an async closure, see [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps an async closure taking the decoded content and the delivery.
pub fn handler_fn<T, F, Fut>(f: F) -> HandlerFn<F>
where
    T: Send + 'static,
    F: Fn(T, Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<T, F, Fut> ConsumerHandler<T> for HandlerFn<F>
where
    T: Send + 'static,
    F: Fn(T, Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn exec(&self, _ctx: &Context, content: T, delivery: &Delivery) -> HandlerResult {
        (self.f)(content, delivery.clone()).await
    }
}

/// Options for `AmqpClient::consume`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub(crate) prefetch: Option<u16>,
    pub(crate) consumer_tag: Option<String>,
    pub(crate) queue: QueueOptions,
}

impl ConsumeOptions {
    pub fn new() -> ConsumeOptions {
        ConsumeOptions::default()
    }

    /// Maximum number of unacknowledged deliveries, also the number of
    /// deliveries processed concurrently. Zero means unlimited.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    pub fn queue(mut self, queue: QueueOptions) -> Self {
        self.queue = queue;
        self
    }
}

/// Terminal state of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Acked,
    Rejected,
}

/// Consumes one delivery.
///
/// The delivery is resolved exactly once: acknowledged when the handler
/// succeeds, rejected without requeue when decoding fails, the handler
/// returns an error or the handler panics. An error is only returned when the
/// ack or the reject itself fails.
pub(crate) async fn consume<T, C>(
    tracer: &BoxedTracer,
    delivery: Delivery,
    channel: &dyn BrokerChannel,
    codec: &C,
    handler: &dyn ConsumerHandler<T>,
) -> Result<Resolution, AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    C: Codec,
{
    let (ctx, mut span) = otel::new_span(&delivery, tracer);

    debug!(
        "received: {} - exchange: {}",
        delivery.routing_key, delivery.exchange,
    );

    let outcome = match codec.decode::<T>(&delivery.body) {
        Err(err) => Err(err),
        Ok(content) => {
            match AssertUnwindSafe(handler.exec(&ctx, content, &delivery))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(AmqpError::HandlerError(err.to_string())),
                Err(_) => Err(AmqpError::HandlerError("handler panicked".to_owned())),
            }
        }
    };

    if let Err(err) = outcome {
        warn!(
            error = err.to_string(),
            routing_key = %delivery.routing_key,
            "error processing message, rejecting without requeue"
        );
        span.record_error(&err);

        return match channel.reject(delivery.delivery_tag, false).await {
            Ok(()) => {
                span.set_status(Status::error(err.to_string()));
                Ok(Resolution::Rejected)
            }
            Err(e) => {
                error!("error whiling nack msg");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to nack msg"),
                });
                Err(AmqpError::NackMessageError(e.to_string()))
            }
        };
    }

    debug!("message successfully processed");
    match channel.acknowledge(delivery.delivery_tag).await {
        Ok(()) => {
            span.set_status(Status::Ok);
            Ok(Resolution::Acked)
        }
        Err(e) => {
            error!("error whiling ack msg");
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(AmqpError::AckMessageError(e.to_string()))
        }
    }
}
