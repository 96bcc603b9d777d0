// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatch
//!
//! A `Subscription` remembers everything needed to start a consumer on a
//! channel: the queue declaration, the binding, the prefetch and the handler.
//! Installing it declares and binds the queue, applies the prefetch, then
//! spawns a task feeding deliveries to the handler, at most `prefetch` at a
//! time. The client keeps subscriptions so they can be installed again on
//! the channel of a new session.

use crate::{
    broker::{BrokerChannel, DeliveryStream},
    codec::Codec,
    consumer::{consume, ConsumeOptions, ConsumerHandler},
    errors::AmqpError,
    queue::QueueBinding,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::global;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

/// A consumer that can be started on a channel.
#[async_trait]
pub(crate) trait Dispatch: Send + Sync {
    fn queue(&self) -> &str;

    /// Declares, binds and subscribes, returning the task processing deliveries.
    async fn install(
        &self,
        channel: Arc<dyn BrokerChannel>,
        exchange: &str,
    ) -> Result<JoinHandle<()>, AmqpError>;
}

pub(crate) struct Subscription<T, C> {
    queue: String,
    binding_key: String,
    prefetch: u16,
    options: ConsumeOptions,
    codec: Arc<C>,
    handler: Arc<dyn ConsumerHandler<T>>,
}

impl<T, C> Subscription<T, C>
where
    T: DeserializeOwned + Send + 'static,
    C: Codec,
{
    pub(crate) fn new(
        queue: &str,
        binding_key: &str,
        options: ConsumeOptions,
        default_prefetch: u16,
        codec: Arc<C>,
        handler: Arc<dyn ConsumerHandler<T>>,
    ) -> Self {
        Subscription {
            queue: queue.to_owned(),
            binding_key: binding_key.to_owned(),
            prefetch: options.prefetch.unwrap_or(default_prefetch),
            options,
            codec,
            handler,
        }
    }
}

#[async_trait]
impl<T, C> Dispatch for Subscription<T, C>
where
    T: DeserializeOwned + Send + 'static,
    C: Codec,
{
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn install(
        &self,
        channel: Arc<dyn BrokerChannel>,
        exchange: &str,
    ) -> Result<JoinHandle<()>, AmqpError> {
        debug!("creating queue: {}", self.queue);
        let def = self.options.queue.clone().into_definition(&self.queue);
        match channel.declare_queue(&def).await {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare queue");
                Err(AmqpError::DeclareQueueError(self.queue.clone()))
            }
            Ok(info) => {
                debug!(
                    "queue: {} was created, {} messages ready",
                    info.name, info.message_count
                );
                Ok(())
            }
        }?;

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            self.queue, exchange, self.binding_key
        );
        let binding = QueueBinding::new(&self.queue)
            .exchange(exchange)
            .binding_key(&self.binding_key);
        if let Err(err) = channel.bind(&binding).await {
            error!(error = err.to_string(), "error to bind queue to exchange");
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                self.queue.clone(),
            ));
        }

        if let Err(err) = channel.set_prefetch(self.prefetch).await {
            error!(error = err.to_string(), "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(self.prefetch.to_string()));
        }

        let tag = match &self.options.consumer_tag {
            Some(tag) => tag.clone(),
            None => format!("{}-{}", self.queue, Uuid::new_v4()),
        };

        let deliveries = match channel.subscribe(&self.queue, &tag).await {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(self.queue.clone()))
            }
            Ok(stream) => Ok(stream),
        }?;

        info!(
            "consumer started for queue [{}] with binding [{}]",
            self.queue, self.binding_key
        );

        Ok(tokio::spawn(run(
            deliveries,
            channel,
            self.codec.clone(),
            self.handler.clone(),
            self.prefetch,
            self.queue.clone(),
        )))
    }
}

/// Processes deliveries until the stream ends.
async fn run<T, C>(
    deliveries: DeliveryStream,
    channel: Arc<dyn BrokerChannel>,
    codec: Arc<C>,
    handler: Arc<dyn ConsumerHandler<T>>,
    prefetch: u16,
    queue: String,
) where
    T: DeserializeOwned + Send + 'static,
    C: Codec,
{
    let tracer = global::tracer("amqp consumer");

    let tracer = &tracer;
    let channel = channel.as_ref();
    let codec = codec.as_ref();
    let handler = handler.as_ref();

    deliveries
        .for_each_concurrent(usize::from(prefetch), move |result| async move {
            match result {
                Ok(delivery) => {
                    if let Err(err) = consume(tracer, delivery, channel, codec, handler).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        })
        .await;

    debug!(queue = %queue, "consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{BrokerError, Delivery, MockBrokerChannel, QueueInfo},
        codec::JsonCodec,
        consumer::{handler_fn, HandlerResult},
        queue::QueueOptions,
    };
    use futures_util::stream;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn subscription(options: ConsumeOptions) -> Subscription<Value, JsonCodec> {
        let handler = handler_fn(|_content: Value, _delivery: Delivery| async {
            HandlerResult::Ok(())
        });
        Subscription::new(
            "hello-queue",
            "example.events.hello_world",
            options,
            10,
            Arc::new(JsonCodec),
            Arc::new(handler),
        )
    }

    #[tokio::test]
    async fn install_declares_binds_and_subscribes() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .withf(|def| def.name == "hello-queue" && def.durable)
            .times(1)
            .returning(|def| {
                Ok(QueueInfo {
                    name: def.name.clone(),
                    ..Default::default()
                })
            });
        channel
            .expect_bind()
            .withf(|binding| {
                binding.queue_name == "hello-queue"
                    && binding.exchange_name == "hello-exchange"
                    && binding.binding_key == "example.events.hello_world"
            })
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_set_prefetch()
            .withf(|count| *count == 5)
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_subscribe()
            .withf(|queue, tag| queue == "hello-queue" && tag == "worker-1")
            .times(1)
            .returning(|_, _| Ok(Box::pin(stream::empty::<Result<Delivery, BrokerError>>())));

        let options = ConsumeOptions::new().prefetch(5).consumer_tag("worker-1");
        let task = subscription(options)
            .install(Arc::new(channel), "hello-exchange")
            .await
            .unwrap();

        task.await.unwrap();
    }

    #[tokio::test]
    async fn prefetch_defaults_to_client_setting() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .returning(|_| Ok(QueueInfo::default()));
        channel.expect_bind().returning(|_| Ok(()));
        channel
            .expect_set_prefetch()
            .withf(|count| *count == 10)
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_subscribe()
            .returning(|_, _| Ok(Box::pin(stream::empty::<Result<Delivery, BrokerError>>())));

        subscription(ConsumeOptions::new())
            .install(Arc::new(channel), "hello-exchange")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn queue_options_reach_the_declaration() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .withf(|def| !def.durable && def.exclusive)
            .times(1)
            .returning(|_| Err(BrokerError::new("access refused")));

        let options = ConsumeOptions::new().queue(QueueOptions::new().durable(false).exclusive());
        let err = subscription(options)
            .install(Arc::new(channel), "hello-exchange")
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::DeclareQueueError("hello-queue".to_owned()));
    }

    #[tokio::test]
    async fn bind_failure_names_exchange_and_queue() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .returning(|_| Ok(QueueInfo::default()));
        channel
            .expect_bind()
            .returning(|_| Err(BrokerError::new("not found")));
        channel.expect_subscribe().never();

        let err = subscription(ConsumeOptions::new())
            .install(Arc::new(channel), "hello-exchange")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AmqpError::BindingExchangeToQueueError(
                "hello-exchange".to_owned(),
                "hello-queue".to_owned()
            )
        );
    }

    #[tokio::test]
    async fn stream_errors_do_not_stop_the_consumer() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_acknowledge()
            .withf(|tag| *tag == 2)
            .times(1)
            .returning(|_| Ok(()));

        let deliveries: DeliveryStream = Box::pin(stream::iter(vec![
            Err(BrokerError::new("frame error")),
            Ok(Delivery {
                delivery_tag: 2,
                body: b"{}".to_vec(),
                ..Default::default()
            }),
        ]));
        let handler = handler_fn(|_content: Value, _delivery: Delivery| async {
            HandlerResult::Ok(())
        });

        run(
            deliveries,
            Arc::new(channel),
            Arc::new(JsonCodec),
            Arc::new(handler) as Arc<dyn ConsumerHandler<Value>>,
            10,
            "hello-queue".to_owned(),
        )
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_prefetch_deliveries_run_at_once() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_acknowledge().times(6).returning(|_| Ok(()));

        let deliveries: DeliveryStream = Box::pin(stream::iter((1..=6).map(|tag| {
            Ok(Delivery {
                delivery_tag: tag,
                body: b"{}".to_vec(),
                ..Default::default()
            })
        })));

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current, max) = (in_flight.clone(), peak.clone());
        let handler = handler_fn(move |_content: Value, _delivery: Delivery| {
            let (current, max) = (current.clone(), max.clone());
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                HandlerResult::Ok(())
            }
        });

        run(
            deliveries,
            Arc::new(channel),
            Arc::new(JsonCodec),
            Arc::new(handler) as Arc<dyn ConsumerHandler<Value>>,
            2,
            "hello-queue".to_owned(),
        )
        .await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }
}
