// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Broker over lapin
//!
//! Implements the broker capability with the `lapin` AMQP client. lapin has
//! no dedicated close notification: any connection-level error leaves the
//! connection unusable, so the first error reported also fires the close
//! hooks.

use crate::{
    broker::{
        Broker, BrokerChannel, BrokerConnection, BrokerError, CloseHook, Delivery,
        DeliveryStream, ErrorHook, Handoff, HeaderValue, QueueInfo,
    },
    exchange::ExchangeDefinition,
    publisher::MessageProperties,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError(err.to_string())
    }
}

/// Opens lapin connections.
pub struct LapinBroker {
    connection_name: String,
}

impl LapinBroker {
    pub fn new(connection_name: &str) -> LapinBroker {
        LapinBroker {
            connection_name: connection_name.to_owned(),
        }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn open(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(BrokerError::from(err))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection::new(conn)))
    }
}

#[derive(Default)]
struct Hooks {
    error: Vec<ErrorHook>,
    close: Vec<CloseHook>,
    closed: bool,
    reason: Option<String>,
}

pub struct LapinConnection {
    conn: Connection,
    hooks: Arc<Mutex<Hooks>>,
}

fn lock(hooks: &Mutex<Hooks>) -> MutexGuard<'_, Hooks> {
    hooks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fires the error hooks. The first error also closes the connection.
fn report_error(hooks: &Mutex<Hooks>, err: BrokerError) {
    let mut hooks = lock(hooks);

    for hook in &hooks.error {
        hook(err.clone());
    }

    if !hooks.closed {
        hooks.closed = true;
        hooks.reason = Some(err.to_string());
        for hook in &hooks.close {
            hook(hooks.reason.clone());
        }
    }
}

/// Registers a close hook, firing it right away if the connection is
/// already closed.
fn register_close(hooks: &Mutex<Hooks>, hook: CloseHook) {
    let mut guard = lock(hooks);
    if !guard.closed {
        guard.close.push(hook);
        return;
    }

    let reason = guard.reason.clone();
    drop(guard);
    hook(reason);
}

impl LapinConnection {
    fn new(conn: Connection) -> LapinConnection {
        let hooks = Arc::new(Mutex::new(Hooks::default()));

        let shared = hooks.clone();
        conn.on_error(move |err: lapin::Error| {
            report_error(&shared, BrokerError::from(err));
        });

        LapinConnection { conn, hooks }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(BrokerError::from(err))
            }
        }
    }

    fn on_error(&self, hook: ErrorHook) {
        lock(&self.hooks).error.push(hook);
    }

    fn on_close(&self, hook: CloseHook) {
        register_close(&self.hooks, hook);
    }

    async fn close(&self) -> Result<(), BrokerError> {
        lock(&self.hooks).closed = true;
        self.conn.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn enable_confirms(&self) -> Result<(), BrokerError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                &def.name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: def.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                field_table(&def.arguments),
            )
            .await?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.binding_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    /// lapin only resolves the publish once the frames are queued for the
    /// socket, so this never reports [`Handoff::Buffered`]. In confirm mode
    /// the broker's confirmation is awaited and a nack is an error.
    async fn transmit(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<Handoff, BrokerError> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: properties.mandatory,
                    immediate: false,
                },
                body,
                basic_properties(properties),
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Nack(_) => Err(BrokerError::new("message was nacked by the broker")),
            Confirmation::Ack(Some(_)) => {
                warn!(routing_key, "unroutable message was returned by the broker");
                Ok(Handoff::Sent)
            }
            _ => Ok(Handoff::Sent),
        }
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        Ok(Box::pin(consumer.map(|result| {
            result.map(into_delivery).map_err(BrokerError::from)
        })))
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

fn basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default()
        .with_delivery_mode(if props.persistent {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        })
        .with_headers(field_table(&props.headers));

    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(id) = &props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(queue) = &props.reply_to {
        basic = basic.with_reply_to(ShortString::from(queue.clone()));
    }
    if let Some(kind) = &props.kind {
        basic = basic.with_type(ShortString::from(kind.clone()));
    }
    if let Some(priority) = props.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(expiration) = &props.expiration {
        basic = basic.with_expiration(ShortString::from(expiration.clone()));
    }

    basic
}

fn field_table(values: &BTreeMap<String, HeaderValue>) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in values {
        let amqp_value = match value {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Int(v) => match i32::try_from(*v) {
                Ok(v) => AMQPValue::LongInt(v),
                Err(_) => AMQPValue::LongLongInt(*v),
            },
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(btree)
}

fn header_values(table: &FieldTable) -> BTreeMap<String, HeaderValue> {
    let mut headers = BTreeMap::new();

    for (key, value) in table.inner() {
        let value = match value {
            AMQPValue::LongString(v) => {
                HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
            }
            AMQPValue::ShortString(v) => HeaderValue::String(v.as_str().to_owned()),
            AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
            AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
            _ => continue,
        };

        headers.insert(key.as_str().to_owned(), value);
    }

    headers
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        content_type: props.content_type().as_ref().map(|v| v.as_str().to_owned()),
        message_id: props.message_id().as_ref().map(|v| v.as_str().to_owned()),
        headers: props
            .headers()
            .as_ref()
            .map(header_values)
            .unwrap_or_default(),
        body: delivery.data,
    }
}
