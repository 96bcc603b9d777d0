// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Client
//!
//! `AmqpClient` owns at most one session (a connection and a channel) and
//! keeps it alive:
//!
//! - `connect` retries a bounded number of times and fails with
//!   `ConnectionExhaustedError` once the attempts run out;
//! - when the broker closes the session, the client reconnects in the
//!   background, by default forever at a fixed delay;
//! - `publish` and `consume` connect lazily when no session is open;
//! - `close` is best effort and never fails.
//!
//! The reconnection loop ignores the `max_retries` given to `connect` and
//! only follows the client's `ReconnectPolicy`.

use crate::{
    broker::{Broker, BrokerChannel, BrokerConnection},
    channel::LapinBroker,
    codec::{Codec, JsonCodec},
    config::ClientConfig,
    consumer::{ConsumeOptions, ConsumerHandler},
    dispatcher::{Dispatch, Subscription},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel,
    publisher::{self, PublishOptions},
    routing,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::{runtime::Handle, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

struct Session {
    id: u64,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

/// Resilient publish/subscribe client over a topic exchange.
///
/// Cloning is cheap and clones share the same session.
pub struct AmqpClient<C: Codec = JsonCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: Codec> Clone for AmqpClient<C> {
    fn clone(&self) -> Self {
        AmqpClient {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<C> {
    config: ClientConfig,
    broker: Arc<dyn Broker>,
    codec: Arc<C>,
    session: Mutex<Option<Session>>,
    /// Set while a connection attempt is in flight.
    connecting: AtomicBool,
    session_ids: AtomicU64,
    /// Bumped by `close`, stops pending reconnection loops.
    close_epoch: AtomicU64,
    consumers: Mutex<Vec<Arc<dyn Dispatch>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AmqpClient<JsonCodec> {
    /// Creates a client for the broker at `url` publishing to `exchange`.
    /// Nothing is opened until the first `connect`, `publish` or `consume`.
    pub fn new(url: &str, exchange: &str) -> Self {
        Self::from_config(ClientConfig::new(url, exchange))
    }

    pub fn from_config(config: ClientConfig) -> Self {
        let broker = Arc::new(LapinBroker::new(&config.connection_name));
        Self::with_broker(config, broker, JsonCodec)
    }
}

impl<C: Codec> AmqpClient<C> {
    pub fn with_broker(config: ClientConfig, broker: Arc<dyn Broker>, codec: C) -> Self {
        AmqpClient {
            inner: Arc::new(Inner {
                config,
                broker,
                codec: Arc::new(codec),
                session: Mutex::new(None),
                connecting: AtomicBool::new(false),
                session_ids: AtomicU64::new(0),
                close_epoch: AtomicU64::new(0),
                consumers: Mutex::new(vec![]),
                tasks: Mutex::new(vec![]),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.has_session()
    }

    /// Opens a session unless one is already open.
    ///
    /// Makes up to `max_retries + 1` attempts, `retry_delay` apart. A call
    /// made while another attempt is in flight returns `Ok(())` right away
    /// without waiting for that attempt.
    pub async fn connect(&self, max_retries: u32, retry_delay: Duration) -> Result<(), AmqpError> {
        self.inner.connect(max_retries, retry_delay).await
    }

    /// [`connect`](AmqpClient::connect) with the retry settings of the configuration.
    pub async fn connect_default(&self) -> Result<(), AmqpError> {
        self.inner
            .connect(self.inner.config.max_retries, self.inner.config.retry_delay())
            .await
    }

    /// Encodes `payload` and publishes it to the exchange under `routing_key`.
    ///
    /// A message the broker could not take right away is still queued for
    /// transmission: it is logged as a warning and this returns `Ok(())`.
    pub async fn publish<T>(
        &self,
        routing_key: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        routing::validate_routing_key(routing_key)?;
        let body = self.inner.codec.encode(payload)?;

        let Some(channel) = self.inner.ensure_channel().await? else {
            error!("failure to publish, channel not initialized");
            return Err(AmqpError::PublishingError(
                "channel not initialized".to_owned(),
            ));
        };

        let properties = options.resolve(
            self.inner.codec.content_type(),
            otel::current_context_headers(),
        );

        publisher::publish(
            channel.as_ref(),
            &self.inner.config.exchange,
            routing_key,
            &body,
            &properties,
        )
        .await?;

        Ok(())
    }

    /// Declares `queue`, binds it to the exchange with `binding_key` and
    /// starts feeding its messages to `handler`.
    ///
    /// Use [`routing::MATCH_ALL`] to receive every message of the exchange.
    /// Successful messages are acknowledged; messages that fail to decode or
    /// whose handler fails are rejected without requeue.
    pub async fn consume<T, H>(
        &self,
        queue: &str,
        handler: H,
        options: ConsumeOptions,
        binding_key: &str,
    ) -> Result<(), AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: ConsumerHandler<T> + 'static,
    {
        routing::validate_binding_key(binding_key)?;

        let Some(channel) = self.inner.ensure_channel().await? else {
            error!(queue, "failure to initialize consumer, channel not initialized");
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        };

        let subscription: Arc<dyn Dispatch> = Arc::new(Subscription::new(
            queue,
            binding_key,
            options,
            self.inner.config.prefetch,
            self.inner.codec.clone(),
            Arc::new(handler),
        ));

        let task = subscription
            .install(channel, &self.inner.config.exchange)
            .await?;
        self.inner.track(task);

        if self.inner.config.restore_consumers {
            lock(&self.inner.consumers).push(subscription);
        }

        Ok(())
    }

    /// Closes the channel, then the connection.
    ///
    /// Errors are logged and swallowed. Pending reconnections stop and
    /// registered consumers are forgotten. A session opened by a connection
    /// attempt still in flight is closed as soon as that attempt completes.
    pub async fn close(&self) {
        self.inner.close_epoch.fetch_add(1, Ordering::AcqRel);
        lock(&self.inner.consumers).clear();

        self.inner.close_session().await;

        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
    }
}

impl<C: Codec> Inner<C> {
    fn has_session(&self) -> bool {
        lock(&self.session).is_some()
    }

    fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        lock(&self.session).as_ref().map(|s| s.channel.clone())
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Returns the open channel, connecting with the configured defaults first
    /// when there is none.
    async fn ensure_channel(self: &Arc<Self>) -> Result<Option<Arc<dyn BrokerChannel>>, AmqpError> {
        if let Some(channel) = self.channel() {
            return Ok(Some(channel));
        }

        info!("channel not initialized, attempting to connect...");
        self.connect(self.config.max_retries, self.config.retry_delay())
            .await?;

        Ok(self.channel())
    }

    async fn connect(self: &Arc<Self>, max_retries: u32, retry_delay: Duration) -> Result<(), AmqpError> {
        let epoch = self.close_epoch.load(Ordering::Acquire);
        let mut attempts = 0;

        loop {
            if self.has_session() {
                return Ok(());
            }

            if self
                .connecting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!("connection attempt already in progress");
                return Ok(());
            }

            attempts += 1;
            let result = self.establish(retry_delay).await;
            self.connecting.store(false, Ordering::Release);

            match result {
                Ok(()) if self.close_epoch.load(Ordering::Acquire) != epoch => {
                    debug!("client closed while connecting");
                    self.close_session().await;
                    return Ok(());
                }
                Ok(()) => {
                    info!("connection established successfully");
                    return Ok(());
                }
                Err(err) if attempts <= max_retries => {
                    error!(
                        error = err.to_string(),
                        retries_left = max_retries - attempts + 1,
                        "connection failed, retrying in {:?}",
                        retry_delay
                    );
                    sleep(retry_delay).await;
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        attempts, "could not connect after maximum attempts"
                    );
                    return Err(AmqpError::ConnectionExhaustedError {
                        attempts,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    /// One connection attempt: connection, channel, exchange, hooks.
    async fn establish(self: &Arc<Self>, retry_delay: Duration) -> Result<(), AmqpError> {
        let connection = match self.broker.open(&self.config.uri()).await {
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        let channel = match self.prepare_channel(connection.as_ref()).await {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(e) = connection.close().await {
                    debug!(error = e.to_string(), "error closing half-open connection");
                }
                return Err(err);
            }
        };

        let id = self.session_ids.fetch_add(1, Ordering::AcqRel) + 1;
        *lock(&self.session) = Some(Session {
            id,
            connection: connection.clone(),
            channel: channel.clone(),
        });

        connection.on_error(Box::new(|err| {
            error!(error = err.to_string(), "amqp connection error");
        }));

        let client = Arc::downgrade(self);
        let runtime = Handle::try_current().ok();
        connection.on_close(Box::new(move |reason| {
            on_close(&client, runtime.as_ref(), id, reason, retry_delay);
        }));

        self.restore_consumers(&channel).await;

        Ok(())
    }

    async fn prepare_channel(
        &self,
        connection: &dyn BrokerConnection,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = match connection.open_channel().await {
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        if self.config.publisher_confirms {
            if let Err(err) = channel.enable_confirms().await {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        }

        debug!("creating exchange: {}", self.config.exchange);
        let exchange = ExchangeDefinition::topic(&self.config.exchange).durable();
        if let Err(err) = channel.declare_exchange(&exchange).await {
            error!(
                error = err.to_string(),
                name = self.config.exchange,
                "error to declare the exchange"
            );
            return Err(AmqpError::DeclareExchangeError(self.config.exchange.clone()));
        }

        Ok(channel)
    }

    async fn restore_consumers(&self, channel: &Arc<dyn BrokerChannel>) {
        let consumers = lock(&self.consumers).clone();

        for consumer in consumers {
            match consumer.install(channel.clone(), &self.config.exchange).await {
                Ok(task) => {
                    info!(queue = consumer.queue(), "consumer restored");
                    self.track(task);
                }
                Err(err) => error!(
                    error = err.to_string(),
                    queue = consumer.queue(),
                    "failure to restore consumer"
                ),
            }
        }
    }

    /// Drops the session if `id` is still the current one. Returns whether it was.
    fn lose_session(&self, id: u64) -> bool {
        let mut session = lock(&self.session);
        if !session.as_ref().is_some_and(|current| current.id == id) {
            return false;
        }

        session.take();
        self.connecting.store(false, Ordering::Release);
        true
    }

    async fn close_session(&self) {
        let session = lock(&self.session).take();
        let Some(session) = session else {
            debug!("no open session to close");
            return;
        };

        let mut clean = true;

        if let Err(err) = session.channel.close().await {
            clean = false;
            error!(
                error = AmqpError::ClosingError(err.to_string()).to_string(),
                "error during channel shutdown"
            );
        }

        if let Err(err) = session.connection.close().await {
            clean = false;
            error!(
                error = AmqpError::ClosingError(err.to_string()).to_string(),
                "error during connection shutdown"
            );
        }

        if clean {
            info!("connection closed cleanly");
        }
    }

    /// Reconnects after a broker-initiated close, one attempt per delay,
    /// until a session is open, the client is closed or the policy gives up.
    async fn reconnect(self: Arc<Self>, retry_delay: Duration) {
        let epoch = self.close_epoch.load(Ordering::Acquire);
        let policy = self.config.reconnect.clone();
        let mut delay = retry_delay;
        let mut failed = 0;

        loop {
            sleep(delay).await;

            if self.close_epoch.load(Ordering::Acquire) != epoch {
                debug!("client closed, stopping reconnection");
                return;
            }

            if self.has_session() {
                return;
            }

            match self.connect(0, retry_delay).await {
                Ok(()) if self.close_epoch.load(Ordering::Acquire) != epoch => {
                    debug!("client closed while reconnecting");
                    self.close_session().await;
                    return;
                }
                Ok(()) if self.has_session() => {
                    info!("amqp connection restored");
                    return;
                }
                Ok(()) => {}
                Err(err) => {
                    failed += 1;
                    if policy.exhausted(failed) {
                        error!(
                            error = err.to_string(),
                            attempts = failed,
                            "giving up reconnection"
                        );
                        return;
                    }

                    delay = policy.next_delay(delay);
                    warn!(
                        error = err.to_string(),
                        "reconnection failed, retrying in {:?}", delay
                    );
                }
            }
        }
    }
}

/// Close hook of session `id`. A close of a session that is no longer
/// current, e.g. after `AmqpClient::close`, is ignored.
fn on_close<C: Codec>(
    client: &Weak<Inner<C>>,
    runtime: Option<&Handle>,
    id: u64,
    reason: Option<String>,
    retry_delay: Duration,
) {
    let Some(inner) = client.upgrade() else {
        return;
    };

    if !inner.lose_session(id) {
        debug!(session = id, "ignoring close of a stale session");
        return;
    }

    let err = AmqpError::Disconnected(reason.unwrap_or_else(|| "closed by broker".to_owned()));
    warn!(
        error = err.to_string(),
        "amqp connection lost, retrying in {:?}", retry_delay
    );

    match runtime {
        Some(runtime) => {
            runtime.spawn(inner.reconnect(retry_delay));
        }
        None => error!("no async runtime available, connection will not be restored"),
    }
}
