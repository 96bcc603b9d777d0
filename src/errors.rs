// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Client
//!
//! `AmqpError` enumerates every failure the client can observe, from connection
//! establishment to per-message processing. `ErrorKind` groups the variants by
//! how they propagate: some are returned to the caller, others are recovered
//! locally and only logged.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error loading or validating the client configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// A single attempt to connect to the broker failed
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Every bounded connection attempt failed
    #[error("could not connect after {attempts} attempts: {reason}")]
    ConnectionExhaustedError { attempts: u32, reason: String },

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Binding key rejected before reaching the broker
    #[error("invalid binding key `{0}`")]
    InvalidBindingKey(String),

    /// Routing key rejected before reaching the broker
    #[error("invalid routing key `{0}`")]
    InvalidRoutingKey(String),

    /// Error handing a message to the broker
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error encoding a payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error decoding a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// The message handler returned an error or panicked
    #[error("failure to handle message: {0}")]
    HandlerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// The broker closed the connection
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// Error closing the channel or the connection
    #[error("failure to close: {0}")]
    ClosingError(String),
}

/// How an [`AmqpError`] is handled by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bounded initial connection retries ran out. Returned to the caller.
    ConnectionExhausted,
    /// One connection attempt failed. Retried, then wrapped into `ConnectionExhausted`.
    Connection,
    /// Publishing failed. Returned to the caller.
    Transmit,
    /// Queue declaration, binding, prefetch or subscription failed. Returned to the caller.
    ConsumerSetup,
    /// One delivery could not be processed. The delivery is rejected, nothing is returned.
    MessageProcessing,
    /// The broker closed the session. Recovered by reconnecting.
    TransientDisconnect,
    /// Shutdown failed. Logged and swallowed.
    Shutdown,
    /// Invalid configuration.
    Configuration,
}

impl AmqpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AmqpError::ConfigError(_) => ErrorKind::Configuration,
            AmqpError::ConnectionExhaustedError { .. } => ErrorKind::ConnectionExhausted,
            AmqpError::ConnectionError(_)
            | AmqpError::ChannelError(_)
            | AmqpError::DeclareExchangeError(_) => ErrorKind::Connection,
            AmqpError::PublishingError(_)
            | AmqpError::SerializePayloadError(_)
            | AmqpError::InvalidRoutingKey(_) => ErrorKind::Transmit,
            AmqpError::DeclareQueueError(_)
            | AmqpError::BindingExchangeToQueueError(_, _)
            | AmqpError::QoSDeclarationError(_)
            | AmqpError::ConsumerDeclarationError(_)
            | AmqpError::InvalidBindingKey(_) => ErrorKind::ConsumerSetup,
            AmqpError::ParsePayloadError(_)
            | AmqpError::HandlerError(_)
            | AmqpError::AckMessageError(_)
            | AmqpError::NackMessageError(_) => ErrorKind::MessageProcessing,
            AmqpError::Disconnected(_) => ErrorKind::TransientDisconnect,
            AmqpError::ClosingError(_) => ErrorKind::Shutdown,
        }
    }
}

impl From<config::ConfigError> for AmqpError {
    fn from(err: config::ConfigError) -> Self {
        AmqpError::ConfigError(err.to_string())
    }
}
