// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publishing
//!
//! `PublishOptions` holds what the caller asked for; `MessageProperties` is
//! the merged result handed to the broker. Defaults mark messages persistent,
//! set the codec's content type and a fresh message id. Any value the caller
//! sets explicitly wins over the default.

use crate::{
    broker::{BrokerChannel, Handoff, HeaderValue},
    errors::AmqpError,
};
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Caller-side publish options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub(crate) persistent: Option<bool>,
    pub(crate) content_type: Option<String>,
    pub(crate) message_id: Option<String>,
    pub(crate) correlation_id: Option<String>,
    pub(crate) reply_to: Option<String>,
    pub(crate) kind: Option<String>,
    pub(crate) priority: Option<u8>,
    pub(crate) expiration: Option<Duration>,
    pub(crate) mandatory: bool,
    pub(crate) headers: BTreeMap<String, HeaderValue>,
}

impl PublishOptions {
    pub fn new() -> PublishOptions {
        PublishOptions::default()
    }

    /// Overrides the delivery mode. Messages are persistent by default.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    /// Sets the AMQP `type` property.
    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Per-message TTL.
    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// Asks the broker to return the message when no queue is bound for its routing key.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    /// Merges these options over the defaults.
    ///
    /// `headers` holds headers the client adds itself (trace context); caller
    /// headers with the same name replace them.
    pub(crate) fn resolve(
        self,
        default_content_type: &str,
        mut headers: BTreeMap<String, HeaderValue>,
    ) -> MessageProperties {
        headers.extend(self.headers);

        MessageProperties {
            persistent: self.persistent.unwrap_or(true),
            content_type: Some(
                self.content_type
                    .unwrap_or_else(|| default_content_type.to_owned()),
            ),
            message_id: Some(
                self.message_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
            correlation_id: self.correlation_id,
            reply_to: self.reply_to,
            kind: self.kind,
            priority: self.priority,
            expiration: self.expiration.map(|ttl| ttl.as_millis().to_string()),
            mandatory: self.mandatory,
            headers,
        }
    }
}

/// Message properties as sent to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub persistent: bool,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub kind: Option<String>,
    pub priority: Option<u8>,
    /// Per-message TTL in milliseconds, as AMQP expects it.
    pub expiration: Option<String>,
    pub mandatory: bool,
    pub headers: BTreeMap<String, HeaderValue>,
}

/// Hands an encoded message to the channel.
///
/// A buffered handoff is reported with a warning and still counts as success.
pub(crate) async fn publish(
    channel: &dyn BrokerChannel,
    exchange: &str,
    routing_key: &str,
    body: &[u8],
    properties: &MessageProperties,
) -> Result<Handoff, AmqpError> {
    match channel
        .transmit(exchange, routing_key, body, properties)
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                routing_key, "error publishing message"
            );
            Err(AmqpError::PublishingError(err.to_string()))
        }
        Ok(Handoff::Buffered) => {
            warn!(
                routing_key,
                "message was buffered locally, check broker capacity or channel drain"
            );
            Ok(Handoff::Buffered)
        }
        Ok(Handoff::Sent) => {
            debug!(routing_key, "message published");
            Ok(Handoff::Sent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, MockBrokerChannel};

    #[test]
    fn defaults_are_persistent_with_codec_content_type() {
        let props = PublishOptions::new().resolve("application/json", BTreeMap::new());
        assert!(props.persistent);
        assert_eq!(props.content_type.as_deref(), Some("application/json"));
        assert!(props.message_id.is_some());
        assert!(!props.mandatory);
    }

    #[test]
    fn caller_values_override_defaults() {
        let props = PublishOptions::new()
            .persistent(false)
            .content_type("text/plain")
            .message_id("msg-1")
            .expiration(Duration::from_secs(30))
            .resolve("application/json", BTreeMap::new());

        assert!(!props.persistent);
        assert_eq!(props.content_type.as_deref(), Some("text/plain"));
        assert_eq!(props.message_id.as_deref(), Some("msg-1"));
        assert_eq!(props.expiration.as_deref(), Some("30000"));
    }

    #[test]
    fn caller_headers_replace_client_headers() {
        let mut traced = BTreeMap::new();
        traced.insert("traceparent".to_owned(), HeaderValue::from("00-abc"));
        traced.insert("tenant".to_owned(), HeaderValue::from("default"));

        let props = PublishOptions::new()
            .header("tenant", "acme")
            .resolve("application/json", traced);

        assert_eq!(props.headers.get("tenant"), Some(&HeaderValue::from("acme")));
        assert_eq!(
            props.headers.get("traceparent"),
            Some(&HeaderValue::from("00-abc"))
        );
    }

    #[tokio::test]
    async fn buffered_handoff_is_not_an_error() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_transmit()
            .withf(|exchange, key, body, _| {
                exchange == "events" && key == "user.created" && body == b"{}"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(Handoff::Buffered));

        let result = publish(
            &channel,
            "events",
            "user.created",
            b"{}",
            &MessageProperties::default(),
        )
        .await;

        assert_eq!(result, Ok(Handoff::Buffered));
    }

    #[tokio::test]
    async fn transmit_failure_is_a_publishing_error() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_transmit()
            .returning(|_, _, _, _| Err(BrokerError::new("channel closed")));

        let result = publish(
            &channel,
            "events",
            "user.created",
            b"{}",
            &MessageProperties::default(),
        )
        .await;

        assert_eq!(
            result,
            Err(AmqpError::PublishingError("channel closed".to_owned()))
        );
    }
}
