// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codecs
//!
//! A codec turns payloads into message bodies and back. The client is generic
//! over the codec; JSON is the default.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

pub trait Codec: Send + Sync + 'static {
    /// Value written to the `content_type` property of published messages.
    fn content_type(&self) -> &str;

    fn encode<T>(&self, payload: &T) -> Result<Vec<u8>, AmqpError>
    where
        T: Serialize + ?Sized;

    fn decode<T>(&self, body: &[u8]) -> Result<T, AmqpError>
    where
        T: DeserializeOwned;
}

/// JSON text encoding backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn encode<T>(&self, payload: &T) -> Result<Vec<u8>, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_vec(payload).map_err(|e| AmqpError::SerializePayloadError(e.to_string()))
    }

    fn decode<T>(&self, body: &[u8]) -> Result<T, AmqpError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(body).map_err(|e| AmqpError::ParsePayloadError(e.to_string()))
    }
}
