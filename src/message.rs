// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Decoding
//!
//! A binding does not know its message type ahead of time; the caller hands
//! in a `MessageDecoder` that turns each payload into a brand-new value of
//! the expected type. Nothing decoded from one delivery is ever reused for
//! the next, so fields absent from a payload always come out at their
//! defaults.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, de::IgnoredAny};
use std::{fmt, marker::PhantomData};

/// Failure reported by a message handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a message handler; any `Err` sends the delivery to the retry ladder.
pub type HandlerResult = Result<(), HandlerError>;

/// Produces a fresh message value from every delivered payload.
pub trait MessageDecoder: Send + Sync + 'static {
    type Message: Send + 'static;

    fn decode(&self, payload: &[u8]) -> Result<Self::Message, AmqpError>;
}

/// Decodes JSON payloads into `M`.
pub struct JsonDecoder<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> JsonDecoder<M> {
    pub fn new() -> Self {
        JsonDecoder {
            _marker: PhantomData,
        }
    }
}

impl<M> Default for JsonDecoder<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for JsonDecoder<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonDecoder")
    }
}

impl<M> MessageDecoder for JsonDecoder<M>
where
    M: DeserializeOwned + Send + 'static,
{
    type Message = M;

    fn decode(&self, payload: &[u8]) -> Result<M, AmqpError> {
        serde_json::from_slice(payload).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}

/// A JSON document kept as the exact bytes it arrived with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload(pub Vec<u8>);

impl RawPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Checks that the payload is well-formed JSON and keeps its bytes untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawDecoder;

impl MessageDecoder for RawDecoder {
    type Message = RawPayload;

    fn decode(&self, payload: &[u8]) -> Result<RawPayload, AmqpError> {
        serde_json::from_slice::<IgnoredAny>(payload)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;
        Ok(RawPayload(payload.to_vec()))
    }
}
