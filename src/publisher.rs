// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes JSON messages to arbitrary exchanges. Application messages go
//! through `publish`, which encodes the value and injects the current trace
//! context; the retry path uses `publish_raw` to move an already encoded
//! body and its headers verbatim.

use crate::{broker::Broker, errors::AmqpError, otel};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::error;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publishes messages through the shared broker channel.
///
/// Publishing holds no lock of its own: the broker client serializes frame
/// writes, so every consumer task can publish concurrently.
pub struct RabbitMQPublisher {
    broker: Arc<dyn Broker>,
}

impl RabbitMQPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { broker })
    }

    /// Encodes `msg` as JSON and publishes it to `exchange` with `routing_key`.
    ///
    /// Messages are neither mandatory nor immediate: when nothing is bound to
    /// the routing key the broker drops them silently. A serialization failure
    /// is reported as `AmqpError::SerializeError` and means the type can never
    /// be published; broker errors are returned as they come.
    pub async fn publish<T>(&self, exchange: &str, routing_key: &str, msg: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let data = match serde_json::to_vec(msg) {
            Ok(data) => Ok(data),
            Err(err) => {
                error!(error = err.to_string(), "failure to marshal message");
                Err(AmqpError::SerializeError(err.to_string()))
            }
        }?;

        let mut headers = BTreeMap::default();
        otel::inject(&Context::current(), &mut headers);

        self.send(exchange, routing_key, &data, FieldTable::from(headers))
            .await
    }

    /// Publishes an already encoded JSON body with `headers`, untouched.
    pub async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        headers: FieldTable,
    ) -> Result<(), AmqpError> {
        self.send(exchange, routing_key, data, headers).await
    }

    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        headers: FieldTable,
    ) -> Result<(), AmqpError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(headers);

        self.broker
            .publish(exchange, routing_key, data, properties)
            .await
            .inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                )
            })
    }
}
