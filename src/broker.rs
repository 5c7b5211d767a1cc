// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The `Broker` trait is the only surface the topology manager, publisher,
//! retry orchestrator and dispatcher talk to. `AmqpChannel` implements it on
//! top of a lapin connection; tests swap in mocks or an in-memory double.

use crate::{errors::AmqpError, exchange::ExchangeDefinition, queue::QueueBinding, queue::QueueDefinition};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{types::FieldTable, BasicProperties};

/// An inbound unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub data: Vec<u8>,
    /// `None` when the message carried no header table at all
    pub headers: Option<FieldTable>,
    pub exchange: String,
    pub routing_key: String,
    /// Broker handle used for acknowledgement
    pub delivery_tag: u64,
}

impl Delivery {
    pub fn new(data: &[u8], exchange: &str, routing_key: &str, delivery_tag: u64) -> Self {
        Delivery {
            data: data.to_vec(),
            headers: None,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            delivery_tag,
        }
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = Some(headers);
        self
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            headers: delivery.properties.headers().clone(),
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            delivery_tag: delivery.delivery_tag,
            data: delivery.data,
        }
    }
}

/// Deliveries of a single consumer, ending when the consumer is cancelled
/// or the connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Broker operations used by the dispatcher.
///
/// Implementations must be safe to share between consumer tasks: publishing
/// and acknowledging happen concurrently from every binding's task.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Non-mandatory, non-immediate publish.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on `queue` under `consumer_tag`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Number of messages ready for delivery in `queue`.
    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError>;

    /// Drops every ready message in `queue`, returning how many were removed.
    async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError>;

    /// Called by a consumer task once its stream has ended.
    async fn on_consumer_cancelled(&self, consumer_tag: &str);

    async fn close(&self) -> Result<(), AmqpError>;
}
