// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.

use crate::{
    broker::{Broker, Delivery, DeliveryStream},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::HandlerResult,
    queue::{QueueBinding, QueueDefinition},
    retry::header_str,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::BasicProperties;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

/// Handler result of a failing handler.
pub(crate) fn failing(msg: &str) -> HandlerResult {
    Err(Box::new(AmqpError::ConsumerError(msg.to_owned())))
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

impl Published {
    pub fn header(&self, key: &str) -> Option<String> {
        self.properties
            .headers()
            .as_ref()
            .and_then(|h| header_str(h, key))
            .map(str::to_owned)
    }
}

#[derive(Default)]
struct State {
    queues: Vec<QueueDefinition>,
    exchanges: Vec<ExchangeDefinition>,
    bindings: Vec<QueueBinding>,
    published: Vec<Published>,
    acks: Vec<u64>,
    consumers: HashMap<String, (String, UnboundedSender<Result<Delivery, AmqpError>>)>,
    cancelled: Vec<String>,
    counts: HashMap<String, u32>,
    fail_publish: bool,
    fail_ack: bool,
    closed: bool,
}

/// Records every broker call and feeds deliveries to consumers on demand.
#[derive(Default)]
pub(crate) struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new() -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.state().fail_publish = fail;
    }

    pub fn fail_acks(&self, fail: bool) {
        self.state().fail_ack = fail;
    }

    pub fn set_message_count(&self, queue: &str, count: u32) {
        self.state().counts.insert(queue.to_owned(), count);
    }

    pub fn queues(&self) -> Vec<QueueDefinition> {
        self.state().queues.clone()
    }

    pub fn exchanges(&self) -> Vec<ExchangeDefinition> {
        self.state().exchanges.clone()
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.state().bindings.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.state().acks.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Pushes a delivery to the consumer registered on `queue`.
    pub fn deliver(&self, queue: &str, delivery: Delivery) {
        let state = self.state();
        let (_, sender) = state
            .consumers
            .values()
            .find(|(q, _)| q == queue)
            .expect("no consumer on queue");
        sender.send(Ok(delivery)).expect("consumer stream dropped");
    }

    /// Drops the stream of `consumer_tag` as a broker-initiated cancel would.
    pub fn drop_consumer(&self, consumer_tag: &str) {
        self.state().consumers.remove(consumer_tag);
    }

    /// Waits until `n` deliveries were acked.
    pub async fn wait_for_acks(&self, n: usize) -> Vec<u64> {
        self.wait_until(|s| s.acks.len() >= n).await;
        self.acks()
    }

    /// Waits until `n` consumers reported their stream as finished.
    pub async fn wait_for_cancelled(&self, n: usize) -> Vec<String> {
        self.wait_until(|s| s.cancelled.len() >= n).await;
        self.cancelled()
    }

    async fn wait_until<F>(&self, cond: F)
    where
        F: Fn(&State) -> bool,
    {
        for _ in 0..200 {
            if cond(&self.state()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.state().exchanges.push(def.clone());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.state().queues.push(def.clone());
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.state().bindings.push(binding.clone());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.state();
        if state.fail_publish {
            return Err(AmqpError::PublishingError("channel closed".to_owned()));
        }

        state.published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: payload.to_vec(),
            properties,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let (sender, receiver) = unbounded_channel();
        self.state()
            .consumers
            .insert(consumer_tag.to_owned(), (queue.to_owned(), sender));

        Ok(futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.acks.push(delivery_tag);
        if state.fail_ack {
            return Err(AmqpError::AckMessageError("channel closed".to_owned()));
        }
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        match self.state().consumers.remove(consumer_tag) {
            Some(_) => Ok(()),
            None => Err(AmqpError::CancelConsumerError(consumer_tag.to_owned())),
        }
    }

    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        self.state()
            .counts
            .get(queue)
            .copied()
            .ok_or_else(|| AmqpError::InspectQueueError(queue.to_owned()))
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        Ok(self.state().counts.insert(queue.to_owned(), 0).unwrap_or(0))
    }

    async fn on_consumer_cancelled(&self, consumer_tag: &str) {
        self.state().cancelled.push(consumer_tag.to_owned());
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state().closed = true;
        Ok(())
    }
}
