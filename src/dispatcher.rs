// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Binds handlers to exchange/routing key/queue triples and runs one tokio
//! task per binding. Each task drains its own consumer stream sequentially;
//! failures go through the shared `RetryPublisher` on the same task that
//! received the delivery.
//!
//! `ensure_retry_consumer` registers the return hop of the ladder: a
//! consumer on the ready queue that republishes expired retries to the
//! exchange and routing key they were originally published to.

use crate::{
    broker::Broker,
    config::{AmqpConfig, RetryConfig},
    consumer::Binding,
    errors::AmqpError,
    message::{HandlerError, HandlerResult, MessageDecoder, RawDecoder, RawPayload},
    publisher::RabbitMQPublisher,
    retry::{self, RetryPublisher, EXCHANGE_NAME_HEADER, ROUTING_KEY_HEADER},
    topology::AmqpTopology,
};
use futures_util::StreamExt;
use lapin::types::FieldTable;
use opentelemetry::global;
use serde::Serialize;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, Instrument};

/// Identifies a registered binding, used to cancel it.
pub type ConsumerTag = String;

/// Shared by every dispatcher of the process: two dispatchers on one
/// channel must never register the same tag.
static CONSUMER_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_consumer_tag() -> ConsumerTag {
    format!("ctag-{}", CONSUMER_SEQ.fetch_add(1, Ordering::SeqCst) + 1)
}

/// Entry point of the subsystem: declarations, publishing and handler registration.
pub struct RabbitMQDispatcher {
    broker: Arc<dyn Broker>,
    cfg: Arc<RetryConfig>,
    topology: Arc<AmqpTopology>,
    publisher: Arc<RabbitMQPublisher>,
    retry: Arc<RetryPublisher>,
    retry_consumer: OnceCell<ConsumerTag>,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher over an existing broker.
    ///
    /// Nothing is declared until the first operation that needs the retry
    /// topology. Several dispatchers may share one broker.
    ///
    /// # Parameters
    /// * `broker` - The broker every declaration, publish and consumer goes through
    /// * `cfg` - Names of the retry objects and the delay ladder
    ///
    /// # Returns
    /// A shareable dispatcher instance
    pub fn new(broker: Arc<dyn Broker>, cfg: Arc<RetryConfig>) -> Arc<RabbitMQDispatcher> {
        let publisher = RabbitMQPublisher::new(broker.clone());

        Arc::new(RabbitMQDispatcher {
            topology: AmqpTopology::new(broker.clone(), cfg.clone()),
            retry: RetryPublisher::new(publisher.clone(), cfg.clone()),
            publisher,
            broker,
            cfg,
            retry_consumer: OnceCell::new(),
        })
    }

    /// Builds a dispatcher over a lazily connected lapin channel.
    pub fn from_config(cfg: AmqpConfig) -> Arc<RabbitMQDispatcher> {
        let retry = cfg.retry.clone();
        Self::new(crate::channel::AmqpChannel::new(cfg), retry)
    }

    /// Topology manager used for every declaration of this dispatcher.
    pub fn topology(&self) -> &Arc<AmqpTopology> {
        &self.topology
    }

    /// Publisher shared with the retry orchestrator.
    pub fn publisher(&self) -> &Arc<RabbitMQPublisher> {
        &self.publisher
    }

    /// Declares the retry topology once. See [`AmqpTopology::ensure_topology`].
    pub async fn ensure_topology(&self) -> Result<(), AmqpError> {
        self.topology.ensure_topology().await
    }

    /// Declares `name` as a durable topic exchange.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - A setup error when the topology or the exchange could not be declared
    pub async fn ensure_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.topology.ensure_exchange(name).await
    }

    /// Declares `name` as a durable queue.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - A setup error when the topology or the queue could not be declared
    pub async fn ensure_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.topology.ensure_queue(name).await
    }

    /// Sum of the messages waiting in `queues`.
    ///
    /// # Parameters
    /// * `queues` - Names of the queues to inspect
    ///
    /// # Returns
    /// * `Result<u64, AmqpError>` - The total, or the first inspection error
    pub async fn queue_total_messages(&self, queues: &[&str]) -> Result<u64, AmqpError> {
        self.topology.queue_total_messages(queues).await
    }

    /// Drops every ready message of `queue`, returning how many were removed.
    pub async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        self.topology.purge_queue(queue).await
    }

    /// Publishes `msg` as JSON, declaring the retry topology first.
    ///
    /// # Parameters
    /// * `exchange` - The exchange to publish to
    /// * `routing_key` - The routing key of the message
    /// * `msg` - Any serializable value
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - `SerializeError` when `msg` cannot be encoded,
    ///   `PublishingError` when the broker refuses it
    pub async fn publish<T>(&self, exchange: &str, routing_key: &str, msg: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.topology.ensure_topology().await?;
        self.publisher.publish(exchange, routing_key, msg).await
    }

    /// Runs `handler` for every message published to `exchange` with `routing_key`.
    ///
    /// Declares the retry topology, the exchange (durable topic) and the
    /// queue (durable), binds them and starts consuming with manual acks.
    /// Each delivery is decoded into a fresh message by `decoder` and handed
    /// to `handler` along with its headers. Handler failures are retried
    /// through the delay ladder; every delivery is acked exactly once.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume from
    /// * `exchange` - The exchange the queue is bound to
    /// * `routing_key` - The binding key
    /// * `decoder` - Builds a fresh message from each payload
    /// * `handler` - Business logic; an `Err` sends the delivery to the retry ladder
    ///
    /// # Returns
    /// * `Result<ConsumerTag, AmqpError>` - The tag identifying the binding, or a setup error
    pub async fn handle_func<D, F, Fut>(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        decoder: D,
        handler: F,
    ) -> Result<ConsumerTag, AmqpError>
    where
        D: MessageDecoder,
        F: Fn(D::Message, FieldTable) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.topology.ensure_topology().await?;
        self.topology.ensure_exchange(exchange).await?;
        self.topology.ensure_queue(queue).await?;
        self.topology.bind_queue(queue, exchange, routing_key).await?;

        let consumer_tag = next_consumer_tag();
        let mut deliveries = self.broker.consume(queue, &consumer_tag).await?;

        let binding = Binding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            consumer_tag: consumer_tag.clone(),
            decoder,
            handler,
            // Failures on the ready queue would loop back into the ladder forever.
            retry_eligible: queue != self.cfg.ready_queue,
        };

        let broker = self.broker.clone();
        let retry = self.retry.clone();
        let span = tracing::info_span!(
            "amqp consumer",
            ctag = consumer_tag,
            queue,
            exchange,
            routing_key
        );

        tokio::spawn(
            async move {
                let tracer = global::tracer("amqp consumer");

                while let Some(result) = deliveries.next().await {
                    match result {
                        Ok(delivery) => {
                            binding
                                .consume(&tracer, delivery, broker.as_ref(), &retry)
                                .await;
                        }
                        Err(err) => error!(error = err.to_string(), "errors consume msg"),
                    }
                }

                info!("amqp consumer was cancelled");
                broker.on_consumer_cancelled(&binding.consumer_tag).await;
            }
            .instrument(span),
        );

        debug!(ctag = consumer_tag, queue, "handler waiting for messages");
        Ok(consumer_tag)
    }

    /// Registers the return hop of the retry ladder, once per dispatcher.
    ///
    /// Messages expiring from a delay queue reach the ready queue and are
    /// republished, body and headers untouched, to `_exchangeName` with
    /// `_routingKey`. A message whose `_retryNumber` already reached the
    /// ladder length is logged as a permanent failure and dropped.
    ///
    /// # Returns
    /// * `Result<ConsumerTag, AmqpError>` - The tag of the ready-queue binding; later calls return the same tag
    pub async fn ensure_retry_consumer(&self) -> Result<ConsumerTag, AmqpError> {
        self.retry_consumer
            .get_or_try_init(|| async {
                let publisher = self.publisher.clone();
                let cfg = self.cfg.clone();

                self.handle_func(
                    &self.cfg.ready_queue,
                    &self.cfg.exchange,
                    &self.cfg.routing_key,
                    RawDecoder,
                    move |payload: RawPayload, headers: FieldTable| {
                        let publisher = publisher.clone();
                        let cfg = cfg.clone();
                        async move { return_hop(&publisher, &cfg, payload, headers).await }
                    },
                )
                .await
            })
            .await
            .cloned()
    }

    /// Stops the binding registered under `consumer_tag`. Its task then runs
    /// the broker's on-cancel policy.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.broker.cancel(consumer_tag).await
    }

    /// Closes the broker connection; every binding's stream ends with it.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.broker.close().await
    }
}

async fn return_hop(
    publisher: &RabbitMQPublisher,
    cfg: &RetryConfig,
    payload: RawPayload,
    headers: FieldTable,
) -> HandlerResult {
    let retry_number = retry::retry_number(Some(&headers));
    if retry_number >= cfg.max_retries() {
        error!(retry_number, "permanent task failure");
        return Ok(());
    }

    let (Some(exchange), Some(routing_key)) = (
        retry::header_str(&headers, EXCHANGE_NAME_HEADER),
        retry::header_str(&headers, ROUTING_KEY_HEADER),
    ) else {
        return Err(HandlerError::from(
            "retried message lost its original exchange or routing key",
        ));
    };

    let (exchange, routing_key) = (exchange.to_owned(), routing_key.to_owned());

    debug!(exchange, routing_key, retry_number, "returning retried message");
    publisher
        .publish_raw(&exchange, &routing_key, payload.as_bytes(), headers)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::Delivery,
        message::JsonDecoder,
        retry::RETRY_NUMBER_HEADER,
        testing::{failing, init_tracing, MemoryBroker},
    };
    use lapin::types::{AMQPValue, LongString};
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Deserialize, PartialEq, Clone)]
    struct Msg {
        i: Option<i32>,
        s: Option<String>,
    }

    fn dispatcher(broker: &Arc<MemoryBroker>) -> Arc<RabbitMQDispatcher> {
        init_tracing();
        RabbitMQDispatcher::new(broker.clone(), Arc::new(RetryConfig::default()))
    }

    fn retry_headers(n: &str, exchange: &str, key: &str) -> FieldTable {
        let mut headers = FieldTable::default();
        for (k, v) in [
            (RETRY_NUMBER_HEADER, n),
            (EXCHANGE_NAME_HEADER, exchange),
            (ROUTING_KEY_HEADER, key),
        ] {
            headers.insert(k.into(), AMQPValue::LongString(LongString::from(v)));
        }
        headers
    }

    #[tokio::test]
    async fn test_handle_func_declares_binds_and_consumes() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker);
        let seen = Arc::new(Mutex::new(vec![]));

        let ctag = dispatcher
            .handle_func("test.mctest", "test", "test.mctest", JsonDecoder::<Msg>::new(), {
                let seen = seen.clone();
                move |msg: Msg, _| {
                    seen.lock().unwrap().push(msg);
                    async { Ok(()) }
                }
            })
            .await
            .unwrap();

        assert!(ctag.starts_with("ctag-"));
        assert!(broker
            .bindings()
            .contains(&crate::queue::QueueBinding::new("test.mctest").exchange("test").routing_key("test.mctest")));

        broker.deliver("test.mctest", Delivery::new(br#"{"i":1,"s":"a"}"#, "test", "test.mctest", 1));
        broker.deliver("test.mctest", Delivery::new(br#"{"i":2}"#, "test", "test.mctest", 2));

        assert_eq!(broker.wait_for_acks(2).await, vec![1, 2]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Msg { i: Some(1), s: Some("a".into()) },
                // No leftovers from the previous delivery.
                Msg { i: Some(2), s: None },
            ]
        );
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_failing_handler_moves_message_to_first_tier() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker);

        dispatcher
            .handle_func("test.mctest", "test", "test.mctest", JsonDecoder::<Msg>::new(), |_, _| async {
                failing("not good")
            })
            .await
            .unwrap();

        broker.deliver("test.mctest", Delivery::new(b"{}", "test", "test.mctest", 1));
        broker.wait_for_acks(1).await;

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "");
        assert_eq!(published[0].routing_key, "amqp.retry.waiting-0001");
        assert_eq!(published[0].header(RETRY_NUMBER_HEADER).as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_retry_number_five_goes_to_tier_five() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker);

        dispatcher
            .handle_func("test.mctest", "test", "test.mctest", JsonDecoder::<Msg>::new(), |_, _| async {
                failing("not good")
            })
            .await
            .unwrap();

        let mut headers = FieldTable::default();
        headers.insert(RETRY_NUMBER_HEADER.into(), AMQPValue::LongString("5".into()));
        broker.deliver(
            "test.mctest",
            Delivery::new(b"{}", "test", "test.mctest", 1).with_headers(headers),
        );
        broker.wait_for_acks(1).await;

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "amqp.retry.waiting-0300");
        assert_eq!(published[0].header(RETRY_NUMBER_HEADER).as_deref(), Some("6"));
    }

    #[tokio::test]
    async fn test_undecodable_message_is_acked_without_retry() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker);

        dispatcher
            .handle_func("test.mctest", "test", "test.mctest", JsonDecoder::<Msg>::new(), |_, _| async {
                failing("not good")
            })
            .await
            .unwrap();

        broker.deliver("test.mctest", Delivery::new(b"not JSON", "test", "test.mctest", 1));

        assert_eq!(broker.wait_for_acks(1).await, vec![1]);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_return_hop_republishes_to_original_destination() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker);

        let ctag = dispatcher.ensure_retry_consumer().await.unwrap();
        assert_eq!(dispatcher.ensure_retry_consumer().await.unwrap(), ctag);

        let body = br#"{ "i": 3 }"#;
        broker.deliver(
            "amqp.retry.ready",
            Delivery::new(body, "amqp.retry", "retry", 1)
                .with_headers(retry_headers("2", "test", "test.mctest")),
        );
        broker.wait_for_acks(1).await;

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "test");
        assert_eq!(published[0].routing_key, "test.mctest");
        assert_eq!(published[0].data, body.to_vec());
        assert_eq!(published[0].header(RETRY_NUMBER_HEADER).as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_return_hop_drops_exhausted_messages() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker);
        dispatcher.ensure_retry_consumer().await.unwrap();

        broker.deliver(
            "amqp.retry.ready",
            Delivery::new(b"{}", "amqp.retry", "retry", 1)
                .with_headers(retry_headers("7", "test", "test.mctest")),
        );

        assert_eq!(broker.wait_for_acks(1).await, vec![1]);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_return_hop_failure_does_not_feed_the_ladder() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker);
        dispatcher.ensure_retry_consumer().await.unwrap();

        // No destination headers: the hop fails, the ready queue must not retry.
        broker.deliver("amqp.retry.ready", Delivery::new(b"{}", "amqp.retry", "retry", 1));

        assert_eq!(broker.wait_for_acks(1).await, vec![1]);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_runs_on_cancel_policy() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker);

        let first = dispatcher
            .handle_func("a", "test", "a", JsonDecoder::<Msg>::new(), |_, _| async { Ok(()) })
            .await
            .unwrap();
        let second = dispatcher
            .handle_func("b", "test", "b", JsonDecoder::<Msg>::new(), |_, _| async { Ok(()) })
            .await
            .unwrap();
        assert_ne!(first, second);

        dispatcher.cancel(&first).await.unwrap();
        assert_eq!(broker.wait_for_cancelled(1).await, vec![first]);

        // The other binding keeps consuming.
        broker.deliver("b", Delivery::new(b"{}", "test", "b", 7));
        assert_eq!(broker.wait_for_acks(1).await, vec![7]);

        broker.drop_consumer(&second);
        assert_eq!(broker.wait_for_cancelled(2).await.len(), 2);
    }

    #[tokio::test]
    async fn test_dispatchers_sharing_a_broker_get_distinct_tags() {
        let broker = MemoryBroker::new();
        let first = dispatcher(&broker);
        let second = dispatcher(&broker);

        let t1 = first
            .handle_func("a", "test", "a", JsonDecoder::<Msg>::new(), |_, _| async { Ok(()) })
            .await
            .unwrap();
        let t2 = second
            .handle_func("b", "test", "b", JsonDecoder::<Msg>::new(), |_, _| async { Ok(()) })
            .await
            .unwrap();
        assert_ne!(t1, t2);

        // Both bindings are still live.
        broker.deliver("a", Delivery::new(b"{}", "test", "a", 1));
        broker.deliver("b", Delivery::new(b"{}", "test", "b", 2));
        let mut acks = broker.wait_for_acks(2).await;
        acks.sort();
        assert_eq!(acks, vec![1, 2]);
        assert!(broker.cancelled().is_empty());
    }

    #[tokio::test]
    async fn test_close_closes_broker() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker);

        dispatcher.close().await.unwrap();

        assert!(broker.is_closed());
    }

    #[tokio::test]
    async fn test_publish_encodes_message() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker);

        dispatcher
            .publish("test", "test.mctest", &serde_json::json!({"i": 1}))
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "test");
        assert_eq!(published[0].data, br#"{"i":1}"#.to_vec());
        // Topology was declared on first use.
        assert_eq!(broker.queues().len(), 8);
    }
}
