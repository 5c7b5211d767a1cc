// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Lifecycle
//!
//! `AmqpChannel` owns the process' single broker connection and channel.
//! Both are opened lazily by the first operation that needs them; concurrent
//! first callers share one connection attempt. Right after the channel opens
//! the prefetch limit is applied and an error listener is registered on the
//! connection so that unsolicited closure reaches the configured
//! `CloseHandler`.

use crate::{
    broker::{Broker, Delivery, DeliveryStream},
    config::AmqpConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

/// Reaction to an unsolicited connection closure.
pub type CloseHandler = Arc<dyn Fn(&AmqpError) + Send + Sync>;

/// Builds the close handler selected by configuration: log only, or log and
/// terminate the process when `exit_on_close` is set.
pub fn default_close_handler(exit_on_close: bool) -> CloseHandler {
    Arc::new(move |err: &AmqpError| {
        if exit_on_close {
            error!(error = err.to_string(), "amqp connection closed, exiting");
            std::process::exit(1);
        }

        info!(error = err.to_string(), "amqp received close message");
    })
}

fn notify_closed(on_close: &CloseHandler, reason: &str) {
    on_close(&AmqpError::ConnectionError(reason.to_owned()));
}

/// What the channel does once one of its consumer streams ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelAction {
    /// Log and keep the connection for the remaining consumers
    Ignore,
    CloseConnection,
}

impl CancelAction {
    pub(crate) fn from_config(cfg: &AmqpConfig) -> CancelAction {
        if cfg.close_on_cancel {
            CancelAction::CloseConnection
        } else {
            CancelAction::Ignore
        }
    }
}

struct Link {
    connection: Connection,
    channel: Channel,
}

/// Lazily connected broker backed by lapin.
pub struct AmqpChannel {
    cfg: AmqpConfig,
    on_close: CloseHandler,
    link: OnceCell<Link>,
}

impl AmqpChannel {
    /// Creates an unconnected broker. Nothing touches the network until the
    /// first operation.
    pub fn new(cfg: AmqpConfig) -> Arc<AmqpChannel> {
        let on_close = default_close_handler(cfg.exit_on_close);
        Arc::new(AmqpChannel {
            cfg,
            on_close,
            link: OnceCell::new(),
        })
    }

    /// Creates an unconnected broker with a custom closure policy.
    pub fn with_close_handler(cfg: AmqpConfig, on_close: CloseHandler) -> Arc<AmqpChannel> {
        Arc::new(AmqpChannel {
            cfg,
            on_close,
            link: OnceCell::new(),
        })
    }

    /// Opens the connection and channel if that has not happened yet.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.channel().await.map(|_| ())
    }

    async fn channel(&self) -> Result<&Channel, AmqpError> {
        let link = self.link.get_or_try_init(|| self.open()).await?;
        Ok(&link.channel)
    }

    async fn open(&self) -> Result<Link, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.cfg.connection_name.clone()));

        let connection = match Connection::connect(&self.cfg.url, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let on_close = self.on_close.clone();
        connection.on_error(move |err| notify_closed(&on_close, &err.to_string()));

        debug!("creating amqp channel...");
        let channel = match connection.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;

        // Per-consumer prefetch; some brokers reject the global flag.
        if let Err(err) = channel
            .basic_qos(self.cfg.prefetch_count, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "failure to set qos");
            return Err(AmqpError::QoSDeclarationError(err.to_string()));
        }
        debug!(prefetch = self.cfg.prefetch_count, "channel created");

        Ok(Link {
            connection,
            channel,
        })
    }
}

#[async_trait]
impl Broker for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name());

        match self
            .channel()
            .await?
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                def.options(),
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name().to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name());

        match self
            .channel()
            .await?
            .queue_declare(def.name(), def.options(), def.arguments())
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name().to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name(),
            binding.exchange_name(),
            binding.key()
        );

        match self
            .channel()
            .await?
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel()
            .await?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => Err(AmqpError::PublishingError(err.to_string())),
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel()
            .await?
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
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(Delivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel()
            .await?
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel()
            .await?
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::CancelConsumerError(err.to_string()))
    }

    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        match self
            .channel()
            .await?
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = queue, "failure to inspect queue");
                Err(AmqpError::InspectQueueError(queue.to_owned()))
            }
            Ok(q) => Ok(q.message_count()),
        }
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        self.channel()
            .await?
            .queue_purge(queue, QueuePurgeOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = queue, "failure to purge queue");
                AmqpError::PurgeQueueError(queue.to_owned())
            })
    }

    async fn on_consumer_cancelled(&self, consumer_tag: &str) {
        match CancelAction::from_config(&self.cfg) {
            CancelAction::Ignore => {
                info!(ctag = consumer_tag, "consumer cancelled, keeping amqp connection");
            }
            CancelAction::CloseConnection => {
                warn!(ctag = consumer_tag, "consumer cancelled, closing amqp connection");
                if let Err(err) = self.close().await {
                    error!(error = err.to_string(), "failure to close amqp connection");
                }
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let Some(link) = self.link.get() else {
            return Ok(());
        };

        link.connection
            .close(200, "OK")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}
