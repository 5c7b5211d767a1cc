// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Topology
//!
//! Declares the broker objects the retry ladder runs on:
//! - the ready queue, where expired retries land
//! - the retry exchange (topic) and the ready queue's binding to it
//! - one delay queue per ladder tier, dead-lettering into the retry exchange
//!   once its message TTL expires
//!
//! The declarations run once per `AmqpTopology`. Every other declaration
//! helper ensures them first, so collaborators never see a half-built
//! ladder.

use crate::{
    broker::Broker,
    config::RetryConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error};

/// Declares the retry ladder and the exchanges/queues handlers bind to.
pub struct AmqpTopology {
    broker: Arc<dyn Broker>,
    cfg: Arc<RetryConfig>,
    installed: OnceCell<()>,
}

impl AmqpTopology {
    /// Creates a topology manager. Nothing is declared until `ensure_topology`.
    ///
    /// # Parameters
    /// * `broker` - The broker the declarations are sent to
    /// * `cfg` - Names of the retry objects and the delay ladder
    ///
    /// # Returns
    /// A shareable topology manager
    pub fn new(broker: Arc<dyn Broker>, cfg: Arc<RetryConfig>) -> Arc<AmqpTopology> {
        Arc::new(AmqpTopology {
            broker,
            cfg,
            installed: OnceCell::new(),
        })
    }

    /// Names and ladder this topology declares.
    pub fn retry_config(&self) -> &Arc<RetryConfig> {
        &self.cfg
    }

    /// Declares the retry ladder, once.
    ///
    /// The first caller runs the declarations while concurrent callers wait
    /// for it; later calls return immediately.
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - A setup error when any declaration failed;
    ///   the process has no retry substrate and should not start consuming
    pub async fn ensure_topology(&self) -> Result<(), AmqpError> {
        self.installed
            .get_or_try_init(|| self.install())
            .await
            .map(|_| ())
    }

    async fn install(&self) -> Result<(), AmqpError> {
        debug!("installing retry topology...");

        self.broker
            .declare_queue(&QueueDefinition::new(&self.cfg.ready_queue).durable())
            .await?;

        self.broker
            .declare_exchange(&ExchangeDefinition::new(&self.cfg.exchange).topic().durable())
            .await?;

        self.broker
            .bind_queue(
                &QueueBinding::new(&self.cfg.ready_queue)
                    .exchange(&self.cfg.exchange)
                    .routing_key(&self.cfg.routing_key),
            )
            .await?;

        for ttl in self.cfg.ladder() {
            let ttl_ms = i32::try_from(u64::from(*ttl) * 1000).map_err(|_| {
                error!(ttl, "retry delay does not fit a queue ttl");
                AmqpError::DeclareQueueError(self.cfg.delay_queue_name(*ttl))
            })?;

            self.broker
                .declare_queue(
                    &QueueDefinition::new(&self.cfg.delay_queue_name(*ttl))
                        .durable()
                        .ttl(ttl_ms)
                        .dead_letter(&self.cfg.exchange, &self.cfg.routing_key),
                )
                .await?;
        }

        debug!("retry topology installed");
        Ok(())
    }

    /// Declares a durable topic exchange.
    pub async fn ensure_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.ensure_topology().await?;
        self.broker
            .declare_exchange(&ExchangeDefinition::new(name).topic().durable())
            .await
    }

    /// Declares a durable queue.
    pub async fn ensure_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.ensure_topology().await?;
        self.broker
            .declare_queue(&QueueDefinition::new(name).durable())
            .await
    }

    /// Binds `queue` to `exchange` with `routing_key`.
    ///
    /// # Parameters
    /// * `queue` - The queue to bind
    /// * `exchange` - The source exchange
    /// * `routing_key` - The binding key
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - `BindingExchangeToQueueError` when the broker refuses the binding
    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        self.ensure_topology().await?;
        self.broker
            .bind_queue(
                &QueueBinding::new(queue)
                    .exchange(exchange)
                    .routing_key(routing_key),
            )
            .await
    }

    /// Sum of the messages waiting in `queues`. Meant for monitoring.
    pub async fn queue_total_messages(&self, queues: &[&str]) -> Result<u64, AmqpError> {
        self.ensure_topology().await?;

        let mut total = 0;
        for queue in queues {
            total += u64::from(self.broker.message_count(queue).await?);
        }
        Ok(total)
    }

    /// Drops every ready message of `queue`.
    pub async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        self.ensure_topology().await?;
        self.broker.purge_queue(queue).await
    }
}
