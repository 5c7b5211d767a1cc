// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! At-least-once RabbitMQ dispatcher with a delay-laddered retry mechanism.
//!
//! Handlers are bound with [`dispatcher::RabbitMQDispatcher::handle_func`];
//! failed deliveries wait in per-tier delay queues and come back through the
//! ready queue consumer registered by
//! [`dispatcher::RabbitMQDispatcher::ensure_retry_consumer`].

mod consumer;
mod otel;
#[cfg(test)]
mod testing;

pub mod broker;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;
