// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Retrying Dispatcher
//!
//! `AmqpError` represents every failure the subsystem can surface: broker
//! setup (connection, channel, QoS, declarations), message transport
//! (publish, consume, ack, cancel) and payload encoding. Variants carry the
//! broker's error text so callers can log it without holding on to the
//! client's error type.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Setup variants (`ConnectionError`, `ChannelError`, `QoSDeclarationError`,
/// the `Declare*` and `Binding*` variants) are fatal for the process: the
/// dispatcher cannot run without its retry substrate. The rest are
/// per-message conditions that the consumer loop logs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error delivered by an active consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The message could not be encoded; the type can never be published
    #[error("failure to serialize message `{0}`")]
    SerializeError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error reading the pending message count of a queue
    #[error("failure to inspect queue `{0}`")]
    InspectQueueError(String),

    /// Error purging a queue
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error closing the connection
    #[error("failure to close connection `{0}`")]
    CloseError(String),
}

impl AmqpError {
    /// Whether the error belongs to broker setup and should abort startup.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ChannelError(_)
                | AmqpError::QoSDeclarationError(_)
                | AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
                | AmqpError::BindingConsumerError(_)
        )
    }
}
