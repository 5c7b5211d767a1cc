// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Handles a single delivery of a handler binding:
//! 1. Decodes the payload into a fresh message
//! 2. Runs the handler with the message and the delivery headers
//! 3. Sends failures to the retry ladder when the binding allows it
//! 4. Acknowledges the delivery, whatever happened before
//!
//! Malformed payloads are acked and dropped, they would fail on every
//! retry. Errors of the retry publish and of the ack are only logged: the
//! handler already ran, and the loop must keep going.

use crate::{
    broker::{Broker, Delivery},
    message::{HandlerResult, MessageDecoder},
    otel,
    retry::{RetryOutcome, RetryPublisher},
};
use lapin::types::FieldTable;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, future::Future};
use tracing::{debug, error, warn};

/// A handler bound to a queue, consuming under `consumer_tag`.
pub(crate) struct Binding<D, F> {
    pub(crate) queue: String,
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) consumer_tag: String,
    pub(crate) decoder: D,
    pub(crate) handler: F,
    /// False for the ready-queue binding, whose failures must not feed the ladder again
    pub(crate) retry_eligible: bool,
}

/// How a delivery left the binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Processed {
    Handled,
    Undecodable,
    /// Handler failed; `None` when no retry was attempted or its publish failed.
    Failed(Option<RetryOutcome>),
}

impl<D, F, Fut> Binding<D, F>
where
    D: MessageDecoder,
    F: Fn(D::Message, FieldTable) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Processes one delivery and acks it exactly once.
    pub(crate) async fn consume(
        &self,
        tracer: &BoxedTracer,
        delivery: Delivery,
        broker: &dyn Broker,
        retry: &RetryPublisher,
    ) -> Processed {
        let (_ctx, mut span) = otel::new_span(delivery.headers.as_ref(), tracer, &self.queue);

        debug!(
            ctag = self.consumer_tag,
            queue = self.queue,
            exchange = %delivery.exchange,
            "message received"
        );

        let processed = match self.decoder.decode(&delivery.data) {
            Err(err) => {
                error!(
                    ctag = self.consumer_tag,
                    queue = self.queue,
                    error = err.to_string(),
                    body = %String::from_utf8_lossy(&delivery.data),
                    "could not decode amqp message"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("undecodable message"),
                });
                Processed::Undecodable
            }
            Ok(msg) => {
                let headers = delivery.headers.clone().unwrap_or_default();
                match (self.handler)(msg, headers).await {
                    Ok(()) => {
                        debug!(ctag = self.consumer_tag, "message successfully processed");
                        span.set_status(Status::Ok);
                        Processed::Handled
                    }
                    Err(err) => {
                        error!(
                            ctag = self.consumer_tag,
                            queue = self.queue,
                            exchange = self.exchange,
                            routing_key = self.routing_key,
                            error = err.to_string(),
                            "error while processing message"
                        );
                        span.set_status(Status::Error {
                            description: Cow::from(err.to_string()),
                        });
                        Processed::Failed(self.retry(&delivery, retry).await)
                    }
                }
            }
        };

        if let Err(err) = broker.ack(delivery.delivery_tag).await {
            error!(
                ctag = self.consumer_tag,
                error = err.to_string(),
                "could not ack message"
            );
            span.record_error(&err);
        }

        span.end();
        processed
    }

    async fn retry(&self, delivery: &Delivery, retry: &RetryPublisher) -> Option<RetryOutcome> {
        if !self.retry_eligible {
            return None;
        }

        match retry.publish_retry(delivery).await {
            Ok(outcome) => {
                if let RetryOutcome::Scheduled { queue, retry_number } = &outcome {
                    warn!(
                        ctag = self.consumer_tag,
                        queue = %queue,
                        retry_number,
                        "message sent to retry queue"
                    );
                }
                Some(outcome)
            }
            Err(err) => {
                error!(
                    ctag = self.consumer_tag,
                    error = err.to_string(),
                    "error while trying to publish to retry queue"
                );
                None
            }
        }
    }
}
