// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Ladder
//!
//! A failed delivery is republished, body and headers, straight into the
//! delay queue of its current tier through the default exchange. When the
//! queue's TTL expires the broker dead-letters it to the retry exchange,
//! the ready queue picks it up and the return hop sends it back to where it
//! was originally published.
//!
//! Three headers travel with the message once it enters the ladder:
//! - `_retryNumber`: attempts already made, string-encoded
//! - `_exchangeName` / `_routingKey`: the original destination

use crate::{broker::Delivery, config::RetryConfig, errors::AmqpError, publisher::RabbitMQPublisher};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const RETRY_NUMBER_HEADER: &str = "_retryNumber";
pub const EXCHANGE_NAME_HEADER: &str = "_exchangeName";
pub const ROUTING_KEY_HEADER: &str = "_routingKey";

/// What happened to a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Published to `queue`; the message now carries `retry_number`.
    Scheduled { queue: String, retry_number: usize },
    /// The ladder is exhausted, the message is dropped.
    Exhausted { retry_number: usize },
}

/// Reads a header as text. The retry headers are written as long strings,
/// but short strings are accepted too.
///
/// # Parameters
/// * `headers` - The header table of a delivery
/// * `key` - The header to read
///
/// # Returns
/// The header value, or `None` when it is absent or not textual
pub fn header_str<'a>(headers: &'a FieldTable, key: &str) -> Option<&'a str> {
    match headers.inner().get(key)? {
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok(),
        AMQPValue::ShortString(v) => Some(v.as_str()),
        _ => None,
    }
}

/// Attempts already made for a message. Missing or unreadable values count as zero.
pub fn retry_number(headers: Option<&FieldTable>) -> usize {
    let Some(headers) = headers else {
        return 0;
    };

    match headers.inner().get(RETRY_NUMBER_HEADER) {
        None => 0,
        Some(AMQPValue::LongString(_)) | Some(AMQPValue::ShortString(_)) => {
            let raw = header_str(headers, RETRY_NUMBER_HEADER).unwrap_or_default();
            raw.trim().parse().unwrap_or_else(|_| {
                warn!(value = raw, "unreadable retry number, assuming no attempts");
                0
            })
        }
        Some(AMQPValue::LongLongInt(v)) => usize::try_from(*v).unwrap_or(0),
        Some(AMQPValue::LongInt(v)) => usize::try_from(*v).unwrap_or(0),
        Some(AMQPValue::ShortInt(v)) => usize::try_from(*v).unwrap_or(0),
        Some(other) => {
            warn!(value = ?other, "unexpected retry number type, assuming no attempts");
            0
        }
    }
}

fn set_header(headers: &mut FieldTable, key: &str, value: &str) {
    headers.insert(
        ShortString::from(key),
        AMQPValue::LongString(LongString::from(value)),
    );
}

/// Moves failed deliveries into the delay queues.
///
/// Holds no per-message state, so every consumer task shares one instance.
pub struct RetryPublisher {
    publisher: Arc<RabbitMQPublisher>,
    cfg: Arc<RetryConfig>,
}

impl RetryPublisher {
    /// # Parameters
    /// * `publisher` - Publisher used to reach the delay queues
    /// * `cfg` - The delay ladder and the delay queue names
    pub fn new(publisher: Arc<RabbitMQPublisher>, cfg: Arc<RetryConfig>) -> Arc<RetryPublisher> {
        Arc::new(RetryPublisher { publisher, cfg })
    }

    /// Schedules the next attempt of a failed delivery.
    ///
    /// A delivery carrying `_retryNumber = n` waits `ladder[n]` seconds and
    /// comes back with `_retryNumber = n + 1`. Once `n` reaches the ladder
    /// length nothing is published and `RetryOutcome::Exhausted` is returned.
    /// The original destination headers are only written when missing, so a
    /// message that already went through the ladder keeps pointing at the
    /// exchange it was first published to.
    ///
    /// # Parameters
    /// * `delivery` - The delivery whose handler failed
    ///
    /// # Returns
    /// * `Result<RetryOutcome, AmqpError>` - Where the message went, or the publish error
    pub async fn publish_retry(&self, delivery: &Delivery) -> Result<RetryOutcome, AmqpError> {
        let retry_number = retry_number(delivery.headers.as_ref());

        let Some(queue) = self.cfg.delay_queue(retry_number) else {
            error!(
                retry_number,
                exchange = %delivery.exchange,
                routing_key = %delivery.routing_key,
                "permanent task failure, retries exhausted"
            );
            return Ok(RetryOutcome::Exhausted { retry_number });
        };

        let mut headers = delivery.headers.clone().unwrap_or_default();

        if !headers.inner().contains_key(EXCHANGE_NAME_HEADER) {
            set_header(&mut headers, EXCHANGE_NAME_HEADER, &delivery.exchange);
        }
        if !headers.inner().contains_key(ROUTING_KEY_HEADER) {
            set_header(&mut headers, ROUTING_KEY_HEADER, &delivery.routing_key);
        }

        let next = retry_number + 1;
        set_header(&mut headers, RETRY_NUMBER_HEADER, &next.to_string());

        self.publisher
            .publish_raw("", &queue, &delivery.data, headers)
            .await?;

        debug!(queue = %queue, retry_number = next, "message scheduled for retry");

        Ok(RetryOutcome::Scheduled {
            queue,
            retry_number: next,
        })
    }
}
