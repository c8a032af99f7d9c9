// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivered Messages
//!
//! [`DeliveredEvent`] is what the router hands to the in-process dispatch
//! sink: the decoded JSON payload together with the broker metadata needed
//! for acknowledgement and retry bookkeeping. The `retry-count` header is
//! read as `0` when absent. The `origin-exchange` header, once set, always
//! wins over the raw delivery exchange, so a message funnelled through the
//! retry infrastructure still matches against the exchange it was
//! originally delivered from.

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicNackOptions},
    protocol::basic::AMQPProperties,
    types::AMQPValue,
};
use std::{fmt, sync::Arc};
use tracing::{error, warn};

/// Header carrying the number of retry attempts already performed.
pub const RETRY_COUNT_HEADER: &str = "retry-count";

/// Header preserving the exchange a message was originally delivered from.
pub const ORIGIN_EXCHANGE_HEADER: &str = "origin-exchange";

/// Acknowledgement capability attached to a delivered event.
///
/// Under the manual acknowledgement policy this is wired to the real
/// channel operations; under every automatic policy it is replaced by a
/// no-op that logs misuse.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// Live acknowledgement operations for one delivery.
pub(crate) struct DeliveryAcker {
    acker: Acker,
}

impl DeliveryAcker {
    pub(crate) fn new(acker: Acker) -> DeliveryAcker {
        DeliveryAcker { acker }
    }
}

#[async_trait]
impl Acknowledger for DeliveryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack(BasicAckOptions { multiple: false }).await.map_err(|err| {
            error!(error = err.to_string(), "failure to ack message");
            AmqpError::AckMessageError
        })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to nack message");
                AmqpError::NackMessageError
            })
    }
}

/// Disabled acknowledgement operations, installed whenever an automatic
/// acknowledgement policy owns the delivery.
pub(crate) struct DisabledAcker {
    handler: String,
}

impl DisabledAcker {
    pub(crate) fn new(handler: impl Into<String>) -> DisabledAcker {
        DisabledAcker {
            handler: handler.into(),
        }
    }
}

#[async_trait]
impl Acknowledger for DisabledAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        warn!(
            handler = self.handler,
            "\"ack\" should not be called with automatic acknowledgement enabled"
        );
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), AmqpError> {
        warn!(
            handler = self.handler,
            "\"nack\" should not be called with automatic acknowledgement enabled"
        );
        Ok(())
    }
}

/// A successfully routed inbound message, ready for in-process dispatch.
#[derive(Clone)]
pub struct DeliveredEvent {
    name: String,
    routing_key: String,
    exchange: String,
    payload: serde_json::Value,
    data: Vec<u8>,
    retry_count: u32,
    properties: AMQPProperties,
    ack: Arc<dyn Acknowledger>,
}

impl DeliveredEvent {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: impl Into<String>,
        routing_key: impl Into<String>,
        exchange: impl Into<String>,
        payload: serde_json::Value,
        data: Vec<u8>,
        retry_count: u32,
        properties: AMQPProperties,
    ) -> DeliveredEvent {
        let name = name.into();
        let ack = Arc::new(DisabledAcker::new(name.clone()));

        DeliveredEvent {
            name,
            routing_key: routing_key.into(),
            exchange: exchange.into(),
            payload,
            data,
            retry_count,
            properties,
            ack,
        }
    }

    /// Builds the in-process mirror of an outbound event.
    pub(crate) fn local(
        name: impl Into<String>,
        routing_key: impl Into<String>,
        exchange: impl Into<String>,
        payload: serde_json::Value,
        data: Vec<u8>,
    ) -> DeliveredEvent {
        DeliveredEvent::new(name, routing_key, exchange, payload, data, 0, AMQPProperties::default())
    }

    pub(crate) fn with_acknowledger(mut self, ack: Arc<dyn Acknowledger>) -> Self {
        self.ack = ack;
        self
    }

    /// Logical name of the matched event type.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `type` property the message was published with.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// The exchange the message was originally delivered from.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The decoded JSON payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// The raw message body.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of retry attempts already performed for this message.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub(crate) fn properties(&self) -> &AMQPProperties {
        &self.properties
    }

    /// Positively acknowledges the message.
    ///
    /// Only effective under the manual acknowledgement policy.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.ack.ack().await
    }

    /// Negatively acknowledges the message without requeueing it.
    ///
    /// Only effective under the manual acknowledgement policy.
    pub async fn nack(&self) -> Result<(), AmqpError> {
        self.ack.nack(false).await
    }
}

impl fmt::Debug for DeliveredEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveredEvent")
            .field("name", &self.name)
            .field("routing_key", &self.routing_key)
            .field("exchange", &self.exchange)
            .field("retry_count", &self.retry_count)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Reads the `type` property identifying the message.
pub(crate) fn message_type(properties: &AMQPProperties) -> Option<String> {
    properties.kind().as_ref().map(|kind| kind.to_string())
}

/// Reads the retry counter header, defaulting to zero when absent.
pub(crate) fn header_retry_count(properties: &AMQPProperties) -> u32 {
    let Some(headers) = properties.headers() else {
        return 0;
    };

    headers
        .inner()
        .get(RETRY_COUNT_HEADER)
        .and_then(amqp_value_as_u32)
        .unwrap_or(0)
}

/// Resolves the exchange a message originates from, preferring the
/// `origin-exchange` header over the raw delivery exchange.
pub(crate) fn origin_exchange(properties: &AMQPProperties, delivery_exchange: &str) -> String {
    let from_header = properties.headers().as_ref().and_then(|headers| {
        headers
            .inner()
            .get(ORIGIN_EXCHANGE_HEADER)
            .and_then(|value| value.as_long_string())
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
    });

    from_header.unwrap_or_else(|| delivery_exchange.to_owned())
}

fn amqp_value_as_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{FieldTable, LongInt, LongString, ShortString};
    use std::collections::BTreeMap;

    fn properties_with_headers(headers: BTreeMap<ShortString, AMQPValue>) -> AMQPProperties {
        AMQPProperties::default().with_headers(FieldTable::from(headers))
    }

    #[test]
    fn retry_count_defaults_to_zero() {
        assert_eq!(header_retry_count(&AMQPProperties::default()), 0);
        assert_eq!(
            header_retry_count(&properties_with_headers(BTreeMap::new())),
            0
        );
    }

    #[test]
    fn retry_count_reads_integer_headers() {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(RETRY_COUNT_HEADER),
            AMQPValue::LongInt(LongInt::from(2)),
        );

        assert_eq!(header_retry_count(&properties_with_headers(headers)), 2);
    }

    #[test]
    fn origin_exchange_prefers_the_header() {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(ORIGIN_EXCHANGE_HEADER),
            AMQPValue::LongString(LongString::from("users")),
        );

        let properties = properties_with_headers(headers);

        assert_eq!(
            origin_exchange(&properties, "pubsub.retry.requeue.exchange"),
            "users"
        );
    }

    #[test]
    fn origin_exchange_falls_back_to_the_delivery_exchange() {
        assert_eq!(origin_exchange(&AMQPProperties::default(), "users"), "users");
    }

    #[test]
    fn message_type_reads_the_kind_property() {
        let properties = AMQPProperties::default().with_type(ShortString::from("user.created"));

        assert_eq!(message_type(&properties), Some("user.created".to_owned()));
        assert_eq!(message_type(&AMQPProperties::default()), None);
    }
}
