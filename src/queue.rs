// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declarations
//!
//! Queue definitions cover both the queues handlers consume from and the
//! TTL-based delay queues the dead-letter retry strategy asserts. Delay
//! queues combine a per-queue message TTL with a dead-letter exchange so
//! that expired messages are republished towards the requeue exchange.

use crate::queue::arguments::*;
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Queue argument names understood by the broker.
pub mod arguments {
    pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
    pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
    pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
    pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
}

/// Declaration options for queue assertions.
///
/// These are the binding-queue defaults of the configuration surface;
/// handlers may override them per descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl Default for QueueOptions {
    fn default() -> QueueOptions {
        QueueOptions {
            durable: true,
            auto_delete: false,
            exclusive: false,
        }
    }
}

/// Definition of a queue to be asserted on the broker.
#[derive(Debug, Clone)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) options: Option<QueueOptions>,
    pub(crate) ttl: Option<u32>,
    pub(crate) max_length: Option<u32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a queue definition with the given name.
    pub fn new(name: impl Into<String>) -> QueueDefinition {
        QueueDefinition {
            name: name.into(),
            options: None,
            ttl: None,
            max_length: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    /// Overrides the configured default declaration options.
    pub fn options(mut self, options: QueueOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Sets the per-message TTL in milliseconds.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: u32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Dead-letters expired or rejected messages to the given exchange.
    pub fn dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    /// Overrides the routing key dead-lettered messages are republished with.
    pub fn dead_letter_routing_key(mut self, key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(key.into());
        self
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renders the declaration arguments for the broker.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl as i32)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max as i32)),
            );
        }

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }

        FieldTable::from(args)
    }
}
