// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration Surface
//!
//! All components receive their configuration explicitly at construction;
//! there is no global state. [`Config`] carries the connection URLs and the
//! default option sets for exchanges, publishing, consuming, queue bindings
//! and retries. Every default follows the broker-integration contract:
//! durable topology, persistent JSON messages, prefetch 10 per consumer and
//! 100 per channel, three retry attempts with exponential backoff.

use crate::{errors::AmqpError, exchange::ExchangeOptions, queue::QueueOptions, retry::RetryPolicy};
use lapin::types::{AMQPValue, ShortString};
use std::{collections::BTreeMap, env, time::Duration};

/// Default publish options applied to every outbound message.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// AMQP delivery mode; `2` marks messages persistent.
    pub delivery_mode: u8,
    pub content_type: String,
}

impl Default for PublishOptions {
    fn default() -> PublishOptions {
        PublishOptions {
            delivery_mode: 2,
            content_type: "application/json".to_owned(),
        }
    }
}

/// Per-publish overrides merged over the configured [`PublishOptions`].
#[derive(Debug, Clone, Default)]
pub struct PublishOverrides {
    pub delivery_mode: Option<u8>,
    pub content_type: Option<String>,
    pub priority: Option<u8>,
    /// Message expiration in milliseconds.
    pub expiration_ms: Option<u64>,
    /// Extra headers merged into the published message.
    pub headers: BTreeMap<ShortString, AMQPValue>,
}

/// Consumer-side concurrency limits, enforced by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Limit of unacknowledged messages per consumer.
    pub prefetch_per_consumer: u16,
    /// Limit of unacknowledged messages per channel.
    pub prefetch_per_channel: u16,
}

impl Default for ConsumerOptions {
    fn default() -> ConsumerOptions {
        ConsumerOptions {
            prefetch_per_consumer: 10,
            prefetch_per_channel: 100,
        }
    }
}

/// Top-level configuration threaded into every component.
#[derive(Debug, Clone)]
pub struct Config {
    /// Application name, used for connection naming and the queue prefix
    /// fallback.
    pub app_name: String,
    /// Broker connection URLs, tried in order.
    pub urls: Vec<String>,
    /// Heartbeat negotiated with the broker, in seconds.
    pub heartbeat_secs: u64,
    /// Fixed backoff between reconnection rounds.
    pub reconnect_interval: Duration,
    /// Queue name prefix; the app name (with `-`/`_` as `.`) when unset.
    pub queue_name_prefix: Option<String>,
    pub exchange: ExchangeOptions,
    pub producer: PublishOptions,
    pub consumer: ConsumerOptions,
    pub binding: QueueOptions,
    /// Root retry defaults, merged under handler-level retry options.
    pub retry: RetryPolicy,
}

impl Config {
    /// Creates a configuration with contract defaults for the given
    /// application and connection URLs.
    pub fn new(app_name: impl Into<String>, urls: Vec<String>) -> Config {
        Config {
            app_name: app_name.into(),
            urls,
            heartbeat_secs: 5,
            reconnect_interval: Duration::from_secs(5),
            queue_name_prefix: None,
            exchange: ExchangeOptions::default(),
            producer: PublishOptions::default(),
            consumer: ConsumerOptions::default(),
            binding: QueueOptions::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Bootstraps a configuration from the environment.
    ///
    /// Reads `PUBSUB_APP_NAME`, `PUBSUB_AMQP_URLS` (comma separated) and
    /// optionally `PUBSUB_QUEUE_PREFIX`.
    pub fn from_env() -> Result<Config, AmqpError> {
        let app_name = env::var("PUBSUB_APP_NAME")
            .map_err(|_| AmqpError::SetupError("PUBSUB_APP_NAME is not set".to_owned()))?;

        let urls: Vec<String> = env::var("PUBSUB_AMQP_URLS")
            .map_err(|_| AmqpError::SetupError("PUBSUB_AMQP_URLS is not set".to_owned()))?
            .split(',')
            .map(|url| url.trim().to_owned())
            .filter(|url| !url.is_empty())
            .collect();

        if urls.is_empty() {
            return Err(AmqpError::SetupError(
                "PUBSUB_AMQP_URLS contains no connection url".to_owned(),
            ));
        }

        let mut config = Config::new(app_name, urls);
        config.queue_name_prefix = env::var("PUBSUB_QUEUE_PREFIX").ok();

        Ok(config)
    }

    /// The prefix consumer queue names are derived with.
    pub fn queue_prefix(&self) -> String {
        match &self.queue_name_prefix {
            Some(prefix) => prefix.clone(),
            None => self.app_name.replace(['-', '_'], "."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryStrategyKind;

    #[test]
    fn defaults_follow_the_contract() {
        let config = Config::new("billing-service", vec!["amqp://localhost".to_owned()]);

        assert_eq!(config.producer.delivery_mode, 2);
        assert_eq!(config.producer.content_type, "application/json");
        assert_eq!(config.consumer.prefetch_per_consumer, 10);
        assert_eq!(config.consumer.prefetch_per_channel, 100);
        assert!(config.exchange.durable);
        assert!(config.binding.durable);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.strategy, RetryStrategyKind::DeadLetterTtl);
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
    }

    #[test]
    fn queue_prefix_falls_back_to_the_app_name() {
        let config = Config::new("billing-service_v2", vec![]);

        assert_eq!(config.queue_prefix(), "billing.service.v2");
    }

    #[test]
    fn explicit_queue_prefix_wins() {
        let mut config = Config::new("billing-service", vec![]);
        config.queue_name_prefix = Some("billing".to_owned());

        assert_eq!(config.queue_prefix(), "billing");
    }
}
