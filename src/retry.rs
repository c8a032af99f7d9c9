// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Engine
//!
//! Two interchangeable strategies republish failed messages with an
//! incremented `retry-count` header and a computed backoff delay.
//!
//! The dead-letter/TTL strategy needs no broker plugin: one delay queue per
//! distinct delay value carries a message TTL and dead-letters into a shared
//! requeue exchange, which routes expired messages back onto the handler
//! queue that failed. The delayed-message-exchange strategy instead relies
//! on the broker's `x-delayed-message` plugin and a per-message `x-delay`
//! header.
//!
//! Enqueuing a retry returns as soon as the republish is confirmed; the
//! redelivery happens out-of-band once the delay elapses.

use crate::{
    channel::AmqpOps,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{DeliveredEvent, ORIGIN_EXCHANGE_HEADER, RETRY_COUNT_HEADER},
    queue::QueueDefinition,
    topology::Topology,
};
use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};
use tracing::info;

/// Ceiling on configured retry attempts; larger values fail registration.
pub const MAX_RETRY_ATTEMPTS: u32 = 100;

pub(crate) const DELAY_QUEUE_NAME_PREFIX: &str = "pubsub.retry.delay.queue";
pub(crate) const RETRY_DELAY_EXCHANGE_NAME: &str = "pubsub.retry.delay.exchange";
pub(crate) const RETRY_REQUEUE_EXCHANGE_NAME: &str = "pubsub.retry.requeue.exchange";
pub(crate) const RETRY_DELAYED_MESSAGE_EXCHANGE_NAME: &str =
    "pubsub.retry.delayed_message.exchange";
pub(crate) const DELAY_HEADER: &str = "x-delay";

/// Selects the broker mechanism used to defer retried messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryStrategyKind {
    /// Per-delay TTL queues dead-lettering into a shared requeue exchange.
    #[default]
    DeadLetterTtl,
    /// The `x-delayed-message` broker plugin.
    DelayedMessageExchange,
}

/// Delay schedule for retry attempts.
#[derive(Clone, Default)]
pub enum RetryDelay {
    /// The same delay before every attempt.
    Fixed(Duration),
    /// `floor(1000 * e^(attempt - 1))` milliseconds.
    #[default]
    Exponential,
    /// A caller-supplied schedule, given the attempt number (starting at 1).
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl RetryDelay {
    /// The delay before the given attempt.
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        match self {
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Exponential => {
                let ms = (1000.0 * f64::exp(f64::from(attempt.saturating_sub(1)))).floor();
                Duration::from_millis(ms as u64)
            }
            RetryDelay::Custom(schedule) => schedule(attempt),
        }
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            RetryDelay::Exponential => write!(f, "Exponential"),
            RetryDelay::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Handler-level retry options, merged over the configured root defaults.
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    pub max_attempts: Option<u32>,
    pub delay: Option<RetryDelay>,
    pub strategy: Option<RetryStrategyKind>,
}

/// A fully resolved retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: RetryDelay,
    pub strategy: RetryStrategyKind,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: RetryDelay::Exponential,
            strategy: RetryStrategyKind::DeadLetterTtl,
        }
    }
}

impl RetryPolicy {
    /// Merges handler-level options over the root policy.
    pub(crate) fn resolve(root: &RetryPolicy, options: Option<&RetryOptions>) -> RetryPolicy {
        let Some(options) = options else {
            return root.clone();
        };

        RetryPolicy {
            max_attempts: options.max_attempts.unwrap_or(root.max_attempts),
            delay: options.delay.clone().unwrap_or_else(|| root.delay.clone()),
            strategy: options.strategy.unwrap_or(root.strategy),
        }
    }

    /// Rejects configurations above the attempt ceiling.
    pub(crate) fn validate(&self, handler: &str) -> Result<(), AmqpError> {
        if self.max_attempts > MAX_RETRY_ATTEMPTS {
            return Err(AmqpError::SetupError(format!(
                "handler `{handler}` configures {} retry attempts, above the ceiling of {}",
                self.max_attempts, MAX_RETRY_ATTEMPTS
            )));
        }

        Ok(())
    }

    /// The delay before the given attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay.for_attempt(attempt)
    }

    /// The distinct delay values, in milliseconds, across all attempts.
    pub(crate) fn delays_ms(&self) -> Vec<u64> {
        let mut delays = Vec::new();

        for attempt in 1..=self.max_attempts {
            let ms = self.delay_for(attempt).as_millis() as u64;
            if !delays.contains(&ms) {
                delays.push(ms);
            }
        }

        delays
    }
}

/// A retry mechanism: builds its delay infrastructure at registration time
/// and republishes failed messages with backoff.
#[async_trait]
pub(crate) trait RetryStrategy: Send + Sync {
    /// Asserts the delay infrastructure for one handler queue.
    async fn setup(
        &self,
        topology: &Topology,
        queue: &str,
        policy: &RetryPolicy,
    ) -> Result<(), AmqpError>;

    /// Republishes a failed message for one more attempt.
    async fn requeue(
        &self,
        ops: &dyn AmqpOps,
        queue: &str,
        policy: &RetryPolicy,
        event: &DeliveredEvent,
    ) -> Result<(), AmqpError>;
}

/// Returns the strategy implementation for the given kind.
pub(crate) fn retry_strategy(kind: RetryStrategyKind) -> Arc<dyn RetryStrategy> {
    match kind {
        RetryStrategyKind::DeadLetterTtl => Arc::new(DeadLetterTtl),
        RetryStrategyKind::DelayedMessageExchange => Arc::new(DelayedMessageExchange),
    }
}

/// Retry via per-delay TTL queues and dead-lettering.
pub(crate) struct DeadLetterTtl;

#[async_trait]
impl RetryStrategy for DeadLetterTtl {
    async fn setup(
        &self,
        topology: &Topology,
        queue: &str,
        policy: &RetryPolicy,
    ) -> Result<(), AmqpError> {
        topology
            .assert_exchange(&ExchangeDefinition::topic(RETRY_DELAY_EXCHANGE_NAME))
            .await?;
        topology
            .assert_exchange(&ExchangeDefinition::topic(RETRY_REQUEUE_EXCHANGE_NAME))
            .await?;

        for delay in policy.delays_ms() {
            let delay_queue = format!("{DELAY_QUEUE_NAME_PREFIX}.{delay}");

            topology
                .assert_queue(
                    &QueueDefinition::new(&delay_queue)
                        .ttl(delay as u32)
                        .dead_letter_exchange(RETRY_REQUEUE_EXCHANGE_NAME),
                )
                .await?;
            topology
                .bind_queue(
                    &delay_queue,
                    RETRY_DELAY_EXCHANGE_NAME,
                    &format!("#.retry.{delay}"),
                )
                .await?;
        }

        topology
            .bind_queue(queue, RETRY_REQUEUE_EXCHANGE_NAME, &format!("{queue}.#"))
            .await
    }

    async fn requeue(
        &self,
        ops: &dyn AmqpOps,
        queue: &str,
        policy: &RetryPolicy,
        event: &DeliveredEvent,
    ) -> Result<(), AmqpError> {
        let retry_count = event.retry_count() + 1;
        let delay = policy.delay_for(retry_count).as_millis() as u64;
        let routing_key = format!("{queue}.retry.{delay}");

        ops.publish(
            RETRY_DELAY_EXCHANGE_NAME,
            &routing_key,
            event.data(),
            retry_properties(event, retry_count, None),
        )
        .await
        .map_err(|_| AmqpError::RequeueMessageError(queue.to_owned()))?;

        info!(
            event = event.name(),
            queue,
            retry_count,
            delay_ms = delay,
            "message republished for retry"
        );

        Ok(())
    }
}

/// Retry via the delayed-message-exchange broker plugin.
pub(crate) struct DelayedMessageExchange;

#[async_trait]
impl RetryStrategy for DelayedMessageExchange {
    async fn setup(
        &self,
        topology: &Topology,
        queue: &str,
        _policy: &RetryPolicy,
    ) -> Result<(), AmqpError> {
        topology
            .assert_exchange(&ExchangeDefinition::delayed_message(
                RETRY_DELAYED_MESSAGE_EXCHANGE_NAME,
            ))
            .await?;

        topology
            .bind_queue(queue, RETRY_DELAYED_MESSAGE_EXCHANGE_NAME, queue)
            .await
    }

    async fn requeue(
        &self,
        ops: &dyn AmqpOps,
        queue: &str,
        policy: &RetryPolicy,
        event: &DeliveredEvent,
    ) -> Result<(), AmqpError> {
        let retry_count = event.retry_count() + 1;
        let delay = policy.delay_for(retry_count).as_millis() as u64;

        ops.publish(
            RETRY_DELAYED_MESSAGE_EXCHANGE_NAME,
            queue,
            event.data(),
            retry_properties(event, retry_count, Some(delay)),
        )
        .await
        .map_err(|_| AmqpError::RequeueMessageError(queue.to_owned()))?;

        info!(
            event = event.name(),
            queue,
            retry_count,
            delay_ms = delay,
            "message republished for retry"
        );

        Ok(())
    }
}

/// Rebuilds the message properties for a retry republish: the retry counter
/// is incremented and the origin exchange is pinned, everything else is
/// preserved from the original delivery.
fn retry_properties(
    event: &DeliveredEvent,
    retry_count: u32,
    x_delay_ms: Option<u64>,
) -> lapin::BasicProperties {
    let properties = event.properties().clone();

    let mut headers: BTreeMap<ShortString, AMQPValue> = match properties.headers() {
        Some(table) => table.inner().clone(),
        None => BTreeMap::new(),
    };

    headers.insert(
        ShortString::from(RETRY_COUNT_HEADER),
        AMQPValue::LongInt(LongInt::from(retry_count as i32)),
    );
    headers.insert(
        ShortString::from(ORIGIN_EXCHANGE_HEADER),
        AMQPValue::LongString(LongString::from(event.exchange())),
    );

    if let Some(delay) = x_delay_ms {
        headers.insert(
            ShortString::from(DELAY_HEADER),
            AMQPValue::LongInt(LongInt::from(delay as i32)),
        );
    }

    properties.with_headers(FieldTable::from(headers))
}

/// Delay infrastructure setup needed by one handler with retries enabled.
pub(crate) async fn setup_retry_infrastructure(
    topology: &Topology,
    queue: &str,
    policy: &RetryPolicy,
) -> Result<(), AmqpError> {
    retry_strategy(policy.strategy).setup(topology, queue, policy).await
}
