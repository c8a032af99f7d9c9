// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Idempotent Topology Assertion
//!
//! The topology builder asserts exchanges and queues and binds queues to
//! exchanges on behalf of producers and consumers. Every operation is safe
//! to repeat; a per-channel set of already-asserted names short-circuits
//! redundant broker round-trips within the life of one channel. The sets
//! die with their channel: after a reconnect a fresh builder re-asserts
//! everything, which is defensive and never destructive.
//!
//! Concurrent registrations may race on the same exchange name; the loser
//! of the race performs one harmless repeated assertion. No global lock is
//! taken.

use crate::{
    channel::AmqpOps,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeOptions},
    queue::{QueueDefinition, QueueOptions},
};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};
use tracing::debug;

/// Asserts topology on one channel, deduplicating repeated assertions.
pub struct Topology {
    ops: Arc<dyn AmqpOps>,
    exchange_defaults: ExchangeOptions,
    queue_defaults: QueueOptions,
    asserted_exchanges: Mutex<HashSet<String>>,
    asserted_queues: Mutex<HashSet<String>>,
}

impl Topology {
    pub(crate) fn new(
        ops: Arc<dyn AmqpOps>,
        exchange_defaults: ExchangeOptions,
        queue_defaults: QueueOptions,
    ) -> Topology {
        Topology {
            ops,
            exchange_defaults,
            queue_defaults,
            asserted_exchanges: Mutex::new(HashSet::new()),
            asserted_queues: Mutex::new(HashSet::new()),
        }
    }

    /// Asserts an exchange, skipping the round-trip when this builder
    /// already asserted the name on its channel.
    pub async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        if self.already_asserted(&self.asserted_exchanges, &def.name) {
            return Ok(());
        }

        debug!(name = def.name, "creating exchange");

        let options = def.options.unwrap_or(self.exchange_defaults);
        self.ops
            .declare_exchange(
                &def.name,
                (&def.kind).into(),
                options.durable,
                options.auto_delete,
                lapin::types::FieldTable::from(def.params.clone()),
            )
            .await?;

        self.mark_asserted(&self.asserted_exchanges, &def.name);
        debug!(name = def.name, "exchange was created");

        Ok(())
    }

    /// Asserts a topic exchange by name with the configured defaults.
    pub async fn assert_topic_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.assert_exchange(&ExchangeDefinition::topic(name)).await
    }

    /// Asserts a queue, skipping the round-trip when this builder already
    /// asserted the name on its channel.
    pub async fn assert_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if self.already_asserted(&self.asserted_queues, &def.name) {
            return Ok(());
        }

        debug!(name = def.name, "creating queue");

        let options = def.options.unwrap_or(self.queue_defaults);
        self.ops
            .declare_queue(
                &def.name,
                options.durable,
                options.auto_delete,
                options.exclusive,
                def.arguments(),
            )
            .await?;

        self.mark_asserted(&self.asserted_queues, &def.name);
        debug!(name = def.name, "queue was created");

        Ok(())
    }

    /// Binds a queue to an exchange with the given pattern.
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), AmqpError> {
        debug!(queue, exchange, pattern, "binding queue to the exchange");

        self.ops.bind_queue(queue, exchange, pattern).await
    }

    fn already_asserted(&self, set: &Mutex<HashSet<String>>, name: &str) -> bool {
        set.lock().map(|set| set.contains(name)).unwrap_or(false)
    }

    fn mark_asserted(&self, set: &Mutex<HashSet<String>>, name: &str) {
        if let Ok(mut set) = set.lock() {
            set.insert(name.to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAmqpOps;

    fn topology(ops: MockAmqpOps) -> Topology {
        Topology::new(
            Arc::new(ops),
            ExchangeOptions::default(),
            QueueOptions::default(),
        )
    }

    #[tokio::test]
    async fn repeated_exchange_assertions_hit_the_broker_once() {
        let mut ops = MockAmqpOps::new();
        ops.expect_declare_exchange()
            .withf(|name, kind, durable, auto_delete, _| {
                name == "users"
                    && *kind == lapin::ExchangeKind::Topic
                    && *durable
                    && !*auto_delete
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        let topology = topology(ops);

        topology.assert_topic_exchange("users").await.unwrap();
        topology.assert_topic_exchange("users").await.unwrap();
    }

    #[tokio::test]
    async fn distinct_exchanges_are_each_asserted() {
        let mut ops = MockAmqpOps::new();
        ops.expect_declare_exchange()
            .times(2)
            .returning(|_, _, _, _, _| Ok(()));

        let topology = topology(ops);

        topology.assert_topic_exchange("users").await.unwrap();
        topology.assert_topic_exchange("stores").await.unwrap();
    }

    #[tokio::test]
    async fn failed_assertions_are_not_remembered() {
        let mut ops = MockAmqpOps::new();
        ops.expect_declare_exchange()
            .times(2)
            .returning(|name, _, _, _, _| {
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            });

        let topology = topology(ops);

        assert!(topology.assert_topic_exchange("users").await.is_err());
        assert!(topology.assert_topic_exchange("users").await.is_err());
    }

    #[tokio::test]
    async fn repeated_queue_assertions_hit_the_broker_once() {
        let mut ops = MockAmqpOps::new();
        ops.expect_declare_queue()
            .withf(|name, durable, auto_delete, exclusive, _| {
                name == "orders" && *durable && !*auto_delete && !*exclusive
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        let topology = topology(ops);

        topology.assert_queue(&QueueDefinition::new("orders")).await.unwrap();
        topology.assert_queue(&QueueDefinition::new("orders")).await.unwrap();
    }

    #[tokio::test]
    async fn bind_passes_the_pattern_through() {
        let mut ops = MockAmqpOps::new();
        ops.expect_bind_queue()
            .withf(|queue, exchange, pattern| {
                queue == "orders" && exchange == "users" && pattern == "user.*"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let topology = topology(ops);

        topology.bind_queue("orders", "users", "user.*").await.unwrap();
    }
}
