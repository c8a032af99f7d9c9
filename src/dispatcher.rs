// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Router
//!
//! The router binds one queue per handler descriptor, asserts the topology
//! its events need, and forwards matched messages to the in-process
//! dispatch sink through the handler's acknowledgement policy.
//!
//! All handlers share one channel derived from the consumer connection;
//! the configured prefetch limits are applied when that channel is created
//! and cap the number of unacknowledged, concurrently dispatched messages.
//! The channel carries one topology builder, so exchanges referenced by
//! several handlers are asserted once per channel life.
//!
//! Registration is loud: topology failures surface to the caller of
//! [`Router::bind_and_consume`]. Once a consumer is installed, it never
//! gives up — when its stream ends with the connection, the worker rebuilds
//! the shared channel and its own consumer on the fixed reconnect interval.
//! The asserted-name bookkeeping dies with each channel, so everything is
//! re-asserted after a reconnect. Deliveries are dispatched on their own
//! tasks, so handler invocations for distinct messages run concurrently up
//! to the prefetch limits.

use crate::{
    ack::{ack_strategy, AckStrategy},
    channel::{AmqpOps, ChannelOps, ConnectionManager},
    config::Config,
    consumer::consume,
    errors::AmqpError,
    event::EventDescriptor,
    handler::{AckMode, DispatchSink, ExhaustionCallback, HandlerDescriptor},
    queue::{QueueDefinition, QueueOptions},
    retry::{setup_retry_infrastructure, RetryPolicy},
    topology::Topology,
};
use futures_util::StreamExt;
use lapin::{options::BasicConsumeOptions, types::FieldTable, Channel};
use opentelemetry::global;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

/// A handler bound to its queue, ready to receive deliveries.
pub(crate) struct BoundHandler {
    pub(crate) handler: String,
    pub(crate) queue: String,
    pub(crate) events: Vec<EventDescriptor>,
    pub(crate) strategy: Arc<dyn AckStrategy>,
}

/// A handler descriptor resolved against the configuration.
struct ConsumerDefinition {
    handler: String,
    queue: String,
    events: Vec<EventDescriptor>,
    ack_mode: AckMode,
    retry: RetryPolicy,
    binding_options: Option<QueueOptions>,
    on_exhausted: Option<ExhaustionCallback>,
}

/// The channel all handlers consume over, with its topology bookkeeping.
#[derive(Clone)]
struct SharedChannel {
    channel: Arc<Channel>,
    ops: Arc<dyn AmqpOps>,
    topology: Arc<Topology>,
}

type ChannelState = Arc<Mutex<Option<SharedChannel>>>;

/// Binds handler queues and routes their inbound messages.
pub struct Router {
    manager: Arc<ConnectionManager>,
    config: Arc<Config>,
    sink: Arc<dyn DispatchSink>,
    bound_tx: broadcast::Sender<String>,
    state: ChannelState,
}

impl Router {
    /// Creates a router dispatching matched messages into the given sink.
    pub fn new(
        manager: Arc<ConnectionManager>,
        config: Arc<Config>,
        sink: Arc<dyn DispatchSink>,
    ) -> Router {
        let (bound_tx, _) = broadcast::channel(16);

        Router {
            manager,
            config,
            sink,
            bound_tx,
            state: Arc::new(Mutex::new(None)),
        }
    }

    /// Notifications carrying a handler name each time its consumer is
    /// installed, including after reconnects.
    pub fn handler_bound(&self) -> broadcast::Receiver<String> {
        self.bound_tx.subscribe()
    }

    /// Asserts the topology a handler needs, binds its queue to every
    /// declared event and starts consuming.
    ///
    /// Fails loudly on invalid descriptors and topology errors; transport
    /// loss after this returns is recovered automatically.
    pub async fn bind_and_consume(&self, descriptor: HandlerDescriptor) -> Result<(), AmqpError> {
        if descriptor.events().is_empty() {
            return Err(AmqpError::SetupError(format!(
                "handler `{}` declares no events",
                descriptor.name()
            )));
        }

        let retry = RetryPolicy::resolve(&self.config.retry, descriptor.retry_options());
        retry.validate(descriptor.name())?;

        let definition = Arc::new(ConsumerDefinition {
            handler: descriptor.name().to_owned(),
            queue: descriptor.queue_name(&self.config.queue_prefix()),
            events: descriptor.events().to_vec(),
            ack_mode: descriptor.ack(),
            retry,
            binding_options: descriptor.binding_overrides().copied(),
            on_exhausted: descriptor.exhaustion_callback(),
        });

        let shared = ensure_channel(&self.manager, &self.config, &self.state).await?;
        let (consumer, bound) = install(&shared, &definition).await?;

        let patterns: Vec<String> = definition
            .events
            .iter()
            .map(EventDescriptor::binding_pattern)
            .collect();
        let exchanges: Vec<&str> = definition.events.iter().map(EventDescriptor::exchange).collect();

        info!(
            handler = definition.handler,
            queue = definition.queue,
            patterns = patterns.join(", "),
            exchanges = exchanges.join(", "),
            "listening for events"
        );

        let _ = self.bound_tx.send(definition.handler.clone());

        let worker = ConsumerWorker {
            manager: self.manager.clone(),
            config: self.config.clone(),
            sink: self.sink.clone(),
            bound_tx: self.bound_tx.clone(),
            state: self.state.clone(),
            definition,
        };
        tokio::spawn(worker.run(consumer, bound));

        Ok(())
    }

    /// Gracefully closes the consumer connection.
    pub async fn close(&self) {
        self.manager.close().await;
    }
}

/// Returns the channel shared by all handlers, recreating it (with fresh
/// topology bookkeeping) after a loss.
async fn ensure_channel(
    manager: &ConnectionManager,
    config: &Config,
    state: &ChannelState,
) -> Result<SharedChannel, AmqpError> {
    let mut guard = state.lock().await;

    if let Some(current) = guard.as_ref() {
        if current.channel.status().connected() {
            return Ok(current.clone());
        }

        warn!("consumer channel lost, recreating");
    }

    let channel = manager.create_channel(Some(&config.consumer)).await?;
    let ops: Arc<dyn AmqpOps> = Arc::new(ChannelOps::new(channel.clone()));
    let topology = Arc::new(Topology::new(ops.clone(), config.exchange, config.binding));

    let fresh = SharedChannel {
        channel,
        ops,
        topology,
    };
    *guard = Some(fresh.clone());

    Ok(fresh)
}

/// Asserts a handler's topology on the shared channel and starts its
/// consumer.
async fn install(
    shared: &SharedChannel,
    definition: &ConsumerDefinition,
) -> Result<(lapin::Consumer, Arc<BoundHandler>), AmqpError> {
    // Exchanges referenced by several handlers are deduplicated by the
    // shared topology builder.
    for event in &definition.events {
        shared.topology.assert_topic_exchange(event.exchange()).await?;
    }

    let mut queue_def = QueueDefinition::new(&definition.queue);
    if let Some(options) = definition.binding_options {
        queue_def = queue_def.options(options);
    }
    shared.topology.assert_queue(&queue_def).await?;

    for event in &definition.events {
        shared
            .topology
            .bind_queue(&definition.queue, event.exchange(), &event.binding_pattern())
            .await?;
    }

    if definition.ack_mode == AckMode::AutoRetry {
        setup_retry_infrastructure(&shared.topology, &definition.queue, &definition.retry).await?;
    }

    let consumer = shared
        .channel
        .basic_consume(
            &definition.queue,
            &format!("{}-{}", definition.queue, Uuid::new_v4()),
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                queue = definition.queue,
                "error to create the consumer"
            );
            AmqpError::ConsumerError(definition.queue.clone())
        })?;

    let strategy = ack_strategy(
        definition.ack_mode,
        &definition.handler,
        &definition.queue,
        definition.retry.clone(),
        definition.on_exhausted.clone(),
        shared.ops.clone(),
    );

    let bound = Arc::new(BoundHandler {
        handler: definition.handler.clone(),
        queue: definition.queue.clone(),
        events: definition.events.clone(),
        strategy,
    });

    Ok((consumer, bound))
}

/// Owns one handler's consume loop across reconnects.
struct ConsumerWorker {
    manager: Arc<ConnectionManager>,
    config: Arc<Config>,
    sink: Arc<dyn DispatchSink>,
    bound_tx: broadcast::Sender<String>,
    state: ChannelState,
    definition: Arc<ConsumerDefinition>,
}

impl ConsumerWorker {
    async fn run(self, mut consumer: lapin::Consumer, mut bound: Arc<BoundHandler>) {
        loop {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let bound = bound.clone();
                        let sink = self.sink.clone();
                        let queue = self.definition.queue.clone();

                        tokio::spawn(async move {
                            let tracer = global::tracer("pubsub consumer");

                            if let Err(err) =
                                consume(&tracer, delivery, &bound, sink.as_ref()).await
                            {
                                error!(
                                    error = err.to_string(),
                                    queue, "error to consume message"
                                );
                            }
                        });
                    }
                    Err(err) => {
                        error!(
                            error = err.to_string(),
                            queue = self.definition.queue,
                            "error receiving delivery"
                        );
                    }
                }
            }

            warn!(
                queue = self.definition.queue,
                "consumer stream closed, re-establishing"
            );

            (consumer, bound) = loop {
                tokio::time::sleep(self.config.reconnect_interval).await;

                let shared = match ensure_channel(&self.manager, &self.config, &self.state).await {
                    Ok(shared) => shared,
                    Err(err) => {
                        error!(
                            error = err.to_string(),
                            queue = self.definition.queue,
                            "failure to re-establish consumer channel"
                        );
                        continue;
                    }
                };

                match install(&shared, &self.definition).await {
                    Ok(installed) => {
                        info!(
                            handler = self.definition.handler,
                            queue = self.definition.queue,
                            "consumer re-established"
                        );
                        let _ = self.bound_tx.send(self.definition.handler.clone());
                        break installed;
                    }
                    Err(err) => {
                        error!(
                            error = err.to_string(),
                            queue = self.definition.queue,
                            "failure to re-establish consumer"
                        );
                    }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockDispatchSink;
    use crate::retry::{RetryOptions, MAX_RETRY_ATTEMPTS};

    fn router() -> Router {
        let config = Arc::new(Config::new("orders", vec![]));
        let manager = Arc::new(ConnectionManager::new(
            &config,
            crate::channel::ConnectionRole::Consumer,
        ));

        Router::new(manager, config, Arc::new(MockDispatchSink::new()))
    }

    #[tokio::test]
    async fn handlers_without_events_fail_loudly() {
        let err = router()
            .bind_and_consume(HandlerDescriptor::new("GhostHandler"))
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::SetupError(_)));
    }

    #[tokio::test]
    async fn absurd_retry_configuration_fails_before_any_broker_work() {
        let descriptor = HandlerDescriptor::new("NotifyUserHandler")
            .event(EventDescriptor::new("UserCreated", "users"))
            .ack_mode(AckMode::AutoRetry)
            .retry(RetryOptions {
                max_attempts: Some(MAX_RETRY_ATTEMPTS + 1),
                ..RetryOptions::default()
            });

        let err = router().bind_and_consume(descriptor).await.unwrap_err();

        assert!(matches!(err, AmqpError::SetupError(_)));
    }
}
