// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Producer
//!
//! The producer publishes outbound events to their declared exchange. The
//! exchange is asserted lazily, exactly once per channel life; the routing
//! key is the event's explicit key or derived from its logical name; and
//! every message carries the routing key in its `type` property, a v4
//! message id, persistent delivery mode and a JSON content type unless
//! overridden.
//!
//! Publish failures are fire-and-log: they are reported with full context
//! but never surfaced to the caller. Retrying is a consumption-side concern
//! handled by the retry engine.

use crate::{
    channel::{AmqpOps, ChannelOps, ConnectionManager},
    config::{Config, PublishOptions, PublishOverrides},
    errors::AmqpError,
    event::{EventDescriptor, PubsubEvent},
    handler::DispatchSink,
    message::DeliveredEvent,
    otel,
    topology::Topology,
};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Publishes application events to their declared topic exchanges.
pub struct Producer {
    manager: Arc<ConnectionManager>,
    config: Arc<Config>,
    state: Mutex<Option<ProducerChannel>>,
    local_sink: Option<Arc<dyn DispatchSink>>,
}

#[derive(Clone)]
struct ProducerChannel {
    channel: Arc<lapin::Channel>,
    ops: Arc<dyn AmqpOps>,
    topology: Arc<Topology>,
}

impl Producer {
    /// Creates a producer over the given connection manager.
    pub fn new(manager: Arc<ConnectionManager>, config: Arc<Config>) -> Producer {
        Producer {
            manager,
            config,
            state: Mutex::new(None),
            local_sink: None,
        }
    }

    /// Enables in-process mirroring for events flagged `fire_locally`.
    pub fn with_local_sink(mut self, sink: Arc<dyn DispatchSink>) -> Producer {
        self.local_sink = Some(sink);
        self
    }

    /// Publishes an event with the configured producer defaults.
    pub async fn publish<E: PubsubEvent>(&self, event: &E) {
        self.publish_with_options(event, PublishOverrides::default()).await
    }

    /// Publishes an event, merging the given overrides over the configured
    /// producer defaults.
    pub async fn publish_with_options<E: PubsubEvent>(&self, event: &E, overrides: PublishOverrides) {
        let descriptor = E::descriptor();
        let routing_key = descriptor.routing_key();

        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    event = descriptor.name(),
                    "failure to serialize event payload"
                );
                return;
            }
        };

        if event.fire_locally() {
            self.mirror_locally(&descriptor, &routing_key, &payload).await;
        }

        match self.publish_raw(&descriptor, &routing_key, &payload, overrides).await {
            Ok(()) => {
                debug!(
                    event = descriptor.name(),
                    exchange = descriptor.exchange(),
                    routing_key,
                    "event published"
                );
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    event = descriptor.name(),
                    exchange = descriptor.exchange(),
                    routing_key,
                    payload = String::from_utf8_lossy(&payload).into_owned(),
                    "event was not published"
                );
            }
        }
    }

    async fn publish_raw(
        &self,
        descriptor: &EventDescriptor,
        routing_key: &str,
        payload: &[u8],
        overrides: PublishOverrides,
    ) -> Result<(), AmqpError> {
        let state = self.ensure_channel().await?;

        state.topology.assert_topic_exchange(descriptor.exchange()).await?;

        let properties = build_publish_properties(&self.config.producer, &overrides, routing_key);

        state
            .ops
            .publish(descriptor.exchange(), routing_key, payload, properties)
            .await
    }

    async fn mirror_locally(&self, descriptor: &EventDescriptor, routing_key: &str, payload: &[u8]) {
        let Some(sink) = &self.local_sink else {
            warn!(
                event = descriptor.name(),
                "event is flagged for local dispatch but no local sink is configured"
            );
            return;
        };

        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(_) => return,
        };

        let event = DeliveredEvent::local(
            descriptor.name(),
            routing_key,
            descriptor.exchange(),
            value,
            payload.to_vec(),
        );

        if let Err(err) = sink.publish_locally(event).await {
            error!(
                error = err.to_string(),
                event = descriptor.name(),
                "local event dispatch failed"
            );
        }
    }

    /// Returns the live channel state, recreating channel and topology
    /// bookkeeping after a connection loss.
    async fn ensure_channel(&self) -> Result<ProducerChannel, AmqpError> {
        let mut state = self.state.lock().await;

        if let Some(current) = state.as_ref() {
            if current.channel.status().connected() {
                return Ok(current.clone());
            }

            warn!("producer channel lost, recreating");
        }

        let channel = self.manager.create_channel(None).await?;
        let ops: Arc<dyn AmqpOps> = Arc::new(ChannelOps::new(channel.clone()));
        let topology = Arc::new(Topology::new(
            ops.clone(),
            self.config.exchange,
            self.config.binding,
        ));

        let fresh = ProducerChannel {
            channel,
            ops,
            topology,
        };
        *state = Some(fresh.clone());

        Ok(fresh)
    }

    /// Gracefully closes the producer connection.
    pub async fn close(&self) {
        self.manager.close().await;
    }
}

/// Renders the properties for one outbound message.
pub(crate) fn build_publish_properties(
    defaults: &PublishOptions,
    overrides: &PublishOverrides,
    routing_key: &str,
) -> BasicProperties {
    let mut headers: BTreeMap<ShortString, AMQPValue> = BTreeMap::new();

    otel::inject_context(&mut headers);

    for (key, value) in &overrides.headers {
        headers.insert(key.clone(), value.clone());
    }

    let content_type = overrides
        .content_type
        .clone()
        .unwrap_or_else(|| defaults.content_type.clone());

    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(content_type))
        .with_type(ShortString::from(routing_key))
        .with_delivery_mode(overrides.delivery_mode.unwrap_or(defaults.delivery_mode))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(headers));

    if let Some(priority) = overrides.priority {
        properties = properties.with_priority(priority);
    }

    if let Some(expiration) = overrides.expiration_ms {
        properties = properties.with_expiration(ShortString::from(expiration.to_string()));
    }

    properties
}
