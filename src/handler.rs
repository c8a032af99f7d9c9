// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Descriptors and the Dispatch Sink
//!
//! The external registration collaborator describes each event handler once
//! at startup: the events it consumes, its acknowledgement policy, optional
//! retry configuration and queue overrides. Descriptors are validated by
//! the [`HandlerRegistry`] and immutable afterwards. Successfully routed
//! messages leave the engine through the [`DispatchSink`], whose
//! implementation invokes the actual handler code and signals success or
//! failure back to the acknowledgement policy.

use crate::{
    errors::AmqpError,
    event::{to_queue_suffix, EventDescriptor},
    message::DeliveredEvent,
    queue::QueueOptions,
    retry::RetryOptions,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

/// Failure signalled by the in-process handler invocation.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked when a message exhausts its retry attempts, before the
/// message is discarded.
pub type ExhaustionCallback = Arc<dyn Fn(&DeliveredEvent, &HandlerError) + Send + Sync>;

/// Receives successfully routed events for in-process dispatch.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DispatchSink: Send + Sync {
    /// Invoked once per matched, acknowledgement-policy-approved message.
    async fn publish_locally(&self, event: DeliveredEvent) -> Result<(), HandlerError>;
}

/// Acknowledgement policy applied to a handler's invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// Positive acknowledge after the handler completes, success or failure.
    #[default]
    AlwaysAck,
    /// Ack on success, nack (without requeue) on failure.
    AckAndNack,
    /// Acknowledgement is performed manually by the handler.
    Never,
    /// Failed invocations are republished with backoff by the retry engine.
    AutoRetry,
}

/// Immutable description of one event handler.
#[derive(Clone)]
pub struct HandlerDescriptor {
    name: String,
    queue: Option<String>,
    events: Vec<EventDescriptor>,
    ack_mode: AckMode,
    retry: Option<RetryOptions>,
    binding_options: Option<QueueOptions>,
    on_exhausted: Option<ExhaustionCallback>,
}

impl HandlerDescriptor {
    /// Creates a descriptor for the handler with the given logical name.
    pub fn new(name: impl Into<String>) -> HandlerDescriptor {
        HandlerDescriptor {
            name: name.into(),
            queue: None,
            events: Vec::new(),
            ack_mode: AckMode::default(),
            retry: None,
            binding_options: None,
            on_exhausted: None,
        }
    }

    /// Declares an event this handler consumes.
    pub fn event(mut self, event: EventDescriptor) -> Self {
        self.events.push(event);
        self
    }

    /// Overrides the derived queue name.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Selects the acknowledgement policy; [`AckMode::AlwaysAck`] otherwise.
    pub fn ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    /// Configures retry options, merged over the root retry defaults.
    pub fn retry(mut self, options: RetryOptions) -> Self {
        self.retry = Some(options);
        self
    }

    /// Overrides the configured queue-binding options.
    pub fn binding_options(mut self, options: QueueOptions) -> Self {
        self.binding_options = Some(options);
        self
    }

    /// Registers a callback invoked when a message exhausts its retries.
    pub fn on_exhausted(mut self, callback: ExhaustionCallback) -> Self {
        self.on_exhausted = Some(callback);
        self
    }

    /// The handler's logical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The events this handler consumes, in declaration order.
    pub fn events(&self) -> &[EventDescriptor] {
        &self.events
    }

    pub fn ack(&self) -> AckMode {
        self.ack_mode
    }

    pub fn retry_options(&self) -> Option<&RetryOptions> {
        self.retry.as_ref()
    }

    pub fn binding_overrides(&self) -> Option<&QueueOptions> {
        self.binding_options.as_ref()
    }

    pub(crate) fn exhaustion_callback(&self) -> Option<ExhaustionCallback> {
        self.on_exhausted.clone()
    }

    /// The queue this handler consumes from: the explicit name, or
    /// `<prefix>:<snake_case(name)>` with a trailing `Handler` disregarded.
    pub fn queue_name(&self, prefix: &str) -> String {
        match &self.queue {
            Some(queue) => queue.clone(),
            None => format!("{prefix}:{}", to_queue_suffix(&self.name)),
        }
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("events", &self.events)
            .field("ack_mode", &self.ack_mode)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Startup-time collection of validated handler descriptors.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: Vec<HandlerDescriptor>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Registers a handler descriptor.
    ///
    /// A handler declaring no events is logged and excluded; it must not
    /// silently consume a whole exchange. A retry configuration above the
    /// attempt ceiling fails loudly.
    pub fn register(&mut self, descriptor: HandlerDescriptor) -> Result<(), AmqpError> {
        if descriptor.events.is_empty() {
            error!(
                handler = descriptor.name,
                "handler declares no events and was excluded from registration"
            );
            return Ok(());
        }

        if let Some(options) = &descriptor.retry {
            if let Some(max_attempts) = options.max_attempts {
                if max_attempts > crate::retry::MAX_RETRY_ATTEMPTS {
                    return Err(AmqpError::SetupError(format!(
                        "handler `{}` configures {max_attempts} retry attempts, above the ceiling of {}",
                        descriptor.name,
                        crate::retry::MAX_RETRY_ATTEMPTS
                    )));
                }
            }
        }

        self.handlers.push(descriptor);
        Ok(())
    }

    /// The registered, validated descriptors.
    pub fn handlers(&self) -> &[HandlerDescriptor] {
        &self.handlers
    }

    pub fn into_handlers(self) -> Vec<HandlerDescriptor> {
        self.handlers
    }
}
