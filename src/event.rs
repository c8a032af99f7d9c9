// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Identity and Routing-Key Derivation
//!
//! An event type is identified by a logical name in class-case
//! (`UserCreated`) and bound to a topic exchange through an
//! [`EventDescriptor`]. The descriptor resolves the routing key the event is
//! published with and the binding pattern its consumers subscribe with.
//! When no explicit key or pattern is configured, both are derived from the
//! logical name: `UserCreated` becomes `user.created`. The reserved name
//! `Fanout` maps to the `#` binding, which receives every message on the
//! exchange.

use serde::Serialize;

/// Binding pattern matching every routing key on an exchange.
pub const FAN_OUT_BINDING: &str = "#";

/// Logical event name reserved for the fan-out binding.
pub const FAN_OUT_CLASS_NAME: &str = "Fanout";

/// Splits a class-case name into its lower-cased words.
///
/// Word boundaries sit before an uppercase letter that follows a lowercase
/// letter or digit, and before the last uppercase letter of an acronym run
/// (`HTTPServer` splits as `http`, `server`).
fn class_case_words(name: &str) -> Vec<String> {
    let chars: Vec<char> = name.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let acronym_end =
                prev.is_uppercase() && chars.get(i + 1).is_some_and(|n| n.is_lowercase());

            if prev.is_lowercase() || prev.is_ascii_digit() || acronym_end {
                words.push(std::mem::take(&mut current));
            }
        }

        current.extend(c.to_lowercase());
    }

    if !current.is_empty() {
        words.push(current);
    }

    words
}

/// Derives the routing key for an event's logical name.
///
/// A trailing `Event` word is disregarded, the remaining words are joined
/// with dots, and the reserved `Fanout` name maps to [`FAN_OUT_BINDING`].
///
/// ```
/// use pubsub::event::to_routing_key;
///
/// assert_eq!(to_routing_key("UserCreated"), "user.created");
/// assert_eq!(to_routing_key("OrderStatusUpdatedEvent"), "order.status.updated");
/// assert_eq!(to_routing_key("Fanout"), "#");
/// ```
pub fn to_routing_key(event_name: &str) -> String {
    let name = event_name.strip_suffix("Event").unwrap_or(event_name);
    let key = class_case_words(name).join(".");

    if key == "fanout" {
        return FAN_OUT_BINDING.to_owned();
    }

    key
}

/// Converts a routing key back to an event's logical name.
///
/// ```
/// use pubsub::event::to_event_class_name;
///
/// assert_eq!(to_event_class_name("user.created"), "UserCreated");
/// assert_eq!(to_event_class_name("#"), "Fanout");
/// ```
pub fn to_event_class_name(routing_key: &str) -> String {
    if routing_key == FAN_OUT_BINDING {
        return FAN_OUT_CLASS_NAME.to_owned();
    }

    routing_key
        .split('.')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Derives the queue-name suffix for a handler's logical name.
///
/// A trailing `Handler` word is disregarded and the remaining words are
/// joined with underscores: `NotifyUserHandler` becomes `notify_user`.
pub fn to_queue_suffix(handler_name: &str) -> String {
    let name = handler_name.strip_suffix("Handler").unwrap_or(handler_name);

    class_case_words(name).join("_")
}

/// Binds an event type to its broker coordinates.
///
/// `routing_key` overrides the derived publish key, and `binding_pattern`
/// overrides both for subscription purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescriptor {
    name: String,
    exchange: String,
    routing_key: Option<String>,
    binding_pattern: Option<String>,
}

impl EventDescriptor {
    /// Creates a descriptor deriving its routing key from `name`.
    pub fn new(name: impl Into<String>, exchange: impl Into<String>) -> EventDescriptor {
        EventDescriptor {
            name: name.into(),
            exchange: exchange.into(),
            routing_key: None,
            binding_pattern: None,
        }
    }

    /// Creates a fan-out descriptor consuming every message on `exchange`.
    pub fn fanout(name: impl Into<String>, exchange: impl Into<String>) -> EventDescriptor {
        EventDescriptor::new(name, exchange).with_routing_key(FAN_OUT_BINDING)
    }

    /// Overrides the routing key the event is published to and listened from.
    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    /// Overrides the binding pattern the event is listened from.
    ///
    /// Takes precedence over the routing key for subscriptions only.
    pub fn with_binding_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.binding_pattern = Some(pattern.into());
        self
    }

    /// The event's logical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The exchange the event is published to and listened from.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The routing key the event is published with.
    pub fn routing_key(&self) -> String {
        match &self.routing_key {
            Some(key) => key.clone(),
            None => to_routing_key(&self.name),
        }
    }

    /// The pattern a consumer queue binds with for this event.
    pub fn binding_pattern(&self) -> String {
        match &self.binding_pattern {
            Some(pattern) => pattern.clone(),
            None => self.routing_key(),
        }
    }
}

/// An outbound application event.
///
/// Implementations carry their payload as serializable state and name the
/// broker coordinates through their descriptor.
pub trait PubsubEvent: Serialize + Send + Sync {
    /// The broker coordinates this event type is published under.
    fn descriptor() -> EventDescriptor
    where
        Self: Sized;

    /// Whether the event should also be dispatched to the in-process sink
    /// when it is produced.
    fn fire_locally(&self) -> bool {
        false
    }
}
