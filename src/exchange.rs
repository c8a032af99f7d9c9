// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Declarations
//!
//! Exchanges are the routing entities events are published to. The pub/sub
//! layer declares `topic` exchanges for application events and, when the
//! delayed-message retry strategy is configured, one exchange of the
//! broker-plugin kind `x-delayed-message`.

use lapin::types::{AMQPValue, LongString, ShortString};
use std::collections::BTreeMap;

/// Argument naming the inner routing behavior of a delayed-message exchange
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Exchange kinds declared by this crate.
///
/// `XMessageDelayed` requires the delayed-message plugin on the broker and
/// routes with the semantics named by its `x-delayed-type` argument.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Topic,
    XMessageDelayed,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Declaration options shared by every exchange assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for ExchangeOptions {
    fn default() -> ExchangeOptions {
        ExchangeOptions {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Definition of an exchange to be asserted on the broker.
#[derive(Debug, Clone)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) options: Option<ExchangeOptions>,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a topic exchange definition.
    pub fn topic(name: impl Into<String>) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.into(),
            kind: ExchangeKind::Topic,
            options: None,
            params: BTreeMap::default(),
        }
    }

    /// Creates a delayed-message exchange definition with direct inner
    /// routing, as used by the delayed-message retry strategy.
    pub fn delayed_message(name: impl Into<String>) -> ExchangeDefinition {
        let mut params = BTreeMap::default();
        params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from("direct")),
        );

        ExchangeDefinition {
            name: name.into(),
            kind: ExchangeKind::XMessageDelayed,
            options: None,
            params,
        }
    }

    /// Overrides the configured default declaration options.
    pub fn options(mut self, options: ExchangeOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// The exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_durable_and_kept() {
        let options = ExchangeOptions::default();

        assert!(options.durable);
        assert!(!options.auto_delete);
    }

    #[test]
    fn delayed_message_definition_names_inner_routing() {
        let def = ExchangeDefinition::delayed_message("delays");

        assert_eq!(def.kind, ExchangeKind::XMessageDelayed);
        assert_eq!(
            def.params.get(&ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE)),
            Some(&AMQPValue::LongString(LongString::from("direct")))
        );
        assert_eq!(
            lapin::ExchangeKind::from(&def.kind),
            lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
        );
    }
}
