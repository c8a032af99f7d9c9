// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Message Routing
//!
//! Every delivery is matched against the handler's declared events in
//! strict order: an exact exchange/routing-key match first, then a fallback
//! on the events' binding patterns with `*` matching exactly one word and
//! `#` matching any number of words. A message nothing matches is
//! acknowledged and logged; it must not be redelivered forever for a
//! binding the handler no longer declares. When several events match, the
//! first declared wins and the unused alternatives are reported, since that
//! signals an ambiguous event-naming configuration.
//!
//! The exchange compared against is the `origin-exchange` header when
//! present, so messages funnelled through the retry infrastructure still
//! match the events of the exchange they were originally delivered from.

use crate::{
    dispatcher::BoundHandler,
    errors::AmqpError,
    event::{EventDescriptor, FAN_OUT_BINDING},
    handler::DispatchSink,
    message::{
        header_retry_count, message_type, origin_exchange, DeliveredEvent, DeliveryAcker,
    },
    otel,
};
use lapin::{
    message::Delivery, options::BasicAckOptions, protocol::basic::AMQPProperties,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use regex::Regex;
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// Outcome of routing one delivery against a handler's declared events.
pub(crate) enum Routed {
    /// The message matched and is ready for policy-wrapped dispatch.
    Dispatch(DeliveredEvent),
    /// The message is terminal here and must be positively acknowledged.
    Discard,
}

/// Consumes one delivery: routes it, dispatches a match through the
/// handler's acknowledgement policy, and acknowledges terminal messages.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: Delivery,
    bound: &BoundHandler,
    sink: &dyn DispatchSink,
) -> Result<(), AmqpError> {
    let Delivery {
        exchange,
        properties,
        data,
        acker,
        ..
    } = delivery;

    debug!(
        queue = bound.queue,
        exchange = exchange.as_str(),
        "message received"
    );

    match route_message(&bound.handler, &bound.events, exchange.as_str(), &properties, data) {
        Routed::Discard => acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to ack discarded message");
                AmqpError::AckMessageError
            }),
        Routed::Dispatch(event) => {
            let (_context, mut span) =
                otel::consumer_span(event.properties(), tracer, event.routing_key());

            let result = bound
                .strategy
                .dispatch(sink, event, Arc::new(DeliveryAcker::new(acker)))
                .await;

            match &result {
                Ok(()) => span.set_status(Status::Ok),
                Err(err) => {
                    span.record_error(err);
                    span.set_status(Status::Error {
                        description: Cow::from("failure to dispatch message"),
                    });
                }
            }

            result
        }
    }
}

/// Routes one message against the handler's declared events.
pub(crate) fn route_message(
    handler: &str,
    events: &[EventDescriptor],
    delivery_exchange: &str,
    properties: &AMQPProperties,
    data: Vec<u8>,
) -> Routed {
    let Some(msg_type) = message_type(properties) else {
        warn!(
            handler,
            "message with an invalid type property consumed, discarding"
        );
        return Routed::Discard;
    };

    let exchange = origin_exchange(properties, delivery_exchange);
    let matched = match_events(events, &exchange, &msg_type);

    let Some((first, unused)) = matched.split_first() else {
        let bindings: Vec<String> = events
            .iter()
            .map(|event| format!("{}:{}", event.name(), event.binding_pattern()))
            .collect();

        warn!(
            handler,
            message_type = msg_type,
            exchange,
            bindings = bindings.join(", "),
            "no declared event matched, acknowledging; the handler may no longer listen for this type"
        );
        return Routed::Discard;
    };

    if !unused.is_empty() {
        let unused: Vec<&str> = unused.iter().map(|event| event.name()).collect();

        warn!(
            handler,
            message_type = msg_type,
            used = first.name(),
            unused = unused.join(", "),
            "handler event intersection detected"
        );
    }

    let payload: serde_json::Value = match serde_json::from_slice(&data) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(
                error = err.to_string(),
                handler,
                message_type = msg_type,
                "message payload is not valid JSON, discarding"
            );
            return Routed::Discard;
        }
    };

    Routed::Dispatch(DeliveredEvent::new(
        first.name(),
        msg_type,
        exchange,
        payload,
        data,
        header_retry_count(properties),
        properties.clone(),
    ))
}

/// Finds the events matching a message, exact matches strictly first.
pub(crate) fn match_events<'a>(
    events: &'a [EventDescriptor],
    exchange: &str,
    msg_type: &str,
) -> Vec<&'a EventDescriptor> {
    let exact: Vec<&EventDescriptor> = events
        .iter()
        .filter(|event| event.exchange() == exchange && event.routing_key() == msg_type)
        .collect();

    if !exact.is_empty() {
        return exact;
    }

    events
        .iter()
        .filter(|event| {
            if event.exchange() != exchange {
                return false;
            }

            let pattern = event.binding_pattern();
            pattern == FAN_OUT_BINDING || pattern_matches(&pattern, msg_type)
        })
        .collect()
}

/// Checks a routing key against an AMQP topic binding pattern.
pub(crate) fn pattern_matches(pattern: &str, msg_type: &str) -> bool {
    match Regex::new(&binding_pattern_regex(pattern)) {
        Ok(regex) => regex.is_match(msg_type),
        Err(err) => {
            warn!(error = err.to_string(), pattern, "unusable binding pattern");
            false
        }
    }
}

/// Converts a binding pattern to a regular expression: `*` matches exactly
/// one word, `#` any number of words, words delimited by `.`.
fn binding_pattern_regex(pattern: &str) -> String {
    let escaped = pattern
        .split('.')
        .map(|segment| match segment {
            "*" => "[^.]+".to_owned(),
            "#" => "#".to_owned(),
            literal => regex::escape(literal),
        })
        .collect::<Vec<String>>()
        .join("\\.");

    let body = escaped
        .replace("#\\.", "(?:[^.]+\\.)*")
        .replace("\\.#", "(?:\\.[^.]+)*")
        .replace('#', ".*");

    format!("^{body}$")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ORIGIN_EXCHANGE_HEADER, RETRY_COUNT_HEADER};
    use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
    use std::collections::BTreeMap;

    fn typed_properties(msg_type: &str) -> AMQPProperties {
        AMQPProperties::default().with_type(ShortString::from(msg_type))
    }

    #[test]
    fn star_matches_exactly_one_word() {
        assert!(pattern_matches("user.*", "user.created"));
        assert!(!pattern_matches("user.*", "user.profile.updated"));
        assert!(!pattern_matches("user.*", "user"));
        assert!(!pattern_matches("user.*", "store.created"));
    }

    #[test]
    fn hash_matches_any_number_of_words() {
        assert!(pattern_matches("user.#", "user.created"));
        assert!(pattern_matches("user.#", "user.profile.updated"));
        assert!(pattern_matches("user.#", "user"));
        assert!(!pattern_matches("user.#", "store.created"));
        assert!(pattern_matches("#.updated", "user.profile.updated"));
        assert!(pattern_matches("#.updated", "updated"));
    }

    #[test]
    fn literal_patterns_do_not_behave_like_regexes() {
        assert!(pattern_matches("user.created", "user.created"));
        assert!(!pattern_matches("user.created", "userXcreated"));
    }

    #[test]
    fn exact_match_wins_over_pattern_fallback() {
        let events = vec![
            EventDescriptor::new("UserWildcard", "users").with_binding_pattern("user.*"),
            EventDescriptor::new("UserCreated", "users"),
        ];

        let matched = match_events(&events, "users", "user.created");

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name(), "UserCreated");
    }

    #[test]
    fn pattern_fallback_fires_when_nothing_matches_exactly() {
        let events = vec![
            EventDescriptor::new("UserCreated", "users"),
            EventDescriptor::new("UserWildcard", "users").with_binding_pattern("user.*"),
        ];

        let matched = match_events(&events, "users", "user.renamed");

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name(), "UserWildcard");
    }

    #[test]
    fn fanout_events_match_everything_on_their_exchange() {
        let events = vec![EventDescriptor::fanout("AuditTrail", "audit")];

        assert_eq!(match_events(&events, "audit", "anything.at.all").len(), 1);
        assert!(match_events(&events, "users", "anything.at.all").is_empty());
    }

    #[test]
    fn events_of_other_exchanges_never_match() {
        let events = vec![EventDescriptor::new("UserCreated", "users")];

        assert!(match_events(&events, "stores", "user.created").is_empty());
    }

    #[test]
    fn multiple_pattern_matches_keep_declaration_order() {
        let events = vec![
            EventDescriptor::new("UserAnything", "users").with_binding_pattern("user.#"),
            EventDescriptor::new("UserWildcard", "users").with_binding_pattern("user.*"),
        ];

        let matched = match_events(&events, "users", "user.renamed");

        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].name(), "UserAnything");
    }

    #[test]
    fn routing_builds_the_delivered_event() {
        let events = vec![EventDescriptor::new("UserCreated", "users")];

        let routed = route_message(
            "NotifyUserHandler",
            &events,
            "users",
            &typed_properties("user.created"),
            br#"{"id":"1"}"#.to_vec(),
        );

        let Routed::Dispatch(event) = routed else {
            panic!("expected a dispatch");
        };

        assert_eq!(event.name(), "UserCreated");
        assert_eq!(event.routing_key(), "user.created");
        assert_eq!(event.exchange(), "users");
        assert_eq!(event.retry_count(), 0);
        assert_eq!(event.payload()["id"], "1");
    }

    #[test]
    fn unmatched_messages_are_discarded() {
        let events = vec![EventDescriptor::new("UserCreated", "users")];

        let routed = route_message(
            "NotifyUserHandler",
            &events,
            "users",
            &typed_properties("order.created"),
            b"{}".to_vec(),
        );

        assert!(matches!(routed, Routed::Discard));
    }

    #[test]
    fn messages_without_a_type_are_discarded() {
        let events = vec![EventDescriptor::new("UserCreated", "users")];

        let routed = route_message(
            "NotifyUserHandler",
            &events,
            "users",
            &AMQPProperties::default(),
            b"{}".to_vec(),
        );

        assert!(matches!(routed, Routed::Discard));
    }

    #[test]
    fn invalid_json_payloads_are_discarded() {
        let events = vec![EventDescriptor::new("UserCreated", "users")];

        let routed = route_message(
            "NotifyUserHandler",
            &events,
            "users",
            &typed_properties("user.created"),
            b"not json".to_vec(),
        );

        assert!(matches!(routed, Routed::Discard));
    }

    #[test]
    fn origin_exchange_header_survives_retry_rerouting() {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(ORIGIN_EXCHANGE_HEADER),
            AMQPValue::LongString(LongString::from("users")),
        );
        headers.insert(
            ShortString::from(RETRY_COUNT_HEADER),
            AMQPValue::LongInt(LongInt::from(2)),
        );

        let properties = typed_properties("user.created").with_headers(FieldTable::from(headers));
        let events = vec![EventDescriptor::new("UserCreated", "users")];

        let routed = route_message(
            "NotifyUserHandler",
            &events,
            "pubsub.retry.requeue.exchange",
            &properties,
            b"{}".to_vec(),
        );

        let Routed::Dispatch(event) = routed else {
            panic!("expected a dispatch");
        };

        assert_eq!(event.exchange(), "users");
        assert_eq!(event.retry_count(), 2);
    }
}
