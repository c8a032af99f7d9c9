// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgement Policy Engine
//!
//! Four interchangeable strategies wrap the handler invocation and decide
//! ack/nack/requeue behavior. The strategy is selected once per handler at
//! registration time and applied to every delivery. The decision is always
//! made after the invocation completes, never preemptively.
//!
//! Retry bookkeeping runs only on handler failure; a successful invocation
//! under `AutoRetry` acknowledges immediately without consulting the retry
//! counters.

use crate::{
    channel::AmqpOps,
    errors::AmqpError,
    handler::{AckMode, DispatchSink, ExhaustionCallback},
    message::{Acknowledger, DeliveredEvent, DisabledAcker},
    retry::{retry_strategy, RetryPolicy, RetryStrategy},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};

/// Wraps a handler invocation with its acknowledgement behavior.
#[async_trait]
pub(crate) trait AckStrategy: Send + Sync {
    /// Dispatches one delivered event through the sink and settles the
    /// delivery according to the policy.
    async fn dispatch(
        &self,
        sink: &dyn DispatchSink,
        event: DeliveredEvent,
        acker: Arc<dyn Acknowledger>,
    ) -> Result<(), AmqpError>;
}

/// Builds the strategy a handler was registered with.
pub(crate) fn ack_strategy(
    mode: AckMode,
    handler: &str,
    queue: &str,
    retry: RetryPolicy,
    on_exhausted: Option<ExhaustionCallback>,
    ops: Arc<dyn AmqpOps>,
) -> Arc<dyn AckStrategy> {
    match mode {
        AckMode::AlwaysAck => Arc::new(AlwaysAck {
            handler: handler.to_owned(),
        }),
        AckMode::AckAndNack => Arc::new(AckAndNack {
            handler: handler.to_owned(),
        }),
        AckMode::Never => Arc::new(ManualAck),
        AckMode::AutoRetry => Arc::new(AutoRetry {
            handler: handler.to_owned(),
            queue: queue.to_owned(),
            strategy: retry_strategy(retry.strategy),
            retry,
            on_exhausted,
            ops,
        }),
    }
}

/// Positive acknowledge after the handler completes, success or failure.
struct AlwaysAck {
    handler: String,
}

#[async_trait]
impl AckStrategy for AlwaysAck {
    async fn dispatch(
        &self,
        sink: &dyn DispatchSink,
        event: DeliveredEvent,
        acker: Arc<dyn Acknowledger>,
    ) -> Result<(), AmqpError> {
        let event = event.with_acknowledger(Arc::new(DisabledAcker::new(self.handler.clone())));

        if let Err(err) = sink.publish_locally(event).await {
            error!(
                error = err.to_string(),
                handler = self.handler,
                "handler failed, message is acknowledged regardless"
            );
        }

        acker.ack().await
    }
}

/// Ack on success, nack without requeue on failure; the handler failure is
/// propagated to the caller for visibility.
struct AckAndNack {
    handler: String,
}

#[async_trait]
impl AckStrategy for AckAndNack {
    async fn dispatch(
        &self,
        sink: &dyn DispatchSink,
        event: DeliveredEvent,
        acker: Arc<dyn Acknowledger>,
    ) -> Result<(), AmqpError> {
        let event = event.with_acknowledger(Arc::new(DisabledAcker::new(self.handler.clone())));

        match sink.publish_locally(event).await {
            Ok(()) => acker.ack().await,
            Err(err) => {
                acker.nack(false).await?;
                Err(AmqpError::HandlerError(err.to_string()))
            }
        }
    }
}

/// No automatic acknowledgement; the event carries the live channel
/// operations and the handler is fully responsible.
struct ManualAck;

#[async_trait]
impl AckStrategy for ManualAck {
    async fn dispatch(
        &self,
        sink: &dyn DispatchSink,
        event: DeliveredEvent,
        acker: Arc<dyn Acknowledger>,
    ) -> Result<(), AmqpError> {
        let event = event.with_acknowledger(acker);

        sink.publish_locally(event)
            .await
            .map_err(|err| AmqpError::HandlerError(err.to_string()))
    }
}

/// On failure, delegate to the retry engine, then acknowledge the original
/// delivery once the retry decision is made.
struct AutoRetry {
    handler: String,
    queue: String,
    retry: RetryPolicy,
    strategy: Arc<dyn RetryStrategy>,
    on_exhausted: Option<ExhaustionCallback>,
    ops: Arc<dyn AmqpOps>,
}

#[async_trait]
impl AckStrategy for AutoRetry {
    async fn dispatch(
        &self,
        sink: &dyn DispatchSink,
        event: DeliveredEvent,
        acker: Arc<dyn Acknowledger>,
    ) -> Result<(), AmqpError> {
        let event = event.with_acknowledger(Arc::new(DisabledAcker::new(self.handler.clone())));

        if let Err(err) = sink.publish_locally(event.clone()).await {
            if event.retry_count() >= self.retry.max_attempts {
                if let Some(callback) = &self.on_exhausted {
                    callback(&event, &err);
                }

                warn!(
                    error = err.to_string(),
                    handler = self.handler,
                    queue = self.queue,
                    event = event.name(),
                    retry_count = event.retry_count(),
                    payload = event.payload().to_string(),
                    "retry attempts exhausted, discarding message"
                );
            } else if let Err(requeue_err) = self
                .strategy
                .requeue(self.ops.as_ref(), &self.queue, &self.retry, &event)
                .await
            {
                error!(
                    error = requeue_err.to_string(),
                    handler = self.handler,
                    queue = self.queue,
                    event = event.name(),
                    "failure to republish message for retry"
                );
            }
        }

        acker.ack().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAmqpOps;
    use crate::handler::{HandlerError, MockDispatchSink};
    use crate::message::MockAcknowledger;
    use crate::retry::{RetryDelay, RetryStrategyKind, RETRY_DELAY_EXCHANGE_NAME};
    use lapin::protocol::basic::AMQPProperties;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn delivered(retry_count: u32) -> DeliveredEvent {
        DeliveredEvent::new(
            "UserCreated",
            "user.created",
            "users",
            json!({"id": "1"}),
            br#"{"id":"1"}"#.to_vec(),
            retry_count,
            AMQPProperties::default(),
        )
    }

    fn failing_sink() -> MockDispatchSink {
        let mut sink = MockDispatchSink::new();
        sink.expect_publish_locally()
            .returning(|_| Err::<(), HandlerError>("boom".into()));
        sink
    }

    fn succeeding_sink() -> MockDispatchSink {
        let mut sink = MockDispatchSink::new();
        sink.expect_publish_locally().returning(|_| Ok(()));
        sink
    }

    fn acker_expecting_ack() -> Arc<MockAcknowledger> {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        Arc::new(acker)
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: RetryDelay::Fixed(Duration::from_secs(1)),
            strategy: RetryStrategyKind::DeadLetterTtl,
        }
    }

    fn auto_retry(max_attempts: u32, ops: MockAmqpOps) -> AutoRetry {
        AutoRetry {
            handler: "NotifyUserHandler".to_owned(),
            queue: "orders:notify_user".to_owned(),
            retry: policy(max_attempts),
            strategy: retry_strategy(RetryStrategyKind::DeadLetterTtl),
            on_exhausted: None,
            ops: Arc::new(ops),
        }
    }

    #[tokio::test]
    async fn always_ack_acknowledges_on_success() {
        let strategy = AlwaysAck {
            handler: "NotifyUserHandler".to_owned(),
        };

        strategy
            .dispatch(&succeeding_sink(), delivered(0), acker_expecting_ack())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn always_ack_acknowledges_on_failure_too() {
        let strategy = AlwaysAck {
            handler: "NotifyUserHandler".to_owned(),
        };

        strategy
            .dispatch(&failing_sink(), delivered(0), acker_expecting_ack())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ack_and_nack_acknowledges_success() {
        let strategy = AckAndNack {
            handler: "NotifyUserHandler".to_owned(),
        };

        strategy
            .dispatch(&succeeding_sink(), delivered(0), acker_expecting_ack())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ack_and_nack_nacks_and_propagates_failure() {
        let mut acker = MockAcknowledger::new();
        acker
            .expect_nack()
            .withf(|requeue| !*requeue)
            .times(1)
            .returning(|_| Ok(()));

        let strategy = AckAndNack {
            handler: "NotifyUserHandler".to_owned(),
        };

        let err = strategy
            .dispatch(&failing_sink(), delivered(0), Arc::new(acker))
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::HandlerError(_)));
    }

    #[tokio::test]
    async fn manual_mode_performs_no_automatic_acknowledgement() {
        // Neither ack nor nack is expected on the channel operations.
        let acker = Arc::new(MockAcknowledger::new());

        ManualAck
            .dispatch(&succeeding_sink(), delivered(0), acker)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn manual_mode_wires_the_event_to_the_live_channel() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|| Ok(()));

        let captured: Arc<std::sync::Mutex<Option<DeliveredEvent>>> =
            Arc::new(std::sync::Mutex::new(None));
        let slot = captured.clone();

        let mut sink = MockDispatchSink::new();
        sink.expect_publish_locally().returning(move |event| {
            *slot.lock().unwrap() = Some(event);
            Ok(())
        });

        ManualAck
            .dispatch(&sink, delivered(0), Arc::new(acker))
            .await
            .unwrap();

        let event = captured.lock().unwrap().take().unwrap();
        event.ack().await.unwrap();
    }

    #[tokio::test]
    async fn auto_retry_success_acks_without_retry_bookkeeping() {
        let ops = MockAmqpOps::new();
        let strategy = auto_retry(3, ops);

        strategy
            .dispatch(&succeeding_sink(), delivered(0), acker_expecting_ack())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn auto_retry_republishes_while_attempts_remain() {
        let mut ops = MockAmqpOps::new();
        ops.expect_publish()
            .withf(|exchange, routing_key, _, _| {
                exchange == RETRY_DELAY_EXCHANGE_NAME
                    && routing_key == "orders:notify_user.retry.1000"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let strategy = auto_retry(3, ops);

        strategy
            .dispatch(&failing_sink(), delivered(2), acker_expecting_ack())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn auto_retry_discards_when_attempts_are_exhausted() {
        // No publish expectation: the message must not be republished.
        let ops = MockAmqpOps::new();
        let strategy = auto_retry(3, ops);

        strategy
            .dispatch(&failing_sink(), delivered(3), acker_expecting_ack())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exhaustion_callback_runs_before_the_discard() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let ops = MockAmqpOps::new();
        let mut strategy = auto_retry(3, ops);
        strategy.on_exhausted = Some(Arc::new(
            move |event: &DeliveredEvent, _err: &HandlerError| {
                assert_eq!(event.retry_count(), 3);
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ));

        strategy
            .dispatch(&failing_sink(), delivered(3), acker_expecting_ack())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auto_retry_republish_decisions_across_a_message_lifetime() {
        // With three configured attempts a poisoned message is dispatched
        // four times in total: retry counts 0, 1 and 2 republish, 3 discards.
        for retry_count in 0..=2 {
            let mut ops = MockAmqpOps::new();
            ops.expect_publish().times(1).returning(|_, _, _, _| Ok(()));

            auto_retry(3, ops)
                .dispatch(&failing_sink(), delivered(retry_count), acker_expecting_ack())
                .await
                .unwrap();
        }

        let ops = MockAmqpOps::new();
        auto_retry(3, ops)
            .dispatch(&failing_sink(), delivered(3), acker_expecting_ack())
            .await
            .unwrap();
    }
}
