// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Pub/Sub Broker Integration
//!
//! This module provides the error taxonomy for the broker integration engine.
//! The `AmqpError` enum covers connection and channel lifecycle, topology
//! assertion, publishing, acknowledgement, retry republishing and handler
//! execution failures. Transport errors are recoverable by design; topology
//! errors surface to the caller of the initiating operation.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QosDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindQueueError(String, String),

    /// Error publishing a message to the given exchange
    #[error("failure to publish to exchange `{0}`")]
    PublishingError(String),

    /// Broker negatively confirmed a published message
    #[error("publish to exchange `{0}` was nacked by the broker")]
    PublishNackedError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error republishing a message for a delayed retry
    #[error("failure to republish message for retry `{0}`")]
    RequeueMessageError(String),

    /// Error declaring a consumer on the given queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerError(String),

    /// The in-process handler signalled a failure
    #[error("handler execution failure `{0}`")]
    HandlerError(String),

    /// Invalid configuration detected at registration time
    #[error("invalid pub/sub setup: {0}")]
    SetupError(String),
}
