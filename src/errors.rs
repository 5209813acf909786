// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Layer
//!
//! This module provides the error taxonomy for broker operations. The `AmqpError`
//! enum covers connection supervision, channel pooling, topology declaration,
//! publishing and consuming. Business failures raised by job handlers live in
//! [`crate::handler::HandlerError`] instead.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connection and channel failures are absorbed and retried internally; only
/// `PermanentConnectionFailure` and `ConnectionClosed` reach API callers once
/// the manager has given up or was shut down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// No live connection exists to create a channel on
    #[error("connection unavailable")]
    ConnectionUnavailable,

    /// The connection manager exhausted its attempts and will not retry
    #[error("connection permanently failed after {0} attempts")]
    PermanentConnectionFailure(u32),

    /// The connection was explicitly closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Error creating or preparing a channel
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding queue `{0}` to exchange `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// A queue was already declared with different parameters
    #[error("conflicting topology for queue `{0}`")]
    TopologyConflict(String),

    /// Error serializing a job before publishing
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// The broker did not confirm a publish in time, or nacked it
    #[error("publish to `{0}` not confirmed")]
    PublishNotConfirmed(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// A consumer is already registered for the queue in this process
    #[error("queue `{0}` already has an active consumer")]
    ConsumerAlreadyRegistered(String),

    /// Graceful shutdown did not finish in time
    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Errors raised while reading configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
}
