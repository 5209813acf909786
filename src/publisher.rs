// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Job Publisher
//!
//! Jobs are published as persistent JSON messages through the default exchange
//! straight to their queue, on a publish channel taken from the pool. Publish
//! channels run in confirm mode and every publish waits for the broker's
//! confirm, bounded by a timeout, so a `true` result means the broker took the
//! message. Failures are logged and reported as `false`, never raised.

use crate::{
    channel::ChannelKey,
    connection::ConnectionManager,
    envelope::Envelope,
    errors::AmqpError,
    otel::{self, Headers},
    topology::TopologyConfigurator,
};
use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    types::{AMQPValue, Boolean, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
#[cfg(test)]
use mockall::automock;
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode marking a message persistent
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Header value types accepted by [`PublishOptions`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl HeaderValue {
    /// Maps the scalar AMQP types back; tables, arrays and other values yield `None`.
    pub fn from_amqp(value: &AMQPValue) -> Option<HeaderValue> {
        match value {
            AMQPValue::LongString(v) => Some(HeaderValue::String(v.to_string())),
            AMQPValue::ShortString(v) => Some(HeaderValue::String(v.to_string())),
            AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
            AMQPValue::ShortShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::ShortShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::ShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::ShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::LongInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::LongUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
            _ => None,
        }
    }
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(Boolean::from(v)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    /// Sent as the AMQP `type` property.
    pub message_type: Option<String>,
    pub headers: HashMap<String, HeaderValue>,
}

impl PublishOptions {
    pub fn message_type(mut self, kind: &str) -> Self {
        self.message_type = Some(kind.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    /// Rebuilds the options a message was published with from its delivery
    /// properties.
    ///
    /// # Parameters
    /// * `message_type` - The AMQP `type` property, if any
    /// * `headers` - The delivery headers; non-scalar values are dropped
    pub fn from_delivery(message_type: Option<String>, headers: &Headers) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                HeaderValue::from_amqp(value).map(|value| (name.to_string(), value))
            })
            .collect();

        PublishOptions {
            message_type,
            headers,
        }
    }
}

/// Publishes serialized jobs to a queue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Returns whether the broker accepted the message.
    async fn publish(&self, queue: &str, payload: &[u8], options: &PublishOptions) -> bool;
}

/// Serializes `envelope` and publishes it; serialization failures count as a failed publish.
pub async fn publish_envelope<J: Serialize>(
    publisher: &dyn JobPublisher,
    queue: &str,
    envelope: &Envelope<J>,
    options: &PublishOptions,
) -> bool {
    match envelope.encode() {
        Ok(payload) => publisher.publish(queue, &payload, options).await,
        Err(err) => {
            error!(error = err.to_string(), queue, "error serializing job");
            false
        }
    }
}

pub struct RabbitMQPublisher {
    manager: Arc<ConnectionManager>,
    topology: Arc<TopologyConfigurator>,
    confirm_timeout: Duration,
}

impl RabbitMQPublisher {
    /// Creates the publisher.
    ///
    /// # Parameters
    /// * `manager` - Connection manager providing the publish channels
    /// * `topology` - Configurator used to assert the target queue on new channels
    /// * `confirm_timeout` - How long a publish waits for the broker's confirm
    ///
    /// # Returns
    /// An Arc-wrapped publisher, shareable as `Arc<dyn JobPublisher>`
    pub fn new(
        manager: Arc<ConnectionManager>,
        topology: Arc<TopologyConfigurator>,
        confirm_timeout: Duration,
    ) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            manager,
            topology,
            confirm_timeout,
        })
    }

    /// Publishes a fresh job (no `retryCount`).
    ///
    /// # Parameters
    /// * `queue` - Target queue
    /// * `job` - Job serialized as the message body
    /// * `options` - Message type and extra headers
    ///
    /// # Returns
    /// `true` when the broker confirmed the message
    pub async fn publish_job<J: Serialize + Sync>(
        &self,
        queue: &str,
        job: &J,
        options: &PublishOptions,
    ) -> bool {
        match serde_json::to_vec(job) {
            Ok(payload) => self.publish(queue, &payload, options).await,
            Err(err) => {
                error!(error = err.to_string(), queue, "error serializing job");
                false
            }
        }
    }

    async fn try_publish(
        &self,
        queue: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let key = ChannelKey::publish(queue);
        let topology = &self.topology;

        let channel = self
            .manager
            .channel(&key, |channel| async move {
                channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await
                    .map_err(|err| AmqpError::ChannelError(err.to_string()))?;
                topology.assert_queue(&channel, queue).await?;
                Ok(channel)
            })
            .await?;

        let properties = message_properties(options);
        let confirm = match channel
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await
        {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(error = err.to_string(), queue, "error publishing message");
                self.manager.evict_channel(&key);
                return Err(AmqpError::PublishingError(queue.to_owned()));
            }
        };

        match tokio::time::timeout(self.confirm_timeout, confirm).await {
            Ok(Ok(Confirmation::Nack(_))) => {
                warn!(queue, "broker nacked the message");
                Err(AmqpError::PublishNotConfirmed(queue.to_owned()))
            }
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => {
                error!(error = err.to_string(), queue, "error awaiting publisher confirm");
                self.manager.evict_channel(&key);
                Err(AmqpError::PublishingError(queue.to_owned()))
            }
            Err(_) => {
                warn!(queue, timeout = ?self.confirm_timeout, "publisher confirm timed out");
                Err(AmqpError::PublishNotConfirmed(queue.to_owned()))
            }
        }
    }
}

/// Persistent JSON properties carrying the message type, the extra headers
/// and the current trace context.
fn message_properties(options: &PublishOptions) -> BasicProperties {
    let mut headers = Headers::default();
    for (name, value) in options.headers.clone() {
        headers.insert(ShortString::from(name), value.into());
    }
    otel::inject(&Context::current(), &mut headers);

    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(headers));

    match &options.message_type {
        Some(kind) => properties.with_type(ShortString::from(kind.clone())),
        None => properties,
    }
}

#[async_trait]
impl JobPublisher for RabbitMQPublisher {
    async fn publish(&self, queue: &str, payload: &[u8], options: &PublishOptions) -> bool {
        match self.try_publish(queue, payload, options).await {
            Ok(()) => {
                debug!(queue, bytes = payload.len(), "message published");
                true
            }
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to publish");
                false
            }
        }
    }
}
