// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Turns one delivery into exactly one acknowledgment decision:
//! 1. Decode the payload. A payload that does not match the job schema is
//!    rejected without requeue and never reaches the handler.
//! 2. Run the handler.
//! 3. `Ok(true)` acks; `Ok(false)`, `Err(_)` and a panic reject without
//!    requeue, so the broker dead-letters the delivery. Retrying is the
//!    business of a [`crate::retry::RetryCoordinator`], never of broker
//!    redelivery.
//!
//! The handler runs with the consumer span as the current OpenTelemetry
//! context, so anything it publishes is parented on the delivery's trace.

use crate::{
    envelope::Envelope,
    errors::AmqpError,
    handler::JobHandler,
    otel,
    publisher::PublishOptions,
};
pub use crate::otel::Headers;
use async_trait::async_trait;
use futures_util::FutureExt as _;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
};
use opentelemetry::trace::{FutureExt as _, Status, TraceContextExt};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, panic::AssertUnwindSafe};
use tracing::{debug, error, warn};

/// A delivery as seen by the consumer loop.
#[async_trait]
pub trait InboundDelivery: Send + Sync {
    fn payload(&self) -> &[u8];

    fn headers(&self) -> Headers {
        Headers::default()
    }

    /// The AMQP `type` property.
    fn message_type(&self) -> Option<String> {
        None
    }

    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects without requeue.
    async fn reject(&self) -> Result<(), AmqpError>;
}

#[async_trait]
impl InboundDelivery for Delivery {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    fn headers(&self) -> Headers {
        self.properties
            .headers()
            .as_ref()
            .map(|table| table.inner().clone())
            .unwrap_or_default()
    }

    fn message_type(&self) -> Option<String> {
        self.properties.kind().as_ref().map(|kind| kind.to_string())
    }

    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    /// Payload did not decode; rejected straight to the DLQ.
    Malformed,
    /// Handler returned `false`.
    Refused,
    /// Handler returned an error.
    Failed,
}

impl Disposition {
    pub fn is_ack(self) -> bool {
        self == Disposition::Acked
    }
}

/// Processes one delivery with `handler` and settles it with the broker.
///
/// # Parameters
/// * `queue` - Name of the consumed queue, used for logs and the span name
/// * `delivery` - The delivery to decode, handle and settle
/// * `handler` - The job handler
///
/// # Returns
/// How the delivery was settled, or the error raised while acking/rejecting it
pub async fn consume<J, H, D>(
    queue: &str,
    delivery: &D,
    handler: &H,
) -> Result<Disposition, AmqpError>
where
    J: DeserializeOwned + Send + Sync,
    H: JobHandler<J> + ?Sized,
    D: InboundDelivery + ?Sized,
{
    let headers = delivery.headers();
    let (parent, span) = otel::consumer_span(&headers, queue);
    let ctx = parent.with_span(span);
    let span = ctx.span();

    let envelope = match Envelope::<J>::decode(delivery.payload()) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(queue, error = err.to_string(), "rejecting malformed message");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("malformed payload"),
            });
            delivery.reject().await?;
            return Ok(Disposition::Malformed);
        }
    };
    let envelope =
        envelope.with_options(PublishOptions::from_delivery(delivery.message_type(), &headers));

    debug!(queue, retry_count = ?envelope.retry_count, "received");

    let outcome = AssertUnwindSafe(handler.handle(&envelope))
        .catch_unwind()
        .with_context(ctx.clone())
        .await;

    let disposition = match outcome {
        Ok(Ok(true)) => Disposition::Acked,
        Ok(Ok(false)) => {
            warn!(queue, "handler refused the message");
            Disposition::Refused
        }
        Ok(Err(err)) => {
            error!(queue, error = err.to_string(), "error whiling handling msg");
            span.record_error(&err);
            Disposition::Failed
        }
        Err(_) => {
            error!(queue, "handler panicked");
            Disposition::Failed
        }
    };

    if disposition.is_ack() {
        debug!(queue, "message successfully processed");
        delivery.ack().await?;
        span.set_status(Status::Ok);
    } else {
        delivery.reject().await?;
        span.set_status(Status::Error {
            description: Cow::from("message rejected"),
        });
    }

    Ok(disposition)
}
