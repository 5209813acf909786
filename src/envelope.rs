// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Envelope
//!
//! A job travels as its JSON body plus an optional `retryCount` field that only
//! the retry coordinator reads and writes. The body itself is typed: decoding
//! validates it against the job schema, and any failure there is permanent.
//!
//! The AMQP properties a job was delivered with (message type and headers) are
//! kept next to the body, outside the wire format, so a retried copy is
//! published with the same metadata.

use crate::{errors::AmqpError, publisher::PublishOptions};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<J> {
    #[serde(flatten)]
    pub job: J,

    #[serde(rename = "retryCount", default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    /// Message type and headers of the delivery.
    #[serde(skip)]
    pub options: PublishOptions,
}

impl<J> Envelope<J> {
    pub fn new(job: J) -> Self {
        Envelope {
            job,
            retry_count: None,
            options: PublishOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PublishOptions) -> Self {
        self.options = options;
        self
    }

    /// The attempt number a republished copy of this job would carry.
    pub fn next_attempt(&self) -> u32 {
        self.retry_count.unwrap_or(0).saturating_add(1)
    }

    /// Same job body and properties, with `retryCount` set to `attempt`.
    pub fn with_retry_count(&self, attempt: u32) -> Self
    where
        J: Clone,
    {
        Envelope {
            job: self.job.clone(),
            retry_count: Some(attempt),
            options: self.options.clone(),
        }
    }
}

impl<J: DeserializeOwned> Envelope<J> {
    pub fn decode(payload: &[u8]) -> Result<Self, AmqpError> {
        serde_json::from_slice(payload).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}

impl<J: Serialize> Envelope<J> {
    pub fn encode(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|err| AmqpError::SerializePayloadError(err.to_string()))
    }
}
