// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Handler Contract
//!
//! A handler receives a decoded job and answers with:
//! - `Ok(true)`: processed, the delivery is acknowledged
//! - `Ok(false)`: business rejection, the delivery is rejected
//! - `Err(_)`: failure, the delivery is rejected
//!
//! Rejected deliveries go to the queue's DLQ unless a
//! [`crate::retry::RetryCoordinator`] wrapping the handler republishes them.

use crate::envelope::Envelope;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    /// Failure that retrying cannot fix.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        HandlerError::Permanent(reason.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Permanent(_))
    }
}

#[async_trait]
pub trait JobHandler<J: Send + Sync>: Send + Sync {
    async fn handle(&self, envelope: &Envelope<J>) -> Result<bool, HandlerError>;
}
