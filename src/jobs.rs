// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Background jobs of the travel backend, tagged by their `type` field.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TravelJob {
    WelcomeEmail {
        to: String,
    },
    TripReminder {
        trip_id: String,
        to: String,
        departs_at: String,
    },
    PhotoProcessing {
        photo_id: String,
        trip_id: String,
    },
    PaymentReceipt {
        payment_id: String,
        to: String,
    },
}

impl TravelJob {
    /// Queue domain the job is published to, see [`crate::topology::queue_name`].
    pub fn domain(&self) -> &'static str {
        match self {
            TravelJob::WelcomeEmail { .. } | TravelJob::PaymentReceipt { .. } => "email",
            TravelJob::TripReminder { .. } => "notification",
            TravelJob::PhotoProcessing { .. } => "photo",
        }
    }

    /// Value sent as the AMQP message type.
    pub fn kind(&self) -> &'static str {
        match self {
            TravelJob::WelcomeEmail { .. } => "welcome_email",
            TravelJob::TripReminder { .. } => "trip_reminder",
            TravelJob::PhotoProcessing { .. } => "photo_processing",
            TravelJob::PaymentReceipt { .. } => "payment_receipt",
        }
    }
}
