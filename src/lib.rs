// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable asynchronous job messaging over RabbitMQ for the travel backend.
//!
//! [`client::MessagingClient`] ties together connection supervision,
//! dead-letter topology, confirmed publishing, bounded-concurrency consumers
//! and application-level retries.

mod otel;

pub mod backoff;
pub mod channel;
pub mod client;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod handler;
pub mod jobs;
pub mod publisher;
pub mod retry;
pub mod topology;
pub mod traces;
