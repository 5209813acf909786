// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Context Propagation
//!
//! Carries the OpenTelemetry context in AMQP headers: injected when a job is
//! published (including retry republishes) and extracted into a consumer span
//! when it is delivered.

use lapin::types::{AMQPValue, LongString, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

pub type Headers = BTreeMap<ShortString, AMQPValue>;

/// Adapter exposing AMQP headers to the OpenTelemetry propagator.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key) {
            Some(AMQPValue::LongString(value)) => std::str::from_utf8(value.as_bytes()).ok(),
            Some(AMQPValue::ShortString(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the given context into `headers`.
pub(crate) fn inject(ctx: &Context, headers: &mut Headers) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(headers))
    });
}

/// Starts a consumer span parented on the context carried in `headers`.
pub(crate) fn consumer_span(headers: &Headers, queue: &str) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let tracer = global::tracer("amqp consumer");
    let span = tracer
        .span_builder(Cow::from(format!("{queue} process")))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &ctx);

    (ctx, span)
}
