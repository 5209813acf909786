// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Log subscriber setup.

use crate::configs::{AppConfigs, LogFormat};
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Installs the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Does nothing when a
/// subscriber is already installed.
pub fn init(cfg: &AppConfigs) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = match cfg.log_format {
        LogFormat::Json => fmt::layer().json().with_current_span(false).boxed(),
        LogFormat::Pretty => fmt::layer().with_target(true).boxed(),
    };

    if tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .is_ok()
    {
        debug!(app = cfg.name, "tracing initialized");
    }
}
