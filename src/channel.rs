// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Pool
//!
//! Channels are cached per purpose: one for topology setup, one for publishing
//! and one for consuming, each scoped to a queue. The pool creates a channel
//! lazily on first use, hands the same channel to every later caller, and drops
//! it as soon as it is observed closed so the next request builds a fresh one.

use crate::errors::AmqpError;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::OnceCell;
use tracing::debug;

/// What a pooled channel is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Setup,
    Publish,
    Consume,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Setup => f.write_str("setup"),
            ChannelRole::Publish => f.write_str("publish"),
            ChannelRole::Consume => f.write_str("consume"),
        }
    }
}

/// Pool key, rendered as `<role>:<queue>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub role: ChannelRole,
    pub queue: String,
}

impl ChannelKey {
    /// Builds the pool key of a channel.
    ///
    /// # Parameters
    /// * `role` - What the channel is used for
    /// * `queue` - Queue the channel serves
    ///
    /// # Returns
    /// A key equal to any other key with the same role and queue
    pub fn new(role: ChannelRole, queue: &str) -> Self {
        ChannelKey {
            role,
            queue: queue.to_owned(),
        }
    }

    pub fn setup(queue: &str) -> Self {
        ChannelKey::new(ChannelRole::Setup, queue)
    }

    pub fn publish(queue: &str) -> Self {
        ChannelKey::new(ChannelRole::Publish, queue)
    }

    pub fn consume(queue: &str) -> Self {
        ChannelKey::new(ChannelRole::Consume, queue)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.queue)
    }
}

/// A channel the pool can check for liveness.
pub trait PooledChannel: Send + Sync + 'static {
    fn is_open(&self) -> bool;
}

impl PooledChannel for lapin::Channel {
    fn is_open(&self) -> bool {
        self.status().connected()
    }
}

type Slot<C> = Arc<OnceCell<Arc<C>>>;

/// Per-purpose channel cache.
///
/// Lookup and slot insertion happen under one lock with no await in between,
/// so concurrent requests for the same key share a single creation.
pub struct ChannelPool<C> {
    slots: Mutex<HashMap<ChannelKey, Slot<C>>>,
}

impl<C> Default for ChannelPool<C> {
    fn default() -> Self {
        ChannelPool {
            slots: Mutex::new(HashMap::default()),
        }
    }
}

impl<C: PooledChannel> ChannelPool<C> {
    pub fn new() -> Self {
        ChannelPool::default()
    }

    /// Returns the cached open channel for `key`, or creates it with `create`.
    ///
    /// A failed creation leaves the slot empty; the next call tries again.
    ///
    /// # Parameters
    /// * `key` - Role and queue the channel serves
    /// * `create` - Opens a new channel; only one caller runs it per key
    ///
    /// # Returns
    /// The pooled channel or the error returned by `create`
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &ChannelKey,
        create: F,
    ) -> Result<Arc<C>, AmqpError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, AmqpError>>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

            let stale = slots
                .get(key)
                .and_then(|slot| slot.get())
                .is_some_and(|channel| !channel.is_open());

            if stale {
                debug!(key = %key, "evicting closed channel");
                slots.remove(key);
            }

            slots.entry(key.clone()).or_default().clone()
        };

        slot.get_or_try_init(|| async {
            debug!(key = %key, "creating channel");
            create().await.map(Arc::new)
        })
        .await
        .cloned()
    }

    /// Drops the entry for `key`, returning the channel if one was created.
    pub fn evict(&self, key: &ChannelKey) -> Option<Arc<C>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .remove(key)
            .and_then(|slot| slot.get().cloned())
    }

    /// Empties the pool, returning every created channel.
    pub fn drain(&self) -> Vec<Arc<C>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
