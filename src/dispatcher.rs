// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer Dispatcher
//!
//! This module subscribes job handlers to queues. Each subscription gets the
//! queue's consume channel from the pool, a prefetch equal to its concurrency
//! limit, and a task that drains the delivery stream. The same limit bounds the
//! number of handler invocations in flight, so no more than `concurrency`
//! deliveries are ever unacknowledged for one consumer.
//!
//! At most one subscription per queue exists in a process. When the channel
//! under a subscription dies (connection loss, channel error) the task waits for
//! the connection manager to report `Connected` again and resubscribes with the
//! same handler. A stream that ends while its channel is still open was
//! cancelled (by `unsubscribe`, shutdown, or the broker after the queue was
//! deleted); the subscription then removes itself from the registry.

use crate::{
    channel::ChannelKey,
    connection::{ConnectionManager, ConnectionState},
    consumer::{consume, InboundDelivery},
    errors::AmqpError,
    handler::JobHandler,
};
use futures_util::{Stream, StreamExt};
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Consumer,
};
use serde::de::DeserializeOwned;
use std::{
    collections::HashMap,
    fmt::Display,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{watch, Semaphore},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// An active subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRegistration {
    pub queue: String,
    pub concurrency: u16,
    pub consumer_tag: String,
}

/// Why a consumer loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerExit {
    /// The broker ended the stream (cancel, channel close).
    StreamEnded,
    /// The stream yielded an error.
    StreamFailed(String),
}

/// Drains `deliveries`, running at most `concurrency` handlers at a time.
///
/// # Parameters
/// * `queue` - Name of the consumed queue
/// * `deliveries` - Stream of deliveries, as produced by `basic_consume`
/// * `handler` - Handler invoked for every decoded job
/// * `concurrency` - Maximum number of handler invocations in flight
///
/// # Returns
/// Why the stream stopped. Returns only after every in-flight handler settled
/// its delivery.
pub async fn run_consumer<J, H, D, E, S>(
    queue: &str,
    mut deliveries: S,
    handler: Arc<H>,
    concurrency: usize,
) -> ConsumerExit
where
    J: DeserializeOwned + Send + Sync + 'static,
    H: JobHandler<J> + ?Sized + 'static,
    D: InboundDelivery + 'static,
    E: Display,
    S: Stream<Item = Result<D, E>> + Unpin,
{
    let limiter = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut in_flight = JoinSet::new();

    let exit = loop {
        let delivery = match deliveries.next().await {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                error!(queue, error = %err, "errors consume msg");
                break ConsumerExit::StreamFailed(err.to_string());
            }
            None => {
                info!(queue, "delivery stream ended");
                break ConsumerExit::StreamEnded;
            }
        };

        let Ok(permit) = limiter.clone().acquire_owned().await else {
            break ConsumerExit::StreamEnded;
        };

        let handler = handler.clone();
        let queue_name = queue.to_owned();
        in_flight.spawn(async move {
            if let Err(err) = consume::<J, H, D>(&queue_name, &delivery, handler.as_ref()).await {
                error!(queue = queue_name, error = err.to_string(), "error consume msg");
            }
            drop(permit);
        });

        while let Some(joined) = in_flight.try_join_next() {
            if let Err(err) = joined {
                error!(queue, error = err.to_string(), "handler task failed");
            }
        }
    };

    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            error!(queue, error = err.to_string(), "handler task failed");
        }
    }

    exit
}

/// A delivery stream together with a liveness check of the channel it runs on.
pub struct Attachment<S> {
    pub deliveries: S,
    /// Whether the channel under `deliveries` is still open.
    pub alive: Box<dyn Fn() -> bool + Send + Sync>,
}

/// Runs a subscription across channel and connection losses.
///
/// After each stream stops, a subscription whose channel is still alive is
/// considered cancelled and the function returns. Otherwise it waits on
/// `states` for `Connected` and calls `open` for a fresh attachment. `open`
/// answers `Ok(None)` once the subscription is no longer wanted.
///
/// # Parameters
/// * `queue` - Name of the consumed queue
/// * `handler` - Handler shared by every attachment
/// * `concurrency` - Maximum number of handler invocations in flight
/// * `states` - Connection state notifications
/// * `attachment` - The first attachment
/// * `open` - Opens a new attachment once the connection is back
///
/// # Returns
/// Why the last stream stopped
pub async fn supervise<J, H, D, E, S, O, Fut>(
    queue: &str,
    handler: Arc<H>,
    concurrency: usize,
    mut states: watch::Receiver<ConnectionState>,
    mut attachment: Attachment<S>,
    mut open: O,
) -> ConsumerExit
where
    J: DeserializeOwned + Send + Sync + 'static,
    H: JobHandler<J> + ?Sized + 'static,
    D: InboundDelivery + 'static,
    E: Display,
    S: Stream<Item = Result<D, E>> + Unpin + Send,
    O: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Option<Attachment<S>>, AmqpError>> + Send,
{
    loop {
        let deliveries = attachment.deliveries;
        let exit =
            run_consumer::<J, H, D, E, S>(queue, deliveries, handler.clone(), concurrency).await;

        if (attachment.alive)() {
            debug!(queue, "consumer cancelled");
            return exit;
        }

        warn!(queue, "consumer lost its channel, resubscribing once connected");
        match reattach(queue, &mut states, &mut open).await {
            Some(next) => attachment = next,
            None => return exit,
        }
    }
}

async fn reattach<S, O, Fut>(
    queue: &str,
    states: &mut watch::Receiver<ConnectionState>,
    open: &mut O,
) -> Option<Attachment<S>>
where
    O: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<Attachment<S>>, AmqpError>>,
{
    loop {
        let state = *states.borrow_and_update();

        match state {
            ConnectionState::Connected => match open().await {
                Ok(Some(attachment)) => {
                    info!(queue, "consumer resubscribed");
                    return Some(attachment);
                }
                Ok(None) => return None,
                // Connection died but the manager has not noticed yet.
                Err(AmqpError::ConnectionUnavailable) => {}
                Err(err) => {
                    error!(queue, error = err.to_string(), "failure to resubscribe");
                    return None;
                }
            },
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {
                debug!(queue, state = ?state, "connection gone, not resubscribing");
                return None;
            }
            _ => {}
        }

        if states.changed().await.is_err() {
            return None;
        }
    }
}

struct ActiveConsumer {
    registration: ConsumerRegistration,
    channel: Option<Arc<Channel>>,
    task: Option<JoinHandle<()>>,
}

/// Registry enforcing one subscription per queue.
#[derive(Default, Clone)]
pub struct ConsumerRegistry {
    active: Arc<Mutex<HashMap<String, ActiveConsumer>>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        ConsumerRegistry::default()
    }

    /// Claims `queue` for a new subscription.
    ///
    /// # Returns
    /// `ConsumerAlreadyRegistered` when the queue already has a subscription
    pub fn reserve(&self, registration: ConsumerRegistration) -> Result<(), AmqpError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(&registration.queue) {
            return Err(AmqpError::ConsumerAlreadyRegistered(registration.queue));
        }

        active.insert(
            registration.queue.clone(),
            ActiveConsumer {
                registration,
                channel: None,
                task: None,
            },
        );
        Ok(())
    }

    /// Whether the subscription of `queue` is still the one tagged `consumer_tag`.
    pub fn owns(&self, queue: &str, consumer_tag: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active
            .get(queue)
            .is_some_and(|consumer| consumer.registration.consumer_tag == consumer_tag)
    }

    /// Removes the subscription of `queue` if it still carries `consumer_tag`.
    pub fn release(&self, queue: &str, consumer_tag: &str) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.get(queue) {
            Some(consumer) if consumer.registration.consumer_tag == consumer_tag => {
                active.remove(queue);
                true
            }
            _ => false,
        }
    }

    pub fn registrations(&self) -> Vec<ConsumerRegistration> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active
            .values()
            .map(|consumer| consumer.registration.clone())
            .collect()
    }

    fn update<F>(&self, queue: &str, consumer_tag: &str, apply: F)
    where
        F: FnOnce(&mut ActiveConsumer),
    {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.get_mut(queue) {
            Some(consumer) if consumer.registration.consumer_tag == consumer_tag => {
                apply(consumer)
            }
            // The loop already finished and deregistered itself.
            _ => debug!(queue, "consumer no longer registered"),
        }
    }

    fn take(&self, queue: &str) -> Option<ActiveConsumer> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.remove(queue)
    }

    fn take_all(&self) -> Vec<ActiveConsumer> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.drain().map(|(_, consumer)| consumer).collect()
    }
}

/// Subscribes handlers to queues over the managed connection.
pub struct RabbitMQDispatcher {
    manager: Arc<ConnectionManager>,
    registry: ConsumerRegistry,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher consuming over the connection of `manager`.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        RabbitMQDispatcher {
            manager,
            registry: ConsumerRegistry::new(),
        }
    }

    /// Starts consuming `queue` with at most `concurrency` unacknowledged deliveries.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume; it must already be declared
    /// * `handler` - Handler invoked for every delivery
    /// * `concurrency` - Prefetch and in-flight limit (at least 1)
    ///
    /// # Returns
    /// The registration, or an error when the queue already has a subscription
    /// or the consumer could not be declared
    pub async fn subscribe<J, H>(
        &self,
        queue: &str,
        handler: Arc<H>,
        concurrency: u16,
    ) -> Result<ConsumerRegistration, AmqpError>
    where
        J: DeserializeOwned + Send + Sync + 'static,
        H: JobHandler<J> + ?Sized + 'static,
    {
        let concurrency = concurrency.max(1);
        let registration = ConsumerRegistration {
            queue: queue.to_owned(),
            concurrency,
            consumer_tag: format!("{queue}-{}", Uuid::new_v4()),
        };
        self.registry.reserve(registration.clone())?;

        let attachment = match open_consumer(&self.manager, &self.registry, &registration).await {
            Ok(attachment) => attachment,
            Err(err) => {
                self.registry.release(queue, &registration.consumer_tag);
                return Err(err);
            }
        };

        let task = tokio::spawn({
            let manager = self.manager.clone();
            let registry = self.registry.clone();
            let registration = registration.clone();
            async move {
                run_registration::<J, H>(manager, registry, registration, handler, attachment)
                    .await
            }
        });
        self.registry
            .update(queue, &registration.consumer_tag, |consumer| consumer.task = Some(task));

        info!(queue, concurrency, tag = registration.consumer_tag, "consumer subscribed");
        Ok(registration)
    }

    /// Stops consuming `queue`; in-flight handlers are left to finish.
    pub async fn unsubscribe(&self, queue: &str) -> Result<(), AmqpError> {
        let Some(consumer) = self.registry.take(queue) else {
            debug!(queue, "no consumer to cancel");
            return Ok(());
        };

        cancel(&consumer).await
    }

    pub fn active_consumers(&self) -> Vec<ConsumerRegistration> {
        self.registry.registrations()
    }

    /// Cancels every consumer and waits up to `timeout` for in-flight handlers.
    ///
    /// Handlers still running after the timeout are aborted.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), AmqpError> {
        let consumers = self.registry.take_all();
        let mut tasks = vec![];

        for consumer in &consumers {
            if let Err(err) = cancel(consumer).await {
                warn!(
                    error = err.to_string(),
                    queue = consumer.registration.queue,
                    "error cancelling consumer"
                );
            }
        }
        for consumer in consumers {
            if let Some(task) = consumer.task {
                tasks.push(task);
            }
        }

        let abort_handles: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();
        match tokio::time::timeout(timeout, futures_util::future::join_all(tasks)).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(timeout = ?timeout, "consumers did not drain in time, aborting");
                abort_handles.iter().for_each(|handle| handle.abort());
                Err(AmqpError::ShutdownTimeout(timeout))
            }
        }
    }
}

/// Body of a subscription task: supervises the consumer, then deregisters it.
async fn run_registration<J, H>(
    manager: Arc<ConnectionManager>,
    registry: ConsumerRegistry,
    registration: ConsumerRegistration,
    handler: Arc<H>,
    attachment: Attachment<Consumer>,
) where
    J: DeserializeOwned + Send + Sync + 'static,
    H: JobHandler<J> + ?Sized + 'static,
{
    let queue = registration.queue.as_str();
    let tag = registration.consumer_tag.as_str();
    let (manager_ref, registry_ref, registration_ref) = (&manager, &registry, &registration);

    let open = move || async move {
        if !registry_ref.owns(&registration_ref.queue, &registration_ref.consumer_tag) {
            return Ok(None);
        }
        open_consumer(manager_ref, registry_ref, registration_ref)
            .await
            .map(Some)
    };

    let exit = supervise::<J, H, _, _, _, _, _>(
        queue,
        handler,
        usize::from(registration.concurrency),
        manager.subscribe_state(),
        attachment,
        open,
    )
    .await;

    if let ConsumerExit::StreamFailed(_) = exit {
        manager.evict_channel(&ChannelKey::consume(queue));
    }
    if registry.release(queue, tag) {
        debug!(queue, "consumer deregistered");
    }
}

/// Opens the consume channel of `registration`, applies its prefetch and
/// starts the broker-side consumer.
async fn open_consumer(
    manager: &ConnectionManager,
    registry: &ConsumerRegistry,
    registration: &ConsumerRegistration,
) -> Result<Attachment<Consumer>, AmqpError> {
    let queue = registration.queue.as_str();
    let tag = registration.consumer_tag.as_str();
    let key = ChannelKey::consume(queue);

    let channel = manager
        .channel(&key, |channel| async move { Ok(channel) })
        .await?;

    if let Err(err) = channel
        .basic_qos(registration.concurrency, BasicQosOptions { global: false })
        .await
    {
        error!(error = err.to_string(), queue, "failure to configure qos");
        manager.evict_channel(&key);
        return Err(AmqpError::QoSDeclarationError(queue.to_owned()));
    }

    let deliveries = match channel
        .basic_consume(
            queue,
            tag,
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(consumer) => consumer,
        Err(err) => {
            error!(error = err.to_string(), queue, "error to create the consumer");
            manager.evict_channel(&key);
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }
    };

    registry.update(queue, tag, |consumer| consumer.channel = Some(channel.clone()));

    Ok(Attachment {
        deliveries,
        alive: Box::new(move || channel.status().connected()),
    })
}

async fn cancel(consumer: &ActiveConsumer) -> Result<(), AmqpError> {
    let Some(channel) = &consumer.channel else {
        return Ok(());
    };
    if !channel.status().connected() {
        return Ok(());
    }

    channel
        .basic_cancel(&consumer.registration.consumer_tag, BasicCancelOptions::default())
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                queue = consumer.registration.queue,
                "error cancelling consumer"
            );
            AmqpError::CancelConsumerError(consumer.registration.queue.clone())
        })
}
