// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Topology
//!
//! This module declares a job queue together with its dead-letter exchange (DLX)
//! and dead-letter queue (DLQ). Declaration always runs in the order the broker
//! needs for dead-lettered messages to land:
//!
//! 1. the DLX exchange
//! 2. the DLQ, bound to the DLX with the dead-letter routing key
//! 3. the main queue, whose arguments point at the DLX and routing key
//!
//! Naming follows `<domain>_job_queue`, `<domain>_job_dlx` and
//! `<domain>_job_dlx_queue`; the routing key defaults to the main queue name.

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel, ExchangeKind,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, PoisonError},
};
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

pub type QueueArguments = BTreeMap<ShortString, AMQPValue>;

pub fn queue_name(domain: &str) -> String {
    format!("{domain}_job_queue")
}

pub fn dlx_name(domain: &str) -> String {
    format!("{domain}_job_dlx")
}

pub fn dlq_name(domain: &str) -> String {
    format!("{domain}_job_dlx_queue")
}

/// Dead-letter settings of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

/// A durable job queue and its optional dead-letter wiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub queue: String,
    pub durable: bool,
    pub dead_letter: Option<DeadLetter>,
    pub message_ttl: Option<i32>,
    pub max_length: Option<i32>,
}

impl QueueTopology {
    /// A durable queue with no dead-letter wiring.
    pub fn new(queue: &str) -> Self {
        QueueTopology {
            queue: queue.to_owned(),
            durable: true,
            dead_letter: None,
            message_ttl: None,
            max_length: None,
        }
    }

    /// The conventional queue, DLX and DLQ for a job domain.
    pub fn for_domain(domain: &str) -> Self {
        QueueTopology::new(&queue_name(domain)).with_dead_letter(&dlx_name(domain), None, None)
    }

    /// Routes rejected messages to `exchange`.
    ///
    /// The DLQ defaults to `<exchange>_queue` and the routing key to the queue name.
    ///
    /// # Parameters
    /// * `exchange` - Dead-letter exchange name
    /// * `queue` - Dead-letter queue bound to the exchange
    /// * `routing_key` - Key used both for dead-lettering and for the binding
    pub fn with_dead_letter(
        mut self,
        exchange: &str,
        queue: Option<&str>,
        routing_key: Option<&str>,
    ) -> Self {
        self.dead_letter = Some(DeadLetter {
            exchange: exchange.to_owned(),
            queue: queue.map_or_else(|| format!("{exchange}_queue"), str::to_owned),
            routing_key: routing_key.unwrap_or(&self.queue).to_owned(),
        });
        self
    }

    /// Sets the message Time-To-Live (TTL) in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Arguments the main queue is declared with.
    pub fn arguments(&self) -> QueueArguments {
        let mut args = BTreeMap::new();

        if let Some(dl) = &self.dead_letter {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(dl.exchange.clone())),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(dl.routing_key.clone())),
            );
        }

        if let Some(ttl) = self.message_ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        args
    }
}

/// The declarations topology setup needs from a channel.
#[async_trait]
pub trait TopologyChannel: Send + Sync {
    /// Declares a durable direct exchange.
    async fn declare_exchange(&self, name: &str) -> Result<(), AmqpError>;

    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        args: QueueArguments,
    ) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;
}

#[async_trait]
impl TopologyChannel for Channel {
    async fn declare_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.exchange_declare(
            name,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), name, "error to declare the exchange");
            AmqpError::DeclareExchangeError(name.to_owned())
        })
    }

    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        args: QueueArguments,
    ) -> Result<(), AmqpError> {
        self.queue_declare(
            name,
            QueueDeclareOptions {
                durable,
                ..QueueDeclareOptions::default()
            },
            FieldTable::from(args),
        )
        .await
        .map(|_| ())
        .map_err(|err| {
            error!(error = err.to_string(), name, "error to declare the queue");
            AmqpError::DeclareQueueError(name.to_owned())
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), queue, exchange, "error to bind queue to exchange");
            AmqpError::BindingExchangeToQueueError(queue.to_owned(), exchange.to_owned())
        })
    }
}

/// Declares queue topologies and remembers what this process declared.
///
/// Re-installing an identical topology is a no-op; installing a different one
/// for an already-declared queue fails with `TopologyConflict`.
#[derive(Default)]
pub struct TopologyConfigurator {
    declared: Mutex<HashMap<String, QueueTopology>>,
}

impl TopologyConfigurator {
    pub fn new() -> Self {
        TopologyConfigurator::default()
    }

    /// Declares `queue` with dead-lettering to `dlx` (when given).
    ///
    /// # Parameters
    /// * `channel` - Channel the declarations go through
    /// * `queue` - Main queue name
    /// * `dlx` - Dead-letter exchange; `None` declares a plain durable queue
    /// * `dlq` - Dead-letter queue, `<dlx>_queue` by default
    /// * `routing_key` - Dead-letter routing key, the queue name by default
    ///
    /// # Returns
    /// The installed topology, or `TopologyConflict` when `queue` was already
    /// declared with different parameters
    pub async fn setup_queue_with_dlx(
        &self,
        channel: &dyn TopologyChannel,
        queue: &str,
        dlx: Option<&str>,
        dlq: Option<&str>,
        routing_key: Option<&str>,
    ) -> Result<QueueTopology, AmqpError> {
        let mut topology = QueueTopology::new(queue);
        if let Some(dlx) = dlx {
            topology = topology.with_dead_letter(dlx, dlq, routing_key);
        }

        self.install(channel, &topology).await?;
        Ok(topology)
    }

    /// Declares the DLX, then the DLQ and its binding, then the main queue.
    ///
    /// # Parameters
    /// * `channel` - Channel the declarations go through
    /// * `topology` - Queue and dead-letter settings to install
    ///
    /// # Returns
    /// `Ok(())` without touching the broker when the same topology is already
    /// installed, `TopologyConflict` when a different one is
    pub async fn install(
        &self,
        channel: &dyn TopologyChannel,
        topology: &QueueTopology,
    ) -> Result<(), AmqpError> {
        match self.declared(&topology.queue) {
            Some(existing) if existing == *topology => {
                debug!(queue = topology.queue, "topology already declared");
                return Ok(());
            }
            Some(_) => {
                error!(queue = topology.queue, "queue already declared with different parameters");
                return Err(AmqpError::TopologyConflict(topology.queue.clone()));
            }
            None => {}
        }

        if let Some(dl) = &topology.dead_letter {
            debug!("creating exchange: {}", dl.exchange);
            channel.declare_exchange(&dl.exchange).await?;

            debug!("creating dlq: {}", dl.queue);
            channel
                .declare_queue(&dl.queue, topology.durable, QueueArguments::new())
                .await?;

            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                dl.queue, dl.exchange, dl.routing_key
            );
            channel
                .bind_queue(&dl.queue, &dl.exchange, &dl.routing_key)
                .await?;
        }

        debug!("creating queue: {}", topology.queue);
        channel
            .declare_queue(&topology.queue, topology.durable, topology.arguments())
            .await?;

        let mut declared = self.declared.lock().unwrap_or_else(PoisonError::into_inner);
        match declared.get(&topology.queue) {
            Some(existing) if existing != topology => {
                Err(AmqpError::TopologyConflict(topology.queue.clone()))
            }
            _ => {
                declared.insert(topology.queue.clone(), topology.clone());
                debug!("queue: {} was created", topology.queue);
                Ok(())
            }
        }
    }

    /// Declares `queue` the way a publisher needs it to exist.
    ///
    /// Uses the recorded topology when there is one so the arguments match,
    /// otherwise a plain durable queue.
    pub async fn assert_queue(
        &self,
        channel: &dyn TopologyChannel,
        queue: &str,
    ) -> Result<(), AmqpError> {
        let args = self
            .declared(queue)
            .map(|topology| topology.arguments())
            .unwrap_or_default();

        channel.declare_queue(queue, true, args).await
    }

    pub fn declared(&self, queue: &str) -> Option<QueueTopology> {
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Mimics the broker: redeclaring with the same arguments is accepted,
    /// with different ones it is refused.
    #[derive(Default)]
    struct RecordingChannel {
        calls: Mutex<Vec<String>>,
        exchanges: Mutex<HashSet<String>>,
        queues: Mutex<HashMap<String, QueueArguments>>,
    }

    impl RecordingChannel {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TopologyChannel for RecordingChannel {
        async fn declare_exchange(&self, name: &str) -> Result<(), AmqpError> {
            self.calls.lock().unwrap().push(format!("exchange:{name}"));
            self.exchanges.lock().unwrap().insert(name.to_owned());
            Ok(())
        }

        async fn declare_queue(
            &self,
            name: &str,
            _durable: bool,
            args: QueueArguments,
        ) -> Result<(), AmqpError> {
            self.calls.lock().unwrap().push(format!("queue:{name}"));
            let mut queues = self.queues.lock().unwrap();
            match queues.get(name) {
                Some(existing) if *existing != args => {
                    Err(AmqpError::DeclareQueueError(name.to_owned()))
                }
                _ => {
                    queues.insert(name.to_owned(), args);
                    Ok(())
                }
            }
        }

        async fn bind_queue(
            &self,
            queue: &str,
            exchange: &str,
            _routing_key: &str,
        ) -> Result<(), AmqpError> {
            if !self.exchanges.lock().unwrap().contains(exchange) {
                return Err(AmqpError::BindingExchangeToQueueError(
                    queue.to_owned(),
                    exchange.to_owned(),
                ));
            }
            self.calls.lock().unwrap().push(format!("bind:{queue}->{exchange}"));
            Ok(())
        }
    }

    #[test]
    fn domain_naming_convention() {
        let topology = QueueTopology::for_domain("email");
        let dl = topology.dead_letter.clone().unwrap();

        assert_eq!(topology.queue, "email_job_queue");
        assert_eq!(dl.exchange, "email_job_dlx");
        assert_eq!(dl.queue, "email_job_dlx_queue");
        assert_eq!(dl.routing_key, "email_job_queue");
        assert!(topology.durable);
    }

    #[test]
    fn arguments_point_at_the_dlx() {
        let args = QueueTopology::for_domain("photo").ttl(60_000).arguments();

        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString(LongString::from("photo_job_dlx")))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)),
            Some(&AMQPValue::LongString(LongString::from("photo_job_queue")))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongInt(60_000))
        );
        assert!(QueueTopology::new("plain").arguments().is_empty());
    }

    #[tokio::test]
    async fn declares_dlx_and_dlq_before_the_queue() {
        let channel = RecordingChannel::default();
        let configurator = TopologyConfigurator::new();

        configurator
            .setup_queue_with_dlx(&channel, "email_job_queue", Some("email_job_dlx"), None, None)
            .await
            .unwrap();

        assert_eq!(
            channel.calls(),
            vec![
                "exchange:email_job_dlx",
                "queue:email_job_dlx_queue",
                "bind:email_job_dlx_queue->email_job_dlx",
                "queue:email_job_queue",
            ]
        );
    }

    #[tokio::test]
    async fn identical_setup_is_a_noop() {
        let channel = RecordingChannel::default();
        let configurator = TopologyConfigurator::new();

        let first = configurator
            .setup_queue_with_dlx(
                &channel,
                "trip_job_queue",
                Some("trip_job_dlx"),
                Some("trip_job_dlx_queue"),
                None,
            )
            .await
            .unwrap();
        let second = configurator
            .setup_queue_with_dlx(
                &channel,
                "trip_job_queue",
                Some("trip_job_dlx"),
                Some("trip_job_dlx_queue"),
                None,
            )
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(channel.calls().len(), 4);
        assert_eq!(channel.exchanges.lock().unwrap().len(), 1);
        assert_eq!(channel.queues.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn conflicting_setup_fails_loudly() {
        let channel = RecordingChannel::default();
        let configurator = TopologyConfigurator::new();

        configurator
            .setup_queue_with_dlx(&channel, "q", Some("dlx_a"), None, None)
            .await
            .unwrap();
        let err = configurator
            .setup_queue_with_dlx(&channel, "q", Some("dlx_b"), None, None)
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::TopologyConflict("q".to_owned()));
        assert_eq!(configurator.declared("q").unwrap().dead_letter.unwrap().exchange, "dlx_a");
    }

    #[tokio::test]
    async fn conflicting_broker_state_surfaces() {
        let channel = RecordingChannel::default();
        channel
            .declare_queue("q", true, QueueTopology::new("q").ttl(10).arguments())
            .await
            .unwrap();

        let err = TopologyConfigurator::new()
            .setup_queue_with_dlx(&channel, "q", None, None, None)
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::DeclareQueueError("q".to_owned()));
    }

    #[tokio::test]
    async fn assert_queue_reuses_declared_arguments() {
        let channel = RecordingChannel::default();
        let configurator = TopologyConfigurator::new();

        configurator
            .install(&channel, &QueueTopology::for_domain("email"))
            .await
            .unwrap();
        configurator
            .assert_queue(&channel, "email_job_queue")
            .await
            .unwrap();
        configurator.assert_queue(&channel, "other_queue").await.unwrap();

        assert!(channel.queues.lock().unwrap()["other_queue"].is_empty());
    }
}
