// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Client
//!
//! Entry point for the rest of the backend: one `MessagingClient` per process
//! owns the connection manager (and with it the channel pool), the topology
//! configurator, the publisher and the consumer dispatcher.
//!
//! ```no_run
//! use std::sync::Arc;
//! use trip_messaging::{
//!     client::MessagingClient, configs::Configs, envelope::Envelope,
//!     handler::{HandlerError, JobHandler}, jobs::TravelJob,
//! };
//!
//! struct SendWelcome;
//!
//! #[async_trait::async_trait]
//! impl JobHandler<TravelJob> for SendWelcome {
//!     async fn handle(&self, envelope: &Envelope<TravelJob>) -> Result<bool, HandlerError> {
//!         Ok(matches!(envelope.job, TravelJob::WelcomeEmail { .. }))
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = MessagingClient::new(Configs::from_env()?);
//! client.connect().await?;
//!
//! let topology = client.setup_domain("email").await?;
//! client
//!     .subscribe_with_retry(&topology.queue, SendWelcome, None)
//!     .await?;
//!
//! let job = TravelJob::WelcomeEmail { to: "a@b.com".to_owned() };
//! client.publish_job(&job).await;
//!
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    channel::ChannelKey,
    configs::Configs,
    connection::{ConnectionManager, ConnectionState},
    dispatcher::{ConsumerRegistration, RabbitMQDispatcher},
    errors::AmqpError,
    handler::JobHandler,
    jobs::TravelJob,
    publisher::{JobPublisher, PublishOptions, RabbitMQPublisher},
    retry::{RetryCoordinator, RetryPolicy},
    topology::{queue_name, QueueTopology, TopologyConfigurator},
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct MessagingClient {
    configs: Configs,
    manager: Arc<ConnectionManager>,
    topology: Arc<TopologyConfigurator>,
    publisher: Arc<RabbitMQPublisher>,
    dispatcher: RabbitMQDispatcher,
}

impl MessagingClient {
    /// Creates a disconnected client from `configs`.
    ///
    /// # Parameters
    /// * `configs` - Application, broker and retry settings
    ///
    /// # Returns
    /// A client; call [`MessagingClient::connect`] before using the broker
    pub fn new(configs: Configs) -> Self {
        let manager = ConnectionManager::from_configs(&configs.rabbitmq, &configs.app.name);
        MessagingClient::with_manager(configs, manager)
    }

    /// Builds the client around an existing connection manager.
    pub fn with_manager(configs: Configs, manager: Arc<ConnectionManager>) -> Self {
        let topology = Arc::new(TopologyConfigurator::new());
        let publisher = RabbitMQPublisher::new(
            manager.clone(),
            topology.clone(),
            configs.rabbitmq.confirm_timeout,
        );
        let dispatcher = RabbitMQDispatcher::new(manager.clone());

        MessagingClient {
            configs,
            manager,
            topology,
            publisher,
            dispatcher,
        }
    }

    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.manager.connect().await.map(|_| ())
    }

    /// Whether the broker connection is currently up.
    pub fn is_healthy(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe_state()
    }

    pub fn publisher(&self) -> Arc<dyn JobPublisher> {
        self.publisher.clone()
    }

    /// Declares `queue`, dead-lettering to `dlx` when given.
    pub async fn setup_queue_with_dlx(
        &self,
        queue: &str,
        dlx: Option<&str>,
        dlq: Option<&str>,
        routing_key: Option<&str>,
    ) -> Result<QueueTopology, AmqpError> {
        let channel = self.setup_channel(queue).await?;
        self.topology
            .setup_queue_with_dlx(channel.as_ref(), queue, dlx, dlq, routing_key)
            .await
    }

    /// Declares the conventional queue, DLX and DLQ of a job domain.
    pub async fn setup_domain(&self, domain: &str) -> Result<QueueTopology, AmqpError> {
        let topology = QueueTopology::for_domain(domain);
        let channel = self.setup_channel(&topology.queue).await?;
        self.topology.install(channel.as_ref(), &topology).await?;
        Ok(topology)
    }

    /// Publishes `job` to `queue` and waits for the broker to confirm it.
    ///
    /// # Parameters
    /// * `queue` - Target queue, reached through the default exchange
    /// * `job` - Job serialized as the JSON message body
    /// * `options` - Message type and extra headers
    ///
    /// # Returns
    /// `true` once the broker acked the message, `false` on any failure
    pub async fn publish<J: Serialize + Sync>(
        &self,
        queue: &str,
        job: &J,
        options: &PublishOptions,
    ) -> bool {
        self.publisher.publish_job(queue, job, options).await
    }

    /// Publishes a travel job to its domain queue.
    pub async fn publish_job(&self, job: &TravelJob) -> bool {
        let options = PublishOptions::default().message_type(job.kind());
        self.publish(&queue_name(job.domain()), job, &options).await
    }

    /// Consumes `queue` with `handler`; `concurrency` defaults to the configured value.
    pub async fn subscribe<J, H>(
        &self,
        queue: &str,
        handler: H,
        concurrency: Option<u16>,
    ) -> Result<ConsumerRegistration, AmqpError>
    where
        J: DeserializeOwned + Send + Sync + 'static,
        H: JobHandler<J> + 'static,
    {
        let concurrency = concurrency.unwrap_or(self.configs.rabbitmq.concurrency);
        self.dispatcher
            .subscribe::<J, H>(queue, Arc::new(handler), concurrency)
            .await
    }

    /// Like [`MessagingClient::subscribe`], with failed jobs republished by a
    /// [`RetryCoordinator`] using the configured retry settings.
    pub async fn subscribe_with_retry<J, H>(
        &self,
        queue: &str,
        handler: H,
        concurrency: Option<u16>,
    ) -> Result<ConsumerRegistration, AmqpError>
    where
        J: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
        H: JobHandler<J> + 'static,
    {
        let policy = RetryPolicy::from(&self.configs.retry);
        self.subscribe_with_policy(queue, handler, concurrency, policy)
            .await
    }

    /// Like [`MessagingClient::subscribe_with_retry`] with an explicit `policy`.
    pub async fn subscribe_with_policy<J, H>(
        &self,
        queue: &str,
        handler: H,
        concurrency: Option<u16>,
        policy: RetryPolicy,
    ) -> Result<ConsumerRegistration, AmqpError>
    where
        J: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
        H: JobHandler<J> + 'static,
    {
        let coordinator = RetryCoordinator::new(queue, handler, self.publisher(), policy);
        self.subscribe::<J, _>(queue, coordinator, concurrency).await
    }

    pub async fn unsubscribe(&self, queue: &str) -> Result<(), AmqpError> {
        self.dispatcher.unsubscribe(queue).await
    }

    pub fn active_consumers(&self) -> Vec<ConsumerRegistration> {
        self.dispatcher.active_consumers()
    }

    /// Stops consumers, lets in-flight handlers drain, then closes the connection.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        let timeout = self.configs.rabbitmq.shutdown_timeout;
        info!("shutting down messaging");

        if let Err(err) = self.dispatcher.shutdown(timeout).await {
            warn!(error = err.to_string(), "consumers did not stop cleanly");
        }

        self.manager.close(timeout).await
    }

    async fn setup_channel(&self, queue: &str) -> Result<Arc<lapin::Channel>, AmqpError> {
        self.manager
            .channel(&ChannelKey::setup(queue), |channel| async move { Ok(channel) })
            .await
    }
}
