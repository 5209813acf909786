// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Application-Level Retry
//!
//! `RetryCoordinator` wraps a job handler. When the handler fails, it waits
//! `base_delay * 2^(attempt-1)`, publishes a copy of the job with `retryCount`
//! set to `attempt` back to the same queue, and still reports the failure so the
//! original delivery is rejected. Once `retryCount` has reached `max_retries`
//! nothing is republished and the rejected delivery stays in the DLQ.
//!
//! Broker-native requeueing is never used: it redelivers immediately, with no
//! backoff and no attempt count.

use crate::{
    backoff::retry_delay,
    configs::RetryConfigs,
    envelope::Envelope,
    handler::{HandlerError, JobHandler},
    publisher::{publish_envelope, JobPublisher},
};
use async_trait::async_trait;
use serde::Serialize;
use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Republishes allowed to wait out their backoff at the same time.
    pub max_pending: usize,
}

impl From<&RetryConfigs> for RetryPolicy {
    fn from(cfg: &RetryConfigs) -> Self {
        RetryPolicy {
            max_retries: cfg.max_retries,
            base_delay: cfg.base_delay,
            max_pending: cfg.max_pending,
        }
    }
}

type Classifier = Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>;

/// A claimed backlog slot, given back when dropped.
struct PendingSlot<'a>(&'a AtomicUsize);

impl<'a> PendingSlot<'a> {
    fn claim(pending: &'a AtomicUsize, max_pending: usize) -> Option<Self> {
        pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < max_pending).then_some(current + 1)
            })
            .ok()
            .map(|_| PendingSlot(pending))
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct RetryCoordinator<J, H> {
    queue: String,
    inner: H,
    publisher: Arc<dyn JobPublisher>,
    policy: RetryPolicy,
    pending: AtomicUsize,
    retryable: Option<Classifier>,
    _job: PhantomData<fn() -> J>,
}

impl<J, H> RetryCoordinator<J, H> {
    /// Wraps `inner` so its failures on `queue` are retried.
    ///
    /// # Parameters
    /// * `queue` - Queue the handler consumes; retries are published back to it
    /// * `inner` - The job handler being wrapped
    /// * `publisher` - Publisher used for the retried copies
    /// * `policy` - Retry budget, base delay and backlog cap
    pub fn new(
        queue: &str,
        inner: H,
        publisher: Arc<dyn JobPublisher>,
        policy: RetryPolicy,
    ) -> Self {
        RetryCoordinator {
            queue: queue.to_owned(),
            inner,
            publisher,
            policy,
            pending: AtomicUsize::new(0),
            retryable: None,
            _job: PhantomData,
        }
    }

    /// Only errors for which `retryable` returns true are republished.
    ///
    /// Handlers returning `false` are always retried.
    pub fn with_classifier<F>(mut self, retryable: F) -> Self
    where
        F: Fn(&HandlerError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(retryable));
        self
    }

    /// Skips the retry budget for [`HandlerError::Permanent`].
    pub fn skip_permanent(self) -> Self {
        self.with_classifier(|err| !err.is_permanent())
    }

    /// Republishes currently waiting out their backoff.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn is_retryable(&self, err: &HandlerError) -> bool {
        self.retryable.as_ref().map_or(true, |retryable| retryable(err))
    }
}

impl<J, H> RetryCoordinator<J, H>
where
    J: Serialize + Clone + Send + Sync,
{
    /// Schedules the next attempt of `envelope`; returns whether a copy was published.
    async fn republish(&self, envelope: &Envelope<J>) -> bool {
        let attempt = envelope.next_attempt();
        if attempt > self.policy.max_retries {
            error!(
                queue = self.queue,
                retry_count = envelope.retry_count.unwrap_or(0),
                "too many attempts, leaving message to the dlq"
            );
            return false;
        }

        let Some(_slot) = PendingSlot::claim(&self.pending, self.policy.max_pending) else {
            warn!(
                queue = self.queue,
                max_pending = self.policy.max_pending,
                "retry backlog full, leaving message to the dlq"
            );
            return false;
        };

        let delay = retry_delay(self.policy.base_delay, attempt);
        info!(
            queue = self.queue,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );
        tokio::time::sleep(delay).await;

        let retried = envelope.with_retry_count(attempt);
        let published = publish_envelope(
            self.publisher.as_ref(),
            &self.queue,
            &retried,
            &retried.options,
        )
        .await;

        if !published {
            error!(queue = self.queue, attempt, "failure to republish for retry");
        }
        published
    }
}

#[async_trait]
impl<J, H> JobHandler<J> for RetryCoordinator<J, H>
where
    J: Serialize + Clone + Send + Sync,
    H: JobHandler<J>,
{
    async fn handle(&self, envelope: &Envelope<J>) -> Result<bool, HandlerError> {
        let outcome = self.inner.handle(envelope).await;

        let retry = match &outcome {
            Ok(true) => return outcome,
            Ok(false) => true,
            Err(err) => self.is_retryable(err),
        };

        if retry {
            self.republish(envelope).await;
        } else {
            warn!(queue = self.queue, "permanent failure, not retrying");
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        jobs::TravelJob,
        publisher::{HeaderValue, MockJobPublisher, PublishOptions},
    };
    use std::sync::Mutex;

    struct AlwaysFails;

    #[async_trait]
    impl JobHandler<TravelJob> for AlwaysFails {
        async fn handle(&self, _envelope: &Envelope<TravelJob>) -> Result<bool, HandlerError> {
            Err(HandlerError::failed("downstream timeout"))
        }
    }

    struct Answers(bool);

    #[async_trait]
    impl JobHandler<TravelJob> for Answers {
        async fn handle(&self, _envelope: &Envelope<TravelJob>) -> Result<bool, HandlerError> {
            Ok(self.0)
        }
    }

    struct Permanent;

    #[async_trait]
    impl JobHandler<TravelJob> for Permanent {
        async fn handle(&self, _envelope: &Envelope<TravelJob>) -> Result<bool, HandlerError> {
            Err(HandlerError::permanent("address rejected"))
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_pending: 100,
        }
    }

    fn welcome(retry_count: Option<u32>) -> Envelope<TravelJob> {
        Envelope {
            job: TravelJob::WelcomeEmail {
                to: "a@b.com".to_owned(),
            },
            retry_count,
            options: PublishOptions::default(),
        }
    }

    fn retry_count_of(payload: &[u8]) -> Option<u32> {
        Envelope::<TravelJob>::decode(payload).unwrap().retry_count
    }

    #[tokio::test]
    async fn success_never_republishes() {
        let mut publisher = MockJobPublisher::new();
        publisher.expect_publish().never();

        let coordinator = RetryCoordinator::new("q", Answers(true), Arc::new(publisher), policy(3));

        assert!(coordinator.handle(&welcome(None)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn republishes_with_incremented_count_after_backoff() {
        let published = Arc::new(Mutex::new(vec![]));
        let mut publisher = MockJobPublisher::new();
        publisher.expect_publish().times(3).returning({
            let published = published.clone();
            move |queue, payload, _| {
                published
                    .lock()
                    .unwrap()
                    .push((queue.to_owned(), retry_count_of(payload), tokio::time::Instant::now()));
                true
            }
        });

        let coordinator =
            RetryCoordinator::new("email_job_queue", AlwaysFails, Arc::new(publisher), policy(3));

        let mut starts = vec![];
        for retry_count in [None, Some(1), Some(2)] {
            starts.push(tokio::time::Instant::now());
            let result = coordinator.handle(&welcome(retry_count)).await;
            assert!(result.is_err());
        }

        let published = published.lock().unwrap();
        let counts: Vec<_> = published.iter().map(|(_, count, _)| *count).collect();
        assert_eq!(counts, vec![Some(1), Some(2), Some(3)]);
        assert!(published.iter().all(|(queue, _, _)| queue == "email_job_queue"));

        let expected = [100, 200, 400].map(Duration::from_millis);
        for (((_, _, at), started), expected) in published.iter().zip(starts).zip(expected) {
            let waited = at.duration_since(started);
            assert!(waited >= expected, "waited {waited:?}, expected {expected:?}");
            assert!(waited < expected + Duration::from_millis(2));
        }
        assert_eq!(coordinator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_not_republished() {
        let mut publisher = MockJobPublisher::new();
        publisher.expect_publish().never();

        let coordinator = RetryCoordinator::new("q", AlwaysFails, Arc::new(publisher), policy(3));

        assert!(coordinator.handle(&welcome(Some(3))).await.is_err());
        assert!(coordinator.handle(&welcome(Some(7))).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn business_refusal_is_retried_and_still_reported() {
        let mut publisher = MockJobPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .withf(|_, payload, _| retry_count_of(payload) == Some(1))
            .return_const(true);

        let coordinator =
            RetryCoordinator::new("q", Answers(false), Arc::new(publisher), policy(2));

        assert!(!coordinator.handle(&welcome(None)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_republish_still_reports_failure() {
        let mut publisher = MockJobPublisher::new();
        publisher.expect_publish().times(1).return_const(false);

        let coordinator = RetryCoordinator::new("q", AlwaysFails, Arc::new(publisher), policy(3));

        assert!(coordinator.handle(&welcome(None)).await.is_err());
        assert_eq!(coordinator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_skips_permanent_errors() {
        let mut publisher = MockJobPublisher::new();
        publisher.expect_publish().never();

        let coordinator =
            RetryCoordinator::new("q", Permanent, Arc::new(publisher), policy(3)).skip_permanent();

        assert!(coordinator.handle(&welcome(None)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn uniform_treatment_without_classifier() {
        let mut publisher = MockJobPublisher::new();
        publisher.expect_publish().times(1).return_const(true);

        let coordinator = RetryCoordinator::new("q", Permanent, Arc::new(publisher), policy(3));

        assert!(coordinator.handle(&welcome(None)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn backlog_cap_stops_republishing() {
        let mut publisher = MockJobPublisher::new();
        publisher.expect_publish().times(1).return_const(true);

        let coordinator = RetryCoordinator::new(
            "q",
            AlwaysFails,
            Arc::new(publisher),
            RetryPolicy {
                max_pending: 1,
                ..policy(3)
            },
        );

        let (first, second) = (welcome(None), welcome(None));
        let (first, second) = tokio::join!(coordinator.handle(&first), coordinator.handle(&second));

        assert!(first.is_err());
        assert!(second.is_err());
        assert_eq!(coordinator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn republishes_with_the_delivery_properties() {
        let mut publisher = MockJobPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .withf(|_, _, options| {
                options.message_type.as_deref() == Some("welcome_email")
                    && options.headers.get("tenant") == Some(&HeaderValue::String("eu".to_owned()))
            })
            .return_const(true);

        let coordinator = RetryCoordinator::new("q", AlwaysFails, Arc::new(publisher), policy(3));
        let delivered = welcome(None).with_options(
            PublishOptions::default()
                .message_type("welcome_email")
                .header("tenant", HeaderValue::String("eu".to_owned())),
        );

        assert!(coordinator.handle(&delivered).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_retry_gives_its_backlog_slot_back() {
        let mut publisher = MockJobPublisher::new();
        publisher.expect_publish().never();

        let coordinator = Arc::new(RetryCoordinator::new(
            "q",
            AlwaysFails,
            Arc::new(publisher),
            RetryPolicy {
                max_pending: 1,
                ..policy(3)
            },
        ));

        let task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.handle(&welcome(None)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.pending(), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(coordinator.pending(), 0);
    }
}
