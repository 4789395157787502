//! Polling loop that feeds due notifications into the dispatcher.
//!
//! The feeder polls the store and spawns each notification as its own
//! dispatch task, so one notification waiting out a retry delay never holds
//! back the ones queued after it. A notification stays claimed while its task
//! runs and is skipped by later polls until the task ends.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use herald_core::{Clock, NotificationId};
use tokio::{
    task::{JoinHandle, JoinSet},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::Dispatcher,
    error::{ErrorCategory, Result},
};

/// Feeder configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeederConfig {
    /// Maximum notifications fetched per poll.
    pub batch_size: usize,
    /// Wait between polls that found nothing.
    pub poll_interval: Duration,
    /// Wait after a storage error.
    pub error_backoff: Duration,
    /// Maximum dispatches running at once.
    pub max_in_flight: usize,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            max_in_flight: 100,
        }
    }
}

/// Ids of notifications with a dispatch task running.
#[derive(Debug, Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<NotificationId>>>);

impl InFlight {
    fn ids(&self) -> MutexGuard<'_, HashSet<NotificationId>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn len(&self) -> usize {
        self.ids().len()
    }

    fn claim(&self, id: NotificationId) -> Option<Claim> {
        self.ids().insert(id).then(|| Claim { in_flight: self.clone(), id })
    }
}

/// Releases its id when the dispatch task ends, including by panic or abort.
struct Claim {
    in_flight: InFlight,
    id: NotificationId,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.in_flight.ids().remove(&self.id);
    }
}

/// Background poller driving [`Dispatcher::process_notification`].
pub struct Feeder {
    dispatcher: Arc<Dispatcher>,
    config: FeederConfig,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    in_flight: InFlight,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl Feeder {
    /// Creates a feeder. It does nothing until [`run`](Self::run) or
    /// [`spawn`](Self::spawn) is called.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        config: FeederConfig,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            config,
            clock,
            cancellation_token,
            in_flight: InFlight::default(),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Runs the loop on a new task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Polls until cancelled, then waits for running dispatches to finish.
    pub async fn run(&self) {
        let poll_interval_ms =
            u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX);
        info!(
            batch_size = self.config.batch_size,
            max_in_flight = self.config.max_in_flight,
            poll_interval_ms,
            "feeder starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                info!("feeder received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = sleep(self.config.poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(error = %error, "feeder poll failed");
                    tokio::select! {
                        () = sleep(self.config.error_backoff) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        let running = self.in_flight();
        if running > 0 {
            info!(running, "waiting for in-flight dispatches");
        }
        self.drain().await;

        info!("feeder stopped");
    }

    /// Fetches due notifications that are not already being dispatched and
    /// spawns a dispatch task for each. Returns how many were spawned.
    ///
    /// Per-notification errors are logged by the task, not returned.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the pending query fails.
    pub async fn process_batch(&self) -> Result<usize> {
        self.reap_finished().await;

        let running = self.in_flight.len();
        let capacity =
            self.config.max_in_flight.saturating_sub(running).min(self.config.batch_size);
        if capacity == 0 {
            debug!(running, "dispatch capacity exhausted");
            return Ok(0);
        }

        // Claimed notifications are still due, so fetch past them.
        let now = self.clock.now_utc();
        let candidates = self
            .dispatcher
            .store()
            .find_pending_notifications(capacity.saturating_add(running), now)
            .await?;

        let mut tasks = self.tasks.lock().await;
        let mut spawned = 0;

        for notification in candidates {
            if spawned == capacity {
                break;
            }
            let Some(claim) = self.in_flight.claim(notification.id) else {
                continue;
            };

            let dispatcher = self.dispatcher.clone();
            tasks.spawn(async move {
                let _claim = claim;
                if let Err(error) = dispatcher.process_notification(notification).await {
                    warn!(
                        error = %error,
                        error_category = %ErrorCategory::from(&error),
                        "notification dispatch aborted"
                    );
                }
            });
            spawned += 1;
        }

        if spawned > 0 {
            debug!(spawned, in_flight = running + spawned, "dispatches spawned");
        }

        Ok(spawned)
    }

    /// Number of dispatch tasks still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Waits for every spawned dispatch task to finish.
    pub async fn drain(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            log_join_error(result);
        }
    }

    async fn reap_finished(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.try_join_next() {
            log_join_error(result);
        }
    }
}

fn log_join_error(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "dispatch task panicked");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use herald_core::{ChannelKind, Notification, NotificationStatus, RealClock, TestClock};

    use super::*;
    use crate::{
        channel::{ChannelAdapter, ChannelRegistry, SendOutcome},
        engine::DispatchConfig,
        retry::RetryPolicy,
        storage::{
            mock::{InMemoryNotificationStore, StoreOp},
            NotificationStore,
        },
    };

    #[derive(Debug)]
    struct Fixed {
        name: &'static str,
        succeed: bool,
    }

    #[async_trait]
    impl ChannelAdapter for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn send(&self, _notification: &Notification) -> Result<SendOutcome> {
            if self.succeed {
                Ok(SendOutcome::delivered("ok"))
            } else {
                Ok(SendOutcome::rejected(Some("DOWN".to_string()), "gateway down"))
            }
        }
    }

    fn feeder_config() -> FeederConfig {
        FeederConfig {
            batch_size: 2,
            poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
            max_in_flight: 10,
        }
    }

    fn feeder(store: Arc<InMemoryNotificationStore>, token: CancellationToken) -> Feeder {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let registry = ChannelRegistry::new()
            .with(ChannelKind::Sms, Arc::new(Fixed { name: "sms", succeed: true }));
        let dispatcher =
            Arc::new(Dispatcher::new(store, registry, DispatchConfig::default(), clock.clone()));
        Feeder::new(dispatcher, feeder_config(), clock, token)
    }

    fn sms() -> Notification {
        Notification::queued(ChannelKind::Sms, "+15550100", None, "hi", Utc::now())
    }

    #[tokio::test]
    async fn batch_dispatches_due_notifications() {
        let store = Arc::new(InMemoryNotificationStore::new());
        for _ in 0..3 {
            store.create(sms()).await.unwrap();
        }
        let feeder = feeder(store.clone(), CancellationToken::new());

        assert_eq!(feeder.process_batch().await.unwrap(), 2);
        assert_eq!(feeder.process_batch().await.unwrap(), 1);
        assert_eq!(feeder.process_batch().await.unwrap(), 0);

        feeder.drain().await;

        assert_eq!(feeder.in_flight(), 0);
        assert_eq!(feeder.dispatcher.stats().await.delivered, 3);
    }

    #[tokio::test]
    async fn storage_error_is_returned() {
        let store = Arc::new(InMemoryNotificationStore::new());
        store.fail_on(StoreOp::FindPending).await;
        let feeder = feeder(store, CancellationToken::new());

        assert!(feeder.process_batch().await.is_err());
    }

    #[tokio::test]
    async fn interrupted_pending_notification_is_delivered() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let mut interrupted = sms();
        interrupted.mark_pending(Utc::now()).unwrap();
        let id = interrupted.id;
        store.create(interrupted).await.unwrap();
        let feeder = feeder(store.clone(), CancellationToken::new());

        assert_eq!(feeder.process_batch().await.unwrap(), 1);
        feeder.drain().await;

        let stored = store.notification(id).await.unwrap();
        assert_eq!(stored.status, NotificationStatus::Delivered);
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn retry_delay_does_not_hold_back_later_notifications() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let registry = ChannelRegistry::new()
            .with(ChannelKind::Email, Arc::new(Fixed { name: "email", succeed: false }))
            .with(ChannelKind::Sms, Arc::new(Fixed { name: "sms", succeed: true }));
        let config = DispatchConfig {
            retry_policy: RetryPolicy {
                max_retries: 2,
                delays: vec![Duration::from_secs(30)],
                jitter_factor: 0.0,
            },
            ..DispatchConfig::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), registry, config, clock.clone()));
        let feeder = Feeder::new(dispatcher, feeder_config(), clock, CancellationToken::new());

        let email =
            Notification::queued(ChannelKind::Email, "ada@example.com", None, "hi", Utc::now());
        store.create(email.clone()).await.unwrap();
        assert_eq!(feeder.process_batch().await.unwrap(), 1);

        // First attempt fails and the task parks in its 30 s retry delay.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let waiting = store.notification(email.id).await.unwrap();
        assert_eq!(waiting.status, NotificationStatus::Pending);
        assert_eq!(waiting.attempts, 1);

        let later = sms();
        store.create(later.clone()).await.unwrap();

        // The email is still due but claimed, so only the SMS is spawned.
        assert_eq!(feeder.process_batch().await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let delivered = store.notification(later.id).await.unwrap();
        assert_eq!(delivered.status, NotificationStatus::Delivered);
        assert_eq!(store.notification(email.id).await.unwrap().attempts, 1);
        assert_eq!(feeder.in_flight(), 1);
    }

    #[tokio::test]
    async fn claim_is_released_when_task_ends() {
        let in_flight = InFlight::default();
        let id = NotificationId::new();

        let claim = in_flight.claim(id).unwrap();
        assert!(in_flight.claim(id).is_none());
        assert_eq!(in_flight.len(), 1);

        let handle = tokio::spawn(async move {
            let _claim = claim;
            panic!("dispatch blew up");
        });
        assert!(handle.await.is_err());

        assert_eq!(in_flight.len(), 0);
        assert!(in_flight.claim(id).is_some());
    }

    #[tokio::test]
    async fn capacity_limits_spawned_dispatches() {
        let store = Arc::new(InMemoryNotificationStore::new());
        for _ in 0..3 {
            store.create(sms()).await.unwrap();
        }
        let mut feeder = feeder(store, CancellationToken::new());
        feeder.config.max_in_flight = 1;

        assert_eq!(feeder.process_batch().await.unwrap(), 1);
        assert_eq!(feeder.in_flight(), 1);

        feeder.drain().await;
        assert_eq!(feeder.in_flight(), 0);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let n = sms();
        let id = n.id;
        store.create(n).await.unwrap();

        let token = CancellationToken::new();
        let handle = feeder(store.clone(), token.clone()).spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        let stored = store.notification(id).await.unwrap();
        assert_eq!(stored.status, NotificationStatus::Delivered);
    }
}
