use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use providers::{AvailabilityProvider, ProviderError};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatch::NotificationDispatcher;
use crate::store::Stores;
use crate::types::SubscriptionStatus;
use crate::worker::{StopReason, WorkerContext, WorkerError, WorkerExit, run_worker};
use crate::WatchError;

/// Events flowing from workers (and restart timers) to the supervisor loop.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A worker completed a poll without error
    PollSucceeded {
        /// Subscription the worker belongs to
        subscription_id: Uuid,
    },
    /// A worker instance terminated
    Exited {
        /// Subscription the worker belonged to
        subscription_id: Uuid,
        /// How it terminated
        exit: WorkerExit,
    },
    /// A crash backoff delay elapsed; the subscription may restart
    RestartDue {
        /// Subscription awaiting restart
        subscription_id: Uuid,
    },
}

/// Configuration for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Maximum concurrently-running workers; beyond this, subscriptions
    /// queue for admission (default: 50)
    pub max_workers: usize,

    /// First restart delay after a crash (default: 30 seconds)
    pub backoff_base: Duration,

    /// Upper bound on the restart delay (default: 15 minutes)
    pub backoff_cap: Duration,

    /// Extra multiplier applied when the crash was an upstream throttle
    /// (default: 4)
    pub rate_limit_multiplier: u32,

    /// Consecutive crashes before the subscription is auto-paused
    /// (default: 3)
    pub max_consecutive_crashes: u32,

    /// Consecutive not-found responses before the subscription is
    /// auto-paused (default: 2)
    pub not_found_threshold: u32,

    /// Healthy polling span after which crash counters reset
    /// (default: 10 minutes)
    pub healthy_reset_after: Duration,

    /// Hard timeout for one provider call (default: 30 seconds)
    pub provider_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_workers: 50,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(15 * 60),
            rate_limit_multiplier: 4,
            max_consecutive_crashes: 3,
            not_found_threshold: 2,
            healthy_reset_after: Duration::from_secs(10 * 60),
            provider_timeout: Duration::from_secs(30),
        }
    }
}

/// Double the restart delay, saturating at the cap.
fn next_backoff(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Running,
    AwaitingRestart,
}

/// Supervisor bookkeeping for one subscription's worker.
struct ManagedWorker {
    state: WorkerState,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    consecutive_crashes: u32,
    consecutive_not_found: u32,
    restart_delay: Duration,
    healthy_since: Option<DateTime<Utc>>,
}

/// Snapshot of the supervisor's worker table for observability tooling.
#[derive(Debug, Serialize)]
pub struct SupervisorStats {
    /// Workers currently polling or sleeping
    pub live_workers: usize,
    /// Workers waiting out a crash backoff
    pub awaiting_restart: usize,
    /// Subscriptions queued behind the admission cap
    pub queued: usize,
    /// Per-subscription detail
    pub workers: Vec<WorkerStatusView>,
}

/// Per-subscription supervisor detail.
#[derive(Debug, Serialize)]
pub struct WorkerStatusView {
    /// Subscription id
    pub subscription_id: Uuid,
    /// `running` or `awaiting_restart`
    pub state: String,
    /// Consecutive crash count
    pub consecutive_crashes: u32,
    /// Consecutive upstream not-found count
    pub consecutive_not_found: u32,
}

/// Owns the pool of subscription workers: exactly one live worker per
/// active subscription, crash restarts with exponential backoff, and a
/// bounded admission queue.
///
/// Workers never restart themselves and never reconfigure mid-poll; every
/// lifecycle decision funnels through this table.
pub struct Supervisor {
    stores: Stores,
    provider: Arc<dyn AvailabilityProvider>,
    dispatcher: Arc<NotificationDispatcher>,
    config: SupervisorConfig,
    workers: RwLock<HashMap<Uuid, ManagedWorker>>,
    pending: Mutex<VecDeque<Uuid>>,
    event_tx: mpsc::Sender<WorkerEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<WorkerEvent>>>,
    /// Master cancellation token, cancelled during shutdown.
    cancel: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor. Call [`Supervisor::start`] to begin monitoring.
    pub fn new(
        stores: Stores,
        provider: Arc<dyn AvailabilityProvider>,
        dispatcher: Arc<NotificationDispatcher>,
        config: Option<SupervisorConfig>,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(256);

        Arc::new(Self {
            stores,
            provider,
            dispatcher,
            config: config.unwrap_or_default(),
            workers: RwLock::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// Start the event loop and a worker for every active subscription.
    pub async fn start(self: &Arc<Self>) -> Result<(), WatchError> {
        let rx = self
            .event_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| WatchError::Config("supervisor already started".to_string()))?;

        let event_loop = Arc::clone(self);
        tokio::spawn(async move { event_loop.run_event_loop(rx).await });

        let active = self.stores.subscriptions.list_active().await?;
        info!(count = active.len(), "Restoring active subscription watches");
        for subscription in active {
            self.watch(subscription.id).await?;
        }

        Ok(())
    }

    /// Ensure a worker exists for the subscription, queueing it if the
    /// concurrency cap is reached. Idempotent: a subscription that already
    /// has a worker (or a queued slot) is left alone.
    pub async fn watch(self: &Arc<Self>, subscription_id: Uuid) -> Result<(), WatchError> {
        let mut workers = self.workers.write().await;
        if workers.contains_key(&subscription_id) {
            debug!(%subscription_id, "Watch requested but worker already tracked");
            return Ok(());
        }

        let running = workers
            .values()
            .filter(|w| w.state == WorkerState::Running)
            .count();

        if running >= self.config.max_workers {
            let mut pending = self.pending.lock().await;
            if !pending.contains(&subscription_id) {
                info!(%subscription_id, "Worker cap reached; queueing subscription");
                pending.push_back(subscription_id);
            }
            return Ok(());
        }

        let managed = self.spawn_worker(subscription_id, Duration::ZERO);
        workers.insert(subscription_id, managed);
        Ok(())
    }

    /// Stop and forget the worker for a subscription (pause/cancel/delete).
    pub async fn unwatch(self: &Arc<Self>, subscription_id: Uuid) {
        self.pending
            .lock()
            .await
            .retain(|id| *id != subscription_id);

        let removed = self.workers.write().await.remove(&subscription_id);
        if let Some(managed) = removed {
            info!(%subscription_id, "Stopping subscription worker");
            managed.cancel.cancel();
        }

        self.admit_queued().await;
    }

    /// Apply an edited configuration: stop the current worker instance and
    /// start a fresh one so the new settings take effect atomically.
    pub async fn resync(self: &Arc<Self>, subscription_id: Uuid) -> Result<(), WatchError> {
        self.unwatch(subscription_id).await;

        match self.stores.subscriptions.get(subscription_id).await? {
            Some(subscription) if subscription.is_active() => self.watch(subscription_id).await,
            _ => Ok(()),
        }
    }

    /// Administrative view of the worker table.
    pub async fn stats(&self) -> SupervisorStats {
        let workers = self.workers.read().await;
        let queued = self.pending.lock().await.len();

        let mut views: Vec<WorkerStatusView> = workers
            .iter()
            .map(|(id, w)| WorkerStatusView {
                subscription_id: *id,
                state: match w.state {
                    WorkerState::Running => "running".to_string(),
                    WorkerState::AwaitingRestart => "awaiting_restart".to_string(),
                },
                consecutive_crashes: w.consecutive_crashes,
                consecutive_not_found: w.consecutive_not_found,
            })
            .collect();
        views.sort_by_key(|v| v.subscription_id);

        SupervisorStats {
            live_workers: workers
                .values()
                .filter(|w| w.state == WorkerState::Running)
                .count(),
            awaiting_restart: workers
                .values()
                .filter(|w| w.state == WorkerState::AwaitingRestart)
                .count(),
            queued,
            workers: views,
        }
    }

    /// Gracefully stop every worker and the event loop.
    pub async fn shutdown(&self) {
        info!("Shutting down subscription supervisor");
        self.cancel.cancel();

        let mut workers = self.workers.write().await;
        for (id, mut managed) in workers.drain() {
            managed.cancel.cancel();
            if let Some(handle) = managed.handle.take() {
                debug!(subscription_id = %id, "Waiting for worker to stop");
                let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
            }
        }

        info!("Subscription supervisor shut down");
    }

    // ---- private helpers ----

    /// Spawn the worker task for a subscription, optionally after a delay.
    fn spawn_worker(self: &Arc<Self>, subscription_id: Uuid, delay: Duration) -> ManagedWorker {
        let cancel = self.cancel.child_token();
        let worker_cancel = cancel.clone();
        let events = self.event_tx.clone();
        let ctx = WorkerContext {
            stores: self.stores.clone(),
            provider: self.provider.clone(),
            dispatcher: self.dispatcher.clone(),
            provider_timeout: self.config.provider_timeout,
        };

        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = worker_cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let exit = run_worker(ctx, subscription_id, worker_cancel, events.clone()).await;
            let _ = events
                .send(WorkerEvent::Exited {
                    subscription_id,
                    exit,
                })
                .await;
        });

        ManagedWorker {
            state: WorkerState::Running,
            cancel,
            handle: Some(handle),
            consecutive_crashes: 0,
            consecutive_not_found: 0,
            restart_delay: self.config.backoff_base,
            healthy_since: None,
        }
    }

    /// Admit queued subscriptions while capacity remains.
    async fn admit_queued(self: &Arc<Self>) {
        loop {
            let next = {
                let workers = self.workers.read().await;
                let running = workers
                    .values()
                    .filter(|w| w.state == WorkerState::Running)
                    .count();
                if running >= self.config.max_workers {
                    return;
                }
                match self.pending.lock().await.pop_front() {
                    Some(id) => id,
                    None => return,
                }
            };

            info!(subscription_id = %next, "Admitting queued subscription");
            if let Err(e) = self.watch(next).await {
                error!(subscription_id = %next, error = %e, "Failed to admit queued subscription");
            }
        }
    }

    async fn run_event_loop(self: Arc<Self>, mut rx: mpsc::Receiver<WorkerEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Supervisor event loop stopping");
                    return;
                }
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            match event {
                WorkerEvent::PollSucceeded { subscription_id } => {
                    self.handle_poll_succeeded(subscription_id).await;
                }
                WorkerEvent::Exited {
                    subscription_id,
                    exit,
                } => {
                    self.handle_exit(subscription_id, exit).await;
                }
                WorkerEvent::RestartDue { subscription_id } => {
                    self.handle_restart_due(subscription_id).await;
                }
            }
        }
    }

    /// Reset crash counters once a worker has stayed healthy long enough.
    async fn handle_poll_succeeded(&self, subscription_id: Uuid) {
        let mut workers = self.workers.write().await;
        let Some(managed) = workers.get_mut(&subscription_id) else {
            return;
        };

        let now = Utc::now();
        match managed.healthy_since {
            None => managed.healthy_since = Some(now),
            Some(since) => {
                let healthy_for = (now - since).to_std().unwrap_or_default();
                if healthy_for >= self.config.healthy_reset_after
                    && (managed.consecutive_crashes > 0 || managed.consecutive_not_found > 0)
                {
                    debug!(%subscription_id, "Sustained healthy polling; resetting crash counters");
                    managed.consecutive_crashes = 0;
                    managed.consecutive_not_found = 0;
                    managed.restart_delay = self.config.backoff_base;
                }
            }
        }
    }

    async fn handle_exit(self: &Arc<Self>, subscription_id: Uuid, exit: WorkerExit) {
        match exit {
            WorkerExit::Stopped(reason) => {
                debug!(%subscription_id, ?reason, "Worker stopped");
                // A cancelled worker was already removed by unwatch();
                // removal here is a no-op in that case.
                if !matches!(reason, StopReason::Cancelled) {
                    self.workers.write().await.remove(&subscription_id);
                }
                self.admit_queued().await;
            }
            WorkerExit::Crashed(error) => {
                self.handle_crash(subscription_id, error).await;
            }
        }
    }

    async fn handle_crash(self: &Arc<Self>, subscription_id: Uuid, error: WorkerError) {
        let decision = {
            let mut workers = self.workers.write().await;
            let Some(managed) = workers.get_mut(&subscription_id) else {
                // Unwatched while the crash event was in flight.
                return;
            };

            managed.state = WorkerState::AwaitingRestart;
            managed.handle = None;
            managed.healthy_since = None;

            let rate_limited = matches!(&error, WorkerError::Provider(ProviderError::RateLimited));
            let not_found = matches!(&error, WorkerError::Provider(ProviderError::NotFound));

            if not_found {
                managed.consecutive_not_found += 1;
            } else {
                managed.consecutive_not_found = 0;
                managed.consecutive_crashes += 1;
            }

            if managed.consecutive_not_found >= self.config.not_found_threshold {
                workers.remove(&subscription_id);
                CrashDecision::Pause("campsite not found upstream".to_string())
            } else if managed.consecutive_crashes >= self.config.max_consecutive_crashes {
                workers.remove(&subscription_id);
                CrashDecision::Pause(format!("paused after repeated failures: {error}"))
            } else {
                let mut delay = managed.restart_delay;
                if rate_limited {
                    // Throttle signals back off harder than an ordinary
                    // crash, and the worker's freed slot lets queued
                    // subscriptions run meanwhile.
                    delay *= self.config.rate_limit_multiplier;
                }
                managed.restart_delay =
                    next_backoff(managed.restart_delay, self.config.backoff_cap);
                CrashDecision::Retry(delay)
            }
        };

        match decision {
            CrashDecision::Pause(reason) => {
                warn!(%subscription_id, reason = %reason, "Pausing subscription after crashes");
                if let Err(e) = self
                    .stores
                    .subscriptions
                    .set_status(subscription_id, SubscriptionStatus::Paused, Some(reason))
                    .await
                {
                    error!(%subscription_id, error = %e, "Failed to pause crashed subscription");
                }
                self.admit_queued().await;
            }
            CrashDecision::Retry(delay) => {
                warn!(
                    %subscription_id,
                    delay_secs = delay.as_secs(),
                    "Worker crashed; restart scheduled"
                );

                let events = self.event_tx.clone();
                let cancel = self.cancel.child_token();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = events
                                .send(WorkerEvent::RestartDue { subscription_id })
                                .await;
                        }
                    }
                });

                // The crashed worker's slot is free during the backoff.
                self.admit_queued().await;
            }
        }
    }

    async fn handle_restart_due(self: &Arc<Self>, subscription_id: Uuid) {
        let still_active = match self.stores.subscriptions.get(subscription_id).await {
            Ok(Some(subscription)) => subscription.is_active(),
            Ok(None) => false,
            Err(e) => {
                error!(%subscription_id, error = %e, "Failed to load subscription for restart");
                false
            }
        };

        let mut workers = self.workers.write().await;
        if !workers.contains_key(&subscription_id) {
            return;
        }

        if !still_active {
            debug!(%subscription_id, "Subscription no longer active; dropping restart");
            workers.remove(&subscription_id);
            drop(workers);
            self.admit_queued().await;
            return;
        }

        let running = workers
            .values()
            .filter(|w| w.state == WorkerState::Running)
            .count();
        if running >= self.config.max_workers {
            // Capacity was consumed during the backoff; try again shortly.
            let events = self.event_tx.clone();
            let cancel = self.cancel.child_token();
            let delay = self.config.backoff_base;
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        let _ = events.send(WorkerEvent::RestartDue { subscription_id }).await;
                    }
                }
            });
            return;
        }

        info!(%subscription_id, "Restarting crashed worker");
        // Carry the crash bookkeeping into the fresh worker entry.
        let (crashes, not_found, delay) = match workers.get(&subscription_id) {
            Some(managed) => (
                managed.consecutive_crashes,
                managed.consecutive_not_found,
                managed.restart_delay,
            ),
            None => return,
        };

        let mut fresh = self.spawn_worker(subscription_id, Duration::ZERO);
        fresh.consecutive_crashes = crashes;
        fresh.consecutive_not_found = not_found;
        fresh.restart_delay = delay;
        workers.insert(subscription_id, fresh);
    }
}

enum CrashDecision {
    Pause(String),
    Retry(Duration),
}
