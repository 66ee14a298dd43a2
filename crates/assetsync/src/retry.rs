//! # Retry Scheduler
//!
//! Exponential backoff with a durable wake-up. The due time of the next
//! attempt is written to the state store before anything else happens, so a
//! process that is evicted before the timer fires picks the retry up again
//! on its next start. Timers only shorten the wait, they are never the source
//! of truth.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::state::{Phase, PersistedState, StateStore, StateUpdate};

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Attempts at or beyond this count are not rescheduled
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60 * 60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// `min(base * multiplier^attempt, max)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Outcome of asking the scheduler for another attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled {
        attempt: u32,
        delay: Duration,
        due_at: DateTime<Utc>,
    },
    Exhausted {
        attempts: u32,
    },
}

/// Callback run when a scheduled retry becomes due
pub type DueCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A wake-up facility that fires a callback at a due time
pub trait WakeTimer: Send + Sync {
    /// Register a wake-up at `due_at`, replacing any earlier registration
    fn arm(&self, due_at: DateTime<Utc>);

    /// Set the callback fired when the armed time is reached
    fn on_due(&self, callback: DueCallback);
}

/// Timer for hosts that rely on an external trigger (cron, systemd timer,
/// OS job scheduler) to restart the process. Only logs; the persisted due
/// time is picked up on the next start.
#[derive(Debug, Default)]
pub struct ExternalWakeTimer;

impl WakeTimer for ExternalWakeTimer {
    fn arm(&self, due_at: DateTime<Utc>) {
        info!(%due_at, "Retry persisted, waiting for external trigger");
    }

    fn on_due(&self, _callback: DueCallback) {}
}

/// In-process timer for long-running hosts
pub struct PollingWakeTimer {
    due_tx: watch::Sender<Option<DateTime<Utc>>>,
    callback: Mutex<Option<DueCallback>>,
}

impl Default for PollingWakeTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PollingWakeTimer {
    pub fn new() -> Self {
        let (due_tx, _) = watch::channel(None);
        Self {
            due_tx,
            callback: Mutex::new(None),
        }
    }

    /// Currently armed due time
    pub fn armed(&self) -> Option<DateTime<Utc>> {
        *self.due_tx.borrow()
    }

    /// Drive the timer until the returned handle is aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        let mut due_rx = self.due_tx.subscribe();

        loop {
            let due = *due_rx.borrow_and_update();
            let Some(due_at) = due else {
                if due_rx.changed().await.is_err() {
                    break;
                }
                continue;
            };

            let wait = (due_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    // Only disarm if nobody re-armed meanwhile
                    self.due_tx.send_if_modified(|current| {
                        if *current == Some(due_at) {
                            *current = None;
                            true
                        } else {
                            false
                        }
                    });

                    let callback = self.callback.lock().clone();
                    match callback {
                        Some(callback) => {
                            debug!(%due_at, "Retry timer fired");
                            callback().await;
                        }
                        None => warn!(%due_at, "Retry timer fired without a callback"),
                    }
                }
                changed = due_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

impl WakeTimer for PollingWakeTimer {
    fn arm(&self, due_at: DateTime<Utc>) {
        self.due_tx.send_replace(Some(due_at));
    }

    fn on_due(&self, callback: DueCallback) {
        *self.callback.lock() = Some(callback);
    }
}

pub struct RetryScheduler {
    policy: RetryPolicy,
    store: Arc<dyn StateStore>,
    timer: Arc<dyn WakeTimer>,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy, store: Arc<dyn StateStore>, timer: Arc<dyn WakeTimer>) -> Self {
        Self {
            policy,
            store,
            timer,
        }
    }

    /// Persist the due time for `attempt` and arm the timer.
    pub async fn schedule_retry(&self, attempt: u32) -> Result<RetryDecision, SyncError> {
        if attempt >= self.policy.max_attempts {
            self.store
                .write(StateUpdate::new().next_retry_at(None))
                .await?;
            warn!(attempt, max_attempts = self.policy.max_attempts, "Retry budget exhausted");
            return Ok(RetryDecision::Exhausted { attempts: attempt });
        }

        let delay = self.policy.delay(attempt);
        let due_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));

        self.store
            .write(
                StateUpdate::new()
                    .retry_count(attempt + 1)
                    .next_retry_at(Some(due_at)),
            )
            .await?;
        self.timer.arm(due_at);

        info!(attempt, delay_secs = delay.as_secs(), %due_at, "Scheduled retry");
        Ok(RetryDecision::Scheduled {
            attempt,
            delay,
            due_at,
        })
    }

    pub fn on_due(&self, callback: DueCallback) {
        self.timer.on_due(callback);
    }

    /// Re-arm the timer for a retry persisted by an earlier process
    pub fn rearm(&self, state: &PersistedState) {
        if state.phase == Phase::Error {
            if let Some(due_at) = state.next_retry_at {
                self.timer.arm(due_at);
            }
        }
    }
}

/// Due time of a persisted retry that should run now
pub fn due_retry(state: &PersistedState, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match (state.phase, state.next_retry_at) {
        (Phase::Error, Some(due_at)) if due_at <= now => Some(due_at),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;
    use futures::FutureExt;

    #[test]
    fn test_backoff_matches_formula_and_is_monotonic() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_delay: Duration::from_secs(600),
            max_attempts: 5,
        };

        let mut previous = Duration::ZERO;
        for n in 0..5u32 {
            let expected = Duration::from_secs(60 * 2u64.pow(n)).min(Duration::from_secs(600));
            let delay = policy.delay(n);
            assert_eq!(delay, expected, "attempt {n}");
            assert!(delay >= previous);
            previous = delay;
        }
        assert_eq!(policy.delay(4), Duration::from_secs(600));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_schedule_persists_due_time() {
        let store = Arc::new(MemoryStateStore::new());
        let timer = Arc::new(PollingWakeTimer::new());
        let scheduler = RetryScheduler::new(RetryPolicy::default(), store.clone(), timer.clone());

        let before = Utc::now();
        let decision = scheduler.schedule_retry(1).await.unwrap();
        let RetryDecision::Scheduled { delay, due_at, .. } = decision.clone() else {
            panic!("expected a scheduled retry, got {decision:?}");
        };
        assert_eq!(delay, Duration::from_secs(120));
        assert!(due_at >= before + chrono::Duration::seconds(120));

        let state = store.read().await.unwrap();
        assert_eq!(state.retry_count, 2);
        assert_eq!(state.next_retry_at, Some(due_at));
        assert_eq!(timer.armed(), Some(due_at));
    }

    #[tokio::test]
    async fn test_exhausted_after_max_attempts() {
        let store = Arc::new(MemoryStateStore::new());
        let scheduler = RetryScheduler::new(
            RetryPolicy::default(),
            store.clone(),
            Arc::new(ExternalWakeTimer),
        );

        let decision = scheduler.schedule_retry(5).await.unwrap();
        assert_eq!(decision, RetryDecision::Exhausted { attempts: 5 });
        assert_eq!(store.read().await.unwrap().next_retry_at, None);
    }

    #[test]
    fn test_due_retry() {
        let now = Utc::now();
        let mut state = PersistedState {
            phase: Phase::Error,
            next_retry_at: Some(now - chrono::Duration::seconds(5)),
            ..Default::default()
        };
        assert!(due_retry(&state, now).is_some());

        state.next_retry_at = Some(now + chrono::Duration::seconds(5));
        assert!(due_retry(&state, now).is_none());

        state.next_retry_at = Some(now - chrono::Duration::seconds(5));
        state.phase = Phase::Ready;
        assert!(due_retry(&state, now).is_none());
    }

    #[tokio::test]
    async fn test_polling_timer_fires_callback() {
        let timer = Arc::new(PollingWakeTimer::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        timer.on_due(Arc::new(move || {
            let tx = tx.clone();
            async move {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
            }
            .boxed()
        }));
        let handle = timer.clone().spawn();

        timer.arm(Utc::now() + chrono::Duration::milliseconds(20));
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("timer did not fire")
            .unwrap();
        assert_eq!(timer.armed(), None);

        handle.abort();
    }
}
