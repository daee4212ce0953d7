//! Auto-unpause timer scheduling
//!
//! One spawned task per armed timer rather than a polling loop. The
//! cancel/fire race is settled by a claim token: an `AtomicBool` that
//! exactly one side swaps. If the canceller claims it first the callback is
//! guaranteed never to run (`Cancelled`); if the firing task got there
//! first the caller learns it lost (`TooLate`).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Result of a cancellation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The timer was disarmed; the callback will never run
    Cancelled,
    /// The timer already claimed the token; the callback ran or is running
    TooLate,
    /// No timer armed for that key
    NotFound,
}

struct TimerEntry {
    session_id: Uuid,
    claimed: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    deadline: Instant,
}

/// Per-key one-shot timers
#[derive(Clone, Default)]
pub struct UnpauseScheduler {
    timers: Arc<Mutex<HashMap<String, TimerEntry>>>,
}

impl UnpauseScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `key`, replacing any previous one
    ///
    /// After `delay` the callback runs unless the timer is cancelled first.
    pub fn schedule<F, Fut>(&self, key: &str, session_id: Uuid, delay: Duration, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Replacing counts as cancelling the old timer.
        self.cancel(key);

        let claimed = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + delay;
        let handle = {
            let key = key.to_string();
            let claimed = claimed.clone();
            let timers = self.timers.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if claimed
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    // A canceller won the race.
                    return;
                }
                // Drop our own entry, but never a replacement's.
                {
                    let mut timers = timers.lock();
                    if let Some(entry) = timers.get(&key) {
                        if Arc::ptr_eq(&entry.claimed, &claimed) {
                            timers.remove(&key);
                        }
                    }
                }
                callback().await;
            })
        };

        self.timers.lock().insert(
            key.to_string(),
            TimerEntry {
                session_id,
                claimed,
                handle,
                deadline,
            },
        );
        tracing::debug!("Armed auto-unpause timer for {} ({:?})", key, delay);
    }

    /// Disarm the timer for `key`
    pub fn cancel(&self, key: &str) -> CancelOutcome {
        let Some(entry) = self.timers.lock().remove(key) else {
            return CancelOutcome::NotFound;
        };
        self.settle(key, entry)
    }

    /// Disarm only if the armed timer belongs to `session_id`
    pub fn cancel_for_session(&self, key: &str, session_id: Uuid) -> CancelOutcome {
        let entry = {
            let mut timers = self.timers.lock();
            match timers.get(key) {
                Some(entry) if entry.session_id == session_id => timers.remove(key),
                _ => None,
            }
        };
        match entry {
            Some(entry) => self.settle(key, entry),
            None => CancelOutcome::NotFound,
        }
    }

    fn settle(&self, key: &str, entry: TimerEntry) -> CancelOutcome {
        if entry
            .claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            entry.handle.abort();
            tracing::debug!("Cancelled auto-unpause timer for {}", key);
            CancelOutcome::Cancelled
        } else {
            CancelOutcome::TooLate
        }
    }

    /// Time left before the timer for `key` fires
    pub fn remaining(&self, key: &str) -> Option<Duration> {
        self.timers.lock().get(key).map(|entry| {
            entry
                .deadline
                .checked_duration_since(Instant::now())
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Keys with an armed timer
    pub fn active_timers(&self) -> Vec<String> {
        self.timers.lock().keys().cloned().collect()
    }
}
