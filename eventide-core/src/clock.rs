//! Pluggable "current time" and the deterministic clock used to drive
//! scheduled work in tests.
//!
//! - [`Clock`] - source of `now` plus a primitive to run an action at a due
//!   time
//! - [`SystemClock`] - wall-clock time, actions run on spawned tokio tasks
//! - [`VirtualClock`] - manually advanced time; advancing runs every action
//!   that falls due, including actions scheduled along the way, before it
//!   returns
//!
//! Code that needs the time without holding a clock calls [`now`], which
//! reads the clock installed for the current task by [`scope`] and falls
//! back to the system clock.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use thiserror::Error;

/// Work registered with a clock to run at a due time.
pub type Action = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Source of the current time and a way to run work later.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Run `action` once the clock reaches `due`. A due time in the past
    /// runs as soon as the clock gets to it.
    fn schedule(&self, due: DateTime<Utc>, action: Action);

    /// Run anything already due without moving time forward.
    ///
    /// Clocks that run actions on their own (like [`SystemClock`]) have
    /// nothing to do here.
    fn run_due(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Errors from moving a [`VirtualClock`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("virtual clock cannot move backwards from {current} to {requested}")]
    Backwards {
        current: DateTime<Utc>,
        requested: DateTime<Utc>,
    },
}

/// `at + duration`, saturating at the latest representable time.
pub(crate) fn offset(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn schedule(&self, due: DateTime<Utc>, action: Action) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let delay = (due - Utc::now()).to_std().unwrap_or_default();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    action().await;
                });
            }
            Err(_) => {
                tracing::error!(%due, "no tokio runtime available, scheduled action dropped");
            }
        }
    }
}

struct VirtualState {
    now: DateTime<Utc>,
    next_ticket: u64,
    // keyed by (due, ticket) so ties run in registration order
    queue: BTreeMap<(DateTime<Utc>, u64), Action>,
}

/// Manually advanced clock.
///
/// Time only moves when [`advance_by`](Self::advance_by) or
/// [`advance_to`](Self::advance_to) is called. Each advance runs the due
/// actions one at a time in due-time order, setting `now` to each action's
/// due time while it runs, and keeps going until nothing is due at or
/// before the target. Actions scheduled by running actions are picked up in
/// the same advance.
///
/// Clones share the same timeline.
///
/// Do not advance the clock from inside one of its own actions; the outer
/// advance is already responsible for that work.
#[derive(Clone)]
pub struct VirtualClock {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(VirtualState {
                now: start,
                next_ticket: 0,
                queue: BTreeMap::new(),
            })),
        }
    }

    /// Start at the current wall-clock time.
    #[must_use]
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VirtualState> {
        self.state.lock().expect("virtual clock lock poisoned")
    }

    /// Number of actions waiting for their due time.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Due time of the earliest waiting action.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.lock().queue.keys().next().map(|&(due, _)| due)
    }

    /// Move forward by `duration`, running everything that falls due.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches
    /// [`advance_to`](Self::advance_to).
    pub async fn advance_by(&self, duration: Duration) -> Result<(), ClockError> {
        let target = offset(self.now(), duration);
        self.advance_to(target).await
    }

    /// Move forward to `target`, running everything that falls due.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Backwards`] if `target` is earlier than the
    /// current time; the clock is left untouched.
    #[tracing::instrument(skip(self))]
    pub async fn advance_to(&self, target: DateTime<Utc>) -> Result<(), ClockError> {
        {
            let state = self.lock();
            if target < state.now {
                return Err(ClockError::Backwards {
                    current: state.now,
                    requested: target,
                });
            }
        }

        let mut fired = 0_usize;
        loop {
            let next = {
                let mut state = self.lock();
                let due = state.queue.keys().next().map(|&(due, _)| due);
                match due {
                    Some(due) if due <= target => {
                        if due > state.now {
                            state.now = due;
                        }
                        state.queue.pop_first().map(|(_, action)| action)
                    }
                    _ => None,
                }
            };
            let Some(action) = next else { break };
            action().await;
            fired += 1;
        }

        let mut state = self.lock();
        if target > state.now {
            state.now = target;
        }
        drop(state);
        tracing::debug!(fired, "virtual clock advanced");
        Ok(())
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    fn schedule(&self, due: DateTime<Utc>, action: Action) {
        let mut state = self.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.insert((due, ticket), action);
        tracing::trace!(%due, ticket, "action queued on virtual clock");
    }

    fn run_due(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let now = self.now();
            // cannot be backwards: target is the current time
            let _ = self.advance_to(now).await;
        })
    }
}

impl std::fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("VirtualClock")
            .field("now", &state.now)
            .field("pending", &state.queue.len())
            .finish()
    }
}

tokio::task_local! {
    static CURRENT: Arc<dyn Clock>;
}

/// Run `future` with `clock` as the current clock for this task.
///
/// Scopes nest: an inner scope overrides the outer one until it completes.
pub async fn scope<F: Future>(clock: Arc<dyn Clock>, future: F) -> F::Output {
    CURRENT.scope(clock, future).await
}

/// The clock installed by the innermost [`scope`], or the system clock.
pub fn current() -> Arc<dyn Clock> {
    CURRENT
        .try_with(Arc::clone)
        .unwrap_or_else(|_| Arc::new(SystemClock))
}

/// Current time according to [`current`].
pub fn now() -> DateTime<Utc> {
    CURRENT.try_with(|clock| clock.now()).unwrap_or_else(|_| Utc::now())
}
