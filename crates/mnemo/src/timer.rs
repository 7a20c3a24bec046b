//! Registry of cancellable timers.
//!
//! Every delayed callback in the engine (cache invalidation in particular)
//! is scheduled through a [`TimerRegistry`]. Each timer is a tracked tokio
//! task racing its sleep against a child of the registry's cancellation
//! token, so [`TimerRegistry::cancel_all`] stops every pending timer at once
//! and nothing scheduled here can keep the runtime alive after shutdown.

use std::{
  collections::HashMap,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};

use parking_lot::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// A handle to one scheduled timer. Dropping it does not cancel the timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
  id:    TimerId,
  token: CancellationToken,
}

impl TimerHandle {
  pub fn id(&self) -> TimerId { self.id }

  /// Cancel the timer. Its callback will not run if it has not started.
  pub fn cancel(&self) { self.token.cancel(); }
}

struct Inner {
  pending: Mutex<HashMap<TimerId, CancellationToken>>,
  next_id: AtomicU64,
  root:    CancellationToken,
  tracker: TaskTracker,
}

/// Cloning is cheap; clones share the same set of timers.
#[derive(Clone)]
pub struct TimerRegistry {
  inner: Arc<Inner>,
}

impl Default for TimerRegistry {
  fn default() -> Self { Self::new() }
}

impl TimerRegistry {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        pending: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(0),
        root:    CancellationToken::new(),
        tracker: TaskTracker::new(),
      }),
    }
  }

  /// Run `callback` after `delay` unless cancelled first.
  ///
  /// Returns `None` without scheduling anything once the registry has been
  /// cancelled, or when called outside a tokio runtime. Callers must not
  /// rely on the callback for correctness.
  pub fn schedule<F>(&self, delay: Duration, callback: F) -> Option<TimerHandle>
  where
    F: FnOnce() + Send + 'static,
  {
    if self.inner.root.is_cancelled() || tokio::runtime::Handle::try_current().is_err() {
      return None;
    }

    let id = TimerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
    let token = self.inner.root.child_token();
    self.inner.pending.lock().insert(id, token.clone());

    let inner = Arc::clone(&self.inner);
    let task_token = token.clone();
    self.inner.tracker.spawn(async move {
      tokio::select! {
        biased;
        _ = task_token.cancelled() => {}
        _ = tokio::time::sleep(delay) => callback(),
      }
      inner.pending.lock().remove(&id);
    });

    tracing::trace!(timer = id.0, ?delay, "timer scheduled");
    Some(TimerHandle { id, token })
  }

  /// Timers that have neither fired nor finished cancelling.
  pub fn outstanding(&self) -> usize { self.inner.pending.lock().len() }

  pub fn is_cancelled(&self) -> bool { self.inner.root.is_cancelled() }

  /// Cancel every pending timer and refuse new ones. Returns how many were
  /// pending.
  pub fn cancel_all(&self) -> usize {
    let pending = self.outstanding();
    self.inner.root.cancel();
    self.inner.tracker.close();
    pending
  }

  /// Wait for cancelled timer tasks to finish, up to `deadline`. Returns
  /// `true` if they all did.
  pub async fn drain(&self, deadline: tokio::time::Instant) -> bool {
    tokio::time::timeout_at(deadline, self.inner.tracker.wait())
      .await
      .is_ok()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;

  use tokio::time::Instant;

  use super::*;

  #[tokio::test]
  async fn fires_after_delay_and_unregisters() {
    let registry = TimerRegistry::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);

    registry
      .schedule(Duration::from_millis(10), move || {
        f.fetch_add(1, Ordering::SeqCst);
      })
      .unwrap();
    assert_eq!(registry.outstanding(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(registry.outstanding(), 0);
  }

  #[tokio::test]
  async fn cancelled_timer_never_fires() {
    let registry = TimerRegistry::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);

    let handle = registry
      .schedule(Duration::from_millis(20), move || {
        f.fetch_add(1, Ordering::SeqCst);
      })
      .unwrap();
    handle.cancel();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(registry.outstanding(), 0);
  }

  #[tokio::test]
  async fn cancel_all_drains_many_long_timers_quickly() {
    let registry = TimerRegistry::new();
    for _ in 0..5_000 {
      registry.schedule(Duration::from_secs(3600), || {}).unwrap();
    }
    assert_eq!(registry.outstanding(), 5_000);

    let start = Instant::now();
    assert_eq!(registry.cancel_all(), 5_000);
    assert!(registry.drain(start + Duration::from_millis(200)).await);
    assert!(start.elapsed() < Duration::from_millis(200));
    assert_eq!(registry.outstanding(), 0);

    assert!(registry.schedule(Duration::from_millis(1), || {}).is_none());
  }

  #[test]
  fn schedule_outside_runtime_is_refused() {
    let registry = TimerRegistry::new();
    assert!(registry.schedule(Duration::from_millis(1), || {}).is_none());
    assert_eq!(registry.outstanding(), 0);
  }
}
