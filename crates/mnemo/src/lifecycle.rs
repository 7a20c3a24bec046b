//! Ownership of everything that can outlive a call: timers, background
//! tasks and the storage handle.
//!
//! Shutdown runs in a fixed order within the configured grace period:
//!
//! 1. cancel every registered timer and signal periodic workers to stop;
//! 2. let in-flight writes (embedding population) finish, abandoning any
//!    still running at half the grace period;
//! 3. close the store.
//!
//! After that nothing spawned through this module is left on the runtime.

use std::{
  future::Future,
  sync::atomic::{AtomicBool, Ordering},
  time::Duration,
};

use mnemo_core::store::PatternStore;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{Error, Result, timer::TimerRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
  pub timers_cancelled: usize,
  /// Background writes still running when the grace period ran out.
  pub tasks_abandoned:  usize,
  pub elapsed:          Duration,
}

pub struct Lifecycle {
  /// Parent of every query and worker token.
  root:          CancellationToken,
  /// Cancelled only once writes have had their share of the grace period.
  writes_cancel: CancellationToken,
  timers:        TimerRegistry,
  writes:        TaskTracker,
  workers:       TaskTracker,
  grace:         Duration,
  shut_down:     AtomicBool,
}

impl Lifecycle {
  pub fn new(grace: Duration) -> Self {
    Self {
      root: CancellationToken::new(),
      writes_cancel: CancellationToken::new(),
      timers: TimerRegistry::new(),
      writes: TaskTracker::new(),
      workers: TaskTracker::new(),
      grace,
      shut_down: AtomicBool::new(false),
    }
  }

  pub fn timers(&self) -> &TimerRegistry { &self.timers }

  /// A token cancelled when shutdown begins.
  pub fn token(&self) -> CancellationToken { self.root.child_token() }

  /// A token cancelled when in-flight writes are abandoned.
  pub fn write_token(&self) -> CancellationToken { self.writes_cancel.child_token() }

  pub fn is_shut_down(&self) -> bool { self.shut_down.load(Ordering::Acquire) }

  pub fn ensure_running(&self) -> Result<()> {
    if self.is_shut_down() { Err(Error::ShutDown) } else { Ok(()) }
  }

  /// Spawn a write that [`flush`](Self::flush) waits for. Returns `false`
  /// once shutdown has begun.
  pub fn spawn_write<F>(&self, fut: F) -> bool
  where
    F: Future<Output = ()> + Send + 'static,
  {
    if self.is_shut_down() {
      return false;
    }
    self.writes.spawn(fut);
    true
  }

  /// Spawn a long-running worker. It must stop when [`token`](Self::token)
  /// is cancelled.
  pub fn spawn_worker<F>(&self, fut: F) -> bool
  where
    F: Future<Output = ()> + Send + 'static,
  {
    if self.is_shut_down() {
      return false;
    }
    self.workers.spawn(fut);
    true
  }

  /// Writes currently in flight.
  pub fn pending_writes(&self) -> usize { self.writes.len() }

  /// Wait for every write spawned so far (and any spawned meanwhile).
  pub async fn flush(&self) {
    self.writes.close();
    self.writes.wait().await;
    if !self.is_shut_down() {
      self.writes.reopen();
    }
  }

  /// Stop everything and close `store`. A second call fails with
  /// [`Error::ShutDown`].
  pub async fn shutdown<S: PatternStore>(&self, store: &S) -> Result<ShutdownReport> {
    if self.shut_down.swap(true, Ordering::AcqRel) {
      return Err(Error::ShutDown);
    }
    let start = Instant::now();
    let deadline = start + self.grace;
    tracing::info!(grace = ?self.grace, "pattern memory shutting down");

    // 1. timers and workers
    let timers_cancelled = self.timers.cancel_all();
    self.root.cancel();
    self.workers.close();

    // 2. in-flight writes get half the grace period before being abandoned
    self.writes.close();
    let soft = start + self.grace / 2;
    let mut tasks_abandoned = 0;
    if tokio::time::timeout_at(soft, self.writes.wait()).await.is_err() {
      tasks_abandoned = self.writes.len();
      tracing::warn!(tasks_abandoned, "abandoning background writes");
      self.writes_cancel.cancel();
      let _ = tokio::time::timeout_at(deadline, self.writes.wait()).await;
    }

    if !self.timers.drain(deadline).await {
      tracing::warn!(outstanding = self.timers.outstanding(), "timers still draining");
    }
    if tokio::time::timeout_at(deadline, self.workers.wait()).await.is_err() {
      tracing::warn!(workers = self.workers.len(), "workers still running");
    }

    // 3. storage
    store.close().await.map_err(Error::storage)?;

    let report = ShutdownReport { timers_cancelled, tasks_abandoned, elapsed: start.elapsed() };
    tracing::info!(
      timers_cancelled = report.timers_cancelled,
      tasks_abandoned = report.tasks_abandoned,
      elapsed = ?report.elapsed,
      "pattern memory shut down"
    );
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn spawns_are_refused_after_shutdown_begins() {
    let lifecycle = Lifecycle::new(Duration::from_millis(100));
    lifecycle.shut_down.store(true, Ordering::Release);
    assert!(!lifecycle.spawn_write(async {}));
    assert!(!lifecycle.spawn_worker(async {}));
    assert!(matches!(lifecycle.ensure_running(), Err(Error::ShutDown)));
  }

  #[tokio::test]
  async fn flush_waits_for_writes_and_reopens() {
    let lifecycle = Lifecycle::new(Duration::from_millis(100));
    let (tx, rx) = tokio::sync::oneshot::channel();
    assert!(lifecycle.spawn_write(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      let _ = tx.send(());
    }));

    lifecycle.flush().await;
    assert!(rx.await.is_ok());
    assert_eq!(lifecycle.pending_writes(), 0);
    assert!(lifecycle.spawn_write(async {}));
  }
}
