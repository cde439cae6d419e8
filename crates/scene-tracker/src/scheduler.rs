//! Timers for the optimistic and suppression windows
//!
//! The engine never sleeps itself. It asks a [`Scheduler`] to deliver a
//! [`WindowElapsed`] message after a delay and keeps the returned
//! [`TimerHandle`] to cancel it. [`TokioScheduler`] delivers over a channel
//! from spawned sleep tasks; [`ManualScheduler`] runs on a virtual clock that
//! tests advance by hand.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::trace;

/// The two timed windows a scene can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    /// Forced active after an activation
    Optimistic,
    /// Forced inactive after a deactivation
    Suppression,
}

/// Message delivered when a window's timer fires
///
/// `generation` identifies the arming; a message whose generation no longer
/// matches the scene's armed window is stale and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowElapsed {
    pub scene_id: String,
    pub window: Window,
    pub generation: u64,
}

/// Cancellation handle for one scheduled timer
///
/// Cancelling is idempotent; cancelling a timer that already fired does
/// nothing.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_none()
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Source of time and delayed window messages
pub trait Scheduler: Send + Sync {
    fn now(&self) -> Instant;

    /// Deliver `elapsed` after `delay` unless the handle is cancelled first
    fn schedule(&self, delay: Duration, elapsed: WindowElapsed) -> TimerHandle;
}

/// Scheduler backed by tokio timers
///
/// Fired windows arrive on the receiver returned by [`TokioScheduler::new`].
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<WindowElapsed>,
}

impl TokioScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WindowElapsed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn schedule(&self, delay: Duration, elapsed: WindowElapsed) -> TimerHandle {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trace!(scene_id = %elapsed.scene_id, window = ?elapsed.window, "Window timer fired");
            // The receiver is gone once the tracker has stopped
            let _ = tx.send(elapsed);
        });

        TimerHandle::new(move || task.abort())
    }
}

#[derive(Default)]
struct ManualClock {
    elapsed: Duration,
    next_id: u64,
    /// Pending timers keyed by (deadline offset, schedule order)
    pending: BTreeMap<(Duration, u64), WindowElapsed>,
}

/// Deterministic scheduler on a virtual clock
///
/// Clones share the same clock.
#[derive(Clone)]
pub struct ManualScheduler {
    origin: Instant,
    clock: Arc<Mutex<ManualClock>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            clock: Arc::new(Mutex::new(ManualClock::default())),
        }
    }

    fn clock(&self) -> std::sync::MutexGuard<'_, ManualClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the clock forward and return the timers that came due, in order
    ///
    /// Timers scheduled while handling the returned messages are relative to
    /// the advanced clock.
    pub fn advance(&self, by: Duration) -> Vec<WindowElapsed> {
        let mut clock = self.clock();
        clock.elapsed += by;
        let now = clock.elapsed;

        let due: Vec<(Duration, u64)> = clock
            .pending
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();

        due.into_iter()
            .filter_map(|key| clock.pending.remove(&key))
            .collect()
    }

    /// Number of timers scheduled and neither fired nor cancelled
    pub fn pending(&self) -> usize {
        self.clock().pending.len()
    }

    /// Time elapsed on the virtual clock
    pub fn elapsed(&self) -> Duration {
        self.clock().elapsed
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn schedule(&self, delay: Duration, elapsed: WindowElapsed) -> TimerHandle {
        let key = {
            let mut clock = self.clock();
            clock.next_id += 1;
            let key = (clock.elapsed + delay, clock.next_id);
            clock.pending.insert(key, elapsed);
            key
        };

        let shared = self.clock.clone();
        TimerHandle::new(move || {
            shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending
                .remove(&key);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elapsed(scene_id: &str, generation: u64) -> WindowElapsed {
        WindowElapsed {
            scene_id: scene_id.to_string(),
            window: Window::Optimistic,
            generation,
        }
    }

    #[test]
    fn test_manual_scheduler_fires_in_order() {
        let scheduler = ManualScheduler::new();
        scheduler.schedule(Duration::from_secs(2), elapsed("b", 2));
        scheduler.schedule(Duration::from_secs(1), elapsed("a", 1));
        scheduler.schedule(Duration::from_secs(5), elapsed("c", 3));

        assert!(scheduler.advance(Duration::from_millis(999)).is_empty());

        let fired = scheduler.advance(Duration::from_secs(1));
        assert_eq!(fired, vec![elapsed("a", 1), elapsed("b", 2)]);
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.elapsed(), Duration::from_millis(1999));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let scheduler = ManualScheduler::new();
        let mut handle = scheduler.schedule(Duration::from_secs(1), elapsed("a", 1));

        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(scheduler.pending(), 0);
        assert!(scheduler.advance(Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn test_cancel_after_fire_is_harmless() {
        let scheduler = ManualScheduler::new();
        let mut handle = scheduler.schedule(Duration::from_secs(1), elapsed("a", 1));
        let mut other = scheduler.schedule(Duration::from_secs(3), elapsed("b", 2));

        assert_eq!(scheduler.advance(Duration::from_secs(1)).len(), 1);
        handle.cancel();
        assert_eq!(scheduler.pending(), 1);

        other.cancel();
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_now_follows_virtual_clock() {
        let scheduler = ManualScheduler::new();
        let start = scheduler.now();
        scheduler.advance(Duration::from_millis(750));
        assert_eq!(scheduler.now() - start, Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_delivers_and_cancels() {
        let (scheduler, mut rx) = TokioScheduler::new();

        let mut cancelled = scheduler.schedule(Duration::from_secs(1), elapsed("a", 1));
        scheduler.schedule(Duration::from_secs(2), elapsed("b", 2));
        cancelled.cancel();

        let start = tokio::time::Instant::now();
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, elapsed("b", 2));
        assert!(start.elapsed() >= Duration::from_secs(2));

        let mut noop = TimerHandle::noop();
        noop.cancel();
        assert!(noop.is_cancelled());
    }
}
