// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cancellable timers on the tokio runtime.
//!
//! Each scheduled timer is a spawned task that sleeps and then invokes its
//! callback. Cancellation flips a flag under the same mutex the task holds
//! while running the callback, so once [`TimerHandle::cancel`] returns the
//! callback will not run again. Callbacks must not block: they run while that
//! mutex is held.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Spawns timers on the current tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TimerService;

impl TimerService {
    pub fn new() -> Self {
        Self
    }

    /// Runs `callback` once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callback = Some(callback);
        self.spawn(delay, None, false, move || {
            if let Some(callback) = callback.take() {
                callback();
            }
        })
    }

    /// Runs `callback` after `initial`, then again after each doubled interval
    /// (capped at `cap` when given) until cancelled.
    pub fn schedule_backoff<F>(
        &self,
        initial: Duration,
        cap: Option<Duration>,
        callback: F,
    ) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.spawn(initial, cap, true, callback)
    }

    fn spawn<F>(
        &self,
        initial: Duration,
        cap: Option<Duration>,
        repeat: bool,
        mut callback: F,
    ) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let cancelled = Arc::new(Mutex::new(false));
        let flag = cancelled.clone();

        tokio::spawn(async move {
            let mut interval = initial;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = &mut stop_rx => return,
                }
                {
                    let cancelled = flag.lock();
                    if *cancelled {
                        return;
                    }
                    callback();
                }
                if !repeat {
                    return;
                }
                interval = interval.saturating_mul(2);
                if let Some(cap) = cap {
                    interval = interval.min(cap);
                }
            }
        });

        TimerHandle {
            cancelled,
            stop: Mutex::new(Some(stop_tx)),
        }
    }
}

/// Handle to a scheduled timer. Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<Mutex<bool>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl TimerHandle {
    /// Cancels the timer. Idempotent; blocks while a callback is running.
    pub fn cancel(&self) {
        *self.cancelled.lock() = true;
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn once_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let _handle = TimerService::new().schedule_once(Duration::from_millis(500), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_up_to_cap() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let log = fired.clone();
        let start = tokio::time::Instant::now();
        let handle = TimerService::new().schedule_backoff(
            Duration::from_millis(500),
            Some(Duration::from_secs(4)),
            move || log.lock().push(start.elapsed().as_millis()),
        );

        tokio::time::sleep(Duration::from_millis(12_000)).await;
        handle.cancel();
        // 500, 1000, 2000, 4000, 4000 intervals
        assert_eq!(*fired.lock(), vec![500, 1500, 3500, 7500, 11500]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_any_later_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = TimerService::new().schedule_backoff(Duration::from_millis(100), None, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_cancels() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        drop(TimerService::new().schedule_once(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
