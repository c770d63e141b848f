//! Cancellable periodic task used for background eviction.
//!
//! The task runs on its own named thread so it never competes with request handling for
//! an async runtime. Cancellation only requests that no further runs happen: a run that is
//! already executing finishes normally and nothing waits for it.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Handle to a background eviction task.
///
/// Dropping the handle cancels the task.
#[derive(Debug)]
#[must_use = "dropping an EvictionHandle stops the background task"]
pub struct EvictionHandle {
    stop: Mutex<Option<Sender<()>>>,
    running: Arc<AtomicBool>,
}

impl EvictionHandle {
    /// A handle with no task behind it; cancelling it does nothing.
    pub fn inert() -> Self {
        Self { stop: Mutex::new(None), running: Arc::new(AtomicBool::new(false)) }
    }

    /// Request that no further runs happen. Idempotent and never blocks on an in-flight run.
    pub fn cancel(&self) {
        let sender = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = sender {
            // The task may already have exited on its own; that is fine.
            let _ = tx.send(());
        }
    }

    /// Whether the background thread is still alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for EvictionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Run `task` every `interval` on a dedicated thread until cancelled or until `task`
/// returns [`ControlFlow::Break`].
///
/// A zero interval yields an inert handle. If the thread cannot be spawned the failure is
/// logged and an inert handle is returned.
pub fn spawn_periodic<F>(name: &str, interval: Duration, mut task: F) -> EvictionHandle
where
    F: FnMut() -> ControlFlow<()> + Send + 'static,
{
    if interval.is_zero() {
        return EvictionHandle::inert();
    }

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let thread_name = name.to_string();

    let spawned = thread::Builder::new().name(thread_name.clone()).spawn(move || {
        debug!(target: "tollgate::eviction", task = %thread_name, ?interval, "periodic task started");
        loop {
            match stop_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if task().is_break() {
                        break;
                    }
                }
            }
        }
        flag.store(false, Ordering::Release);
        debug!(target: "tollgate::eviction", task = %thread_name, "periodic task stopped");
    });

    match spawned {
        Ok(_detached) => EvictionHandle { stop: Mutex::new(Some(stop_tx)), running },
        Err(err) => {
            warn!(target: "tollgate::eviction", task = %name, error = %err, "failed to spawn periodic task; eviction disabled");
            EvictionHandle::inert()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn runs_repeatedly_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = spawn_periodic("test-periodic", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        });
        assert!(handle.is_running());
        assert!(wait_until(Duration::from_secs(2), || runs.load(Ordering::SeqCst) >= 3));

        handle.cancel();
        assert!(wait_until(Duration::from_secs(2), || !handle.is_running()));
        let after_cancel = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn cancel_is_idempotent() {
        let handle = spawn_periodic("test-idempotent", Duration::from_millis(10), || {
            ControlFlow::Continue(())
        });
        handle.cancel();
        handle.cancel();
        assert!(wait_until(Duration::from_secs(2), || !handle.is_running()));
    }

    #[test]
    fn cancel_does_not_wait_for_in_flight_run() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let handle = spawn_periodic("test-slow", Duration::from_millis(5), move || {
            flag.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(300));
            ControlFlow::Continue(())
        });
        assert!(wait_until(Duration::from_secs(2), || started.load(Ordering::SeqCst)));

        let t = Instant::now();
        handle.cancel();
        assert!(t.elapsed() < Duration::from_millis(100));
        // The in-flight run completes, then the thread exits.
        assert!(handle.is_running());
        assert!(wait_until(Duration::from_secs(2), || !handle.is_running()));
    }

    #[test]
    fn break_stops_the_task() {
        let handle = spawn_periodic("test-break", Duration::from_millis(5), || ControlFlow::Break(()));
        assert!(wait_until(Duration::from_secs(2), || !handle.is_running()));
    }

    #[test]
    fn zero_interval_is_inert() {
        let handle = spawn_periodic("test-zero", Duration::ZERO, || ControlFlow::Continue(()));
        assert!(!handle.is_running());
        handle.cancel();
    }

    #[test]
    fn drop_cancels() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = spawn_periodic("test-drop", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        });
        let running = handle.running.clone();
        drop(handle);
        assert!(wait_until(Duration::from_secs(2), || !running.load(Ordering::Acquire)));
    }
}
