//! Background task ownership for protocol clients.
//!
//! Every client runs its loops (discovery, poll, reconnect) through a
//! [`BackgroundTasks`] group. Stopping the group cancels its token and waits
//! for every loop to observe it, so `stop()` really halts all scheduled work.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long `shutdown` waits for a task before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A restartable group of cancellable background tasks.
pub struct BackgroundTasks {
    name: &'static str,
    cancel_token: Mutex<CancellationToken>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    /// Creates an empty group; `name` is used as the log component.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cancel_token: Mutex::new(CancellationToken::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Token observed by the group's tasks.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.lock().clone()
    }

    /// Returns true while at least one task is tracked.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handles.lock().iter().any(|h| !h.is_finished())
    }

    /// Spawns a task built from the group's current token.
    pub fn spawn<F, Fut>(&self, make: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(make(self.token()));
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Cancels every task and waits for them to finish.
    ///
    /// The group gets a fresh token afterwards so it can be started again.
    pub async fn shutdown(&self) {
        let token = {
            let mut guard = self.cancel_token.lock();
            std::mem::replace(&mut *guard, CancellationToken::new())
        };
        token.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        let count = handles.len();
        for mut handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                log::warn!("[{}] Background task did not stop in time, aborting", self.name);
                handle.abort();
            }
        }
        if count > 0 {
            log::debug!("[{}] Stopped {} background task(s)", self.name, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn shutdown_stops_cancellable_loops() {
        let tasks = BackgroundTasks::new("Test");
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_clone = stopped.clone();

        tasks.spawn(move |cancel| async move {
            cancel.cancelled().await;
            stopped_clone.store(true, Ordering::SeqCst);
        });
        assert!(tasks.is_running());

        tasks.shutdown().await;

        assert!(stopped.load(Ordering::SeqCst));
        assert!(!tasks.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn group_can_restart_after_shutdown() {
        let tasks = BackgroundTasks::new("Test");
        let ticks = Arc::new(AtomicUsize::new(0));

        tasks.spawn(|cancel| async move { cancel.cancelled().await });
        tasks.shutdown().await;

        let ticks_clone = ticks.clone();
        tasks.spawn(move |cancel| async move {
            let mut interval = tokio::time::interval(Duration::from_millis(10));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => { ticks_clone.fetch_add(1, Ordering::SeqCst); }
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(35)).await;
        tasks.shutdown().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected the restarted loop to tick, saw {}", seen);
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_task_is_aborted() {
        let tasks = BackgroundTasks::new("Test");
        tasks.spawn(|_cancel| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        tasks.shutdown().await;
        assert!(!tasks.is_running());
    }
}
