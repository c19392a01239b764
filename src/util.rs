//! Task and signal helpers shared by every layer.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{error, trace};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ============================================================================
// Exit signal
// ============================================================================

/// One-shot broadcast "this object is gone" signal. Firing is idempotent and
/// late subscribers observe the fired state immediately.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    tx: watch::Sender<bool>,
}

impl ExitSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Returns true if this call fired the signal.
    pub fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for only errs when the sender is dropped, and `self` owns it.
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Owned future that resolves once fired, for use inside spawned tasks.
    pub fn subscribe(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            let _ = rx.wait_for(|fired| *fired).await;
        }
    }
}

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Supervised tasks
// ============================================================================

/// Spawns `task` and watches it from a second task. A panic is logged and
/// converted into a call to `on_fault`, so the owner can close itself instead
/// of silently losing a loop.
pub fn spawn_supervised<F, C>(name: &'static str, task: F, on_fault: C) -> AbortHandle
where
    F: Future<Output = ()> + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    let handle = tokio::spawn(task);
    let abort = handle.abort_handle();
    tokio::spawn(async move {
        match handle.await {
            Ok(()) => trace!(task = name, "task finished"),
            Err(e) if e.is_panic() => {
                error!(task = name, "task panicked");
                on_fault();
            }
            Err(_) => trace!(task = name, "task cancelled"),
        }
    });
    abort
}

/// Periodic callback. The first tick fires one period after start; the task
/// is aborted on [`Ticker::stop`] or drop.
#[derive(Debug)]
pub struct Ticker {
    handle: AbortHandle,
}

impl Ticker {
    pub fn start<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        Self { handle: handle.abort_handle() }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Removes duplicates and empty entries, keeping first occurrences in order.
pub fn dedup(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn exit_signal_fires_once() {
        let exit = ExitSignal::new();
        let waiter = tokio::spawn(exit.subscribe());
        assert!(!exit.is_fired());
        assert!(exit.fire());
        assert!(!exit.fire());
        waiter.await.unwrap();
        // Late waiters return immediately.
        exit.wait().await;
    }

    #[tokio::test]
    async fn panic_reaches_fault_handler() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        spawn_supervised("boom", async { panic!("boom") }, move || {
            let _ = tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_waits_one_period_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = Ticker::start(Duration::from_secs(15), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        ticker.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let out = dedup(vec!["b".into(), "a".into(), String::new(), "b".into()]);
        assert_eq!(out, vec!["b".to_string(), "a".to_string()]);
    }
}
