//! Pluggable ticker backends: the thing that calls a closure every `interval`
//! until told to stop. [`IntervalTicker`] is the only implementation shipped
//! here — an external scheduler (a cluster cron, a cloud Scheduler job) can
//! implement [`TickerBackend`] instead and drive the same
//! [`super::service::SchedulerService`] without it knowing the difference.
//!
//! Grounded in the same `watch`-channel shutdown and background poll task
//! shape as [`crate::worker::WorkerLoop`], itself grounded in the teacher's
//! `worker::pool::WorkerPool`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub type TickFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A closure invoked on every tick. Takes no arguments — the
/// [`super::service::SchedulerService`] closes over whatever state it needs.
pub type TickFn = Arc<dyn Fn() -> TickFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerHealth {
    Stopped,
    Running,
}

#[derive(Debug, thiserror::Error)]
pub enum TickerError {
    #[error("ticker is already running")]
    AlreadyRunning,
}

/// A backend that calls `tick` on a schedule until stopped.
pub trait TickerBackend: Send + Sync + 'static {
    fn start(self: Arc<Self>, interval: Duration, tick: TickFn) -> Result<(), TickerError>;
    fn stop(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
    fn health(&self) -> TickerHealth;
}

/// The default ticker backend: a `tokio::time::interval` loop with
/// `watch`-channel graceful shutdown.
#[derive(Default)]
pub struct IntervalTicker {
    inner: std::sync::Mutex<Option<Inner>>,
}

struct Inner {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl IntervalTicker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TickerBackend for IntervalTicker {
    fn start(self: Arc<Self>, interval: Duration, tick: TickFn) -> Result<(), TickerError> {
        let mut guard = self.inner.lock().unwrap();
        if guard.is_some() {
            return Err(TickerError::AlreadyRunning);
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                tick().await;
            }
        });

        *guard = Some(Inner { shutdown_tx, handle });
        Ok(())
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap().take();
            if let Some(inner) = inner {
                let _ = inner.shutdown_tx.send(true);
                let _ = inner.handle.await;
            }
        })
    }

    fn health(&self) -> TickerHealth {
        if self.inner.lock().unwrap().is_some() {
            TickerHealth::Running
        } else {
            TickerHealth::Stopped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn ticks_until_stopped() {
        let ticker = Arc::new(IntervalTicker::new());
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = count.clone();

        ticker
            .clone()
            .start(
                Duration::from_millis(5),
                Arc::new(move || {
                    let count = count_clone.clone();
                    Box::pin(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        ticker.stop().await;
        assert!(count.load(Ordering::SeqCst) >= 2);
        assert_eq!(ticker.health(), TickerHealth::Stopped);
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let ticker = Arc::new(IntervalTicker::new());
        ticker
            .clone()
            .start(Duration::from_secs(60), Arc::new(|| Box::pin(async {})))
            .unwrap();
        let err = ticker.clone().start(Duration::from_secs(60), Arc::new(|| Box::pin(async {})));
        assert!(matches!(err, Err(TickerError::AlreadyRunning)));
        ticker.stop().await;
    }
}
