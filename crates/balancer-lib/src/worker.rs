//! Background task handle with cooperative shutdown
//!
//! Both periodic loops (telemetry collection and migration decisions) run
//! as a spawned task that listens on a broadcast channel for shutdown.

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

/// Default time to wait for a loop to exit after signalling shutdown
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to a spawned periodic loop
pub struct BackgroundWorker {
    name: &'static str,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl BackgroundWorker {
    /// Spawn a loop; it receives the shutdown receiver it must select on
    pub fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run(shutdown_rx));
        Self {
            name,
            shutdown_tx,
            handle,
        }
    }

    /// Whether the loop task is still alive
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal shutdown and wait up to `timeout` for the loop to exit
    ///
    /// An in-flight tick is never interrupted; if it outlives the timeout
    /// the task is left to finish on its own.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(worker = self.name, error = %e, "Worker task ended abnormally");
            }
            Err(_) => {
                warn!(
                    worker = self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker did not stop in time, detaching"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();

        let worker = BackgroundWorker::spawn("test", move |mut shutdown| async move {
            let _ = shutdown.recv().await;
            flag.store(true, Ordering::SeqCst);
        });
        assert!(worker.is_active());

        worker.shutdown(Duration::from_secs(1)).await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stuck_task() {
        let worker = BackgroundWorker::spawn("stuck", |_shutdown| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let start = std::time::Instant::now();
        worker.shutdown(Duration::from_millis(50)).await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
