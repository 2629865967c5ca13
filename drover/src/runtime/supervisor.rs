use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::JobClient;
use crate::config::QueueConfig;
use crate::dead_letter::DeadLetterQueue;
use crate::registry::HandlerRegistry;
use crate::store::{DeadLetterStore, JobStore};

use super::worker::Worker;

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the worker tasks and the dead-letter housekeeper.
pub struct QueueRuntime {
    config: Arc<QueueConfig>,
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    client: JobClient,
    dead_letters: DeadLetterQueue,
    instance_id: String,
    shutdown_token: ShutdownToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for QueueRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task_count = self
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("QueueRuntime")
            .field("config", &self.config)
            .field("instance_id", &self.instance_id)
            .field("registry", &self.registry)
            .field("task_count", &task_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl QueueRuntime {
    /// Create a runtime over the given stores. Prefer [`super::QueueRuntimeBuilder`].
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn JobStore>,
        dead_letter_store: Arc<dyn DeadLetterStore>,
        registry: HandlerRegistry,
    ) -> Self {
        let config = Arc::new(config);
        let client = JobClient::new(Arc::clone(&store), Arc::clone(&config))
            .with_dead_letters(Arc::clone(&dead_letter_store));
        let dead_letters = DeadLetterQueue::new(dead_letter_store, client.clone());
        let instance = Uuid::new_v4().simple().to_string();

        Self {
            config,
            store,
            registry: Arc::new(registry),
            client,
            dead_letters,
            instance_id: instance[..8].to_string(),
            shutdown_token: ShutdownToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Get the runtime configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue and read API bound to this runtime's store.
    pub fn client(&self) -> JobClient {
        self.client.clone()
    }

    /// Dead-letter operations bound to this runtime's stores.
    pub fn dead_letters(&self) -> DeadLetterQueue {
        self.dead_letters.clone()
    }

    /// Handlers the workers dispatch to.
    pub fn registry(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Token cancelled by [`QueueRuntime::shutdown`].
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Identities the spawned workers use as `lock_owner`.
    pub fn worker_ids(&self) -> Vec<String> {
        (0..self.config.concurrency)
            .map(|i| {
                format!(
                    "{}-{}-w{}",
                    self.config.worker_prefix, self.instance_id, i
                )
            })
            .collect()
    }

    /// Build a standalone worker sharing this runtime's stores and registry.
    ///
    /// Useful for driving [`Worker::run_once`] directly.
    pub fn worker(&self, worker_id: impl Into<String>) -> Worker {
        Worker::new(
            worker_id,
            Arc::clone(&self.store),
            self.dead_letters.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.config),
        )
    }

    /// Spawn the worker pool and, when retention is configured, the housekeeper.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            anyhow::bail!("queue runtime already started");
        }
        if self.shutdown_token.is_cancelled() {
            anyhow::bail!("queue runtime has been shut down");
        }

        for worker_id in self.worker_ids() {
            let worker = self.worker(worker_id);
            let shutdown = self.shutdown_token.clone();
            handles.push(tokio::spawn(worker.run(shutdown)));
        }

        if let Some(retention_days) = self.config.dlq_retention_days {
            handles.push(self.spawn_housekeeper(retention_days));
        }

        tracing::info!(
            instance_id = %self.instance_id,
            concurrency = self.config.concurrency,
            job_types = ?self.registry.job_types(),
            "queue runtime started"
        );
        Ok(())
    }

    fn spawn_housekeeper(&self, retention_days: u32) -> JoinHandle<()> {
        let dead_letters = self.dead_letters.clone();
        let interval = self.config.dlq_prune_interval();
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = dead_letters.prune(retention_days).await {
                            tracing::warn!("housekeeper dead-letter prune error: {err}");
                        }
                    }
                }
            }
        })
    }

    /// Gracefully shut down the runtime and all workers.
    ///
    /// Workers finish their current iteration; each task is awaited for at
    /// most `shutdown_timeout_ms`.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of queue runtime");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let timeout = self.config.shutdown_timeout();
        for handle in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Worker task failed: {:?}", e),
                Err(_) => {
                    tracing::warn!("Worker task timed out during shutdown")
                }
            }
        }

        tracing::info!("Queue runtime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::InMemoryStore;
    use std::time::Duration;

    fn runtime(config: QueueConfig) -> QueueRuntime {
        let store = Arc::new(InMemoryStore::new());
        QueueRuntime::new(config, store.clone(), store, HandlerRegistry::new())
    }

    #[tokio::test]
    async fn test_shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::task::yield_now().await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_after_cancel() {
        let token = ShutdownToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already cancelled");
    }

    #[test]
    fn test_worker_ids_use_prefix_and_instance() {
        let runtime = runtime(QueueConfig {
            concurrency: 3,
            worker_prefix: "imports".into(),
            ..Default::default()
        });

        let ids = runtime.worker_ids();
        assert_eq!(ids.len(), 3);
        assert!(ids[0].starts_with("imports-"));
        assert!(ids[2].ends_with("-w2"));
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_shutdown_joins() {
        let runtime = runtime(QueueConfig {
            concurrency: 2,
            idle_poll_interval_ms: 10,
            ..Default::default()
        });

        runtime.start().await.unwrap();
        assert!(runtime.start().await.is_err());

        tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
            .await
            .expect("shutdown should finish")
            .unwrap();
        assert!(runtime.shutdown_token().is_cancelled());
        assert!(runtime.start().await.is_err());
    }
}
