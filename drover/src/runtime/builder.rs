use std::fmt;
use std::sync::Arc;

use crate::config::QueueConfig;
use crate::registry::HandlerRegistry;
use crate::store::{DeadLetterStore, JobStore};

use super::supervisor::QueueRuntime;

/// Builder for constructing a [`QueueRuntime`] with explicit dependencies.
///
/// The configuration is validated and both stores must be provided before
/// the runtime is constructed. The registry defaults to empty, in which case
/// every claimed job fails with `INVALID_JOB_TYPE`.
///
/// # Example
///
/// ```ignore
/// use drover::*;
///
/// let store = Arc::new(InMemoryStore::new());
/// let mut registry = HandlerRegistry::new();
/// registry.register("send_email", |job: Job| async move { anyhow::Ok(job.payload) });
///
/// let runtime = QueueRuntimeBuilder::new(QueueConfig::default())
///     .with_backend(store)
///     .with_registry(registry)
///     .build()?;
/// runtime.start().await?;
/// ```
pub struct QueueRuntimeBuilder {
    config: QueueConfig,
    store: Option<Arc<dyn JobStore>>,
    dead_letter_store: Option<Arc<dyn DeadLetterStore>>,
    registry: Option<HandlerRegistry>,
}

impl fmt::Debug for QueueRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRuntimeBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("dead_letter_store_set", &self.dead_letter_store.is_some())
            .field("registry_set", &self.registry.is_some())
            .finish()
    }
}

impl QueueRuntimeBuilder {
    /// Create a new builder with the given queue configuration.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            store: None,
            dead_letter_store: None,
            registry: None,
        }
    }

    /// Set the job store.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the dead-letter store.
    pub fn with_dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letter_store = Some(store);
        self
    }

    /// Use one backend for both jobs and dead-letter records.
    pub fn with_backend<S>(self, backend: Arc<S>) -> Self
    where
        S: JobStore + DeadLetterStore + 'static,
    {
        let dead_letters: Arc<dyn DeadLetterStore> = backend.clone();
        self.with_store(backend).with_dead_letter_store(dead_letters)
    }

    /// Set the handler registry.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the `QueueRuntime`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a store is missing.
    pub fn build(self) -> anyhow::Result<QueueRuntime> {
        self.config.validate()?;

        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("job store dependency missing"))?;
        let dead_letter_store = self
            .dead_letter_store
            .ok_or_else(|| anyhow::anyhow!("dead-letter store dependency missing"))?;
        let registry = self.registry.unwrap_or_default();

        if registry.is_empty() {
            tracing::warn!("queue runtime built without any registered handlers");
        }

        Ok(QueueRuntime::new(
            self.config,
            store,
            dead_letter_store,
            registry,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::InMemoryStore;

    #[test]
    fn test_build_requires_stores() {
        let err = QueueRuntimeBuilder::new(QueueConfig::default())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("job store"));

        let store = Arc::new(InMemoryStore::new());
        let err = QueueRuntimeBuilder::new(QueueConfig::default())
            .with_store(store)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("dead-letter store"));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let store = Arc::new(InMemoryStore::new());
        let config = QueueConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(
            QueueRuntimeBuilder::new(config)
                .with_backend(store)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_with_backend_builds_runtime() {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register("noop", |_job: crate::job::Job| async {
            anyhow::Ok(serde_json::Value::Null)
        });

        let builder = QueueRuntimeBuilder::new(QueueConfig::default())
            .with_backend(store)
            .with_registry(registry);
        let debug = format!("{builder:?}");
        assert!(debug.contains("store_set: true"));

        let runtime = builder.build().unwrap();
        assert!(runtime.registry().contains("noop"));
    }
}
