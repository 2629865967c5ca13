use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::job::Job;

/// Processing function for one job type.
///
/// Delivery is at-least-once: a handler may run again for a job it already
/// processed (after a lost lock or a crash), so it must tolerate re-execution.
/// Returning an error schedules a retry; returning a [`crate::JobError`]
/// through `anyhow` sets the stored error code.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process one claimed job. `Ok` is stored as the job result.
    async fn handle(&self, job: &Job) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
        (self)(job.clone()).await
    }
}

/// Lookup table from job type to handler.
///
/// Populated before the runtime starts, then shared read-only behind an `Arc`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any earlier registration.
    pub fn register<H>(&mut self, job_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.register_arc(job_type, Arc::new(handler))
    }

    /// Register an already shared handler.
    pub fn register_arc(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> &mut Self {
        let job_type = job_type.into();
        if self.handlers.insert(job_type.clone(), handler).is_some() {
            tracing::debug!(job_type = %job_type, "replaced existing job handler");
        }
        self
    }

    /// Handler registered for `job_type`.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Whether `job_type` has a handler.
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Number of registered job types.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
