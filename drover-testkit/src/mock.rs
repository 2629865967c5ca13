use async_trait::async_trait;
use drover::{Job, JobHandler, JobId};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One observed handler invocation.
#[derive(Clone, Debug)]
pub struct CallRecord {
    /// Job being handled.
    pub job_id: JobId,
    /// Type of the job.
    pub job_type: String,
    /// Attempt number seen by the handler.
    pub attempts: u32,
    /// Payload as received.
    pub payload: Value,
    /// When the call started.
    pub at: Instant,
}

impl CallRecord {
    fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempts: job.attempts,
            payload: job.payload.clone(),
            at: Instant::now(),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct CallLog {
    calls: Arc<Mutex<Vec<CallRecord>>>,
}

impl CallLog {
    fn push(&self, job: &Job) -> usize {
        let mut calls = self.calls.lock();
        calls.push(CallRecord::from_job(job));
        calls.len()
    }

    fn snapshot(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

/// Succeeds with `{"echo": payload}` and records each call.
#[derive(Clone, Debug, Default)]
pub struct RecordingHandler {
    log: CallLog,
}

impl RecordingHandler {
    /// Create a handler with an empty call log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.log.snapshot()
    }

    /// Number of calls received.
    pub fn call_count(&self) -> usize {
        self.log.len()
    }

    /// Panic unless exactly `expected` calls were received.
    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.log.len();
        assert_eq!(
            actual, expected,
            "Expected {} handler calls, got {}",
            expected, actual
        );
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
        self.log.push(job);
        Ok(json!({ "echo": job.payload }))
    }
}

/// Fails the first `failures` calls, then succeeds with `{"call": n}`.
#[derive(Clone, Debug)]
pub struct ScriptedHandler {
    failures: usize,
    log: CallLog,
}

impl ScriptedHandler {
    /// Fail the first `failures` calls, then succeed.
    pub fn failing_times(failures: usize) -> Self {
        Self {
            failures,
            log: CallLog::default(),
        }
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.log.snapshot()
    }

    /// Number of calls received.
    pub fn call_count(&self) -> usize {
        self.log.len()
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
        let call = self.log.push(job);
        if call <= self.failures {
            anyhow::bail!("scripted failure {call} of {}", self.failures);
        }
        Ok(json!({ "call": call }))
    }
}

/// Always fails with the configured message.
#[derive(Clone, Debug)]
pub struct AlwaysFailHandler {
    message: String,
    log: CallLog,
}

impl AlwaysFailHandler {
    /// Fail every call with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            log: CallLog::default(),
        }
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.log.snapshot()
    }

    /// Number of calls received.
    pub fn call_count(&self) -> usize {
        self.log.len()
    }
}

#[async_trait]
impl JobHandler for AlwaysFailHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
        self.log.push(job);
        Err(anyhow::anyhow!("{}", self.message))
    }
}

/// Sleeps for a fixed duration before succeeding.
#[derive(Clone, Debug)]
pub struct SlowHandler {
    delay: Duration,
    log: CallLog,
}

impl SlowHandler {
    /// Succeed after sleeping for `delay`.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            log: CallLog::default(),
        }
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.log.snapshot()
    }

    /// Number of calls received.
    pub fn call_count(&self) -> usize {
        self.log.len()
    }
}

#[async_trait]
impl JobHandler for SlowHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
        self.log.push(job);
        tokio::time::sleep(self.delay).await;
        Ok(json!({ "slept_ms": self.delay.as_millis() as u64 }))
    }
}
