//! Periodic job registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use stowage_core::error::AppError;

/// A maintenance task the runner executes on a fixed interval.
#[async_trait]
pub trait JobHandler: Send + Sync + std::fmt::Debug {
    /// Get the job name used in logs.
    fn name(&self) -> &str;

    /// How often the job runs.
    fn interval(&self) -> Duration;

    /// Execute the job once.
    async fn execute(&self) -> Result<Value, JobExecutionError>;
}

/// Error from job execution
#[derive(Debug, thiserror::Error)]
pub enum JobExecutionError {
    /// Permanent failure; the job is not run again.
    #[error("Permanent job failure: {0}")]
    Permanent(String),

    /// Transient failure; the job runs again at its next interval.
    #[error("Transient job failure: {0}")]
    Transient(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] AppError),
}

#[derive(Debug)]
struct Registered {
    handler: Arc<dyn JobHandler>,
    next_run: Instant,
    disabled: bool,
}

/// Runs registered jobs when they come due.
#[derive(Debug, Default)]
pub struct JobExecutor {
    jobs: HashMap<String, Registered>,
}

impl JobExecutor {
    /// Create a new job executor
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. Its first run is one interval from now.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let name = handler.name().to_string();
        tracing::info!(job = %name, interval_secs = handler.interval().as_secs(), "Registered periodic job");
        let next_run = Instant::now() + handler.interval();
        self.jobs.insert(
            name,
            Registered {
                handler,
                next_run,
                disabled: false,
            },
        );
    }

    /// Check if a job is registered
    pub fn has_job(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Run every job that is due. Returns the names of the jobs that ran.
    pub async fn run_due(&mut self) -> Vec<String> {
        let now = Instant::now();
        let mut ran = Vec::new();
        for (name, job) in &mut self.jobs {
            if job.disabled || job.next_run > now {
                continue;
            }
            job.next_run = now + job.handler.interval();
            match job.handler.execute().await {
                Ok(result) => tracing::info!(job = %name, result = %result, "Job completed"),
                Err(JobExecutionError::Transient(msg)) => {
                    tracing::warn!(job = %name, error = %msg, "Job failed, will run again");
                }
                Err(JobExecutionError::Permanent(msg)) => {
                    tracing::error!(job = %name, error = %msg, "Job failed permanently, disabling");
                    job.disabled = true;
                }
                Err(JobExecutionError::Internal(e)) => {
                    tracing::error!(job = %name, error = %e, "Job internal error");
                }
            }
            ran.push(name.clone());
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Counting {
        runs: AtomicUsize,
        fail_permanently: bool,
    }

    #[async_trait]
    impl JobHandler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn execute(&self) -> Result<Value, JobExecutionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_permanently {
                return Err(JobExecutionError::Permanent("broken".into()));
            }
            Ok(Value::Null)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_run_once_per_interval() {
        let job = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail_permanently: false,
        });
        let mut executor = JobExecutor::new();
        executor.register(job.clone());

        assert!(executor.run_due().await.is_empty());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(executor.run_due().await, vec!["counting".to_string()]);
        assert!(executor.run_due().await.is_empty());
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_disables_job() {
        let job = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail_permanently: true,
        });
        let mut executor = JobExecutor::new();
        executor.register(job.clone());

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(61)).await;
            executor.run_due().await;
        }
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }
}
