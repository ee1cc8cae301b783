//! Ordered task pipeline
//!
//! A list of named steps run strictly in sequence, each independently
//! retryable. Session teardown uses this to guarantee ordering (kill the
//! process before evicting the registry record) while tolerating transient
//! step failures.

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

type StepFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send>>;
type StepFn = Box<dyn Fn() -> StepFuture + Send + Sync>;

pub struct PipelineStep {
    name: String,
    max_attempts: u32,
    run: StepFn,
}

pub struct TaskPipeline {
    name: String,
    steps: Vec<PipelineStep>,
}

impl TaskPipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step. The closure is invoked once per attempt.
    pub fn step<F, Fut>(mut self, name: impl Into<String>, max_attempts: u32, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        self.steps.push(PipelineStep {
            name: name.into(),
            max_attempts: max_attempts.max(1),
            run: Box::new(move || Box::pin(f())),
        });
        self
    }

    /// Run all steps in order. A step that exhausts its attempts aborts the
    /// pipeline; later steps do not run.
    pub async fn run(&self) -> AppResult<()> {
        for step in &self.steps {
            let mut last_error = None;
            let mut succeeded = false;
            for attempt in 1..=step.max_attempts {
                match (step.run)().await {
                    Ok(()) => {
                        debug!(pipeline = %self.name, step = %step.name, attempt, "step completed");
                        succeeded = true;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            pipeline = %self.name,
                            step = %step.name,
                            attempt,
                            max_attempts = step.max_attempts,
                            "step failed: {e}"
                        );
                        last_error = Some(e);
                    }
                }
            }
            if !succeeded {
                return Err(AppError::internal(format!(
                    "pipeline '{}' aborted at step '{}' after {} attempts: {}",
                    self.name,
                    step.name,
                    step.max_attempts,
                    last_error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                )));
            }
        }
        Ok(())
    }
}
