//! Isolated code execution.
//!
//! `SandboxExecutor` is the seam between the pipeline and the container
//! runtime. A completed process (any exit code) is an `Ok` outcome; timeouts
//! and spawn failures are errors. The pipeline decides what a non-zero exit
//! means.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::SandboxError;
use crate::request::ResourceUsage;
use crate::types::Language;

pub mod container;

pub use container::{ContainerSandbox, SandboxConfig};

/// One execution request.
#[derive(Debug, Clone)]
pub struct SandboxRun {
    pub language: Language,
    pub code: String,
    /// Dataset name -> host path, mounted read-only at /data/<name>.
    pub datasets: HashMap<String, String>,
    pub timeout: Duration,
}

/// What a completed execution produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// True when stdout was cut at the output cap.
    pub truncated: bool,
    /// File names collected from the run's output directory.
    pub artifacts: Vec<String>,
    pub usage: ResourceUsage,
}

impl SandboxOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn run_code(&self, run: &SandboxRun) -> Result<SandboxOutcome, SandboxError>;
}

/// A recorded run made against the mock.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub language: Language,
    pub code: String,
    pub timeout: Duration,
}

/// Scripted sandbox for tests: outcomes are served FIFO, runs are recorded.
#[derive(Default)]
pub struct MockSandbox {
    outcomes: Mutex<VecDeque<Result<SandboxOutcome, SandboxError>>>,
    runs: Mutex<Vec<RecordedRun>>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_success(&self, stdout: impl Into<String>) {
        self.outcomes.lock().push_back(Ok(SandboxOutcome {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            truncated: false,
            artifacts: Vec::new(),
            usage: ResourceUsage {
                cpu_time_ms: 150,
                memory_mb: 64,
                execution_time_ms: 420,
            },
        }));
    }

    pub fn push_failure(&self, exit_code: i32, stderr: impl Into<String>) {
        self.outcomes.lock().push_back(Ok(SandboxOutcome {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            truncated: false,
            artifacts: Vec::new(),
            usage: ResourceUsage::default(),
        }));
    }

    pub fn push_timeout(&self, seconds: u64) {
        self.outcomes
            .lock()
            .push_back(Err(SandboxError::Timeout { seconds }));
    }

    pub fn push_outcome(&self, outcome: SandboxOutcome) {
        self.outcomes.lock().push_back(Ok(outcome));
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().clone()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().len()
    }
}

#[async_trait]
impl SandboxExecutor for MockSandbox {
    async fn run_code(&self, run: &SandboxRun) -> Result<SandboxOutcome, SandboxError> {
        self.runs.lock().push(RecordedRun {
            language: run.language,
            code: run.code.clone(),
            timeout: run.timeout,
        });

        self.outcomes.lock().pop_front().unwrap_or_else(|| {
            Err(SandboxError::Spawn(
                "no scripted outcome remaining".to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_serves_fifo_and_records() {
        let sandbox = MockSandbox::new();
        sandbox.push_success(r#"{"rows": [1, 2]}"#);
        sandbox.push_timeout(30);

        let run = SandboxRun {
            language: Language::Python,
            code: "print(1)".to_string(),
            datasets: HashMap::new(),
            timeout: Duration::from_secs(30),
        };

        let first = sandbox.run_code(&run).await.unwrap();
        assert!(first.succeeded());

        let second = sandbox.run_code(&run).await.unwrap_err();
        assert!(second.is_timeout());

        assert_eq!(sandbox.run_count(), 2);
        assert_eq!(sandbox.runs()[0].language, Language::Python);
    }
}
