//! Container-backed sandbox implementation.
//!
//! Each run gets a fresh container with no network, capped memory, cpu and
//! pids, a read-only root filesystem, and a tmpfs scratch mount. The code
//! file and datasets are mounted read-only; artifacts land in a per-run
//! output directory.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{SandboxExecutor, SandboxOutcome, SandboxRun};
use crate::errors::SandboxError;
use crate::request::ResourceUsage;
use crate::types::Language;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    /// Container CLI to shell out to.
    pub runtime: String,
    pub image: String,
    pub memory_limit_mb: u64,
    pub cpus: f64,
    pub pids_limit: u32,
    pub tmpfs_size_mb: u64,
    /// Host directory holding per-run scratch dirs.
    pub work_dir: PathBuf,
    /// Stdout beyond this is truncated with a marker.
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "quarry-sandbox:latest".to_string(),
            memory_limit_mb: 512,
            cpus: 1.0,
            pids_limit: 50,
            tmpfs_size_mb: 100,
            work_dir: PathBuf::from("/var/lib/quarry/runs"),
            max_output_bytes: 10 * 1024 * 1024,
        }
    }
}

pub struct ContainerSandbox {
    config: SandboxConfig,
}

impl ContainerSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn interpreter(language: Language) -> (&'static str, &'static str) {
        match language {
            Language::Python => ("python3", "script.py"),
            Language::R => ("Rscript", "script.R"),
            Language::Sql => ("sql-runner", "script.sql"),
        }
    }

    /// Cut stdout at the configured cap, appending an explicit marker.
    fn truncate_output(&self, output: Vec<u8>) -> (String, bool) {
        let cap = self.config.max_output_bytes;
        if output.len() <= cap {
            return (String::from_utf8_lossy(&output).into_owned(), false);
        }
        let mut cut = String::from_utf8_lossy(&output[..cap]).into_owned();
        cut.push_str(&format!(
            "\n[Output truncated - exceeded {}MB limit]",
            cap / (1024 * 1024)
        ));
        (cut, true)
    }
}

#[async_trait]
impl SandboxExecutor for ContainerSandbox {
    #[tracing::instrument(skip(self, run), fields(language = %run.language, timeout_s = run.timeout.as_secs()))]
    async fn run_code(&self, run: &SandboxRun) -> Result<SandboxOutcome, SandboxError> {
        let run_id = Uuid::new_v4();
        let container_name = format!("quarry-run-{run_id}");
        let run_dir = self.config.work_dir.join(run_id.to_string());
        let output_dir = run_dir.join("output");

        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| SandboxError::Spawn(format!("create run dir: {e}")))?;

        let (interpreter, file_name) = Self::interpreter(run.language);
        let code_path = run_dir.join(file_name);
        tokio::fs::write(&code_path, &run.code)
            .await
            .map_err(|e| SandboxError::Spawn(format!("write code file: {e}")))?;

        let mut command = Command::new(&self.config.runtime);
        command
            .arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(&container_name)
            .arg("--network=none")
            .arg(format!("--memory={}m", self.config.memory_limit_mb))
            .arg(format!("--memory-swap={}m", self.config.memory_limit_mb))
            .arg(format!("--cpus={}", self.config.cpus))
            .arg(format!("--pids-limit={}", self.config.pids_limit))
            .arg("--read-only")
            .arg("--tmpfs")
            .arg(format!("/tmp:size={}M", self.config.tmpfs_size_mb))
            .arg("-v")
            .arg(format!("{}:/code/{}:ro", code_path.display(), file_name))
            .arg("-v")
            .arg(format!("{}:/output", output_dir.display()));

        for (name, host_path) in &run.datasets {
            command
                .arg("-v")
                .arg(format!("{host_path}:/data/{name}:ro"));
        }

        command
            .arg(&self.config.image)
            .arg(interpreter)
            .arg(format!("/code/{file_name}"))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(%container_name, "starting sandbox container");
        let started = Instant::now();
        let child = command
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("spawn {}: {e}", self.config.runtime)))?;

        let output = match tokio::time::timeout(run.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SandboxError::Spawn(format!("wait for container: {e}")));
            }
            Err(_) => {
                // The client process is killed on drop; stop the container
                // itself by name, best effort.
                let kill = Command::new(&self.config.runtime)
                    .arg("kill")
                    .arg(&container_name)
                    .output()
                    .await;
                if let Err(e) = kill {
                    warn!(%container_name, error = %e, "failed to kill timed-out container");
                }
                return Err(SandboxError::Timeout {
                    seconds: run.timeout.as_secs(),
                });
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);

        // OOM kills surface as 137 (SIGKILL) with the memory cap in place.
        if exit_code == 137 {
            return Err(SandboxError::ResourceExceeded(format!(
                "killed at the {}MB memory cap",
                self.config.memory_limit_mb
            )));
        }

        let (stdout, truncated) = self.truncate_output(output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let mut artifacts = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(&output_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                artifacts.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        artifacts.sort();

        Ok(SandboxOutcome {
            exit_code,
            stdout,
            stderr,
            truncated,
            artifacts,
            usage: ResourceUsage {
                cpu_time_ms: 0,
                memory_mb: 0,
                execution_time_ms: elapsed_ms,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_appends_marker() {
        let sandbox = ContainerSandbox::new(SandboxConfig {
            max_output_bytes: 1024 * 1024,
            ..SandboxConfig::default()
        });

        let small = b"hello".to_vec();
        let (text, truncated) = sandbox.truncate_output(small);
        assert_eq!(text, "hello");
        assert!(!truncated);

        let big = vec![b'x'; 2 * 1024 * 1024];
        let (text, truncated) = sandbox.truncate_output(big);
        assert!(truncated);
        assert!(text.ends_with("[Output truncated - exceeded 1MB limit]"));
        assert!(text.len() < 2 * 1024 * 1024);
    }

    #[test]
    fn interpreter_per_language() {
        assert_eq!(
            ContainerSandbox::interpreter(Language::Python),
            ("python3", "script.py")
        );
        assert_eq!(
            ContainerSandbox::interpreter(Language::R),
            ("Rscript", "script.R")
        );
        assert_eq!(
            ContainerSandbox::interpreter(Language::Sql),
            ("sql-runner", "script.sql")
        );
    }
}
