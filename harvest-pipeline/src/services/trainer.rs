//! Trainer adapter
//!
//! The trainer is an external collaborator: given the accumulated snapshots
//! it returns a model artifact and a scalar quality score. `CommandTrainer`
//! runs it as a child process.
//!
//! Process contract:
//! - stdin: JSON `{"window": TrainingWindow, "snapshots": [Snapshot]}`
//! - env `HARVEST_ARTIFACT_OUT`: path the artifact must be written to
//! - stdout: JSON `{"quality_score": f64, "metrics": {name: f64}}`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Snapshot, TrainingWindow};

/// Environment variable naming the artifact output path
pub const ARTIFACT_OUT_ENV: &str = "HARVEST_ARTIFACT_OUT";

/// Candidate produced by one training run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutput {
    pub artifact: Vec<u8>,
    pub quality_score: f64,
    pub metrics: BTreeMap<String, f64>,
}

#[async_trait]
pub trait Trainer: Send + Sync {
    /// Train a candidate on `snapshots`; any failure is `TrainingFailed`
    async fn train(
        &self,
        snapshots: &[Snapshot],
        window: &TrainingWindow,
    ) -> PipelineResult<TrainingOutput>;
}

#[derive(Serialize)]
struct TrainerInput<'a> {
    window: &'a TrainingWindow,
    snapshots: &'a [Snapshot],
}

#[derive(Deserialize)]
struct TrainerReport {
    quality_score: f64,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
}

/// Removes the staged artifact however training ends
struct StagedArtifact {
    path: PathBuf,
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Runs the configured trainer command as a child process
pub struct CommandTrainer {
    command: Vec<String>,
    staging_dir: PathBuf,
    timeout: Duration,
}

impl CommandTrainer {
    pub fn new(command: Vec<String>, staging_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command,
            staging_dir: staging_dir.into(),
            timeout,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }
}

#[async_trait]
impl Trainer for CommandTrainer {
    async fn train(
        &self,
        snapshots: &[Snapshot],
        window: &TrainingWindow,
    ) -> PipelineResult<TrainingOutput> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(PipelineError::TrainingFailed(
                "no trainer command configured".to_string(),
            ));
        };

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let staged = StagedArtifact {
            path: self
                .staging_dir
                .join(format!("candidate-{}.bin", Uuid::new_v4())),
        };

        let input = serde_json::to_vec(&TrainerInput { window, snapshots })?;

        tracing::info!(
            program = %program,
            snapshots = snapshots.len(),
            first_date = %window.first_date,
            last_date = %window.last_date,
            timeout_secs = self.timeout.as_secs(),
            "Starting trainer"
        );

        let mut child = Command::new(program)
            .args(args)
            .env(ARTIFACT_OUT_ENV, &staged.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::TrainingFailed(format!("failed to start {}: {}", program, e)))?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // The trainer may exit without reading its input; that shows up in its exit status
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            }
        };

        let run = async {
            let (_, output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(output) => output.map_err(|e| {
                PipelineError::TrainingFailed(format!("failed to wait for trainer: {}", e))
            })?,
            Err(_) => {
                return Err(PipelineError::TrainingFailed(format!(
                    "trainer exceeded {}s timeout",
                    self.timeout.as_secs()
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::TrainingFailed(format!(
                "trainer exited with {}: {}",
                output.status,
                tail(&stderr, 500)
            )));
        }

        let report: TrainerReport = serde_json::from_slice(&output.stdout).map_err(|e| {
            PipelineError::TrainingFailed(format!("unparsable trainer report: {}", e))
        })?;

        if !report.quality_score.is_finite() {
            return Err(PipelineError::TrainingFailed(format!(
                "non-finite quality score {}",
                report.quality_score
            )));
        }

        let artifact = match tokio::fs::read(&staged.path).await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => {
                return Err(PipelineError::TrainingFailed(
                    "trainer wrote an empty artifact".to_string(),
                ))
            }
            Err(e) => {
                return Err(PipelineError::TrainingFailed(format!(
                    "artifact not written to {}: {}",
                    staged.path.display(),
                    e
                )))
            }
        };

        tracing::info!(
            quality_score = report.quality_score,
            artifact_size = artifact.len(),
            metrics = report.metrics.len(),
            "Trainer finished"
        );

        Ok(TrainingOutput {
            artifact,
            quality_score: report.quality_score,
            metrics: report.metrics,
        })
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn window() -> TrainingWindow {
        TrainingWindow {
            first_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            last_date: NaiveDate::from_ymd_opt(2024, 1, 9).unwrap(),
            snapshot_count: 0,
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_missing_command_fails() {
        let dir = TempDir::new().unwrap();
        let trainer = CommandTrainer::new(vec![], dir.path(), Duration::from_secs(5));

        let err = trainer.train(&[], &window()).await.unwrap_err();
        assert!(matches!(err, PipelineError::TrainingFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_run_reads_artifact_and_report() {
        let dir = TempDir::new().unwrap();
        let trainer = CommandTrainer::new(
            sh(r#"cat > /dev/null; printf 'model' > "$HARVEST_ARTIFACT_OUT"; echo '{"quality_score": 0.81, "metrics": {"mae": 3.5}}'"#),
            dir.path(),
            Duration::from_secs(10),
        );

        let output = trainer.train(&[], &window()).await.unwrap();
        assert_eq!(output.artifact, b"model");
        assert_eq!(output.quality_score, 0.81);
        assert_eq!(output.metrics["mae"], 3.5);

        // Staged artifact is cleaned up
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let dir = TempDir::new().unwrap();
        let trainer = CommandTrainer::new(
            sh("echo boom >&2; exit 3"),
            dir.path(),
            Duration::from_secs(10),
        );

        match trainer.train(&[], &window()).await.unwrap_err() {
            PipelineError::TrainingFailed(msg) => assert!(msg.contains("boom"), "{}", msg),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_artifact_fails() {
        let dir = TempDir::new().unwrap();
        let trainer = CommandTrainer::new(
            sh(r#"cat > /dev/null; echo '{"quality_score": 0.5}'"#),
            dir.path(),
            Duration::from_secs(10),
        );

        assert!(matches!(
            trainer.train(&[], &window()).await.unwrap_err(),
            PipelineError::TrainingFailed(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unparsable_report_fails() {
        let dir = TempDir::new().unwrap();
        let trainer = CommandTrainer::new(
            sh(r#"cat > /dev/null; printf 'm' > "$HARVEST_ARTIFACT_OUT"; echo 'done'"#),
            dir.path(),
            Duration::from_secs(10),
        );

        assert!(matches!(
            trainer.train(&[], &window()).await.unwrap_err(),
            PipelineError::TrainingFailed(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_fails() {
        let dir = TempDir::new().unwrap();
        let trainer = CommandTrainer::new(sh("sleep 5"), dir.path(), Duration::from_millis(200));

        match trainer.train(&[], &window()).await.unwrap_err() {
            PipelineError::TrainingFailed(msg) => assert!(msg.contains("timeout"), "{}", msg),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("  short  ", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
    }
}
