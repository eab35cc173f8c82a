//! Execution providers.
//!
//! Providers are polymorphic over `{validate, deploy, execute,
//! undeploy, name}`; the node never learns which variant runs behind
//! the uniform dispatch interface. This build ships the native (`elf`)
//! provider; `wasm` and `js` are stubbed out and refuse deploys.

use async_trait::async_trait;
use chrono::Utc;
use skiff_common::WorkloadType;
use skiff_proto::{LogEntry, LogLevel};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors from execution providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("workload type not supported on this platform: {0}")]
    Unsupported(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One deployed workload's execution backend.
#[async_trait]
pub trait ExecutionProvider: Send + Sync {
    /// Human-readable provider name.
    fn name(&self) -> &str;

    /// Check the staged artifact before accepting the deploy.
    async fn validate(&self) -> Result<(), ProviderError>;

    /// Start the workload.
    async fn deploy(&self) -> Result<(), ProviderError>;

    /// Run one triggered invocation and return its output.
    async fn execute(&self, payload: Vec<u8>) -> Result<Vec<u8>, ProviderError>;

    /// Stop the workload.
    async fn undeploy(&self) -> Result<(), ProviderError>;
}

/// Workload exit notification: (workload name, exit code).
pub type ExitSender = mpsc::UnboundedSender<(String, i32)>;

/// Build the provider for a workload type.
///
/// Unsupported types fail here, before any acknowledgement goes out.
pub fn provider_for(
    workload_type: &WorkloadType,
    workload_name: String,
    artifact_path: PathBuf,
    environment: HashMap<String, String>,
    logs: mpsc::UnboundedSender<LogEntry>,
    exits: ExitSender,
) -> Result<Box<dyn ExecutionProvider>, ProviderError> {
    match workload_type {
        WorkloadType::Elf => Ok(Box::new(NativeProvider {
            workload_name,
            artifact_path,
            environment,
            logs,
            exits,
            cancel: CancellationToken::new(),
        })),
        other => Err(ProviderError::Unsupported(other.as_str().to_string())),
    }
}

/// Runs a statically linked executable as a child process, streaming
/// its stdout/stderr as log entries.
pub struct NativeProvider {
    workload_name: String,
    artifact_path: PathBuf,
    environment: HashMap<String, String>,
    logs: mpsc::UnboundedSender<LogEntry>,
    exits: ExitSender,
    cancel: CancellationToken,
}

#[async_trait]
impl ExecutionProvider for NativeProvider {
    fn name(&self) -> &str {
        "ELF binary"
    }

    async fn validate(&self) -> Result<(), ProviderError> {
        let meta = tokio::fs::metadata(&self.artifact_path).await.map_err(|_| {
            ProviderError::Validation(format!(
                "artifact not found: {}",
                self.artifact_path.display()
            ))
        })?;
        if !meta.is_file() {
            return Err(ProviderError::Validation(format!(
                "artifact is not a file: {}",
                self.artifact_path.display()
            )));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err(ProviderError::Validation(format!(
                    "artifact is not executable: {}",
                    self.artifact_path.display()
                )));
            }
        }
        Ok(())
    }

    async fn deploy(&self) -> Result<(), ProviderError> {
        let mut child = Command::new(&self.artifact_path)
            .envs(&self.environment)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProviderError::Execution(format!("spawn failed: {e}")))?;

        if let Some(stdout) = child.stdout.take() {
            spawn_log_pump(stdout, self.workload_name.clone(), LogLevel::Info, self.logs.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_pump(stderr, self.workload_name.clone(), LogLevel::Error, self.logs.clone());
        }

        let workload_name = self.workload_name.clone();
        let exits = self.exits.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let code = status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1);
                    tracing::info!(workload = %workload_name, code, "Workload exited");
                    let _ = exits.send((workload_name, code));
                }
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(workload = %workload_name, error = %e, "Failed to kill workload");
                    }
                    let _ = exits.send((workload_name, -1));
                }
            }
        });

        Ok(())
    }

    async fn execute(&self, _payload: Vec<u8>) -> Result<Vec<u8>, ProviderError> {
        // Native workloads are long-running services; they consume
        // triggers through their own subscriptions, not through the
        // dispatch interface.
        Err(ProviderError::Execution(
            "triggered execution is not supported for native workloads".to_string(),
        ))
    }

    async fn undeploy(&self) -> Result<(), ProviderError> {
        self.cancel.cancel();
        Ok(())
    }
}

fn spawn_log_pump<R>(
    stream: R,
    workload_name: String,
    level: LogLevel,
    logs: mpsc::UnboundedSender<LogEntry>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = logs.send(LogEntry {
                text: line,
                level,
                timestamp: Utc::now(),
                source: format!("workload:{workload_name}"),
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> (
        mpsc::UnboundedSender<LogEntry>,
        mpsc::UnboundedReceiver<LogEntry>,
        ExitSender,
        mpsc::UnboundedReceiver<(String, i32)>,
    ) {
        let (logs_tx, logs_rx) = mpsc::unbounded_channel();
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        (logs_tx, logs_rx, exits_tx, exits_rx)
    }

    #[test]
    fn test_provider_factory() {
        let (logs_tx, _logs_rx, exits_tx, _exits_rx) = channels();
        let provider = provider_for(
            &WorkloadType::Elf,
            "echo".to_string(),
            PathBuf::from("/bin/true"),
            HashMap::new(),
            logs_tx.clone(),
            exits_tx.clone(),
        )
        .expect("elf is supported");
        assert_eq!(provider.name(), "ELF binary");

        for unsupported in [WorkloadType::Wasm, WorkloadType::Js] {
            let err = provider_for(
                &unsupported,
                "echo".to_string(),
                PathBuf::from("/bin/true"),
                HashMap::new(),
                logs_tx.clone(),
                exits_tx.clone(),
            )
            .map(|_| ())
            .expect_err("must be unsupported");
            assert!(matches!(err, ProviderError::Unsupported(_)));
        }
    }

    #[tokio::test]
    async fn test_validate_missing_artifact() {
        let (logs_tx, _logs_rx, exits_tx, _exits_rx) = channels();
        let provider = provider_for(
            &WorkloadType::Elf,
            "ghost".to_string(),
            PathBuf::from("/nonexistent/artifact"),
            HashMap::new(),
            logs_tx,
            exits_tx,
        )
        .unwrap();
        let err = provider.validate().await.unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deploy_streams_logs_and_exit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("skiff-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let script = dir.join("workload");
        tokio::fs::write(&script, "#!/bin/sh\necho hello from workload\n")
            .await
            .unwrap();
        tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .await
            .unwrap();

        let (logs_tx, mut logs_rx, exits_tx, mut exits_rx) = channels();
        let provider = provider_for(
            &WorkloadType::Elf,
            "hello".to_string(),
            script,
            HashMap::new(),
            logs_tx,
            exits_tx,
        )
        .unwrap();

        provider.validate().await.unwrap();
        provider.deploy().await.unwrap();

        let entry = tokio::time::timeout(std::time::Duration::from_secs(2), logs_rx.recv())
            .await
            .expect("log line arrives")
            .expect("channel open");
        assert_eq!(entry.text, "hello from workload");
        assert_eq!(entry.source, "workload:hello");

        let (name, code) = tokio::time::timeout(std::time::Duration::from_secs(2), exits_rx.recv())
            .await
            .expect("exit arrives")
            .expect("channel open");
        assert_eq!(name, "hello");
        assert_eq!(code, 0);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_native_trigger_unsupported() {
        let (logs_tx, _logs_rx, exits_tx, _exits_rx) = channels();
        let provider = provider_for(
            &WorkloadType::Elf,
            "echo".to_string(),
            PathBuf::from("/bin/true"),
            HashMap::new(),
            logs_tx,
            exits_tx,
        )
        .unwrap();
        assert!(provider.execute(Vec::new()).await.is_err());
    }
}
