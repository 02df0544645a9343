//! Invocation of the external bulk loader.
//!
//! The loader is opaque: it receives a local file and a kind, and reports
//! back only through its exit status and captured output.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use loadstar_core::config::LoaderConfig;
use loadstar_core::CoreError;

use crate::registry::CancellationRegistry;

/// How long to wait for output pipes after the process is gone. Grandchildren
/// that inherited the pipes can keep them open indefinitely.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadKind {
    Items,
    Collections,
    Queryables,
}

impl fmt::Display for LoadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadKind::Items => "items",
            LoadKind::Collections => "collections",
            LoadKind::Queryables => "queryables",
        })
    }
}

impl FromStr for LoadKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "items" => Ok(LoadKind::Items),
            "collections" => Ok(LoadKind::Collections),
            "queryables" => Ok(LoadKind::Queryables),
            other => Err(CoreError::Other(format!("unknown load kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Success { stdout: String, stderr: String },
    Failed { code: Option<i32>, stderr: String },
    /// Stopped through the cancellation registry.
    Terminated,
}

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("failed to start loader '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for loader: {0}")]
    Wait(#[source] std::io::Error),
}

pub struct Loader {
    config: LoaderConfig,
}

impl Loader {
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    /// Full argument list for one invocation.
    pub fn args(&self, kind: LoadKind, file: &Path) -> Vec<String> {
        let file = file.display().to_string();
        let mut args = self.config.base_args.clone();
        match kind {
            LoadKind::Items | LoadKind::Collections => {
                args.push("load".into());
                args.push(kind.to_string());
                args.push(file);
            }
            LoadKind::Queryables => {
                args.push("load_queryables".into());
                args.push(file);
            }
        }
        if let Some(dsn) = &self.config.database_url {
            args.push(format!("--dsn={dsn}"));
        }
        match kind {
            LoadKind::Queryables => {
                args.push(format!("--index-fields={}", self.config.queryable_index_fields))
            }
            _ => args.push(format!("--method={}", self.config.method)),
        }
        args
    }

    fn command(&self, kind: LoadKind, file: &Path) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.args(kind, file))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run the loader for `file`, registered under `job_id` for the duration
    /// of the call so a cancel request can stop it.
    pub async fn run(
        &self,
        kind: LoadKind,
        file: &Path,
        registry: &CancellationRegistry,
        job_id: &str,
    ) -> Result<LoadOutcome, LoaderError> {
        let mut child = self.command(kind, file).spawn().map_err(|source| LoaderError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;
        let registration = registry.register(job_id, child.id());
        let handle = registration.handle().clone();
        debug!(job_id = %job_id, kind = %kind, pid = ?child.id(), file = %file.display(), "loader started");

        let stdout = child.stdout.take().map(|out| tokio::spawn(read_all(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(read_all(err)));

        let status = tokio::select! {
            status = child.wait() => status.map_err(LoaderError::Wait)?,
            _ = handle.force_requested() => {
                if let Err(e) = child.kill().await {
                    warn!(job_id = %job_id, error = %e, "failed to kill loader");
                }
                child.wait().await.map_err(LoaderError::Wait)?
            }
        };
        drop(registration);

        let stdout = drain(stdout).await;
        let stderr = drain(stderr).await;

        if handle.termination_requested() {
            info!(job_id = %job_id, file = %file.display(), "loader terminated by cancellation");
            return Ok(LoadOutcome::Terminated);
        }

        if status.success() {
            info!(job_id = %job_id, kind = %kind, file = %file.display(), "loader finished");
            Ok(LoadOutcome::Success { stdout, stderr })
        } else {
            warn!(
                job_id = %job_id,
                kind = %kind,
                code = ?status.code(),
                stderr = %stderr.trim(),
                "loader failed"
            );
            Ok(LoadOutcome::Failed { code: status.code(), stderr })
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, "loader output stream closed with error");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn drain(task: Option<JoinHandle<String>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout(OUTPUT_DRAIN, &mut task).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn config(program: &str, base_args: &[&str]) -> LoaderConfig {
        LoaderConfig {
            program: program.to_string(),
            base_args: base_args.iter().map(|s| s.to_string()).collect(),
            database_url: None,
            method: "insert_ignore".into(),
            queryable_index_fields: "dt_days,created".into(),
        }
    }

    /// Loader backed by `sh -c script`; the file path arrives as `$3`.
    fn shell_loader(script: &str) -> Loader {
        Loader::new(config("sh", &["-c", script, "loader"]))
    }

    #[test]
    fn builds_item_and_queryable_arguments() {
        let mut cfg = config("micromamba", &["run", "-p", "/opt/conda", "pypgstac"]);
        cfg.database_url = Some("postgresql://db/stac".into());
        let loader = Loader::new(cfg);
        let file = PathBuf::from("/tmp/shared/j_2021.ndjson");

        assert_eq!(
            loader.args(LoadKind::Items, &file),
            vec![
                "run", "-p", "/opt/conda", "pypgstac", "load", "items",
                "/tmp/shared/j_2021.ndjson", "--dsn=postgresql://db/stac", "--method=insert_ignore",
            ]
        );
        assert_eq!(
            loader.args(LoadKind::Collections, &file)[4..6],
            ["load".to_string(), "collections".to_string()]
        );
        assert_eq!(
            loader.args(LoadKind::Queryables, &file)[4..],
            [
                "load_queryables".to_string(),
                "/tmp/shared/j_2021.ndjson".to_string(),
                "--dsn=postgresql://db/stac".to_string(),
                "--index-fields=dt_days,created".to_string(),
            ]
        );
    }

    #[test]
    fn kind_parses_from_cli_names() {
        assert_eq!("queryables".parse::<LoadKind>().unwrap(), LoadKind::Queryables);
        assert!("schemas".parse::<LoadKind>().is_err());
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        let registry = CancellationRegistry::new(Duration::from_secs(1));
        let loader = shell_loader(r#"test "$2" = items && echo "loaded $3""#);

        let outcome = loader
            .run(LoadKind::Items, Path::new("/tmp/x.ndjson"), &registry, "job")
            .await
            .unwrap();

        match outcome {
            LoadOutcome::Success { stdout, .. } => assert_eq!(stdout.trim(), "loaded /tmp/x.ndjson"),
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(registry.active_count("job"), 0);
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let registry = CancellationRegistry::new(Duration::from_secs(1));
        let loader = shell_loader("echo 'bad row' >&2; exit 1");

        let outcome = loader
            .run(LoadKind::Items, Path::new("/tmp/x.ndjson"), &registry, "job")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            LoadOutcome::Failed { code: Some(1), stderr: "bad row\n".into() }
        );
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let registry = CancellationRegistry::new(Duration::from_secs(1));
        let loader = Loader::new(config("/nonexistent/loadstar-loader", &[]));

        let err = loader
            .run(LoadKind::Items, Path::new("/tmp/x.ndjson"), &registry, "job")
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_terminates_running_loader() {
        let registry = CancellationRegistry::new(Duration::from_secs(2));
        let loader = shell_loader("exec sleep 30");

        let run = loader.run(LoadKind::Items, Path::new("/tmp/x.ndjson"), &registry, "job");
        let cancel = async {
            while registry.active_count("job") == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            registry.cancel_all("job").await
        };

        let started = std::time::Instant::now();
        let (outcome, signalled) = tokio::join!(run, cancel);

        assert_eq!(outcome.unwrap(), LoadOutcome::Terminated);
        assert_eq!(signalled, 1);
        assert_eq!(registry.active_count("job"), 0);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
