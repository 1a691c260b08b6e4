//! Batch scheduler backend
//!
//! Submits jobs to an external batch scheduler. Two submission paths exist,
//! chosen once when the backend is constructed:
//!
//! - **Direct**: the scheduler's submit command is available on this host.
//!   The opaque option map becomes command-line flags, the rendered script is
//!   appended, and the native job id is parsed from the command's stdout.
//! - **Inbox**: the command is unavailable (restricted compute nodes). The
//!   script is dropped into a shared inbox directory under a unique stem and
//!   a sibling `<stem>.id` file, written by the listener daemon, is polled
//!   for. The id-file's integer content is the submission result: at least 1
//!   means accepted, 0 or negative means rejected.
//!
//! The inbox wait has no timeout of its own; it ends only when the listener
//! answers or the job's cancellation token fires.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assets::JobAssets;
use crate::error::{Error, Result};
use crate::job::Backend;
use crate::tail::{TailHandle, tail_output};
use crate::template::END_OF_JOB;

/// How often the inbox is re-checked for the id-file
pub const ID_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Opaque scheduler option mapping, forwarded verbatim
///
/// Keys and values are never validated or interpreted here; rejecting unknown
/// options is the scheduler's job. Keys use underscores and are rendered as
/// `--dashed-key=value` flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchOptions(pub BTreeMap<String, String>);

impl BatchOptions {
    /// Creates an empty option map
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an option
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Looks up an option
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Renders the map as scheduler command-line flags
    pub fn to_args(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(k, v)| format!("--{}={}", k.replace('_', "-"), v))
            .collect()
    }
}

impl FromIterator<(String, String)> for BatchOptions {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The external scheduler's command-line surface
#[derive(Debug, Clone)]
pub struct SchedulerCommand {
    /// Submit command name (e.g. `sbatch`)
    pub submit_cmd: String,
    /// Prefix of the scheduler's default output files (`<prefix>-<id>.out`)
    pub output_prefix: String,
}

impl SchedulerCommand {
    /// Slurm's conventional command surface
    pub fn slurm() -> Self {
        Self {
            submit_cmd: "sbatch".to_string(),
            output_prefix: "slurm".to_string(),
        }
    }

    /// Probes whether the submit command runs on this host
    pub fn is_available(&self) -> bool {
        std::process::Command::new(&self.submit_cmd)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Runs the submit command and parses the native job id from its stdout
    pub async fn submit(&self, args: &[String], script: &Path) -> Result<i64> {
        let output = Command::new(&self.submit_cmd)
            .args(args)
            .arg(script)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Scheduler(format!(
                "{} exited with {}: {}",
                self.submit_cmd,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_submit_output(&stdout).ok_or_else(|| {
            Error::Scheduler(format!(
                "could not parse a job id from {} output: {}",
                self.submit_cmd,
                stdout.trim()
            ))
        })
    }

    /// Expected output-log path for a job id, per scheduler convention
    pub fn output_path(&self, job_id: i64) -> PathBuf {
        PathBuf::from(format!("{}-{}.out", self.output_prefix, job_id))
    }
}

/// Extracts the job id from submit-command output such as
/// `Submitted batch job 42` (the last integer token wins)
pub fn parse_submit_output(stdout: &str) -> Option<i64> {
    stdout
        .split_whitespace()
        .rev()
        .find_map(|token| token.parse::<i64>().ok())
}

/// Resolved submission path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Call the scheduler's submit command on this host
    Direct,
    /// Hand the script to the listener through the shared inbox
    Inbox,
}

/// Backend submitting jobs to a batch scheduler
pub struct BatchBackend {
    scheduler: SchedulerCommand,
    options: BatchOptions,
    inbox: PathBuf,
    mode: SubmitMode,
    id_poll_interval: Duration,
}

impl BatchBackend {
    /// Creates a backend, probing the scheduler command once to pick the
    /// submission mode
    pub fn new(scheduler: SchedulerCommand, options: BatchOptions, inbox: impl Into<PathBuf>) -> Self {
        let mode = if scheduler.is_available() {
            SubmitMode::Direct
        } else {
            SubmitMode::Inbox
        };
        Self::with_mode(scheduler, options, inbox, mode)
    }

    /// Creates a backend with an explicit submission mode, bypassing the
    /// availability probe
    pub fn with_mode(
        scheduler: SchedulerCommand,
        options: BatchOptions,
        inbox: impl Into<PathBuf>,
        mode: SubmitMode,
    ) -> Self {
        Self {
            scheduler,
            options,
            inbox: inbox.into(),
            mode,
            id_poll_interval: ID_POLL_INTERVAL,
        }
    }

    /// The submission mode this backend resolved to
    pub fn mode(&self) -> SubmitMode {
        self.mode
    }

    /// Where the scheduler will write this job's output log: the explicit
    /// `output` option if present, otherwise the scheduler's convention
    pub fn resolve_output_path(&self, job_id: i64) -> PathBuf {
        match self.options.get("output") {
            Some(path) => PathBuf::from(path),
            None => self.scheduler.output_path(job_id),
        }
    }

    async fn submit_direct(&self, assets: &JobAssets) -> Result<i64> {
        let args = self.options.to_args();
        debug!(
            "submitting {} via {} {:?}",
            assets.script_path().display(),
            self.scheduler.submit_cmd,
            args
        );
        self.scheduler.submit(&args, &assets.script_path()).await
    }

    async fn submit_inbox(&self, assets: &JobAssets, cancel: &CancellationToken) -> Result<i64> {
        std::fs::create_dir_all(&self.inbox)?;

        let stem = format!("job-{}", Uuid::new_v4());
        let script = assets.script()?;

        // Drop through a temp name and rename, so the listener never sees a
        // half-written script.
        let tmp_path = self.inbox.join(format!("{stem}.tmp"));
        let script_path = self.inbox.join(format!("{stem}.sh"));
        let id_path = self.inbox.join(format!("{stem}.id"));
        std::fs::write(&tmp_path, &script)?;
        std::fs::rename(&tmp_path, &script_path)?;

        info!("queued {} in inbox {}", stem, self.inbox.display());

        // The id-file's appearance is the only acknowledgment; the wait is
        // bounded by the listener's liveness and the cancellation token.
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if id_path.exists() {
                break;
            }
            tokio::time::sleep(self.id_poll_interval).await;
        }

        let content = std::fs::read_to_string(&id_path)?;
        if let Err(e) = std::fs::remove_file(&id_path) {
            warn!("failed to remove consumed id-file {}: {}", id_path.display(), e);
        }

        let id = content.trim().parse::<i64>().map_err(|_| {
            Error::Scheduler(format!("malformed id-file for {stem}: {:?}", content.trim()))
        })?;

        if id < 1 {
            return Err(Error::Submission { code: id, script });
        }
        Ok(id)
    }
}

#[async_trait]
impl Backend for BatchBackend {
    async fn submit(&self, assets: &JobAssets, cancel: &CancellationToken) -> Result<i64> {
        match self.mode {
            SubmitMode::Direct => self.submit_direct(assets).await,
            SubmitMode::Inbox => self.submit_inbox(assets, cancel).await,
        }
    }

    /// Starts tailing the scheduler's output log for the job
    ///
    /// Any stale log of the same name is removed first so the tail cannot
    /// replay a previous run.
    async fn follow(&self, job_id: i64, _assets: &JobAssets) -> Result<Option<TailHandle>> {
        let output = self.resolve_output_path(job_id);
        if output.exists() {
            std::fs::remove_file(&output)?;
        }

        let label = format!("{}-{}", self.scheduler.output_prefix, job_id);
        Ok(Some(tail_output(output, label, END_OF_JOB.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Invocation;
    use crate::template::ScriptTemplate;
    use serde_json::json;

    fn assets_with_script(dir: &Path) -> JobAssets {
        let assets = JobAssets::new(dir.join("job")).unwrap();
        let invocation = Invocation::with_args("add", vec![json!(1), json!(2)]);
        let template = ScriptTemplate::new("worker {call_path} {ret_path}");
        assets.create(&invocation, &template).unwrap();
        assets
    }

    #[test]
    fn test_options_render_as_dashed_flags() {
        let options = BatchOptions::new()
            .set("cpus_per_task", "1")
            .set("mem_per_cpu", "100M");
        assert_eq!(
            options.to_args(),
            vec!["--cpus-per-task=1", "--mem-per-cpu=100M"]
        );
    }

    #[test]
    fn test_options_json_roundtrip() {
        let options = BatchOptions::new().set("time", "00:01:00");
        let json = serde_json::to_string(&options).unwrap();
        assert_eq!(json, r#"{"time":"00:01:00"}"#);
        let back: BatchOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, options);
    }

    #[test]
    fn test_parse_submit_output() {
        assert_eq!(parse_submit_output("Submitted batch job 42\n"), Some(42));
        assert_eq!(parse_submit_output("42"), Some(42));
        assert_eq!(parse_submit_output("no id here"), None);
    }

    #[test]
    fn test_resolve_output_path() {
        let backend = BatchBackend::with_mode(
            SchedulerCommand::slurm(),
            BatchOptions::new(),
            "/tmp/inbox",
            SubmitMode::Inbox,
        );
        assert_eq!(backend.resolve_output_path(7), PathBuf::from("slurm-7.out"));

        let backend = BatchBackend::with_mode(
            SchedulerCommand::slurm(),
            BatchOptions::new().set("output", "/tmp/custom.out"),
            "/tmp/inbox",
            SubmitMode::Inbox,
        );
        assert_eq!(
            backend.resolve_output_path(7),
            PathBuf::from("/tmp/custom.out")
        );
    }

    #[tokio::test]
    async fn test_direct_submit_parses_id_from_stub_scheduler() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("sbatch-stub");
        std::fs::write(&stub, "#!/bin/sh\necho 'Submitted batch job 42'\n").unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let scheduler = SchedulerCommand {
            submit_cmd: stub.display().to_string(),
            output_prefix: "slurm".to_string(),
        };
        let assets = assets_with_script(dir.path());

        let id = scheduler
            .submit(&["--time=00:01:00".to_string()], &assets.script_path())
            .await
            .unwrap();
        assert_eq!(id, 42);
    }

    #[tokio::test]
    async fn test_follow_removes_stale_output_log_before_tailing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("job-7.out");
        // A leftover log from a previous run would end the tail immediately
        std::fs::write(&out, "old run output\nJOBEND\n").unwrap();

        let backend = BatchBackend::with_mode(
            SchedulerCommand::slurm(),
            BatchOptions::new().set("output", out.display().to_string()),
            dir.path().join("inbox"),
            SubmitMode::Inbox,
        );
        let assets = assets_with_script(dir.path());

        let handle = backend.follow(7, &assets).await.unwrap().unwrap();
        assert!(!out.exists());

        handle.abort();
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_inbox_submit_correlates_with_id_file() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = dir.path().join("inbox");
        let backend = BatchBackend::with_mode(
            SchedulerCommand::slurm(),
            BatchOptions::new(),
            &inbox,
            SubmitMode::Inbox,
        );
        let assets = assets_with_script(dir.path());

        // Stand-in listener: answer the first script that appears with id 42.
        let answer_inbox = inbox.clone();
        let listener = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if let Ok(entries) = std::fs::read_dir(&answer_inbox) {
                    for entry in entries.flatten() {
                        let path = entry.path();
                        if path.extension().is_some_and(|e| e == "sh") {
                            std::fs::write(path.with_extension("id"), "42").unwrap();
                            std::fs::remove_file(&path).unwrap();
                            return;
                        }
                    }
                }
            }
        });

        let cancel = CancellationToken::new();
        let id = backend.submit(&assets, &cancel).await.unwrap();
        assert_eq!(id, 42);
        listener.await.unwrap();

        // The id-file was consumed
        let leftovers: Vec<_> = std::fs::read_dir(&inbox).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_inbox_submit_rejects_non_positive_id() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = dir.path().join("inbox");
        let backend = BatchBackend::with_mode(
            SchedulerCommand::slurm(),
            BatchOptions::new(),
            &inbox,
            SubmitMode::Inbox,
        );
        let assets = assets_with_script(dir.path());

        let answer_inbox = inbox.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if let Ok(entries) = std::fs::read_dir(&answer_inbox) {
                    for entry in entries.flatten() {
                        let path = entry.path();
                        if path.extension().is_some_and(|e| e == "sh") {
                            std::fs::write(path.with_extension("id"), "0").unwrap();
                            std::fs::remove_file(&path).unwrap();
                            return;
                        }
                    }
                }
            }
        });

        let cancel = CancellationToken::new();
        let err = backend.submit(&assets, &cancel).await.unwrap_err();
        match err {
            Error::Submission { code, script } => {
                assert_eq!(code, 0);
                assert!(script.contains("worker"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_inbox_wait_honors_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = BatchBackend::with_mode(
            SchedulerCommand::slurm(),
            BatchOptions::new(),
            dir.path().join("inbox"),
            SubmitMode::Inbox,
        );
        let assets = assets_with_script(dir.path());

        let cancel = CancellationToken::new();
        let aborter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            aborter.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), backend.submit(&assets, &cancel))
            .await
            .expect("cancellation did not end the inbox wait")
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
