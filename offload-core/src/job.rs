//! Job orchestration
//!
//! A [`Job`] composes an invocation, a script template, an asset directory,
//! and a backend into the submit / result / run lifecycle. Backends only
//! decide how the rendered script reaches an executor; status transitions,
//! result polling, timeout handling, and cleanup all live here.
//!
//! States move Pending → Running → {Completed, Failed}, never backwards.
//! The result wait is a bounded-interval polling loop: each iteration checks
//! the cancellation token, then the result blob, then the timeout. A timeout
//! never cancels remote execution; the remote side may keep running and
//! writing after the caller has given up.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assets::JobAssets;
use crate::error::{Error, Result};
use crate::registry::Invocation;
use crate::status::JobStatus;
use crate::tail::TailHandle;
use crate::template::ScriptTemplate;
use crate::worker::ResultBlob;

/// Default result timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
/// Default interval between result-blob checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Execution strategy seam
///
/// `submit` is the only operation a backend must provide: deliver the
/// rendered script to an executor and return a backend-native job id.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Submits the job's rendered script, returning the backend-native id
    ///
    /// The cancellation token lets submission waits (e.g. the inbox id-file
    /// poll) abort early.
    async fn submit(&self, assets: &JobAssets, cancel: &CancellationToken) -> Result<i64>;

    /// Hook run by [`Job::run`] between submission and result polling
    ///
    /// Backends may block here (synchronous local execution) or start a
    /// concurrent output tail whose completion `run` awaits after a
    /// successful result.
    async fn follow(&self, _job_id: i64, _assets: &JobAssets) -> Result<Option<TailHandle>> {
        Ok(None)
    }
}

/// Tunables for a job
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Asset root; a fresh directory under the system temp dir when `None`
    pub root: Option<PathBuf>,
    /// Maximum wall-clock wait for the result after submission
    pub timeout: Duration,
    /// Interval between result-blob checks
    pub poll_interval: Duration,
    /// Keep the asset directory after the job finishes
    pub retain_assets: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            root: None,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retain_assets: false,
        }
    }
}

/// One request to execute a packaged callable and retrieve its result
pub struct Job {
    name: String,
    assets: JobAssets,
    status: JobStatus,
    id: Option<i64>,
    backend: Box<dyn Backend>,
    poll_interval: Duration,
    retain_assets: bool,
    cancel: CancellationToken,
}

impl Job {
    /// Creates a job with default options
    ///
    /// Materializes the asset directory immediately; fails before any write
    /// if the root is unusable.
    pub fn new(
        invocation: Invocation,
        script_template: ScriptTemplate,
        backend: Box<dyn Backend>,
    ) -> Result<Self> {
        Self::with_options(invocation, script_template, backend, JobOptions::default())
    }

    /// Creates a job with explicit options
    pub fn with_options(
        invocation: Invocation,
        script_template: ScriptTemplate,
        backend: Box<dyn Backend>,
        options: JobOptions,
    ) -> Result<Self> {
        let root = options
            .root
            .unwrap_or_else(|| std::env::temp_dir().join(format!("offload-{}", Uuid::new_v4())));
        let assets = JobAssets::new(root)?;
        assets.create(&invocation, &script_template)?;

        Ok(Self {
            name: invocation.key().to_string(),
            assets,
            status: JobStatus::new(options.timeout),
            id: None,
            backend,
            poll_interval: options.poll_interval,
            retain_assets: options.retain_assets,
            cancel: CancellationToken::new(),
        })
    }

    /// The job's name (its registry key)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backend-assigned id, once submitted
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    /// Current status
    pub fn status(&self) -> &JobStatus {
        &self.status
    }

    /// The job's asset directory
    pub fn assets(&self) -> &JobAssets {
        &self.assets
    }

    /// Token that aborts this job's waits when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Submits the job without waiting for it to finish
    ///
    /// Returns the backend-native id and moves the job to Running.
    pub async fn submit(&mut self) -> Result<i64> {
        let id = self.backend.submit(&self.assets, &self.cancel).await?;
        self.status.set_start();
        self.id = Some(id);
        info!("job '{}' submitted with id {}", self.name, id);
        Ok(id)
    }

    /// Waits for the result blob and decodes it
    ///
    /// Polls at the configured interval; each iteration checks cancellation,
    /// then the blob, then the timeout. Timeout and cancellation are terminal:
    /// the job ends Failed and its assets are removed unless retained.
    pub async fn result(&mut self) -> Result<Value> {
        loop {
            if self.cancel.is_cancelled() {
                self.status.set_end(false);
                self.discard_assets();
                return Err(Error::Cancelled);
            }

            if self.assets.ret_path().exists() {
                return self.load_result();
            }

            if self.status.is_timeout() {
                self.status.set_end(false);
                self.discard_assets();
                return Err(Error::Timeout {
                    name: self.name.clone(),
                    limit: self.status.timeout,
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Submits the job and waits for its result
    ///
    /// When the backend started an output tail, a successful return also
    /// means the tail has seen the sentinel and the console stream is
    /// drained. Assets are released on every exit path unless retained.
    pub async fn run(&mut self) -> Result<Value> {
        let outcome = self.run_inner().await;
        if outcome.is_err() {
            self.discard_assets();
        }
        outcome
    }

    async fn run_inner(&mut self) -> Result<Value> {
        let id = self.submit().await?;
        let tail = self.backend.follow(id, &self.assets).await?;

        match self.result().await {
            Ok(value) => {
                if let Some(tail) = tail {
                    tail.wait().await;
                }
                Ok(value)
            }
            Err(e) => {
                // The sentinel may never appear on a failed job; don't wait
                // for it.
                if let Some(tail) = tail {
                    tail.abort();
                }
                Err(e)
            }
        }
    }

    /// Removes the asset directory unless the retain flag is set; idempotent
    pub fn clean_up(&mut self) {
        self.discard_assets();
    }

    fn load_result(&mut self) -> Result<Value> {
        let blob = ResultBlob::load(&self.assets.ret_path())?;
        self.discard_assets();

        match blob {
            ResultBlob::Value { value } => {
                self.status.set_end(true);
                debug!("job '{}' completed", self.name);
                Ok(value)
            }
            ResultBlob::Error { kind, message } => {
                self.status.set_end(false);
                Err(Error::JobFailed {
                    name: self.name.clone(),
                    id: self.id,
                    kind,
                    message,
                })
            }
        }
    }

    fn discard_assets(&self) {
        if self.retain_assets {
            return;
        }
        if let Err(e) = self.assets.clean_up() {
            warn!(
                "failed to remove assets for job '{}' under {}: {}",
                self.name,
                self.assets.root().display(),
                e
            );
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.discard_assets();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::JobState;
    use serde_json::json;

    /// Backend that writes a canned result blob at submit time
    struct InstantBackend {
        blob: ResultBlob,
    }

    #[async_trait]
    impl Backend for InstantBackend {
        async fn submit(&self, assets: &JobAssets, _cancel: &CancellationToken) -> Result<i64> {
            self.blob.store(&assets.ret_path())?;
            Ok(7)
        }
    }

    /// Backend that acknowledges submission but never produces a result
    struct SilentBackend;

    #[async_trait]
    impl Backend for SilentBackend {
        async fn submit(&self, _assets: &JobAssets, _cancel: &CancellationToken) -> Result<i64> {
            Ok(7)
        }
    }

    fn job_with(backend: Box<dyn Backend>, options: JobOptions) -> Job {
        let invocation = Invocation::with_args("add", vec![json!(1), json!(2)]);
        let template = ScriptTemplate::new("worker {call_path} {ret_path}");
        Job::with_options(invocation, template, backend, options).unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_completes() {
        let backend = Box::new(InstantBackend {
            blob: ResultBlob::Value { value: json!(3) },
        });
        let mut job = job_with(backend, JobOptions::default());
        let root = job.assets().root().to_path_buf();

        assert_eq!(job.status().state, JobState::Pending);
        assert_eq!(job.name(), "add");

        let value = job.run().await.unwrap();
        assert_eq!(value, json!(3));
        assert_eq!(job.status().state, JobState::Completed);
        assert_eq!(job.id(), Some(7));
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_remote_failure_surfaces_kind_and_message() {
        let backend = Box::new(InstantBackend {
            blob: ResultBlob::Error {
                kind: "ValueError".to_string(),
                message: "fail".to_string(),
            },
        });
        let mut job = job_with(backend, JobOptions::default());
        let root = job.assets().root().to_path_buf();

        let err = job.run().await.unwrap_err();
        match err {
            Error::JobFailed { name, id, kind, message } => {
                assert_eq!(name, "add");
                assert_eq!(id, Some(7));
                assert_eq!(kind, "ValueError");
                assert_eq!(message, "fail");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(job.status().state, JobState::Failed);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_timeout_fails_and_removes_assets() {
        let options = JobOptions {
            timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            ..JobOptions::default()
        };
        let mut job = job_with(Box::new(SilentBackend), options);
        let root = job.assets().root().to_path_buf();

        let err = job.run().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(job.status().state, JobState::Failed);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_retained_assets_survive_completion() {
        let options = JobOptions {
            retain_assets: true,
            ..JobOptions::default()
        };
        let backend = Box::new(InstantBackend {
            blob: ResultBlob::Value { value: json!(3) },
        });
        let mut job = job_with(backend, options);
        let root = job.assets().root().to_path_buf();

        job.run().await.unwrap();
        assert!(root.exists());

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_aborts_the_wait_early() {
        let options = JobOptions {
            timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(10),
            ..JobOptions::default()
        };
        let mut job = job_with(Box::new(SilentBackend), options);
        let cancel = job.cancel_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), job.run())
            .await
            .expect("cancellation did not abort the wait")
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(job.status().state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_run_returns_only_after_tail_sees_the_sentinel() {
        use crate::tail::tail_output;
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        /// Backend that answers instantly but tails a scheduler-style log
        struct TailingBackend {
            log: PathBuf,
        }

        #[async_trait]
        impl Backend for TailingBackend {
            async fn submit(&self, assets: &JobAssets, _cancel: &CancellationToken) -> Result<i64> {
                ResultBlob::Value { value: json!(3) }.store(&assets.ret_path())?;
                Ok(7)
            }

            async fn follow(&self, _job_id: i64, _assets: &JobAssets) -> Result<Option<TailHandle>> {
                Ok(Some(tail_output(
                    self.log.clone(),
                    "job".to_string(),
                    "JOBEND".to_string(),
                )))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("scheduler.out");

        // The result blob is available immediately, but the remote log keeps
        // streaming for a while before the sentinel lands.
        let sentinel_written = Arc::new(AtomicBool::new(false));
        let flag = sentinel_written.clone();
        let log_writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            flag.store(true, Ordering::SeqCst);
            std::fs::write(&log_writer, "remote line\nJOBEND\n").unwrap();
        });

        let mut job = job_with(Box::new(TailingBackend { log }), JobOptions::default());
        let value = tokio::time::timeout(Duration::from_secs(5), job.run())
            .await
            .expect("run did not resolve")
            .unwrap();

        assert_eq!(value, json!(3));
        assert!(
            sentinel_written.load(Ordering::SeqCst),
            "run() returned before the tail consumed the sentinel"
        );
    }

    #[tokio::test]
    async fn test_clean_up_is_idempotent() {
        let mut job = job_with(Box::new(SilentBackend), JobOptions::default());
        job.clean_up();
        job.clean_up();
        assert!(!job.assets().root().exists());
    }
}
