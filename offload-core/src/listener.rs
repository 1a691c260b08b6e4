//! Submission listener
//!
//! The listener is the scheduler-side half of the inbox protocol: a
//! long-running loop, meant for a host with scheduler access, that drains a
//! shared inbox of job scripts queued by hosts that cannot submit directly.
//!
//! For every `<stem>.sh` it finds, the listener submits the script, writes
//! the outcome to `<stem>.id` (the native id, or 0 on failure), and only
//! then deletes the script. The id-file is written before the unlink, so
//! "id-file exists" always implies "request fully processed" and a script
//! that was picked up is never left unanswered.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::SchedulerCommand;
use crate::error::Result;

/// Default pause between inbox scans
pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Submits one rendered script to the scheduler
///
/// Seam between the listener loop and the scheduler command, so the protocol
/// is testable without a scheduler installed.
#[async_trait]
pub trait ScriptSubmitter: Send + Sync {
    /// Submits the script and returns the scheduler-native job id
    async fn submit_script(&self, script: &Path) -> Result<i64>;
}

#[async_trait]
impl ScriptSubmitter for SchedulerCommand {
    async fn submit_script(&self, script: &Path) -> Result<i64> {
        self.submit(&[], script).await
    }
}

/// Inbox-draining daemon loop
pub struct Listener {
    inbox: PathBuf,
    submitter: Arc<dyn ScriptSubmitter>,
    scan_interval: Duration,
}

impl Listener {
    /// Creates a listener over an inbox directory
    pub fn new(inbox: impl Into<PathBuf>, submitter: Arc<dyn ScriptSubmitter>) -> Self {
        Self {
            inbox: inbox.into(),
            submitter,
            scan_interval: SCAN_INTERVAL,
        }
    }

    /// Overrides the pause between scans
    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    /// Runs until the token is cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        std::fs::create_dir_all(&self.inbox)?;
        info!("listening for job scripts in {}", self.inbox.display());

        loop {
            if let Err(e) = self.scan_once().await {
                warn!("inbox scan failed: {}", e);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("listener stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.scan_interval) => {}
            }
        }
    }

    /// Scans the inbox once, processing every pending script
    ///
    /// Failures are per-request: one bad script does not stop the scan.
    pub async fn scan_once(&self) -> Result<usize> {
        let mut processed = 0;

        for entry in std::fs::read_dir(&self.inbox)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "sh") {
                continue;
            }

            match self.process_request(&path).await {
                Ok(id) => {
                    processed += 1;
                    debug!("processed {} -> id {}", path.display(), id);
                }
                Err(e) => warn!("failed to process {}: {}", path.display(), e),
            }
        }

        Ok(processed)
    }

    /// Handles one request: submit, answer, then remove the script
    async fn process_request(&self, script: &Path) -> Result<i64> {
        let id = match self.submitter.submit_script(script).await {
            Ok(id) => id,
            Err(e) => {
                error!("scheduler rejected {}: {}", script.display(), e);
                0
            }
        };

        // The id-file must be complete before it becomes visible, and must
        // exist before the script disappears.
        let id_path = script.with_extension("id");
        let tmp_path = script.with_extension("id.tmp");
        std::fs::write(&tmp_path, id.to_string())?;
        std::fs::rename(&tmp_path, &id_path)?;
        std::fs::remove_file(script)?;

        Ok(id)
    }
}
