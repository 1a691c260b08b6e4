//! Local backend
//!
//! Runs the rendered job script as a child process on the caller's own host.
//! The child's stdout and stderr are teed: every line lands in the job's log
//! file and is mirrored to the caller's streams. The OS process id doubles as
//! the job id.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::assets::JobAssets;
use crate::error::{Error, Result};
use crate::job::Backend;
use crate::tail::TailHandle;

/// Backend executing jobs as local child processes
pub struct LocalBackend {
    /// Wait for the child to exit before result decoding starts
    blocking: bool,
    child: Mutex<Option<Child>>,
    tees: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalBackend {
    /// Creates a backend that lets the child run while the result is polled
    pub fn new() -> Self {
        Self {
            blocking: false,
            child: Mutex::new(None),
            tees: Mutex::new(Vec::new()),
        }
    }

    /// Creates a backend whose `run()` blocks until the child exits before
    /// decoding the result
    pub fn blocking() -> Self {
        Self {
            blocking: true,
            ..Self::new()
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn submit(&self, assets: &JobAssets, _cancel: &CancellationToken) -> Result<i64> {
        let script = assets.script_path();
        debug!("spawning local job script {}", script.display());

        let mut child = Command::new("bash")
            .arg(&script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Scheduler("child exited before a pid was observed".to_string()))?
            as i64;

        let mut tees = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            tees.push(spawn_tee(stdout, assets, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tees.push(spawn_tee(stderr, assets, true));
        }

        if self.blocking {
            *self.child.lock().unwrap() = Some(child);
            *self.tees.lock().unwrap() = tees;
        } else {
            // Reap the child once its output is drained, so it never sits
            // around as a zombie while the result is being polled.
            tokio::spawn(async move {
                for tee in tees {
                    let _ = tee.await;
                }
                match child.wait().await {
                    Ok(status) => debug!("local job {} exited with {}", pid, status),
                    Err(e) => warn!("failed to reap local job {}: {}", pid, e),
                }
            });
        }

        Ok(pid)
    }

    async fn follow(&self, job_id: i64, _assets: &JobAssets) -> Result<Option<TailHandle>> {
        if !self.blocking {
            return Ok(None);
        }

        let child = self.child.lock().unwrap().take();
        if let Some(mut child) = child {
            let status = child.wait().await?;
            debug!("local job {} exited with {}", job_id, status);
        }

        let tees = std::mem::take(&mut *self.tees.lock().unwrap());
        for tee in tees {
            let _ = tee.await;
        }

        Ok(None)
    }
}

/// Copies one child stream into the job log while mirroring it to the
/// caller's own stdout or stderr
fn spawn_tee(
    stream: impl AsyncRead + Unpin + Send + 'static,
    assets: &JobAssets,
    to_stderr: bool,
) -> JoinHandle<()> {
    let log_path = assets.log_path();

    tokio::spawn(async move {
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await;
        let mut log = match log {
            Ok(log) => log,
            Err(e) => {
                warn!("failed to open job log {}: {}", log_path.display(), e);
                return;
            }
        };

        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if to_stderr {
                eprintln!("{line}");
            } else {
                println!("{line}");
            }
            if let Err(e) = log.write_all(format!("{line}\n").as_bytes()).await {
                warn!("failed to append to job log {}: {}", log_path.display(), e);
                break;
            }
        }
        let _ = log.flush().await;
    })
}
