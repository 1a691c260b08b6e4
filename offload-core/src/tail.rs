//! Output tail
//!
//! Streams a job's log file to the console while the caller blocks on the
//! result. The tail runs as its own task: it waits for the file to appear,
//! prints each appended line prefixed with a label, and stops once it sees a
//! line equal to the sentinel. Completion is signalled through an explicit
//! event; callers must await [`TailHandle::wait`], not merely the task, before
//! treating the output as drained.

use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How often the tail re-checks for the file before it exists
const EXISTS_POLL: Duration = Duration::from_millis(500);
/// How often the tail re-reads once it reaches end of file
const READ_POLL: Duration = Duration::from_millis(100);

/// Handle to a running output tail
pub struct TailHandle {
    done: oneshot::Receiver<()>,
    task: JoinHandle<()>,
}

impl TailHandle {
    /// Waits for the tail to see the sentinel and finish flushing
    pub async fn wait(self) {
        let _ = self.done.await;
    }

    /// Stops the tail without waiting for the sentinel
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawns a task streaming `path` to stdout until a line equals `sentinel`
///
/// Each printed line is prefixed with `label | `.
pub fn tail_output(path: PathBuf, label: String, sentinel: String) -> TailHandle {
    let (done_tx, done_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        while !path.exists() {
            tokio::time::sleep(EXISTS_POLL).await;
        }
        debug!("tailing {}", path.display());

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                warn!("failed to open {} for tailing: {}", path.display(), e);
                let _ = done_tx.send(());
                return;
            }
        };

        let mut reader = BufReader::new(file);
        let mut line = String::new();
        loop {
            match reader.read_line(&mut line).await {
                Ok(0) => tokio::time::sleep(READ_POLL).await,
                Ok(_) => {
                    // A read can stop mid-line; wait for the newline before
                    // treating the buffer as a full line.
                    if !line.ends_with('\n') {
                        tokio::time::sleep(READ_POLL).await;
                        continue;
                    }
                    let text = line.trim_end_matches('\n');
                    if text.trim() == sentinel.trim() {
                        break;
                    }
                    println!("{label} | {text}");
                    line.clear();
                }
                Err(e) => {
                    warn!("error tailing {}: {}", path.display(), e);
                    break;
                }
            }
        }

        let _ = done_tx.send(());
    });

    TailHandle { done: done_rx, task }
}
