//! Per-job asset directories
//!
//! Each job owns an isolated directory holding the rendered script, the
//! serialized invocation, the result blob written by the remote side, and a
//! log file. Filenames inside the root are fixed: `job.sh`, `call.json`,
//! `ret.json`, `log.txt`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::registry::Invocation;
use crate::template::{self, ScriptTemplate};

/// Script filename within an asset root
pub const SCRIPT_FILE: &str = "job.sh";
/// Serialized invocation filename
pub const CALL_FILE: &str = "call.json";
/// Result blob filename
pub const RET_FILE: &str = "ret.json";
/// Log filename
pub const LOG_FILE: &str = "log.txt";

/// Isolated working directory backing one job
///
/// The root must not exist, or must be an empty directory, when the assets
/// are constructed; anything else fails before a single byte is written.
/// The invariant is checked only at construction.
#[derive(Debug)]
pub struct JobAssets {
    root: PathBuf,
}

impl JobAssets {
    /// Claims `root` as a job's asset directory, creating it if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        if root.exists() {
            if !root.is_dir() {
                return Err(Error::AssetRoot {
                    path: root,
                    reason: "exists and is not a directory".to_string(),
                });
            }
            let occupied = std::fs::read_dir(&root)?.next().is_some();
            if occupied {
                return Err(Error::AssetRoot {
                    path: root,
                    reason: "directory is not empty".to_string(),
                });
            }
        } else {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// The asset root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the rendered job script
    pub fn script_path(&self) -> PathBuf {
        self.root.join(SCRIPT_FILE)
    }

    /// Path of the serialized invocation blob
    pub fn call_path(&self) -> PathBuf {
        self.root.join(CALL_FILE)
    }

    /// Path of the result blob the remote side writes
    pub fn ret_path(&self) -> PathBuf {
        self.root.join(RET_FILE)
    }

    /// Path of the job's log file
    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    /// Materializes the job on disk: writes the invocation blob and the
    /// rendered script
    pub fn create(&self, invocation: &Invocation, script_template: &ScriptTemplate) -> Result<()> {
        invocation.dump(&self.call_path())?;

        let bindings = HashMap::from([
            (template::CALL_PATH, self.call_path().display().to_string()),
            (template::CALL_B64, invocation.dump_base64()?),
            (template::RET_PATH, self.ret_path().display().to_string()),
        ]);
        let script = script_template.render(&bindings);
        std::fs::write(self.script_path(), script)?;

        debug!("materialized job assets under {}", self.root.display());
        Ok(())
    }

    /// Reads back the rendered script, for error reporting
    pub fn script(&self) -> Result<String> {
        Ok(std::fs::read_to_string(self.script_path())?)
    }

    /// Recursively removes the asset root; a no-op if already gone
    pub fn clean_up(&self) -> Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
            debug!("removed job assets under {}", self.root.display());
        }
        Ok(())
    }
}
