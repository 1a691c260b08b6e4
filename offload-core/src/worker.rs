//! Worker-side execution
//!
//! The job script invokes the embedding application, which calls
//! [`execute`] with its own [`JobRegistry`]. Success and failure travel
//! through the same result blob: a value, or a captured error the submitting
//! side re-surfaces as a job failure. After recording a failure the worker
//! still returns an error, so the scheduler's own logs show the job as
//! failed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::registry::{Invocation, JobFnError, JobRegistry};

/// Result blob written into a job's `ret.json` slot
///
/// Written exactly once by the worker, consumed at most once by the
/// submitting side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResultBlob {
    /// The callable returned a value
    Value { value: Value },
    /// The callable failed; kind and message identify the original error
    Error { kind: String, message: String },
}

impl ResultBlob {
    /// Reads a result blob from a file
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Writes the blob and locks the file read-only so nothing can tamper
    /// with a delivered result
    ///
    /// Written through a temp name and renamed into place: the submitting
    /// side polls for this file and must never observe it half-written.
    pub fn store(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        lock_read_only(&tmp)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Runs the invocation stored at `call_path` against the registry and writes
/// the outcome to `ret_path`
///
/// An error raised by the callable (or an unregistered key) is recorded in
/// the blob and then returned, so a hosting binary exits nonzero on failure.
pub fn execute(registry: &JobRegistry, call_path: &Path, ret_path: &Path) -> Result<Value> {
    let invocation = Invocation::load(call_path)?;
    debug!("executing job function '{}'", invocation.key());

    let outcome = match registry.invoke(&invocation) {
        Ok(outcome) => outcome,
        Err(Error::UnknownJob(key)) => Err(JobFnError::new(
            "UnknownJob",
            format!("no job function registered under key '{key}'"),
        )),
        Err(e) => return Err(e),
    };

    match outcome {
        Ok(value) => {
            ResultBlob::Value {
                value: value.clone(),
            }
            .store(ret_path)?;
            Ok(value)
        }
        Err(failure) => {
            error!("job function '{}' failed: {}", invocation.key(), failure);
            ResultBlob::Error {
                kind: failure.kind.clone(),
                message: failure.message.clone(),
            }
            .store(ret_path)?;
            Err(Error::JobFailed {
                name: invocation.key().to_string(),
                id: None,
                kind: failure.kind,
                message: failure.message,
            })
        }
    }
}

#[cfg(unix)]
fn lock_read_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))
}

#[cfg(not(unix))]
fn lock_read_only(path: &Path) -> std::io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(path, perms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register("add", |args, _| {
            Ok(json!(args[0].as_i64().unwrap() + args[1].as_i64().unwrap()))
        });
        registry.register("fail", |_, _| Err(JobFnError::new("ValueError", "fail")));
        registry
    }

    #[test]
    fn test_execute_writes_value_blob() {
        let dir = tempfile::tempdir().unwrap();
        let call = dir.path().join("call.json");
        let ret = dir.path().join("ret.json");
        Invocation::with_args("add", vec![json!(1), json!(2)])
            .dump(&call)
            .unwrap();

        let value = execute(&registry(), &call, &ret).unwrap();
        assert_eq!(value, json!(3));

        match ResultBlob::load(&ret).unwrap() {
            ResultBlob::Value { value } => assert_eq!(value, json!(3)),
            other => panic!("unexpected blob: {other:?}"),
        }
    }

    #[test]
    fn test_execute_records_failure_and_returns_err() {
        let dir = tempfile::tempdir().unwrap();
        let call = dir.path().join("call.json");
        let ret = dir.path().join("ret.json");
        Invocation::with_args("fail", vec![])
            .dump(&call)
            .unwrap();

        let err = execute(&registry(), &call, &ret).unwrap_err();
        assert!(err.is_remote_failure());

        match ResultBlob::load(&ret).unwrap() {
            ResultBlob::Error { kind, message } => {
                assert_eq!(kind, "ValueError");
                assert_eq!(message, "fail");
            }
            other => panic!("unexpected blob: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_key_is_recorded_in_blob() {
        let dir = tempfile::tempdir().unwrap();
        let call = dir.path().join("call.json");
        let ret = dir.path().join("ret.json");
        Invocation::with_args("missing", vec![])
            .dump(&call)
            .unwrap();

        assert!(execute(&registry(), &call, &ret).is_err());
        match ResultBlob::load(&ret).unwrap() {
            ResultBlob::Error { kind, .. } => assert_eq!(kind, "UnknownJob"),
            other => panic!("unexpected blob: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_result_blob_is_locked_read_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let call = dir.path().join("call.json");
        let ret = dir.path().join("ret.json");
        Invocation::with_args("add", vec![json!(1), json!(1)])
            .dump(&call)
            .unwrap();

        execute(&registry(), &call, &ret).unwrap();
        let mode = std::fs::metadata(&ret).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o400);
    }
}
