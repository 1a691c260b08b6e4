//! Callable packaging and the job function registry
//!
//! A job ships "what to run and with what arguments" to a separate process.
//! Closures cannot cross a process boundary, so functions are registered by
//! name in a [`JobRegistry`] known to both the submitting and the worker
//! process, and an [`Invocation`] carries the registry key plus the bound
//! arguments as a JSON blob.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

/// A zero-argument invocation: a registered function key with its positional
/// and keyword arguments bound
///
/// Immutable once constructed; serializes to the blob embedded in each job's
/// asset directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    key: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl Invocation {
    /// Binds a registry key to its arguments
    pub fn new(key: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            key: key.into(),
            args,
            kwargs,
        }
    }

    /// Binds a registry key with positional arguments only
    pub fn with_args(key: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(key, args, Map::new())
    }

    /// The registry key, used as the job's name
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serializes the invocation to a JSON blob
    pub fn dump_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Writes the invocation blob to a file
    pub fn dump(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.dump_bytes()?)?;
        Ok(())
    }

    /// Serializes the invocation to base64 text, safe to embed inline in a
    /// shell script
    pub fn dump_base64(&self) -> Result<String> {
        Ok(BASE64.encode(self.dump_bytes()?))
    }

    /// Reads an invocation blob back from a file
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Decodes an invocation from its base64 text form
    pub fn load_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::Decode(format!("invalid base64 invocation: {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// A job function: positional arguments and keyword arguments in, JSON value
/// out, with failures reported as a (kind, message) pair
pub type JobFn =
    Arc<dyn Fn(&[Value], &Map<String, Value>) -> std::result::Result<Value, JobFnError> + Send + Sync>;

/// Failure raised inside a job function
///
/// `kind` is a stable type tag (e.g. "ValueError"); both fields survive the
/// process boundary through the result blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFnError {
    pub kind: String,
    pub message: String,
}

impl JobFnError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobFnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Table of job functions, keyed by name
///
/// The submitting process and the worker process must register the same keys;
/// only the key and the arguments travel between them.
#[derive(Default, Clone)]
pub struct JobRegistry {
    functions: HashMap<String, JobFn>,
}

impl JobRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function under a key, replacing any previous registration
    pub fn register<F>(&mut self, key: impl Into<String>, f: F)
    where
        F: Fn(&[Value], &Map<String, Value>) -> std::result::Result<Value, JobFnError>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(key.into(), Arc::new(f));
    }

    /// Looks up and calls the function bound by an invocation
    pub fn invoke(&self, invocation: &Invocation) -> Result<std::result::Result<Value, JobFnError>> {
        let f = self
            .functions
            .get(&invocation.key)
            .ok_or_else(|| Error::UnknownJob(invocation.key.clone()))?;
        Ok(f(&invocation.args, &invocation.kwargs))
    }

    /// True iff a function is registered under the key
    pub fn contains(&self, key: &str) -> bool {
        self.functions.contains_key(key)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("keys", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}
