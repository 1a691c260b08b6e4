//! Script template
//!
//! Renders the shell script materialized into each job's asset directory:
//! a caller-composed preamble, the worker invocation referencing the
//! serialized call and the result path, and a postamble that emits the
//! end-of-output sentinel consumed by the output tail.
//!
//! Rendering is pure string substitution. It is the caller's responsibility
//! to keep placeholder names consistent with the paths generated by
//! [`JobAssets`](crate::assets::JobAssets); unresolved placeholders are left
//! in place rather than rejected.

use std::collections::HashMap;

/// Line every job script emits once the callable has finished, successfully
/// or not. The output tail stops streaming when it sees this line.
pub const END_OF_JOB: &str = "JOBEND";

/// Placeholder for the serialized invocation's file path
pub const CALL_PATH: &str = "call_path";
/// Placeholder for the base64-encoded inline invocation blob
pub const CALL_B64: &str = "call_b64";
/// Placeholder for the result blob's file path
pub const RET_PATH: &str = "ret_path";

/// Template for a job script
///
/// A plain value: each job gets its own instance, there is no shared default
/// mutated across jobs. `command` is the worker invocation and must reference
/// `{call_path}` (or `{call_b64}`) and `{ret_path}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTemplate {
    /// Environment setup lines (module loads, container binds, exports)
    pub before: String,
    /// Worker invocation, e.g. `myapp work {call_path} {ret_path}`
    pub command: String,
    /// Postamble; the default emits the sentinel line
    pub after: String,
}

impl ScriptTemplate {
    /// Creates a template with the given worker invocation and no preamble
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            before: String::new(),
            command: command.into(),
            after: format!("echo {END_OF_JOB}"),
        }
    }

    /// Sets the preamble
    pub fn with_before(mut self, before: impl Into<String>) -> Self {
        self.before = before.into();
        self
    }

    /// Sets the postamble
    pub fn with_after(mut self, after: impl Into<String>) -> Self {
        self.after = after.into();
        self
    }

    /// Renders the script with the given placeholder bindings
    pub fn render(&self, bindings: &HashMap<&str, String>) -> String {
        let raw = format!("{}\n{}\n{}\n", self.before, self.command, self.after);
        substitute(&raw, bindings)
    }
}

/// Replaces every `{name}` occurrence with its binding, leaving unbound
/// placeholders untouched
fn substitute(input: &str, bindings: &HashMap<&str, String>) -> String {
    let mut out = input.to_string();
    for (name, value) in bindings {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}
