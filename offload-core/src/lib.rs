//! Offload Core
//!
//! Dispatches a packaged callable onto a local process or an external batch
//! scheduler and retrieves its result through a shared-filesystem mailbox.
//!
//! The pieces, leaves first:
//! - [`registry`]: the callable package, a registered function key with its
//!   bound arguments, serializable across processes
//! - [`template`]: the shell-script template each job renders
//! - [`assets`]: the isolated per-job directory (script, blobs, log)
//! - [`status`]: the Pending → Running → {Completed, Failed} state machine
//! - [`job`]: the orchestrator and the backend seam
//! - [`local`] / [`batch`]: the two execution backends
//! - [`listener`]: the daemon loop answering inbox submissions
//! - [`tail`]: concurrent log streaming up to the sentinel line
//! - [`worker`]: the remote-side executor invoked by job scripts
//!
//! Submitter, scheduler, and listener coordinate purely through files: the
//! inbox is the channel, the filename stem the correlation key, the id-file
//! the acknowledgment.

pub mod assets;
pub mod batch;
pub mod error;
pub mod job;
pub mod listener;
pub mod local;
pub mod registry;
pub mod status;
pub mod tail;
pub mod template;
pub mod worker;

pub use assets::JobAssets;
pub use batch::{BatchBackend, BatchOptions, SchedulerCommand, SubmitMode};
pub use error::{Error, Result};
pub use job::{Backend, Job, JobOptions};
pub use listener::{Listener, ScriptSubmitter};
pub use local::LocalBackend;
pub use registry::{Invocation, JobFnError, JobRegistry};
pub use status::{JobState, JobStatus};
pub use tail::{TailHandle, tail_output};
pub use template::{END_OF_JOB, ScriptTemplate};
pub use worker::{ResultBlob, execute};
