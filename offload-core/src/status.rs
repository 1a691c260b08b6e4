//! Job status state machine
//!
//! Tracks the lifecycle of a single job: Pending until submission, Running
//! once the backend has acknowledged it, then Completed or Failed. Transitions
//! are monotonic; nothing ever moves a job back or skips Running.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Status record for a job: state plus lifecycle timestamps and the
/// configured timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Maximum wall-clock time to wait for a result after submission
    pub timeout: Duration,
}

impl JobStatus {
    /// Creates a pending status with the given result timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: JobState::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            timeout,
        }
    }

    /// Records the start time and moves the job to Running
    pub fn set_start(&mut self) {
        self.started_at = Some(Utc::now());
        self.state = JobState::Running;
    }

    /// Records the end time and moves the job to Completed or Failed
    pub fn set_end(&mut self, success: bool) {
        self.ended_at = Some(Utc::now());
        self.state = if success {
            JobState::Completed
        } else {
            JobState::Failed
        };
    }

    /// True iff the job has started and has been running longer than the
    /// configured timeout. Unsubmitted jobs never time out.
    pub fn is_timeout(&self) -> bool {
        match self.started_at {
            Some(started) => {
                let elapsed = Utc::now().signed_duration_since(started);
                elapsed.to_std().map(|e| e > self.timeout).unwrap_or(false)
            }
            None => false,
        }
    }

    /// True iff the job reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::Failed)
    }
}
