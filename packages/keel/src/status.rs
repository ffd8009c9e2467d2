//! Job status as a pure projection of the event stream.
//!
//! The metadata row caches the result for cheap claim selection; this module
//! is the source of truth whenever the two could disagree.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Event, EventType};

/// A `job_waiting` older than this many seconds is Parked: no longer
/// scanner-visible, woken only through the signal inbox.
pub const PARKED_AFTER_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Waiting,
    Parked,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Integer encoding for the relational `jobs.status` column.
    pub fn as_i32(&self) -> i32 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Waiting => 2,
            JobStatus::Parked => 3,
            JobStatus::Retrying => 4,
            JobStatus::Completed => 5,
            JobStatus::Failed => 6,
            JobStatus::Cancelled => 7,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => JobStatus::Pending,
            1 => JobStatus::Running,
            2 => JobStatus::Waiting,
            3 => JobStatus::Parked,
            4 => JobStatus::Retrying,
            5 => JobStatus::Completed,
            6 => JobStatus::Failed,
            7 => JobStatus::Cancelled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Waiting => "waiting",
            JobStatus::Parked => "parked",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Derive the status from the event tail.
///
/// Only lifecycle events are significant; everything else (node progress,
/// recorded effects, trace events) is skipped. A `job_waiting` flips from
/// Waiting to Parked once it is older than [`PARKED_AFTER`] relative to
/// `now`, which keeps indefinitely-parked workflows out of scheduler scans.
pub fn derive_status(events: &[Event], now: DateTime<Utc>) -> JobStatus {
    let last = events.iter().rev().find(|e| e.event_type.is_lifecycle());
    let Some(event) = last else {
        return JobStatus::Pending;
    };
    match event.event_type {
        EventType::JobCreated => JobStatus::Pending,
        EventType::JobRunning => JobStatus::Running,
        EventType::JobWaiting => {
            if now - event.created_at > Duration::seconds(PARKED_AFTER_SECONDS) {
                JobStatus::Parked
            } else {
                JobStatus::Waiting
            }
        }
        EventType::WaitCompleted | EventType::JobRequeued => JobStatus::Pending,
        EventType::JobCompleted => JobStatus::Completed,
        EventType::JobFailed => JobStatus::Failed,
        EventType::JobCancelled => JobStatus::Cancelled,
        // is_lifecycle() admits nothing else.
        _ => JobStatus::Pending,
    }
}

/// True iff the last lifecycle event is `job_waiting` with no subsequent
/// `wait_completed`. The reclaimer must not resurrect blocked jobs.
pub fn is_blocked(events: &[Event]) -> bool {
    for event in events.iter().rev() {
        match event.event_type {
            EventType::JobWaiting => return true,
            e if e.is_lifecycle() => return false,
            _ => continue,
        }
    }
    false
}
