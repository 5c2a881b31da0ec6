//! Lifecycle status of trials, environments and remote operations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Status of a trial, an environment node, or a remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Unknown,
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

impl Status {
    /// Not failed, canceled, or timed out.
    pub fn is_good(self) -> bool {
        !matches!(self, Status::Failed | Status::Canceled | Status::TimedOut)
    }

    /// Succeeded or ready to run.
    pub fn is_ready(self) -> bool {
        matches!(self, Status::Succeeded | Status::Ready)
    }

    /// Reached a final state; no further transitions are permitted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Failed | Status::Canceled | Status::TimedOut
        )
    }

    pub fn is_succeeded(self) -> bool {
        self == Status::Succeeded
    }

    pub fn is_pending(self) -> bool {
        self == Status::Pending
    }

    pub fn is_canceled(self) -> bool {
        self == Status::Canceled
    }

    /// Storage text form, e.g. `TIMED_OUT`.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unknown => "UNKNOWN",
            Status::Pending => "PENDING",
            Status::Ready => "READY",
            Status::Running => "RUNNING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Canceled => "CANCELED",
            Status::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNKNOWN" => Ok(Status::Unknown),
            "PENDING" => Ok(Status::Pending),
            "READY" => Ok(Status::Ready),
            "RUNNING" => Ok(Status::Running),
            "SUCCEEDED" => Ok(Status::Succeeded),
            "FAILED" => Ok(Status::Failed),
            "CANCELED" => Ok(Status::Canceled),
            "TIMED_OUT" => Ok(Status::TimedOut),
            other => Err(Error::ConfigInvalid {
                reason: format!("unknown status: {other}"),
            }),
        }
    }
}
