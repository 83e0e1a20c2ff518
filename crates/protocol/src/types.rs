//! Core types shared across the bridge

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a persisted status string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
    TimedOut,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
            SessionStatus::TimedOut => "timed_out",
        }
    }

    /// `ended` and `timed_out` can only be left through a forced restart.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "ended" => Ok(SessionStatus::Ended),
            "timed_out" => Ok(SessionStatus::TimedOut),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Approval status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    /// The decision delivered to the blocked hook for this status.
    /// Everything except an explicit approval fails closed.
    pub fn decision(&self) -> Decision {
        match self {
            ApprovalStatus::Approved => Decision::Approved,
            _ => Decision::Denied,
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "denied" => Ok(ApprovalStatus::Denied),
            "expired" => Ok(ApprovalStatus::Expired),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// What the hook client receives through the handoff artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Denied,
}

impl Decision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Decision::Approved)
    }

    /// Artifact body. Only the exact string `approved` means approval.
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Denied => "denied",
        }
    }

    /// Parse an artifact body; anything but `approved` is a denial.
    pub fn from_artifact(content: &str) -> Self {
        if content.trim() == "approved" {
            Decision::Approved
        } else {
            Decision::Denied
        }
    }
}

/// Which actor moved an approval out of `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolver {
    /// A matching reply in the remote thread
    Reply,
    /// The daemon's deadline sweep
    Sweep,
    /// The hook client gave up waiting
    HookTimeout,
    /// The approval prompt could not be delivered
    RelayFailure,
    /// The owning session was ended or timed out
    SessionEnd,
}

impl Resolver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolver::Reply => "reply",
            Resolver::Sweep => "sweep",
            Resolver::HookTimeout => "hook_timeout",
            Resolver::RelayFailure => "relay_failure",
            Resolver::SessionEnd => "session_end",
        }
    }
}

/// One logical Claude Code session bound to one remote thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_path: String,
    pub thread_id: String,
    pub channel_id: String,
    /// Unix milliseconds
    pub created_at: i64,
    /// Unix milliseconds
    pub last_active: i64,
    pub status: SessionStatus,
}

impl Session {
    /// Last path component of the project, for banners.
    pub fn project_name(&self) -> &str {
        self.project_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.project_path)
    }
}

/// One outstanding (or resolved) request for human approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub request_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub command: String,
    pub description: String,
    /// Unix milliseconds
    pub created_at: i64,
    /// Unix milliseconds after which the sweep expires the request
    pub deadline: i64,
    pub status: ApprovalStatus,
    /// Location of the handoff artifact the hook client polls
    pub response_path: String,
    pub resolved_at: Option<i64>,
}

impl PendingApproval {
    pub fn is_past_deadline(&self, now_ms: i64) -> bool {
        now_ms >= self.deadline
    }
}
