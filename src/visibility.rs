//! Approval-aware visibility rules.
//!
//! Every search path runs candidates through [`is_visible`] before ranking,
//! so a question nobody is allowed to see never takes a slot below a limit.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl Default for ApprovalStatus {
    fn default() -> Self {
        ApprovalStatus::Pending
    }
}

impl FromStr for ApprovalStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(ApprovalStatus::Pending),
            "APPROVED" => Ok(ApprovalStatus::Approved),
            "REJECTED" => Ok(ApprovalStatus::Rejected),
            other => anyhow::bail!("unknown approval status {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Student,
    Advisor,
    Admin,
}

impl Role {
    pub fn is_elevated(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "STUDENT" => Ok(Role::Student),
            "ADVISOR" => Ok(Role::Advisor),
            "ADMIN" => Ok(Role::Admin),
            other => anyhow::bail!("unknown role {other:?}"),
        }
    }
}

/// Who is asking. Derived per request from the identity the upstream
/// application forwards; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Viewer {
    #[default]
    Anonymous,
    User { id: u64, role: Role },
}

impl Viewer {
    pub fn user(id: u64, role: Role) -> Self {
        Viewer::User { id, role }
    }
}

impl fmt::Display for Viewer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Viewer::Anonymous => write!(f, "anonymous"),
            Viewer::User { id, role } => write!(f, "user#{id} ({role:?})"),
        }
    }
}

/// Whether `viewer` may see a question written by `author_id` that currently
/// has `status`.
///
/// - admins see everything
/// - signed-in users see approved questions plus their own in any state
/// - anonymous callers see approved questions only
pub fn is_visible(viewer: &Viewer, author_id: u64, status: ApprovalStatus) -> bool {
    match viewer {
        Viewer::User { role, .. } if role.is_elevated() => true,
        Viewer::User { id, .. } => status == ApprovalStatus::Approved || *id == author_id,
        Viewer::Anonymous => status == ApprovalStatus::Approved,
    }
}
