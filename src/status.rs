//! Job status model and mapping of remote provider statuses.

use serde::{Deserialize, Serialize};

/// OGC-compliant job status.
///
/// Transitions follow a fixed machine:
/// `accepted -> started -> running -> succeeded | failed | dismissed`,
/// with `accepted -> dismissed` allowed for cancellation before start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Accepted,
    Started,
    Running,
    Succeeded,
    Failed,
    Dismissed,
}

/// Coarse grouping used for subscriber notifications and response shaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCategory {
    Running,
    Success,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Accepted => "accepted",
            Status::Started => "started",
            Status::Running => "running",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Dismissed => "dismissed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed | Status::Dismissed)
    }

    pub fn category(&self) -> StatusCategory {
        match self {
            Status::Succeeded => StatusCategory::Success,
            Status::Failed | Status::Dismissed => StatusCategory::Failed,
            _ => StatusCategory::Running,
        }
    }

    /// Whether `self -> next` is a legal transition. Re-asserting the current
    /// status is always allowed so progress-only updates stay cheap.
    pub fn can_transition(&self, next: Status) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Status::Accepted => matches!(next, Status::Started | Status::Dismissed),
            Status::Started => matches!(
                next,
                Status::Running | Status::Succeeded | Status::Failed | Status::Dismissed
            ),
            Status::Running => {
                matches!(next, Status::Succeeded | Status::Failed | Status::Dismissed)
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        map_remote_status(s).ok_or_else(|| format!("unknown job status: {s}"))
    }
}

impl StatusCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCategory::Running => "running",
            StatusCategory::Success => "success",
            StatusCategory::Failed => "failed",
        }
    }
}

/// Normalize a status reported by a remote provider.
///
/// Accepts WPS-1/2 values (`ProcessSucceeded`, `ProcessFailed`, ...), OGC API
/// values (`successful`, `dismissed`, ...) and a few common variants seen in
/// the wild, all case-insensitively.
pub fn map_remote_status(raw: &str) -> Option<Status> {
    let status = raw.trim().to_ascii_lowercase();
    let status = status.strip_prefix("process").unwrap_or(&status);
    match status {
        "accepted" | "queued" | "created" | "pending" => Some(Status::Accepted),
        "started" => Some(Status::Started),
        "running" | "paused" => Some(Status::Running),
        "succeeded" | "successful" | "success" | "finished" => Some(Status::Succeeded),
        "failed" | "error" | "exception" => Some(Status::Failed),
        "dismissed" | "canceled" | "cancelled" => Some(Status::Dismissed),
        _ => None,
    }
}

/// Contractual progress marks of the execution engine.
pub mod progress {
    pub const SETUP: i32 = 1;
    pub const STAGE_INPUTS: i32 = 3;
    pub const PLAN_OUTPUTS: i32 = 4;
    pub const STAGE_INPUTS_DONE: i32 = 8;
    pub const EXECUTE: i32 = 10;
    pub const MONITOR_DONE: i32 = 95;
    pub const COLLECT: i32 = 96;
    pub const COLLECT_DONE: i32 = 98;
    pub const NOTIFY: i32 = 99;
    pub const DONE: i32 = 100;

    /// Map a sub-progress in `[0, 100]` into the `[min, max]` window.
    pub fn map_range(percent: f64, min: i32, max: i32) -> i32 {
        let clamped = percent.clamp(0.0, 100.0);
        (min as f64 + (max - min) as f64 * clamped / 100.0).round() as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_status_mapping() {
        assert_eq!(map_remote_status("ProcessSucceeded"), Some(Status::Succeeded));
        assert_eq!(map_remote_status("ProcessFailed"), Some(Status::Failed));
        assert_eq!(map_remote_status("ProcessAccepted"), Some(Status::Accepted));
        assert_eq!(map_remote_status("successful"), Some(Status::Succeeded));
        assert_eq!(map_remote_status("CANCELED"), Some(Status::Dismissed));
        assert_eq!(map_remote_status("bogus"), None);
    }

    #[test]
    fn test_transitions_follow_state_machine() {
        assert!(Status::Accepted.can_transition(Status::Started));
        assert!(Status::Accepted.can_transition(Status::Dismissed));
        assert!(Status::Started.can_transition(Status::Running));
        assert!(Status::Running.can_transition(Status::Succeeded));
        assert!(Status::Running.can_transition(Status::Failed));
        assert!(Status::Running.can_transition(Status::Dismissed));

        assert!(!Status::Accepted.can_transition(Status::Succeeded));
        assert!(!Status::Succeeded.can_transition(Status::Running));
        assert!(!Status::Dismissed.can_transition(Status::Failed));
        assert!(!Status::Failed.can_transition(Status::Succeeded));
    }

    #[test]
    fn test_categories() {
        assert_eq!(Status::Running.category(), StatusCategory::Running);
        assert_eq!(Status::Succeeded.category(), StatusCategory::Success);
        assert_eq!(Status::Dismissed.category(), StatusCategory::Failed);
    }

    #[test]
    fn test_progress_window_mapping() {
        assert_eq!(progress::map_range(0.0, 10, 95), 10);
        assert_eq!(progress::map_range(100.0, 10, 95), 95);
        assert_eq!(progress::map_range(50.0, 10, 95), 53);
        assert_eq!(progress::map_range(150.0, 10, 95), 95);
    }
}
