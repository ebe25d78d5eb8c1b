use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an analysis job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    PartiallyComplete,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::PartiallyComplete => "partially_complete",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "partially_complete" => Ok(Self::PartiallyComplete),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Check whether a status transition is legal.
///
/// The status machine is monotonic: once a job is Complete or Failed no
/// further transition is allowed. PartiallyComplete marks a recoverable
/// stage failure awaiting retry, so it can move back to Running.
pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Queued, Running)
            | (Queued, Failed)
            | (Running, PartiallyComplete)
            | (Running, Complete)
            | (Running, Failed)
            | (PartiallyComplete, Running)
            | (PartiallyComplete, Failed)
    )
}

/// A parsed repository locator ("owner/repo").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoLocator {
    pub owner: String,
    pub name: String,
}

impl RepoLocator {
    /// Parse a locator from the accepted input forms: bare `owner/repo`,
    /// `https://github.com/owner/repo[.git]`, or `git@github.com:owner/repo`.
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim().trim_end_matches('/').trim_end_matches(".git");
        if input.is_empty() {
            return Err("Repository locator is empty".to_string());
        }

        if let Some(pos) = input.find("github.com/") {
            let rest = &input[pos + "github.com/".len()..];
            return Self::from_owner_name(rest);
        }
        if let Some(rest) = input.strip_prefix("git@github.com:") {
            return Self::from_owner_name(rest);
        }
        // Bare "owner/repo" form. Reject anything that looks like a URL for
        // a different host.
        if input.contains("://") || input.contains('@') {
            return Err(format!("Unsupported repository locator: {}", input));
        }
        Self::from_owner_name(input)
    }

    fn from_owner_name(rest: &str) -> Result<Self, String> {
        let parts: Vec<&str> = rest.splitn(3, '/').collect();
        if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(format!("Expected owner/repo, got: {}", rest));
        }
        let valid = |s: &str| {
            s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if !valid(parts[0]) || !valid(parts[1]) {
            return Err(format!("Invalid characters in locator: {}", rest));
        }
        Ok(Self {
            owner: parts[0].to_string(),
            name: parts[1].to_string(),
        })
    }
}

impl std::fmt::Display for RepoLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub repository: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// One stage's output, append-only within a job. Identity is (job_id, index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub job_id: Uuid,
    pub index: i64,
    pub stage: String,
    pub payload: serde_json::Value,
    pub success: bool,
    pub recorded_at: String,
}

/// Atomic read of a job together with its ordered stage results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    #[serde(flatten)]
    pub job: Job,
    pub stages: Vec<StageResult>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Ok,
    Error,
}

/// A unit pushed to subscribers describing stage completion or job
/// termination. Not persisted: derivable from stage results plus the job's
/// terminal state, which is what makes replay-from-store exact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub seq: u64,
    pub stage: String,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub terminal: bool,
}

impl ProgressEvent {
    /// Event for a recorded stage result. Sequence numbers are one-based so
    /// the terminal event can always take `stage_count + 1`.
    pub fn for_stage(result: &StageResult) -> Self {
        Self {
            job_id: result.job_id,
            seq: (result.index + 1) as u64,
            stage: result.stage.clone(),
            status: if result.success {
                EventStatus::Ok
            } else {
                EventStatus::Error
            },
            payload: Some(result.payload.clone()),
            error: None,
            terminal: false,
        }
    }

    pub fn completed(job_id: Uuid, seq: u64) -> Self {
        Self {
            job_id,
            seq,
            stage: "complete".to_string(),
            status: EventStatus::Ok,
            payload: None,
            error: None,
            terminal: true,
        }
    }

    pub fn failed(job_id: Uuid, seq: u64, error: String) -> Self {
        Self {
            job_id,
            seq,
            stage: "failed".to_string(),
            status: EventStatus::Error,
            payload: None,
            error: Some(error),
            terminal: true,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::PartiallyComplete,
            JobStatus::Complete,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()), Ok(status));
        }
        assert!(JobStatus::from_str("bogus").is_err());
    }

    #[test]
    fn test_job_status_serde_snake_case() {
        let json = serde_json::to_string(&JobStatus::PartiallyComplete).unwrap();
        assert_eq!(json, "\"partially_complete\"");
        let back: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, JobStatus::PartiallyComplete);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::PartiallyComplete.is_terminal());
    }

    #[test]
    fn test_valid_transitions() {
        use JobStatus::*;
        assert!(is_valid_transition(Queued, Running));
        assert!(is_valid_transition(Queued, Failed));
        assert!(is_valid_transition(Running, PartiallyComplete));
        assert!(is_valid_transition(PartiallyComplete, Running));
        assert!(is_valid_transition(Running, Complete));
        assert!(is_valid_transition(Running, Failed));
        assert!(is_valid_transition(PartiallyComplete, Failed));
    }

    #[test]
    fn test_invalid_transitions() {
        use JobStatus::*;
        // Terminal states never move.
        assert!(!is_valid_transition(Complete, Running));
        assert!(!is_valid_transition(Complete, Failed));
        assert!(!is_valid_transition(Failed, Running));
        assert!(!is_valid_transition(Failed, Complete));
        // No skipping Queued -> Complete or re-queueing.
        assert!(!is_valid_transition(Queued, Complete));
        assert!(!is_valid_transition(Running, Queued));
        assert!(!is_valid_transition(PartiallyComplete, Complete));
    }

    #[test]
    fn test_locator_parse_bare() {
        let loc = RepoLocator::parse("rust-lang/cargo").unwrap();
        assert_eq!(loc.owner, "rust-lang");
        assert_eq!(loc.name, "cargo");
        assert_eq!(loc.to_string(), "rust-lang/cargo");
    }

    #[test]
    fn test_locator_parse_https_url() {
        let loc = RepoLocator::parse("https://github.com/tokio-rs/axum").unwrap();
        assert_eq!(loc.owner, "tokio-rs");
        assert_eq!(loc.name, "axum");
    }

    #[test]
    fn test_locator_parse_git_suffix_and_trailing_slash() {
        let loc = RepoLocator::parse("https://github.com/tokio-rs/axum.git").unwrap();
        assert_eq!(loc.name, "axum");
        let loc = RepoLocator::parse("https://github.com/tokio-rs/axum/").unwrap();
        assert_eq!(loc.name, "axum");
    }

    #[test]
    fn test_locator_parse_ssh() {
        let loc = RepoLocator::parse("git@github.com:serde-rs/serde").unwrap();
        assert_eq!(loc.owner, "serde-rs");
        assert_eq!(loc.name, "serde");
    }

    #[test]
    fn test_locator_parse_rejects_malformed() {
        assert!(RepoLocator::parse("").is_err());
        assert!(RepoLocator::parse("   ").is_err());
        assert!(RepoLocator::parse("just-a-name").is_err());
        assert!(RepoLocator::parse("a/b/c").is_err());
        assert!(RepoLocator::parse("https://gitlab.com/owner/repo").is_err());
        assert!(RepoLocator::parse("owner//").is_err());
        assert!(RepoLocator::parse("ow ner/repo").is_err());
    }

    #[test]
    fn test_progress_event_serialization_skips_absent_fields() {
        let event = ProgressEvent::completed(Uuid::new_v4(), 7);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "complete");
        assert_eq!(json["status"], "ok");
        assert_eq!(json["terminal"], true);
        assert!(json.get("payload").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_progress_event_for_stage_seq_is_one_based() {
        let result = StageResult {
            job_id: Uuid::new_v4(),
            index: 0,
            stage: "fetch".to_string(),
            payload: serde_json::json!({"file_count": 3}),
            success: true,
            recorded_at: "2026-01-01T00:00:00Z".to_string(),
        };
        let event = ProgressEvent::for_stage(&result);
        assert_eq!(event.seq, 1);
        assert_eq!(event.status, EventStatus::Ok);
        assert!(!event.terminal);
        assert_eq!(event.payload.unwrap()["file_count"], 3);
    }

    #[test]
    fn test_failed_event_carries_error() {
        let event = ProgressEvent::failed(Uuid::new_v4(), 3, "fetch timed out".to_string());
        assert_eq!(event.stage, "failed");
        assert_eq!(event.status, EventStatus::Error);
        assert!(event.terminal);
        assert_eq!(event.error.as_deref(), Some("fetch timed out"));
    }
}
