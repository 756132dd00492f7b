use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    AutoProxy,
    ManualCheck,
    SetupWorker,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoProxy => "auto-proxy",
            Self::ManualCheck => "manual-check",
            Self::SetupWorker => "setup-worker",
        }
    }
}

/// Profiles are grouped by mode; `Simple` sorts before `Detailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProfileMode {
    Simple,
    Detailed,
}

impl ProfileMode {
    pub fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case("detailed") {
            Self::Detailed
        } else {
            Self::Simple
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "Simple",
            Self::Detailed => "Detailed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubPhase {
    Priority,
    Routine,
    Check,
    Setup,
}

impl SubPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::Routine => "routine",
            Self::Check => "check",
            Self::Setup => "setup",
        }
    }

    pub fn for_mode(mode: RunMode) -> &'static [SubPhase] {
        match mode {
            RunMode::AutoProxy => &[SubPhase::Priority, SubPhase::Routine],
            RunMode::ManualCheck => &[SubPhase::Check],
            RunMode::SetupWorker => &[SubPhase::Setup],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    Skipped,
    Interrupted,
}

impl ProfileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutKind {
    /// The newest parsed log line is older than the time limit.
    Stalled,
    /// No log line parsed since the attempt started.
    NoOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum RunOutcome {
    Success,
    PartialFailure(String),
    Timeout(TimeoutKind),
    ManuallyInterrupted,
    ConfigInvalid(String),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Success => "success".to_string(),
            Self::PartialFailure(reason) => reason.clone(),
            Self::Timeout(TimeoutKind::Stalled) => {
                "worker log went silent beyond the time limit".to_string()
            }
            Self::Timeout(TimeoutKind::NoOutput) => {
                "worker produced no log output within the time limit".to_string()
            }
            Self::ManuallyInterrupted => "manually interrupted".to_string(),
            Self::ConfigInvalid(reason) => format!("configuration invalid: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSnapshot {
    pub profile_id: Uuid,
    pub name: String,
    pub status: ProfileStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    LogBatch {
        profile_id: Option<Uuid>,
        lines: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    ProfileList { profiles: Vec<ProfileSnapshot> },
    #[serde(rename_all = "camelCase")]
    ProfileStatus {
        profile_id: Uuid,
        name: String,
        status: ProfileStatus,
    },
    #[serde(rename_all = "camelCase")]
    Message { level: String, text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt: u32,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub log_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubPhaseReport {
    pub sub_phase: SubPhase,
    pub done: bool,
    pub skipped_by_policy: bool,
    pub attempts: Vec<AttemptRecord>,
}

impl SubPhaseReport {
    pub fn last_outcome(&self) -> Option<&RunOutcome> {
        self.attempts.last().map(|attempt| &attempt.outcome)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileReport {
    pub profile_id: Uuid,
    pub name: String,
    pub status: ProfileStatus,
    pub sub_phases: Vec<SubPhaseReport>,
    pub drops: BTreeMap<String, BTreeMap<String, u64>>,
}

impl ProfileReport {
    pub fn attempts_consumed(&self) -> usize {
        self.sub_phases.iter().map(|phase| phase.attempts.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunStatistics {
    pub title: String,
    pub script_name: String,
    pub mode: RunMode,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub completed_count: usize,
    pub uncompleted_count: usize,
    pub completed_profiles: Vec<String>,
    pub failed_profiles: Vec<String>,
    pub interrupted_profiles: Vec<String>,
    pub waiting_profiles: Vec<String>,
    pub skipped_profiles: Vec<String>,
}

impl RunStatistics {
    pub fn failed_count(&self) -> usize {
        self.failed_profiles.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting_profiles.len()
    }

    pub fn has_problems(&self) -> bool {
        self.uncompleted_count > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub script_id: Uuid,
    pub mode: RunMode,
    pub interrupted: bool,
    pub profiles: Vec<ProfileReport>,
    pub statistics: RunStatistics,
}
