//! Outcome codes shared by steps, flows and jobs.
//!
//! Three orderings live here and are kept apart. [`ExitStatus::and`] keeps
//! the more severe exit code and ranks UNKNOWN lowest.
//! [`BatchStatus::upgrade_to`] only ever moves a job or step forward, with
//! FAILED absorbing everything. [`FlowExecutionStatus`] ranks UNKNOWN highest
//! so that aggregating parallel branches never hides an unexplained outcome.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Immutable `(code, description)` pair returned by a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitStatus {
    exit_code: String,
    exit_description: String,
}

impl ExitStatus {
    pub const UNKNOWN_CODE: &'static str = "UNKNOWN";
    pub const EXECUTING_CODE: &'static str = "EXECUTING";
    pub const COMPLETED_CODE: &'static str = "COMPLETED";
    pub const NOOP_CODE: &'static str = "NOOP";
    pub const FAILED_CODE: &'static str = "FAILED";
    pub const STOPPED_CODE: &'static str = "STOPPED";

    pub fn new(code: impl Into<String>) -> Self {
        Self::with_description(code, "")
    }

    pub fn with_description(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            exit_code: code.into(),
            exit_description: description.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN_CODE)
    }

    pub fn executing() -> Self {
        Self::new(Self::EXECUTING_CODE)
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED_CODE)
    }

    pub fn noop() -> Self {
        Self::new(Self::NOOP_CODE)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED_CODE)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED_CODE)
    }

    pub fn exit_code(&self) -> &str {
        &self.exit_code
    }

    pub fn exit_description(&self) -> &str {
        &self.exit_description
    }

    /// Combines two statuses: the more severe code wins, descriptions are
    /// joined.
    pub fn and(&self, other: &ExitStatus) -> ExitStatus {
        let mut result = self.add_exit_description(&other.exit_description);
        if self.severity() < other.severity() {
            result.exit_code = other.exit_code.clone();
        }
        result
    }

    pub fn replace_exit_code(&self, code: impl Into<String>) -> ExitStatus {
        Self {
            exit_code: code.into(),
            exit_description: self.exit_description.clone(),
        }
    }

    /// Appends a description, skipping empty and duplicate text.
    pub fn add_exit_description(&self, description: &str) -> ExitStatus {
        let joined = if description.is_empty() || description == self.exit_description {
            self.exit_description.clone()
        } else if self.exit_description.is_empty() {
            description.to_string()
        } else {
            format!("{}; {}", self.exit_description, description)
        };
        Self {
            exit_code: self.exit_code.clone(),
            exit_description: joined,
        }
    }

    pub fn is_running(&self) -> bool {
        self.exit_code == Self::EXECUTING_CODE || self.exit_code == Self::UNKNOWN_CODE
    }

    /// UNKNOWN ranks below every other code. Custom codes rank above
    /// FAILED.
    fn severity(&self) -> u8 {
        let code = self.exit_code.as_str();
        if code.starts_with(Self::UNKNOWN_CODE) {
            0
        } else if code.starts_with(Self::EXECUTING_CODE) {
            1
        } else if code.starts_with(Self::COMPLETED_CODE) {
            2
        } else if code.starts_with(Self::NOOP_CODE) {
            3
        } else if code.starts_with(Self::STOPPED_CODE) {
            4
        } else if code.starts_with(Self::FAILED_CODE) {
            5
        } else {
            6
        }
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exit_description.is_empty() {
            write!(f, "{}", self.exit_code)
        } else {
            write!(f, "{} ({})", self.exit_code, self.exit_description)
        }
    }
}

/// Lifecycle status of a job or step execution.
///
/// Variants are declared in upgrade order; [`BatchStatus::upgrade_to`] takes
/// the maximum, so a status never moves backward and FAILED is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Completed,
    Abandoned,
    Unknown,
    Failed,
}

impl BatchStatus {
    pub fn upgrade_to(self, other: BatchStatus) -> BatchStatus {
        self.max(other)
    }

    pub fn is_running(self) -> bool {
        matches!(self, BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping)
    }

    pub fn is_unsuccessful(self) -> bool {
        matches!(
            self,
            BatchStatus::Failed | BatchStatus::Abandoned | BatchStatus::Unknown
        )
    }

    /// Job status implied by the final status of its flow.
    pub fn from_flow_status(status: &FlowExecutionStatus) -> BatchStatus {
        match status.rank() {
            FlowRank::Completed => BatchStatus::Completed,
            FlowRank::Paused => BatchStatus::Stopped,
            FlowRank::Stopped => BatchStatus::Stopped,
            FlowRank::Failed => BatchStatus::Failed,
            FlowRank::Unknown => BatchStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Unknown => "UNKNOWN",
            BatchStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rank used to compare and aggregate flow outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlowRank {
    Completed,
    Paused,
    Stopped,
    Failed,
    Unknown,
}

/// Outcome of a state or a whole flow, propagated as a raw code so that
/// custom codes can drive transitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowExecutionStatus {
    name: String,
}

impl FlowExecutionStatus {
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const PAUSED: &'static str = "PAUSED";
    pub const STOPPED: &'static str = "STOPPED";
    pub const FAILED: &'static str = "FAILED";
    pub const UNKNOWN: &'static str = "UNKNOWN";

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED)
    }

    pub fn paused() -> Self {
        Self::new(Self::PAUSED)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED)
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rank(&self) -> FlowRank {
        let name = self.name.as_str();
        if name.starts_with(Self::COMPLETED) {
            FlowRank::Completed
        } else if name.starts_with(Self::PAUSED) {
            FlowRank::Paused
        } else if name.starts_with(Self::STOPPED) {
            FlowRank::Stopped
        } else if name.starts_with(Self::FAILED) {
            FlowRank::Failed
        } else {
            FlowRank::Unknown
        }
    }

    pub fn is_paused(&self) -> bool {
        self.rank() == FlowRank::Paused
    }

    pub fn is_stop(&self) -> bool {
        self.rank() == FlowRank::Stopped
    }

    pub fn is_fail(&self) -> bool {
        self.rank() == FlowRank::Failed
    }

    pub fn is_end(&self) -> bool {
        matches!(self.rank(), FlowRank::Completed | FlowRank::Stopped | FlowRank::Failed)
    }
}

impl PartialOrd for FlowExecutionStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlowExecutionStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank()
            .cmp(&other.rank())
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl fmt::Display for FlowExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl From<&str> for FlowExecutionStatus {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<&ExitStatus> for FlowExecutionStatus {
    fn from(status: &ExitStatus) -> Self {
        Self::new(status.exit_code())
    }
}
