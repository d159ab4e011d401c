//! Transaction and step state machines.

use serde::{Deserialize, Serialize};

/// The status of a distributed transaction.
///
/// State transitions:
/// ```text
/// Started ──► InProgress ──┬──► Completed
///                          ├──► Failed ────┐
///                          └──► TimedOut ──┴──► Compensating ──► Compensated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Created and persisted, no step dispatched yet.
    #[default]
    Started,

    /// A step command is out and the coordinator awaits its outcome.
    InProgress,

    /// Every step completed (terminal state).
    Completed,

    /// A step reported failure; compensation follows.
    Failed,

    /// The active step made no progress within the timeout window; compensation follows.
    TimedOut,

    /// Compensation commands are being dispatched.
    Compensating,

    /// Compensation finished (terminal state).
    Compensated,
}

impl TransactionStatus {
    /// Returns true if the transaction may advance to its next step.
    pub fn can_progress(&self) -> bool {
        matches!(self, TransactionStatus::Started | TransactionStatus::InProgress)
    }

    /// Returns true once compensation has begun or finished.
    pub fn is_compensating(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Compensating | TransactionStatus::Compensated
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Compensated
        )
    }

    /// Returns the status name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Started => "STARTED",
            TransactionStatus::InProgress => "IN_PROGRESS",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::TimedOut => "TIMED_OUT",
            TransactionStatus::Compensating => "COMPENSATING",
            TransactionStatus::Compensated => "COMPENSATED",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The status of a single step within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Compensated,
}

impl StepStatus {
    /// Returns the status name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
            StepStatus::Compensated => "COMPENSATED",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
