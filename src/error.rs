// ⚠️ Error Types - Structured faults for the rule engine
//
// Row-level ingestion problems are NOT errors: they are ValidationIssue values
// collected during the validation pass. The enums here cover faults that stop
// an operation outright (structural ingestion failures, lifecycle refusals,
// storage failures).

use crate::ingestion::issue::ValidationIssue;
use crate::rules::{Period, RuleSetStatus};
use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

// ============================================================================
// ENGINE ERRORS (lifecycle + storage)
// ============================================================================

#[derive(Error, Debug)]
pub enum EngineError {
    /// Referenced RuleSet does not exist
    #[error("rule set not found: {0}")]
    NotFound(String),

    /// Activation refused: the RuleSet carries error-severity issues
    #[error("VALIDATION_BLOCKED: rule set {rule_set_id} has {error_count} blocking issue(s)")]
    ValidationBlocked {
        rule_set_id: String,
        error_count: usize,
    },

    /// Status change not present in the transition table
    #[error("invalid transition for rule set {rule_set_id}: {from} -> {to}")]
    InvalidTransition {
        rule_set_id: String,
        from: RuleSetStatus,
        to: RuleSetStatus,
    },

    /// Another RuleSet became active for the same period first
    #[error("conflicting activation: {year} {period} already has an active rule set")]
    ConflictingActivation { year: i32, period: Period },

    /// Calculation requested against a rule set that was never activated
    #[error("rule set {0} has not been published; only activated rule sets can be calculated against")]
    NotPublished(String),

    /// Year outside the calendar range dates can be derived for
    #[error("invalid period: {year} {period}")]
    InvalidPeriod { year: i32, period: Period },

    /// Structural ingestion failure surfaced through the lifecycle manager
    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    /// Stored row could not be mapped back into the domain model
    #[error("corrupt stored value in {table}.{column}: {value}")]
    Corrupt {
        table: &'static str,
        column: &'static str,
        value: String,
    },

    /// Storage unavailable or constraint failure not mapped above
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// INGESTION ERRORS (structural only)
// ============================================================================

/// Structural failure that makes row-level validation meaningless.
/// No RuleSet is created when ingestion returns one of these.
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("MISSING_SHEET: {}", describe(.0))]
    MissingSheet(Vec<ValidationIssue>),

    #[error("UNSUPPORTED_INPUT: {}", describe(.0))]
    UnsupportedInput(Vec<ValidationIssue>),
}

impl IngestionError {
    /// Issues explaining the abort, for the same review surface as row issues
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            IngestionError::MissingSheet(issues) => issues,
            IngestionError::UnsupportedInput(issues) => issues,
        }
    }
}

fn describe(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}
