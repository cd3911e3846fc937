// 🏷️ Tax Rules - Rule sets, withholding/composite rules and their keys
//
// A RuleSet is one versioned collection for a (year, period). Its child rules
// are created at ingestion and never change afterwards: corrections arrive as
// a new RuleSet version.

use crate::reference::{EntityTypeCode, StateCode};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// PERIOD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Period {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Q1 => "Q1",
            Period::Q2 => "Q2",
            Period::Q3 => "Q3",
            Period::Q4 => "Q4",
        }
    }

    /// Calendar month the quarter starts in (1-based)
    pub fn start_month(&self) -> u32 {
        match self {
            Period::Q1 => 1,
            Period::Q2 => 4,
            Period::Q3 => 7,
            Period::Q4 => 10,
        }
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "Q1" => Ok(Period::Q1),
            "Q2" => Ok(Period::Q2),
            "Q3" => Ok(Period::Q3),
            "Q4" => Ok(Period::Q4),
            other => Err(format!("unknown period: {other} (expected Q1-Q4)")),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// LIFECYCLE STATUS (finite state machine)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSetStatus {
    Draft,
    Active,
    Archived,
}

/// Every permitted (from, to) pair. Anything else is rejected.
const TRANSITIONS: &[(RuleSetStatus, RuleSetStatus)] = &[
    (RuleSetStatus::Draft, RuleSetStatus::Active),
    (RuleSetStatus::Draft, RuleSetStatus::Archived),
    (RuleSetStatus::Active, RuleSetStatus::Archived),
];

impl RuleSetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleSetStatus::Draft => "draft",
            RuleSetStatus::Active => "active",
            RuleSetStatus::Archived => "archived",
        }
    }

    pub fn can_transition_to(&self, to: RuleSetStatus) -> bool {
        TRANSITIONS.contains(&(*self, to))
    }
}

impl FromStr for RuleSetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(RuleSetStatus::Draft),
            "active" => Ok(RuleSetStatus::Active),
            "archived" => Ok(RuleSetStatus::Archived),
            other => Err(format!("unknown rule set status: {other}")),
        }
    }
}

impl fmt::Display for RuleSetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RULE SET
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub id: String,
    pub year: i32,
    pub period: Period,
    pub status: RuleSetStatus,

    /// Period start unless overridden at activation
    pub effective_from: NaiveDate,

    /// Set when archived
    pub effective_to: Option<NaiveDate>,

    /// Fingerprint of the uploaded workbook, if the caller supplied one
    pub source_digest: Option<String>,

    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl RuleSet {
    pub fn is_active(&self) -> bool {
        self.status == RuleSetStatus::Active
    }

    /// Whether this set governed the given day (never true before publication)
    pub fn is_effective_on(&self, date: NaiveDate) -> bool {
        self.published_at.is_some()
            && self.effective_from <= date
            && self.effective_to.map_or(true, |to| date <= to)
    }
}

// ============================================================================
// RULE KEY
// ============================================================================

/// (state, entity type) - the granularity of every rule, resolution and diff
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleKey {
    pub state: StateCode,
    pub entity_type: EntityTypeCode,
}

impl RuleKey {
    pub fn new(state: StateCode, entity_type: EntityTypeCode) -> Self {
        RuleKey { state, entity_type }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.state, self.entity_type)
    }
}

// ============================================================================
// RULES (persisted) + CANDIDATES (pre-persistence)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithholdingRule {
    pub id: String,
    pub rule_set_id: String,
    pub key: RuleKey,
    pub rate: Option<Decimal>,
    pub income_threshold: Option<Decimal>,
    pub tax_threshold: Option<Decimal>,
    pub source_row: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeRule {
    pub id: String,
    pub rule_set_id: String,
    pub key: RuleKey,
    pub rate: Option<Decimal>,
    pub income_threshold: Option<Decimal>,

    /// None = unspecified, distinct from Some(false)
    pub mandatory_filing: Option<bool>,
    pub source_row: usize,
}

/// Withholding row that passed validation, not yet owned by a RuleSet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithholdingCandidate {
    pub key: RuleKey,
    pub rate: Option<Decimal>,
    pub income_threshold: Option<Decimal>,
    pub tax_threshold: Option<Decimal>,
    pub source_row: usize,
}

impl WithholdingCandidate {
    pub fn into_rule(self, rule_set_id: &str) -> WithholdingRule {
        WithholdingRule {
            id: uuid::Uuid::new_v4().to_string(),
            rule_set_id: rule_set_id.to_string(),
            key: self.key,
            rate: self.rate,
            income_threshold: self.income_threshold,
            tax_threshold: self.tax_threshold,
            source_row: self.source_row,
        }
    }
}

/// Composite row that passed validation, not yet owned by a RuleSet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeCandidate {
    pub key: RuleKey,
    pub rate: Option<Decimal>,
    pub income_threshold: Option<Decimal>,
    pub mandatory_filing: Option<bool>,
    pub source_row: usize,
}

impl CompositeCandidate {
    pub fn into_rule(self, rule_set_id: &str) -> CompositeRule {
        CompositeRule {
            id: uuid::Uuid::new_v4().to_string(),
            rule_set_id: rule_set_id.to_string(),
            key: self.key,
            rate: self.rate,
            income_threshold: self.income_threshold,
            mandatory_filing: self.mandatory_filing,
            source_row: self.source_row,
        }
    }
}

/// Output of the validation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedRules {
    pub withholding: Vec<WithholdingCandidate>,
    pub composite: Vec<CompositeCandidate>,
}

impl ParsedRules {
    pub fn len(&self) -> usize {
        self.withholding.len() + self.composite.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// TESTS
// ============================================================================
