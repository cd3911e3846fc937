// SALT Rules Engine - Core Library
// Exposes all modules for use in the CLI and tests

pub mod reference;   // States + entity types + synonym registry
pub mod ingestion;   // Workbook -> validated rule candidates + issues
pub mod rules;       // RuleSet / rule records / lifecycle status
pub mod temporal;    // Effective-date windows
pub mod db;          // SQLite schema, constraints, event log
pub mod lifecycle;   // Draft -> active -> archived
pub mod diff;        // Rule set comparison
pub mod resolution;  // Withholding + composite -> resolved snapshot
pub mod calculation; // Distributions -> taxes + audit trail
pub mod config;
pub mod error;

// Re-export commonly used types
pub use reference::{EntityTypeCode, ReferenceData, State, StateCode, STATES};
pub use ingestion::{
    issues_to_csv, IngestionReport, IssueCode, IssueCollector, RuleIngestor,
    Severity, Sheet, SheetKind, ValidationIssue, Workbook,
};
pub use rules::{
    CompositeRule, ParsedRules, Period, RuleKey, RuleSet, RuleSetStatus, WithholdingRule,
};
pub use db::{setup_database, Event};
pub use lifecycle::RuleSetManager;
pub use diff::{FieldChange, ModifiedRule, RuleSetDiff};
pub use resolution::{resolve, ResolvedRule, ResolvedRuleSet};
pub use calculation::{
    read_distributions, AuditEntry, AuditOutcome, BatchSummary, CalculationBatch,
    CalculationStep, Distribution, DistributionResult, Investor, TaxCalculator,
};
pub use config::{CoveragePolicy, EngineConfig};
pub use error::{EngineError, EngineResult, IngestionError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
