// 🚩 Validation Issues - Structured, never-mutated ingestion findings

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::str::FromStr;

// ============================================================================
// CODES + SEVERITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    MissingSheet,
    UnsupportedInput,
    UnknownReference,
    DuplicateRule,
    InvalidNumber,
    InvalidBoolean,
    CoverageGap,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::MissingSheet => "MISSING_SHEET",
            IssueCode::UnsupportedInput => "UNSUPPORTED_INPUT",
            IssueCode::UnknownReference => "UNKNOWN_REFERENCE",
            IssueCode::DuplicateRule => "DUPLICATE_RULE",
            IssueCode::InvalidNumber => "INVALID_NUMBER",
            IssueCode::InvalidBoolean => "INVALID_BOOLEAN",
            IssueCode::CoverageGap => "COVERAGE_GAP",
        }
    }
}

impl FromStr for IssueCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MISSING_SHEET" => Ok(IssueCode::MissingSheet),
            "UNSUPPORTED_INPUT" => Ok(IssueCode::UnsupportedInput),
            "UNKNOWN_REFERENCE" => Ok(IssueCode::UnknownReference),
            "DUPLICATE_RULE" => Ok(IssueCode::DuplicateRule),
            "INVALID_NUMBER" => Ok(IssueCode::InvalidNumber),
            "INVALID_BOOLEAN" => Ok(IssueCode::InvalidBoolean),
            "COVERAGE_GAP" => Ok(IssueCode::CoverageGap),
            other => Err(format!("unknown issue code: {other}")),
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks activation
    Error,
    /// Reported only
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(Severity::Error),
            "warning" => Ok(Severity::Warning),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ISSUE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Logical sheet name ("withholding" / "composite")
    pub sheet: String,

    /// 1-based sheet row (header = 1). None for sheet-level issues.
    pub row: Option<usize>,

    pub field: Option<String>,

    /// Offending cell text
    pub value: Option<String>,

    pub code: IssueCode,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn error(sheet: &str, code: IssueCode, message: impl Into<String>) -> Self {
        ValidationIssue {
            sheet: sheet.to_string(),
            row: None,
            field: None,
            value: None,
            code,
            message: message.into(),
            severity: Severity::Error,
        }
    }

    pub fn warning(sheet: &str, code: IssueCode, message: impl Into<String>) -> Self {
        ValidationIssue {
            severity: Severity::Warning,
            ..ValidationIssue::error(sheet, code, message)
        }
    }

    pub fn at_row(mut self, row: usize) -> Self {
        self.row = Some(row);
        self
    }

    pub fn on_field(mut self, field: &str, value: &str) -> Self {
        self.field = Some(field.to_string());
        self.value = Some(value.to_string());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error
    }
}

// ============================================================================
// ACCUMULATOR
// ============================================================================

/// Threaded through the validation pass; nothing fails fast.
#[derive(Debug, Default)]
pub struct IssueCollector {
    issues: Vec<ValidationIssue>,
}

impl IssueCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    pub fn error_count(&self) -> usize {
        self.issues.iter().filter(|i| i.is_blocking()).count()
    }

    pub fn warning_count(&self) -> usize {
        self.issues.len() - self.error_count()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn into_issues(self) -> Vec<ValidationIssue> {
        self.issues
    }
}

// ============================================================================
// CSV EXPORT
// ============================================================================

#[derive(Serialize)]
struct IssueRow<'a> {
    sheet: &'a str,
    row: Option<usize>,
    field: Option<&'a str>,
    value: Option<&'a str>,
    code: &'static str,
    severity: &'static str,
    message: &'a str,
}

/// Flatten issues to one CSV row each for external review
pub fn issues_to_csv<W: Write>(writer: W, issues: &[ValidationIssue]) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);

    if issues.is_empty() {
        wtr.write_record(["sheet", "row", "field", "value", "code", "severity", "message"])
            .context("Failed to write issue CSV header")?;
    }

    for issue in issues {
        wtr.serialize(IssueRow {
            sheet: &issue.sheet,
            row: issue.row,
            field: issue.field.as_deref(),
            value: issue.value.as_deref(),
            code: issue.code.as_str(),
            severity: issue.severity.as_str(),
            message: &issue.message,
        })
        .context("Failed to write issue CSV row")?;
    }

    wtr.flush().context("Failed to flush issue CSV")?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_counts_by_severity() {
        let mut collector = IssueCollector::new();
        collector.push(ValidationIssue::error("withholding", IssueCode::InvalidNumber, "bad").at_row(3));
        collector.push(ValidationIssue::warning("composite", IssueCode::CoverageGap, "gap"));
        collector.push(ValidationIssue::error("composite", IssueCode::DuplicateRule, "dup").at_row(9));

        assert_eq!(collector.error_count(), 2);
        assert_eq!(collector.warning_count(), 1);
        assert_eq!(collector.into_issues().len(), 3);
    }

    #[test]
    fn test_issue_builders() {
        let issue = ValidationIssue::error("withholding", IssueCode::InvalidNumber, "not a number")
            .at_row(12)
            .on_field("rate", "abc");

        assert_eq!(issue.row, Some(12));
        assert_eq!(issue.field.as_deref(), Some("rate"));
        assert_eq!(issue.value.as_deref(), Some("abc"));
        assert!(issue.is_blocking());

        let downgraded = issue.with_severity(Severity::Warning);
        assert!(!downgraded.is_blocking());
    }

    #[test]
    fn test_issues_to_csv_flattens_one_row_per_issue() {
        let issues = vec![
            ValidationIssue::error("withholding", IssueCode::UnknownReference, "unknown state: XX")
                .at_row(4)
                .on_field("state", "XX"),
            ValidationIssue::warning("composite", IssueCode::CoverageGap, "no rule for WY/IRA"),
        ];

        let mut out = Vec::new();
        issues_to_csv(&mut out, &issues).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "sheet,row,field,value,code,severity,message");
        assert_eq!(
            lines[1],
            "withholding,4,state,XX,UNKNOWN_REFERENCE,error,unknown state: XX"
        );
        assert_eq!(lines[2], "composite,,,,COVERAGE_GAP,warning,no rule for WY/IRA");
    }

    #[test]
    fn test_code_and_severity_parse_back() {
        assert_eq!("COVERAGE_GAP".parse::<IssueCode>().unwrap(), IssueCode::CoverageGap);
        assert_eq!("warning".parse::<Severity>().unwrap(), Severity::Warning);
        assert!("LOUD".parse::<Severity>().is_err());
    }
}
