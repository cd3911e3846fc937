// Rule Ingestion & Validation Pipeline
//
// workbook -> normalize -> validate -> (ParsedRules, Vec<ValidationIssue>)

pub mod issue;
pub mod normalize;
pub mod validate;
pub mod workbook;

pub use issue::{issues_to_csv, IssueCode, IssueCollector, Severity, ValidationIssue};
pub use validate::{IngestionReport, RuleIngestor};
pub use workbook::{Column, Sheet, SheetKind, SheetRow, Workbook};
