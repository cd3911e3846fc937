// ✅ Rule Validation - Normalize + validate workbook rows in one pass
//
// Row problems are accumulated in an IssueCollector and never abort the pass;
// only structural problems (missing sheet, missing required column) return
// early, because row validation is meaningless without them.

use crate::config::{CoveragePolicy, EngineConfig};
use crate::error::IngestionError;
use crate::ingestion::issue::{IssueCode, IssueCollector, Severity, ValidationIssue};
use crate::ingestion::normalize::{parse_decimal, parse_flag};
use crate::ingestion::workbook::{Column, Sheet, SheetKind, SheetRow, Workbook};
use crate::reference::ReferenceData;
use crate::rules::{CompositeCandidate, ParsedRules, RuleKey, WithholdingCandidate};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub rules: ParsedRules,
    pub issues: Vec<ValidationIssue>,

    /// Workbook fingerprint (see Workbook::digest)
    pub source_digest: String,
}

impl IngestionReport {
    pub fn error_count(&self) -> usize {
        self.issues.iter().filter(|i| i.is_blocking()).count()
    }

    pub fn warning_count(&self) -> usize {
        self.issues.len() - self.error_count()
    }

    pub fn has_blocking_issues(&self) -> bool {
        self.error_count() > 0
    }
}

// ============================================================================
// INGESTOR
// ============================================================================

pub struct RuleIngestor {
    reference: ReferenceData,
    coverage: CoveragePolicy,
}

impl RuleIngestor {
    pub fn new(config: &EngineConfig) -> Self {
        RuleIngestor {
            reference: config.reference_data(),
            coverage: config.coverage.clone(),
        }
    }

    /// Validate a workbook into rule candidates plus every issue found
    pub fn ingest(&self, workbook: &Workbook) -> Result<IngestionReport, IngestionError> {
        let (withholding_sheet, composite_sheet) = check_structure(workbook)?;

        let mut collector = IssueCollector::new();
        let mut rules = ParsedRules::default();

        let withholding_keys =
            self.read_withholding(withholding_sheet, &mut rules.withholding, &mut collector);
        let composite_keys =
            self.read_composite(composite_sheet, &mut rules.composite, &mut collector);

        if self.coverage.enabled {
            self.check_coverage(SheetKind::Withholding, &withholding_keys, &mut collector);
            self.check_coverage(SheetKind::Composite, &composite_keys, &mut collector);
        }

        let report = IngestionReport {
            rules,
            issues: collector.into_issues(),
            source_digest: workbook.digest(),
        };

        tracing::info!(
            withholding = report.rules.withholding.len(),
            composite = report.rules.composite.len(),
            errors = report.error_count(),
            warnings = report.warning_count(),
            "workbook validated"
        );

        Ok(report)
    }

    fn read_withholding(
        &self,
        sheet: &Sheet,
        out: &mut Vec<WithholdingCandidate>,
        collector: &mut IssueCollector,
    ) -> BTreeSet<RuleKey> {
        let kind = SheetKind::Withholding;
        let mut seen: HashMap<RuleKey, usize> = HashMap::new();

        for row in &sheet.rows {
            let mut clean = true;
            let key = self.read_key(kind, sheet, row, collector, &mut clean);
            let rate = read_number(kind, sheet, row, Column::Rate, collector, &mut clean);
            let income_threshold =
                read_number(kind, sheet, row, Column::IncomeThreshold, collector, &mut clean);
            let tax_threshold =
                read_number(kind, sheet, row, Column::TaxThreshold, collector, &mut clean);

            let Some(key) = key else { continue };
            if !register_key(kind, &key, row, &mut seen, collector) || !clean {
                continue;
            }

            out.push(WithholdingCandidate {
                key,
                rate,
                income_threshold,
                tax_threshold,
                source_row: row.row_number,
            });
        }

        seen.into_keys().collect()
    }

    fn read_composite(
        &self,
        sheet: &Sheet,
        out: &mut Vec<CompositeCandidate>,
        collector: &mut IssueCollector,
    ) -> BTreeSet<RuleKey> {
        let kind = SheetKind::Composite;
        let mut seen: HashMap<RuleKey, usize> = HashMap::new();

        for row in &sheet.rows {
            let mut clean = true;
            let key = self.read_key(kind, sheet, row, collector, &mut clean);
            let rate = read_number(kind, sheet, row, Column::Rate, collector, &mut clean);
            let income_threshold =
                read_number(kind, sheet, row, Column::IncomeThreshold, collector, &mut clean);
            let mandatory_filing = read_flag(kind, sheet, row, collector, &mut clean);

            let Some(key) = key else { continue };
            if !register_key(kind, &key, row, &mut seen, collector) || !clean {
                continue;
            }

            out.push(CompositeCandidate {
                key,
                rate,
                income_threshold,
                mandatory_filing,
                source_row: row.row_number,
            });
        }

        seen.into_keys().collect()
    }

    /// Resolve the state + entity-type references of a row
    fn read_key(
        &self,
        kind: SheetKind,
        sheet: &Sheet,
        row: &SheetRow,
        collector: &mut IssueCollector,
        clean: &mut bool,
    ) -> Option<RuleKey> {
        let state_raw = sheet.cell(row, Column::State);
        let entity_raw = sheet.cell(row, Column::EntityType);

        let state = self.reference.resolve_state(state_raw);
        if state.is_none() {
            *clean = false;
            collector.push(
                ValidationIssue::error(
                    kind.name(),
                    IssueCode::UnknownReference,
                    format!("unknown state: '{}'", state_raw.trim()),
                )
                .at_row(row.row_number)
                .on_field(Column::State.field(), state_raw),
            );
        }

        let entity_type = self.reference.resolve_entity_type(entity_raw);
        if entity_type.is_none() {
            *clean = false;
            collector.push(
                ValidationIssue::error(
                    kind.name(),
                    IssueCode::UnknownReference,
                    format!("unknown entity type: '{}'", entity_raw.trim()),
                )
                .at_row(row.row_number)
                .on_field(Column::EntityType.field(), entity_raw),
            );
        }

        Some(RuleKey::new(state?, entity_type?))
    }

    fn check_coverage(
        &self,
        kind: SheetKind,
        present: &BTreeSet<RuleKey>,
        collector: &mut IssueCollector,
    ) {
        for state in self.reference.state_codes() {
            for entity_type in &self.coverage.entity_types {
                let key = RuleKey::new(state.clone(), *entity_type);
                if present.contains(&key) {
                    continue;
                }
                collector.push(
                    ValidationIssue::error(
                        kind.name(),
                        IssueCode::CoverageGap,
                        format!("no {} rule for {}", kind.name(), key),
                    )
                    .with_severity(self.coverage.severity),
                );
            }
        }
    }
}

// ============================================================================
// STRUCTURE CHECKS
// ============================================================================

fn check_structure(workbook: &Workbook) -> Result<(&Sheet, &Sheet), IngestionError> {
    let missing: Vec<ValidationIssue> = SheetKind::REQUIRED
        .iter()
        .filter(|kind| workbook.sheet(**kind).is_none())
        .map(|kind| {
            ValidationIssue::error(
                kind.name(),
                IssueCode::MissingSheet,
                format!("required sheet '{}' not found", kind.name()),
            )
        })
        .collect();
    if !missing.is_empty() {
        return Err(IngestionError::MissingSheet(missing));
    }

    let mut unsupported = Vec::new();
    let mut sheets = Vec::new();
    for kind in SheetKind::REQUIRED {
        let Some(sheet) = workbook.sheet(kind) else { continue };
        for column in kind.required_columns() {
            if sheet.column_index(*column).is_none() {
                unsupported.push(
                    ValidationIssue::error(
                        kind.name(),
                        IssueCode::UnsupportedInput,
                        format!("sheet '{}' has no '{}' column", sheet.title, column.field()),
                    )
                    .at_row(1),
                );
            }
        }
        sheets.push(sheet);
    }
    if !unsupported.is_empty() {
        return Err(IngestionError::UnsupportedInput(unsupported));
    }

    match sheets.as_slice() {
        [withholding, composite] => Ok((*withholding, *composite)),
        _ => Err(IngestionError::MissingSheet(Vec::new())),
    }
}

// ============================================================================
// CELL READERS
// ============================================================================

fn read_number(
    kind: SheetKind,
    sheet: &Sheet,
    row: &SheetRow,
    column: Column,
    collector: &mut IssueCollector,
    clean: &mut bool,
) -> Option<Decimal> {
    let raw = sheet.cell(row, column);
    match parse_decimal(raw) {
        Ok(value) => value,
        Err(e) => {
            *clean = false;
            collector.push(
                ValidationIssue::error(
                    kind.name(),
                    IssueCode::InvalidNumber,
                    format!("{}: {} ('{}')", column.field(), e.describe(), raw.trim()),
                )
                .at_row(row.row_number)
                .on_field(column.field(), raw),
            );
            None
        }
    }
}

fn read_flag(
    kind: SheetKind,
    sheet: &Sheet,
    row: &SheetRow,
    collector: &mut IssueCollector,
    clean: &mut bool,
) -> Option<bool> {
    let raw = sheet.cell(row, Column::MandatoryFiling);
    match parse_flag(raw) {
        Ok(value) => value,
        Err(message) => {
            *clean = false;
            collector.push(
                ValidationIssue::error(kind.name(), IssueCode::InvalidBoolean, message)
                    .at_row(row.row_number)
                    .on_field(Column::MandatoryFiling.field(), raw),
            );
            None
        }
    }
}

/// Record a key; returns false (and reports) when the sheet already had it
fn register_key(
    kind: SheetKind,
    key: &RuleKey,
    row: &SheetRow,
    seen: &mut HashMap<RuleKey, usize>,
    collector: &mut IssueCollector,
) -> bool {
    if let Some(first_row) = seen.get(key) {
        collector.push(
            ValidationIssue::error(
                kind.name(),
                IssueCode::DuplicateRule,
                format!("duplicate rule for {} (first defined on row {})", key, first_row),
            )
            .at_row(row.row_number)
            .on_field("key", &key.to_string()),
        );
        return false;
    }
    seen.insert(key.clone(), row.row_number);
    true
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::EntityTypeCode;
    use rust_decimal_macros::dec;

    const WH_HEADERS: [&str; 5] = ["State", "Entity Type", "Rate", "Income Threshold", "Tax Threshold"];
    const COMP_HEADERS: [&str; 5] = ["State", "Entity Type", "Rate", "Income Threshold", "Mandatory Filing"];

    fn workbook(wh_rows: &[[&str; 5]], comp_rows: &[[&str; 5]]) -> Workbook {
        let mut wh = Sheet::new("Withholding", &WH_HEADERS);
        for row in wh_rows {
            wh.push_row(row);
        }
        let mut comp = Sheet::new("Composite", &COMP_HEADERS);
        for row in comp_rows {
            comp.push_row(row);
        }
        Workbook::new(vec![wh, comp])
    }

    fn ingestor() -> RuleIngestor {
        RuleIngestor::new(&EngineConfig::default())
    }

    #[test]
    fn test_valid_rows_produce_no_errors() {
        let wb = workbook(
            &[
                ["CA", "Partnership", "0.07", "", ""],
                ["New York", "Corporation", "6.85%", "1,000", "50"],
            ],
            &[["California", "partnership", "0.09", "1000", "Yes"]],
        );

        let report = ingestor().ingest(&wb).unwrap();

        assert_eq!(report.error_count(), 0);
        assert_eq!(report.rules.withholding.len(), 2);
        assert_eq!(report.rules.composite.len(), 1);

        let ny = &report.rules.withholding[1];
        assert_eq!(ny.key.state.as_str(), "NY");
        assert_eq!(ny.rate, Some(dec!(0.0685)));
        assert_eq!(ny.income_threshold, Some(dec!(1000)));
        assert_eq!(ny.tax_threshold, Some(dec!(50)));
        assert_eq!(ny.source_row, 3);

        let ca = &report.rules.composite[0];
        assert_eq!(ca.key.entity_type, EntityTypeCode::Partnership);
        assert_eq!(ca.mandatory_filing, Some(true));
    }

    #[test]
    fn test_blank_cells_are_absent() {
        let wb = workbook(
            &[["CA", "Trust", "", "", ""]],
            &[["CA", "Trust", "0.05", "", ""]],
        );

        let report = ingestor().ingest(&wb).unwrap();
        assert_eq!(report.error_count(), 0);
        assert_eq!(report.rules.withholding[0].rate, None);
        assert_eq!(report.rules.composite[0].mandatory_filing, None);
    }

    #[test]
    fn test_missing_sheet_is_structural() {
        let wb = Workbook::new(vec![Sheet::new("Withholding", &WH_HEADERS)]);

        let err = ingestor().ingest(&wb).unwrap_err();
        assert!(matches!(err, IngestionError::MissingSheet(_)));
        assert_eq!(err.issues().len(), 1);
        assert_eq!(err.issues()[0].sheet, "composite");
        assert_eq!(err.issues()[0].code, IssueCode::MissingSheet);
    }

    #[test]
    fn test_missing_required_column_is_unsupported_input() {
        let wb = Workbook::new(vec![
            Sheet::new("Withholding", &["State", "Rate"]),
            Sheet::new("Composite", &COMP_HEADERS),
        ]);

        let err = ingestor().ingest(&wb).unwrap_err();
        assert!(matches!(err, IngestionError::UnsupportedInput(_)));
        assert_eq!(err.issues()[0].code, IssueCode::UnsupportedInput);
    }

    #[test]
    fn test_all_row_problems_collected_in_one_pass() {
        let wb = workbook(
            &[
                ["XX", "Partnership", "0.07", "", ""],
                ["CA", "Sole Prop", "0.07", "", ""],
                ["CA", "Partnership", "(0.07)", "", ""],
                ["NY", "Partnership", "abc", "-5", ""],
            ],
            &[["CA", "Partnership", "0.09", "", "perhaps"]],
        );

        let report = ingestor().ingest(&wb).unwrap();
        let codes: Vec<IssueCode> = report.issues.iter().map(|i| i.code).collect();

        assert_eq!(
            codes,
            vec![
                IssueCode::UnknownReference,
                IssueCode::UnknownReference,
                IssueCode::InvalidNumber,
                IssueCode::InvalidNumber,
                IssueCode::InvalidNumber,
                IssueCode::InvalidBoolean,
            ]
        );
        assert!(report.rules.withholding.is_empty());
        assert!(report.rules.composite.is_empty());
        assert_eq!(report.issues[0].row, Some(2));
        assert_eq!(report.issues[0].value.as_deref(), Some("XX"));
    }

    #[test]
    fn test_duplicate_key_within_sheet() {
        let wb = workbook(
            &[
                ["CA", "Partnership", "0.07", "", ""],
                ["California", "LP", "0.08", "", ""],
            ],
            &[["CA", "Partnership", "0.09", "", "yes"]],
        );

        let report = ingestor().ingest(&wb).unwrap();

        assert_eq!(report.error_count(), 1);
        let dup = &report.issues[0];
        assert_eq!(dup.code, IssueCode::DuplicateRule);
        assert_eq!(dup.row, Some(3));
        assert!(dup.message.contains("row 2"));
        assert_eq!(report.rules.withholding.len(), 1);
        assert_eq!(report.rules.withholding[0].rate, Some(dec!(0.07)));
    }

    #[test]
    fn test_same_key_across_sheets_is_not_duplicate() {
        let wb = workbook(
            &[["CA", "Partnership", "0.07", "", ""]],
            &[["CA", "Partnership", "0.09", "", "yes"]],
        );
        assert_eq!(ingestor().ingest(&wb).unwrap().error_count(), 0);
    }

    #[test]
    fn test_coverage_gap_is_warning_by_default() {
        let mut config = EngineConfig::default();
        config.coverage.enabled = true;
        config.coverage.entity_types = vec![EntityTypeCode::Partnership];

        let wb = workbook(
            &[["CA", "Partnership", "0.07", "", ""]],
            &[["CA", "Partnership", "0.09", "", "yes"]],
        );
        let report = RuleIngestor::new(&config).ingest(&wb).unwrap();

        // 50 uncovered states per sheet
        assert_eq!(report.warning_count(), 100);
        assert_eq!(report.error_count(), 0);
        assert!(report
            .issues
            .iter()
            .all(|i| i.code == IssueCode::CoverageGap && i.severity == Severity::Warning));
    }

    #[test]
    fn test_coverage_gap_severity_configurable() {
        let mut config = EngineConfig::default();
        config.coverage.enabled = true;
        config.coverage.severity = Severity::Error;
        config.coverage.entity_types = vec![EntityTypeCode::Ira];

        let wb = workbook(&[], &[]);
        let report = RuleIngestor::new(&config).ingest(&wb).unwrap();

        assert_eq!(report.error_count(), 102);
        assert!(report.has_blocking_issues());
    }

    #[test]
    fn test_report_carries_workbook_digest() {
        let wb = workbook(&[["CA", "Partnership", "0.07", "", ""]], &[]);
        let report = ingestor().ingest(&wb).unwrap();
        assert_eq!(report.source_digest, wb.digest());
    }
}
