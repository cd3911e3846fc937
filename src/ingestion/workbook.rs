// 📒 Workbook - Raw tabular input handed to the ingestion pipeline
//
// A workbook is a set of named sheets; each row keeps its sheet row number so
// issues point back at the exact cell a reviewer has to fix.

use crate::error::IngestionError;
use crate::ingestion::issue::{IssueCode, ValidationIssue};
use crate::ingestion::normalize::fold_label;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

// ============================================================================
// SHEET KINDS + COLUMNS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SheetKind {
    Withholding,
    Composite,
}

impl SheetKind {
    pub const REQUIRED: [SheetKind; 2] = [SheetKind::Withholding, SheetKind::Composite];

    /// Logical name used in issues
    pub fn name(&self) -> &'static str {
        match self {
            SheetKind::Withholding => "withholding",
            SheetKind::Composite => "composite",
        }
    }

    fn synonyms(&self) -> &'static [&'static str] {
        match self {
            SheetKind::Withholding => &[
                "withholding",
                "withholding rules",
                "withholding tax",
                "nonresident withholding",
                "wh",
            ],
            SheetKind::Composite => &["composite", "composite rules", "composite tax", "composite filing"],
        }
    }

    /// Match a sheet title after normalization
    pub fn from_title(title: &str) -> Option<SheetKind> {
        let folded = fold_label(title);
        SheetKind::REQUIRED
            .into_iter()
            .find(|kind| kind.synonyms().iter().any(|s| fold_label(s) == folded))
    }

    /// Columns that must be present for row validation to mean anything
    pub fn required_columns(&self) -> &'static [Column] {
        &[Column::State, Column::EntityType]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    State,
    EntityType,
    Rate,
    IncomeThreshold,
    TaxThreshold,
    MandatoryFiling,
}

impl Column {
    const ALL: [Column; 6] = [
        Column::State,
        Column::EntityType,
        Column::Rate,
        Column::IncomeThreshold,
        Column::TaxThreshold,
        Column::MandatoryFiling,
    ];

    /// Field name used in issues
    pub fn field(&self) -> &'static str {
        match self {
            Column::State => "state",
            Column::EntityType => "entity_type",
            Column::Rate => "rate",
            Column::IncomeThreshold => "income_threshold",
            Column::TaxThreshold => "tax_threshold",
            Column::MandatoryFiling => "mandatory_filing",
        }
    }

    fn synonyms(&self) -> &'static [&'static str] {
        match self {
            Column::State => &["state", "state code", "jurisdiction", "state name"],
            Column::EntityType => &["entity type", "entity", "investor type", "entity type code", "entity classification"],
            Column::Rate => &["rate", "tax rate", "withholding rate", "composite rate"],
            Column::IncomeThreshold => &[
                "income threshold",
                "income threshold ($)",
                "minimum income",
                "income minimum",
            ],
            Column::TaxThreshold => &[
                "tax threshold",
                "tax threshold ($)",
                "minimum tax",
                "tax amount threshold",
            ],
            Column::MandatoryFiling => &[
                "mandatory filing",
                "mandatory",
                "composite mandatory",
                "mandatory composite",
                "filing required",
            ],
        }
    }

    /// Match a header after normalization
    pub fn from_header(header: &str) -> Option<Column> {
        let folded = fold_label(header);
        Column::ALL
            .into_iter()
            .find(|col| col.synonyms().iter().any(|s| fold_label(s) == folded))
    }
}

// ============================================================================
// SHEETS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    /// 1-based row number in the source sheet (header = 1)
    pub row_number: usize,
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub title: String,
    pub headers: Vec<String>,
    pub rows: Vec<SheetRow>,
}

impl Sheet {
    pub fn new(title: &str, headers: &[&str]) -> Self {
        Sheet {
            title: title.to_string(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a data row; numbering continues after the header row
    pub fn push_row(&mut self, cells: &[&str]) {
        let row_number = self.rows.last().map(|r| r.row_number + 1).unwrap_or(2);
        self.rows.push(SheetRow {
            row_number,
            cells: cells.iter().map(|c| c.to_string()).collect(),
        });
    }

    /// Builder form of push_row
    pub fn with_row(mut self, cells: &[&str]) -> Self {
        self.push_row(cells);
        self
    }

    /// Header index for each recognized column
    pub fn column_index(&self, column: Column) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| Column::from_header(h) == Some(column))
    }

    /// Cell text for a column; missing cells read as blank
    pub fn cell<'a>(&self, row: &'a SheetRow, column: Column) -> &'a str {
        self.column_index(column)
            .and_then(|idx| row.cells.get(idx))
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    /// Parse a sheet from CSV text
    pub fn from_csv_reader<R: Read>(title: &str, reader: R) -> Result<Sheet> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::None)
            .from_reader(reader);

        let headers: Vec<String> = rdr
            .headers()
            .with_context(|| format!("Failed to read header row of sheet '{title}'"))?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let mut sheet = Sheet {
            title: title.to_string(),
            headers,
            rows: Vec::new(),
        };

        for (idx, record) in rdr.records().enumerate() {
            let record = record.with_context(|| format!("Failed to read row {} of sheet '{title}'", idx + 2))?;
            if record.iter().all(|c| c.trim().is_empty()) {
                continue;
            }
            let row_number = record
                .position()
                .map(|p| p.line() as usize)
                .unwrap_or(idx + 2);
            sheet.rows.push(SheetRow {
                row_number,
                cells: record.iter().map(|c| c.to_string()).collect(),
            });
        }

        Ok(sheet)
    }
}

// ============================================================================
// WORKBOOK
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn new(sheets: Vec<Sheet>) -> Self {
        Workbook { sheets }
    }

    /// Load the two rule sheets from CSV exports
    pub fn from_csv_files(withholding: &Path, composite: &Path) -> Result<Workbook> {
        let mut sheets = Vec::new();
        for (kind, path) in [(SheetKind::Withholding, withholding), (SheetKind::Composite, composite)] {
            let is_csv = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("csv"))
                .unwrap_or(false);
            if !is_csv {
                return Err(IngestionError::UnsupportedInput(vec![ValidationIssue::error(
                    kind.name(),
                    IssueCode::UnsupportedInput,
                    format!("unsupported file type: {}", path.display()),
                )])
                .into());
            }

            let file = std::fs::File::open(path)
                .with_context(|| format!("Failed to open sheet file: {:?}", path))?;
            sheets.push(Sheet::from_csv_reader(kind.name(), file)?);
        }
        Ok(Workbook { sheets })
    }

    /// First sheet whose title matches the kind
    pub fn sheet(&self, kind: SheetKind) -> Option<&Sheet> {
        self.sheets
            .iter()
            .find(|s| SheetKind::from_title(&s.title) == Some(kind))
    }

    /// SHA-256 over normalized content, for caller-side duplicate upload checks
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for kind in SheetKind::REQUIRED {
            let Some(sheet) = self.sheet(kind) else { continue };
            hasher.update(kind.name().as_bytes());
            hasher.update([0x1e]);
            for header in &sheet.headers {
                hasher.update(fold_label(header).as_bytes());
                hasher.update([0x1f]);
            }
            for row in &sheet.rows {
                hasher.update([0x1e]);
                for cell in &row.cells {
                    hasher.update(cell.trim().as_bytes());
                    hasher.update([0x1f]);
                }
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sheet_kind_from_title() {
        assert_eq!(SheetKind::from_title("Withholding Rules"), Some(SheetKind::Withholding));
        assert_eq!(SheetKind::from_title(" COMPOSITE "), Some(SheetKind::Composite));
        assert_eq!(SheetKind::from_title("Composite\nTax"), Some(SheetKind::Composite));
        assert_eq!(SheetKind::from_title("Notes"), None);
    }

    #[test]
    fn test_column_from_header_handles_newlines() {
        assert_eq!(Column::from_header("Income\nThreshold ($)"), Some(Column::IncomeThreshold));
        assert_eq!(Column::from_header("Entity  Type"), Some(Column::EntityType));
        assert_eq!(Column::from_header("Mandatory Filing"), Some(Column::MandatoryFiling));
        assert_eq!(Column::from_header("Comments"), None);
    }

    #[test]
    fn test_push_row_numbers_after_header() {
        let sheet = Sheet::new("withholding", &["State", "Entity Type", "Rate"])
            .with_row(&["CA", "Partnership", "0.07"])
            .with_row(&["NY", "Partnership", "0.0685"]);

        assert_eq!(sheet.rows[0].row_number, 2);
        assert_eq!(sheet.rows[1].row_number, 3);
        assert_eq!(sheet.cell(&sheet.rows[1], Column::Rate), "0.0685");
        assert_eq!(sheet.cell(&sheet.rows[1], Column::TaxThreshold), "");
    }

    #[test]
    fn test_from_csv_reader_skips_blank_rows_and_keeps_numbers() {
        let data = "State,Entity Type,Rate\nCA,Partnership,0.07\n,,\nNY,Corporation,\"1,000\"\n";
        let sheet = Sheet::from_csv_reader("withholding", data.as_bytes()).unwrap();

        assert_eq!(sheet.rows.len(), 2);
        assert_eq!(sheet.rows[0].row_number, 2);
        assert_eq!(sheet.rows[1].row_number, 4);
        assert_eq!(sheet.cell(&sheet.rows[1], Column::Rate), "1,000");
    }

    #[test]
    fn test_from_csv_files_rejects_non_csv() {
        let dir = tempfile::tempdir().unwrap();
        let wh = dir.path().join("withholding.xlsx");
        let comp = dir.path().join("composite.csv");
        std::fs::write(&wh, "x").unwrap();
        std::fs::write(&comp, "State,Entity Type\n").unwrap();

        let err = Workbook::from_csv_files(&wh, &comp).unwrap_err();
        let ingestion = err.downcast_ref::<IngestionError>().unwrap();
        assert_eq!(ingestion.issues()[0].code, IssueCode::UnsupportedInput);
    }

    #[test]
    fn test_from_csv_files_loads_both_sheets() {
        let dir = tempfile::tempdir().unwrap();
        let wh = dir.path().join("wh.csv");
        let comp = dir.path().join("comp.csv");
        let mut f = std::fs::File::create(&wh).unwrap();
        writeln!(f, "State,Entity Type,Rate,Income Threshold,Tax Threshold").unwrap();
        writeln!(f, "CA,Partnership,0.07,,").unwrap();
        let mut f = std::fs::File::create(&comp).unwrap();
        writeln!(f, "State,Entity Type,Rate,Income Threshold,Mandatory Filing").unwrap();
        writeln!(f, "CA,Partnership,0.09,1000,Yes").unwrap();

        let workbook = Workbook::from_csv_files(&wh, &comp).unwrap();
        assert!(workbook.sheet(SheetKind::Withholding).is_some());
        assert_eq!(workbook.sheet(SheetKind::Composite).unwrap().rows.len(), 1);
    }

    #[test]
    fn test_digest_ignores_cell_padding_but_not_values() {
        let a = Workbook::new(vec![Sheet::new("withholding", &["State", "Entity Type", "Rate"])
            .with_row(&["CA", "Partnership", "0.07"])]);
        let b = Workbook::new(vec![Sheet::new("Withholding", &["state", "entity type", "rate"])
            .with_row(&[" CA ", "Partnership", "0.07 "])]);
        let c = Workbook::new(vec![Sheet::new("withholding", &["State", "Entity Type", "Rate"])
            .with_row(&["CA", "Partnership", "0.08"])]);

        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.digest().len(), 64);
    }
}
