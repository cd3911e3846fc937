// 🗄️ Storage - SQLite schema, constraints and row mapping
//
// Lifecycle invariants live here as constraints, not only in application
// code: one active RuleSet per (year, period) is a partial unique index, rule
// and resolved rows are immutable via triggers, and child rules can only be
// added while their RuleSet is a draft.

use crate::error::{EngineError, EngineResult};
use crate::ingestion::issue::ValidationIssue;
use crate::resolution::ResolvedRule;
use crate::rules::{CompositeRule, Period, RuleKey, RuleSet, RuleSetStatus, WithholdingRule};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

// ============================================================================
// SCHEMA
// ============================================================================

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rule_sets (
    id TEXT PRIMARY KEY,
    year INTEGER NOT NULL,
    period TEXT NOT NULL CHECK (period IN ('Q1', 'Q2', 'Q3', 'Q4')),
    status TEXT NOT NULL CHECK (status IN ('draft', 'active', 'archived')),
    effective_from TEXT NOT NULL,
    effective_to TEXT,
    source_digest TEXT,
    created_at TEXT NOT NULL,
    published_at TEXT,
    archived_at TEXT
);

-- At most one active rule set per period
CREATE UNIQUE INDEX IF NOT EXISTS idx_one_active_per_period
    ON rule_sets(year, period) WHERE status = 'active';

CREATE INDEX IF NOT EXISTS idx_rule_sets_digest ON rule_sets(year, period, source_digest);

CREATE TABLE IF NOT EXISTS withholding_rules (
    id TEXT PRIMARY KEY,
    rule_set_id TEXT NOT NULL REFERENCES rule_sets(id),
    state TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    rate TEXT,
    income_threshold TEXT,
    tax_threshold TEXT,
    source_row INTEGER NOT NULL,
    UNIQUE (rule_set_id, state, entity_type)
);

CREATE TABLE IF NOT EXISTS composite_rules (
    id TEXT PRIMARY KEY,
    rule_set_id TEXT NOT NULL REFERENCES rule_sets(id),
    state TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    rate TEXT,
    income_threshold TEXT,
    mandatory_filing INTEGER,
    source_row INTEGER NOT NULL,
    UNIQUE (rule_set_id, state, entity_type)
);

CREATE TABLE IF NOT EXISTS resolved_rules (
    id TEXT PRIMARY KEY,
    rule_set_id TEXT NOT NULL REFERENCES rule_sets(id),
    state TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    withholding_rule_id TEXT REFERENCES withholding_rules(id),
    withholding_rate TEXT,
    withholding_income_threshold TEXT,
    withholding_tax_threshold TEXT,
    composite_rule_id TEXT REFERENCES composite_rules(id),
    composite_rate TEXT,
    composite_income_threshold TEXT,
    composite_mandatory INTEGER,
    UNIQUE (rule_set_id, state, entity_type)
);

CREATE TABLE IF NOT EXISTS validation_issues (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_set_id TEXT NOT NULL REFERENCES rule_sets(id),
    sheet TEXT NOT NULL,
    row_number INTEGER,
    field TEXT,
    value TEXT,
    code TEXT NOT NULL,
    message TEXT NOT NULL,
    severity TEXT NOT NULL CHECK (severity IN ('error', 'warning'))
);

CREATE INDEX IF NOT EXISTS idx_issues_rule_set ON validation_issues(rule_set_id, severity);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT UNIQUE NOT NULL,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    data TEXT NOT NULL,
    actor TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);

-- Child rules only enter a draft rule set
CREATE TRIGGER IF NOT EXISTS withholding_rules_draft_only
BEFORE INSERT ON withholding_rules
WHEN (SELECT status FROM rule_sets WHERE id = NEW.rule_set_id) IS NOT 'draft'
BEGIN SELECT RAISE(ABORT, 'rules can only be added to a draft rule set'); END;

CREATE TRIGGER IF NOT EXISTS composite_rules_draft_only
BEFORE INSERT ON composite_rules
WHEN (SELECT status FROM rule_sets WHERE id = NEW.rule_set_id) IS NOT 'draft'
BEGIN SELECT RAISE(ABORT, 'rules can only be added to a draft rule set'); END;

-- Rules, resolved rows and issues never change once written
CREATE TRIGGER IF NOT EXISTS withholding_rules_no_update
BEFORE UPDATE ON withholding_rules
BEGIN SELECT RAISE(ABORT, 'withholding rules are immutable'); END;

CREATE TRIGGER IF NOT EXISTS withholding_rules_no_delete
BEFORE DELETE ON withholding_rules
BEGIN SELECT RAISE(ABORT, 'withholding rules are immutable'); END;

CREATE TRIGGER IF NOT EXISTS composite_rules_no_update
BEFORE UPDATE ON composite_rules
BEGIN SELECT RAISE(ABORT, 'composite rules are immutable'); END;

CREATE TRIGGER IF NOT EXISTS composite_rules_no_delete
BEFORE DELETE ON composite_rules
BEGIN SELECT RAISE(ABORT, 'composite rules are immutable'); END;

CREATE TRIGGER IF NOT EXISTS resolved_rules_no_update
BEFORE UPDATE ON resolved_rules
BEGIN SELECT RAISE(ABORT, 'resolved rules are immutable'); END;

CREATE TRIGGER IF NOT EXISTS resolved_rules_no_delete
BEFORE DELETE ON resolved_rules
BEGIN SELECT RAISE(ABORT, 'resolved rules are immutable'); END;

CREATE TRIGGER IF NOT EXISTS validation_issues_no_update
BEFORE UPDATE ON validation_issues
BEGIN SELECT RAISE(ABORT, 'validation issues are immutable'); END;
";

pub fn setup_database(conn: &Connection) -> EngineResult<()> {
    // WAL for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Open (or create) a database file and ensure the schema exists
pub fn open_database(path: &Path) -> EngineResult<Connection> {
    let conn = Connection::open(path)?;
    setup_database(&conn)?;
    Ok(conn)
}

// ============================================================================
// VALUE MAPPING
// ============================================================================

fn decimal_text(value: Option<Decimal>) -> Option<String> {
    value.map(|d| d.to_string())
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn get_decimal(row: &Row, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| Decimal::from_str(&t).map_err(|e| conversion_error(idx, e.to_string())))
        .transpose()
}

fn get_parsed<T: FromStr<Err = String>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn get_key(row: &Row, state_idx: usize, entity_idx: usize) -> rusqlite::Result<RuleKey> {
    Ok(RuleKey::new(get_parsed(row, state_idx)?, get_parsed(row, entity_idx)?))
}

fn get_row_number(row: &Row, idx: usize) -> rusqlite::Result<Option<usize>> {
    let value: Option<i64> = row.get(idx)?;
    Ok(value.map(|v| v as usize))
}

// ============================================================================
// RULE SETS
// ============================================================================

const RULE_SET_COLUMNS: &str = "id, year, period, status, effective_from, effective_to,
     source_digest, created_at, published_at, archived_at";

fn map_rule_set(row: &Row) -> rusqlite::Result<RuleSet> {
    Ok(RuleSet {
        id: row.get(0)?,
        year: row.get(1)?,
        period: get_parsed::<Period>(row, 2)?,
        status: get_parsed::<RuleSetStatus>(row, 3)?,
        effective_from: row.get(4)?,
        effective_to: row.get(5)?,
        source_digest: row.get(6)?,
        created_at: row.get(7)?,
        published_at: row.get(8)?,
        archived_at: row.get(9)?,
    })
}

pub fn insert_rule_set(conn: &Connection, rule_set: &RuleSet) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO rule_sets (
            id, year, period, status, effective_from, effective_to,
            source_digest, created_at, published_at, archived_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            rule_set.id,
            rule_set.year,
            rule_set.period.as_str(),
            rule_set.status.as_str(),
            rule_set.effective_from,
            rule_set.effective_to,
            rule_set.source_digest,
            rule_set.created_at,
            rule_set.published_at,
            rule_set.archived_at,
        ],
    )?;
    Ok(())
}

pub fn get_rule_set(conn: &Connection, id: &str) -> EngineResult<Option<RuleSet>> {
    let sql = format!("SELECT {RULE_SET_COLUMNS} FROM rule_sets WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], map_rule_set).optional()?)
}

pub fn list_rule_sets(conn: &Connection, year: Option<i32>) -> EngineResult<Vec<RuleSet>> {
    let sql = format!(
        "SELECT {RULE_SET_COLUMNS} FROM rule_sets
         WHERE (?1 IS NULL OR year = ?1)
         ORDER BY year DESC, period DESC, created_at DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rule_sets = stmt
        .query_map(params![year], map_rule_set)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rule_sets)
}

pub fn find_active(conn: &Connection, year: i32, period: Period) -> EngineResult<Option<RuleSet>> {
    let sql = format!(
        "SELECT {RULE_SET_COLUMNS} FROM rule_sets
         WHERE year = ?1 AND period = ?2 AND status = 'active'"
    );
    Ok(conn
        .query_row(&sql, params![year, period.as_str()], map_rule_set)
        .optional()?)
}

pub fn find_by_source_digest(
    conn: &Connection,
    year: i32,
    period: Period,
    digest: &str,
) -> EngineResult<Vec<RuleSet>> {
    let sql = format!(
        "SELECT {RULE_SET_COLUMNS} FROM rule_sets
         WHERE year = ?1 AND period = ?2 AND source_digest = ?3
         ORDER BY created_at"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rule_sets = stmt
        .query_map(params![year, period.as_str(), digest], map_rule_set)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rule_sets)
}

/// Published rule set whose effective window contains the day
pub fn find_effective_on(conn: &Connection, date: NaiveDate) -> EngineResult<Option<RuleSet>> {
    let sql = format!(
        "SELECT {RULE_SET_COLUMNS} FROM rule_sets
         WHERE published_at IS NOT NULL
           AND effective_from <= ?1
           AND (effective_to IS NULL OR effective_to >= ?1)
         ORDER BY effective_from DESC, published_at DESC
         LIMIT 1"
    );
    Ok(conn.query_row(&sql, params![date], map_rule_set).optional()?)
}

pub fn mark_active(
    conn: &Connection,
    id: &str,
    effective_from: NaiveDate,
    published_at: DateTime<Utc>,
) -> EngineResult<()> {
    conn.execute(
        "UPDATE rule_sets SET status = 'active', effective_from = ?2, published_at = ?3
         WHERE id = ?1",
        params![id, effective_from, published_at],
    )?;
    Ok(())
}

pub fn mark_archived(
    conn: &Connection,
    id: &str,
    effective_to: Option<NaiveDate>,
    archived_at: DateTime<Utc>,
) -> EngineResult<()> {
    conn.execute(
        "UPDATE rule_sets SET status = 'archived', effective_to = ?2, archived_at = ?3
         WHERE id = ?1",
        params![id, effective_to, archived_at],
    )?;
    Ok(())
}

// ============================================================================
// CHILD RULES
// ============================================================================

pub fn insert_withholding_rules(conn: &Connection, rules: &[WithholdingRule]) -> EngineResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO withholding_rules (
            id, rule_set_id, state, entity_type, rate, income_threshold, tax_threshold, source_row
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for rule in rules {
        stmt.execute(params![
            rule.id,
            rule.rule_set_id,
            rule.key.state.as_str(),
            rule.key.entity_type.as_str(),
            decimal_text(rule.rate),
            decimal_text(rule.income_threshold),
            decimal_text(rule.tax_threshold),
            rule.source_row as i64,
        ])?;
    }
    Ok(())
}

pub fn insert_composite_rules(conn: &Connection, rules: &[CompositeRule]) -> EngineResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO composite_rules (
            id, rule_set_id, state, entity_type, rate, income_threshold, mandatory_filing, source_row
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for rule in rules {
        stmt.execute(params![
            rule.id,
            rule.rule_set_id,
            rule.key.state.as_str(),
            rule.key.entity_type.as_str(),
            decimal_text(rule.rate),
            decimal_text(rule.income_threshold),
            rule.mandatory_filing,
            rule.source_row as i64,
        ])?;
    }
    Ok(())
}

pub fn get_withholding_rules(conn: &Connection, rule_set_id: &str) -> EngineResult<Vec<WithholdingRule>> {
    let mut stmt = conn.prepare(
        "SELECT id, rule_set_id, state, entity_type, rate, income_threshold, tax_threshold, source_row
         FROM withholding_rules WHERE rule_set_id = ?1
         ORDER BY state, entity_type",
    )?;
    let rules = stmt
        .query_map([rule_set_id], |row| {
            Ok(WithholdingRule {
                id: row.get(0)?,
                rule_set_id: row.get(1)?,
                key: get_key(row, 2, 3)?,
                rate: get_decimal(row, 4)?,
                income_threshold: get_decimal(row, 5)?,
                tax_threshold: get_decimal(row, 6)?,
                source_row: row.get::<_, i64>(7)? as usize,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rules)
}

pub fn get_composite_rules(conn: &Connection, rule_set_id: &str) -> EngineResult<Vec<CompositeRule>> {
    let mut stmt = conn.prepare(
        "SELECT id, rule_set_id, state, entity_type, rate, income_threshold, mandatory_filing, source_row
         FROM composite_rules WHERE rule_set_id = ?1
         ORDER BY state, entity_type",
    )?;
    let rules = stmt
        .query_map([rule_set_id], |row| {
            Ok(CompositeRule {
                id: row.get(0)?,
                rule_set_id: row.get(1)?,
                key: get_key(row, 2, 3)?,
                rate: get_decimal(row, 4)?,
                income_threshold: get_decimal(row, 5)?,
                mandatory_filing: row.get(6)?,
                source_row: row.get::<_, i64>(7)? as usize,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rules)
}

// ============================================================================
// RESOLVED RULES
// ============================================================================

pub fn insert_resolved_rules(conn: &Connection, rules: &[ResolvedRule]) -> EngineResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO resolved_rules (
            id, rule_set_id, state, entity_type,
            withholding_rule_id, withholding_rate, withholding_income_threshold, withholding_tax_threshold,
            composite_rule_id, composite_rate, composite_income_threshold, composite_mandatory
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    for rule in rules {
        stmt.execute(params![
            rule.id,
            rule.rule_set_id,
            rule.key.state.as_str(),
            rule.key.entity_type.as_str(),
            rule.withholding_rule_id,
            decimal_text(rule.withholding_rate),
            decimal_text(rule.withholding_income_threshold),
            decimal_text(rule.withholding_tax_threshold),
            rule.composite_rule_id,
            decimal_text(rule.composite_rate),
            decimal_text(rule.composite_income_threshold),
            rule.composite_mandatory,
        ])?;
    }
    Ok(())
}

pub fn get_resolved_rules(conn: &Connection, rule_set_id: &str) -> EngineResult<Vec<ResolvedRule>> {
    let mut stmt = conn.prepare(
        "SELECT id, rule_set_id, state, entity_type,
                withholding_rule_id, withholding_rate, withholding_income_threshold, withholding_tax_threshold,
                composite_rule_id, composite_rate, composite_income_threshold, composite_mandatory
         FROM resolved_rules WHERE rule_set_id = ?1
         ORDER BY state, entity_type",
    )?;
    let rules = stmt
        .query_map([rule_set_id], |row| {
            Ok(ResolvedRule {
                id: row.get(0)?,
                rule_set_id: row.get(1)?,
                key: get_key(row, 2, 3)?,
                withholding_rule_id: row.get(4)?,
                withholding_rate: get_decimal(row, 5)?,
                withholding_income_threshold: get_decimal(row, 6)?,
                withholding_tax_threshold: get_decimal(row, 7)?,
                composite_rule_id: row.get(8)?,
                composite_rate: get_decimal(row, 9)?,
                composite_income_threshold: get_decimal(row, 10)?,
                composite_mandatory: row.get(11)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rules)
}

// ============================================================================
// VALIDATION ISSUES
// ============================================================================

pub fn insert_issues(conn: &Connection, rule_set_id: &str, issues: &[ValidationIssue]) -> EngineResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO validation_issues (
            rule_set_id, sheet, row_number, field, value, code, message, severity
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for issue in issues {
        stmt.execute(params![
            rule_set_id,
            issue.sheet,
            issue.row.map(|r| r as i64),
            issue.field,
            issue.value,
            issue.code.as_str(),
            issue.message,
            issue.severity.as_str(),
        ])?;
    }
    Ok(())
}

pub fn get_issues(conn: &Connection, rule_set_id: &str) -> EngineResult<Vec<ValidationIssue>> {
    let mut stmt = conn.prepare(
        "SELECT sheet, row_number, field, value, code, message, severity
         FROM validation_issues WHERE rule_set_id = ?1
         ORDER BY id",
    )?;
    let issues = stmt
        .query_map([rule_set_id], |row| {
            Ok(ValidationIssue {
                sheet: row.get(0)?,
                row: get_row_number(row, 1)?,
                field: row.get(2)?,
                value: row.get(3)?,
                code: get_parsed(row, 4)?,
                message: row.get(5)?,
                severity: get_parsed(row, 6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(issues)
}

pub fn count_blocking_issues(conn: &Connection, rule_set_id: &str) -> EngineResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM validation_issues WHERE rule_set_id = ?1 AND severity = 'error'",
        [rule_set_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

// ============================================================================
// EVENT LOG (lifecycle audit trail)
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn insert_event(conn: &Connection, event: &Event) -> EngineResult<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp,
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Events for one entity, oldest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> EngineResult<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id",
    )?;

    let rows = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, DateTime<Utc>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(event_id, timestamp, event_type, entity_type, entity_id, data, actor)| {
            let data = serde_json::from_str(&data).map_err(|_| EngineError::Corrupt {
                table: "events",
                column: "data",
                value: data.clone(),
            })?;
            Ok(Event {
                event_id,
                timestamp,
                event_type,
                entity_type,
                entity_id,
                data,
                actor,
            })
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
