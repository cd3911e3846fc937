// 🔄 Rule Set Lifecycle - Draft / activate / archive with an atomic gate
//
// Every state change runs inside one SQLite transaction together with its
// event-log entry. Activation also materializes the resolved snapshot in that
// same transaction, so a reader never sees an active set without its rows.

use crate::db::{self, Event};
use crate::diff::{diff_resolved, RuleSetDiff};
use crate::error::{EngineError, EngineResult};
use crate::ingestion::{IngestionReport, RuleIngestor, ValidationIssue, Workbook};
use crate::resolution::{resolve, ResolvedRule, ResolvedRuleSet};
use crate::rules::{CompositeRule, ParsedRules, Period, RuleSet, RuleSetStatus, WithholdingRule};
use crate::temporal::{close_before, period_end, period_start};
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde_json::json;
use std::path::Path;

const ENTITY: &str = "rule_set";

pub struct RuleSetManager {
    conn: Connection,
    actor: String,
}

impl RuleSetManager {
    /// Wrap an open connection, creating the schema if needed
    pub fn new(conn: Connection) -> EngineResult<Self> {
        db::setup_database(&conn)?;
        Ok(RuleSetManager {
            conn,
            actor: "system".to_string(),
        })
    }

    pub fn open(path: &Path) -> EngineResult<Self> {
        Ok(RuleSetManager {
            conn: db::open_database(path)?,
            actor: "system".to_string(),
        })
    }

    pub fn in_memory() -> EngineResult<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Name recorded on lifecycle events
    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ========================================================================
    // DRAFTS
    // ========================================================================

    /// Persist a new draft with its child rules and every ingestion issue
    pub fn create_draft(
        &mut self,
        year: i32,
        period: Period,
        rules: &ParsedRules,
        issues: &[ValidationIssue],
        source_digest: Option<&str>,
    ) -> EngineResult<String> {
        let effective_from =
            period_start(year, period).ok_or(EngineError::InvalidPeriod { year, period })?;

        let rule_set = RuleSet {
            id: uuid::Uuid::new_v4().to_string(),
            year,
            period,
            status: RuleSetStatus::Draft,
            effective_from,
            effective_to: None,
            source_digest: source_digest.map(|d| d.to_string()),
            created_at: Utc::now(),
            published_at: None,
            archived_at: None,
        };

        let withholding: Vec<WithholdingRule> = rules
            .withholding
            .iter()
            .cloned()
            .map(|c| c.into_rule(&rule_set.id))
            .collect();
        let composite: Vec<CompositeRule> = rules
            .composite
            .iter()
            .cloned()
            .map(|c| c.into_rule(&rule_set.id))
            .collect();
        let error_count = issues.iter().filter(|i| i.is_blocking()).count();

        let tx = begin_write(&mut self.conn)?;
        db::insert_rule_set(&tx, &rule_set)?;
        db::insert_withholding_rules(&tx, &withholding)?;
        db::insert_composite_rules(&tx, &composite)?;
        db::insert_issues(&tx, &rule_set.id, issues)?;
        db::insert_event(
            &tx,
            &Event::new(
                "rule_set_drafted",
                ENTITY,
                &rule_set.id,
                json!({
                    "year": year,
                    "period": period.as_str(),
                    "withholding_rules": withholding.len(),
                    "composite_rules": composite.len(),
                    "errors": error_count,
                    "warnings": issues.len() - error_count,
                    "source_digest": source_digest,
                }),
                &self.actor,
            ),
        )?;
        tx.commit()?;

        tracing::info!(
            rule_set_id = %rule_set.id,
            year,
            period = %period,
            withholding = withholding.len(),
            composite = composite.len(),
            errors = error_count,
            "draft rule set created"
        );

        Ok(rule_set.id)
    }

    /// Validate a workbook and store the result as a draft in one call.
    /// Structural failures create nothing.
    pub fn ingest(
        &mut self,
        year: i32,
        period: Period,
        workbook: &Workbook,
        ingestor: &RuleIngestor,
    ) -> EngineResult<(String, IngestionReport)> {
        let report = ingestor.ingest(workbook)?;
        let id = self.create_draft(
            year,
            period,
            &report.rules,
            &report.issues,
            Some(&report.source_digest),
        )?;
        Ok((id, report))
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    /// True iff the rule set carries zero error-severity issues
    pub fn can_activate(&self, id: &str) -> EngineResult<bool> {
        self.get_rule_set(id)?;
        Ok(db::count_blocking_issues(&self.conn, id)? == 0)
    }

    /// Publish a draft. The prior active set for the period is archived with
    /// effective_to one day before the new effective_from. All or nothing.
    pub fn activate(&mut self, id: &str, effective_date: Option<NaiveDate>) -> EngineResult<RuleSet> {
        let tx = begin_write(&mut self.conn)?;

        let target = db::get_rule_set(&tx, id)?.ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if !target.status.can_transition_to(RuleSetStatus::Active) {
            return Err(EngineError::InvalidTransition {
                rule_set_id: id.to_string(),
                from: target.status,
                to: RuleSetStatus::Active,
            });
        }

        let error_count = db::count_blocking_issues(&tx, id)?;
        if error_count > 0 {
            tracing::warn!(rule_set_id = %id, error_count, "activation blocked");
            return Err(EngineError::ValidationBlocked {
                rule_set_id: id.to_string(),
                error_count,
            });
        }

        let effective_from = effective_date.unwrap_or(target.effective_from);
        let now = Utc::now();

        let prior = db::find_active(&tx, target.year, target.period)?;
        if let Some(prior) = &prior {
            let effective_to = close_before(effective_from);
            db::mark_archived(&tx, &prior.id, Some(effective_to), now)?;
            db::insert_event(
                &tx,
                &Event::new(
                    "rule_set_archived",
                    ENTITY,
                    &prior.id,
                    json!({
                        "effective_to": effective_to,
                        "superseded_by": id,
                    }),
                    &self.actor,
                ),
            )?;
        }

        db::mark_active(&tx, id, effective_from, now)
            .map_err(|e| activation_conflict(e, target.year, target.period))?;

        let withholding = db::get_withholding_rules(&tx, id)?;
        let composite = db::get_composite_rules(&tx, id)?;
        let resolved = resolve(id, &withholding, &composite);
        db::insert_resolved_rules(&tx, &resolved)?;

        db::insert_event(
            &tx,
            &Event::new(
                "rule_set_activated",
                ENTITY,
                id,
                json!({
                    "effective_from": effective_from,
                    "resolved_rules": resolved.len(),
                    "superseded": prior.as_ref().map(|p| p.id.as_str()),
                }),
                &self.actor,
            ),
        )?;
        tx.commit()?;

        tracing::info!(
            rule_set_id = %id,
            year = target.year,
            period = %target.period,
            resolved = resolved.len(),
            superseded = ?prior.as_ref().map(|p| p.id.as_str()),
            "rule set activated"
        );

        self.get_rule_set(id)
    }

    /// Retire a rule set. An active set closes at `effective_to` (default:
    /// its period end); a draft is abandoned without ever being published.
    pub fn archive(&mut self, id: &str, effective_to: Option<NaiveDate>) -> EngineResult<RuleSet> {
        let tx = begin_write(&mut self.conn)?;

        let target = db::get_rule_set(&tx, id)?.ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if !target.status.can_transition_to(RuleSetStatus::Archived) {
            return Err(EngineError::InvalidTransition {
                rule_set_id: id.to_string(),
                from: target.status,
                to: RuleSetStatus::Archived,
            });
        }

        let effective_to = match target.status {
            RuleSetStatus::Active => Some(
                effective_to
                    .or_else(|| period_end(target.year, target.period))
                    .ok_or(EngineError::InvalidPeriod {
                        year: target.year,
                        period: target.period,
                    })?,
            ),
            _ => effective_to,
        };

        db::mark_archived(&tx, id, effective_to, Utc::now())?;
        db::insert_event(
            &tx,
            &Event::new(
                "rule_set_archived",
                ENTITY,
                id,
                json!({
                    "from_status": target.status.as_str(),
                    "effective_to": effective_to,
                }),
                &self.actor,
            ),
        )?;
        tx.commit()?;

        tracing::info!(rule_set_id = %id, from = %target.status, "rule set archived");

        self.get_rule_set(id)
    }

    // ========================================================================
    // REVIEW
    // ========================================================================

    /// Compare a rule set against `against`, or against the active set for
    /// its period when none is given
    pub fn diff(&self, id: &str, against: Option<&str>) -> EngineResult<RuleSetDiff> {
        let target = self.get_rule_set(id)?;
        let base = match against {
            Some(base_id) => Some(self.get_rule_set(base_id)?),
            None => self.active_rule_set(target.year, target.period)?,
        };

        let target_rules = self.resolve_children(&target.id)?;
        let base_rules = match &base {
            Some(b) => self.resolve_children(&b.id)?,
            None => Vec::new(),
        };

        let diff = diff_resolved(
            base.as_ref().map(|b| b.id.as_str()),
            &base_rules,
            &target.id,
            &target_rules,
        );
        tracing::debug!(rule_set_id = %id, summary = %diff.summary(), "diff computed");
        Ok(diff)
    }

    fn resolve_children(&self, id: &str) -> EngineResult<Vec<ResolvedRule>> {
        let withholding = db::get_withholding_rules(&self.conn, id)?;
        let composite = db::get_composite_rules(&self.conn, id)?;
        Ok(resolve(id, &withholding, &composite))
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get_rule_set(&self, id: &str) -> EngineResult<RuleSet> {
        db::get_rule_set(&self.conn, id)?.ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub fn list_rule_sets(&self, year: Option<i32>) -> EngineResult<Vec<RuleSet>> {
        db::list_rule_sets(&self.conn, year)
    }

    pub fn active_rule_set(&self, year: i32, period: Period) -> EngineResult<Option<RuleSet>> {
        db::find_active(&self.conn, year, period)
    }

    pub fn rule_set_effective_on(&self, date: NaiveDate) -> EngineResult<Option<RuleSet>> {
        db::find_effective_on(&self.conn, date)
    }

    pub fn find_by_source_digest(
        &self,
        year: i32,
        period: Period,
        digest: &str,
    ) -> EngineResult<Vec<RuleSet>> {
        db::find_by_source_digest(&self.conn, year, period, digest)
    }

    pub fn issues(&self, id: &str) -> EngineResult<Vec<ValidationIssue>> {
        db::get_issues(&self.conn, id)
    }

    pub fn withholding_rules(&self, id: &str) -> EngineResult<Vec<WithholdingRule>> {
        db::get_withholding_rules(&self.conn, id)
    }

    pub fn composite_rules(&self, id: &str) -> EngineResult<Vec<CompositeRule>> {
        db::get_composite_rules(&self.conn, id)
    }

    /// Stored snapshot; empty until the rule set has been activated
    pub fn resolved_rules(&self, id: &str) -> EngineResult<ResolvedRuleSet> {
        let rules = db::get_resolved_rules(&self.conn, id)?;
        Ok(ResolvedRuleSet::new(id, rules))
    }

    /// Snapshot to calculate against. Drafts (and abandoned drafts) have no
    /// published snapshot and are rejected.
    pub fn published_snapshot(&self, id: &str) -> EngineResult<ResolvedRuleSet> {
        let rule_set = self.get_rule_set(id)?;
        if rule_set.published_at.is_none() {
            return Err(EngineError::NotPublished(id.to_string()));
        }
        self.resolved_rules(id)
    }

    pub fn events_for(&self, id: &str) -> EngineResult<Vec<Event>> {
        db::get_events_for_entity(&self.conn, ENTITY, id)
    }
}

/// Write transaction holding the database write lock from BEGIN
fn begin_write(conn: &mut Connection) -> rusqlite::Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

/// A unique-index violation while flipping to active means another set won
fn activation_conflict(err: EngineError, year: i32, period: Period) -> EngineError {
    match err {
        EngineError::Storage(rusqlite::Error::SqliteFailure(e, _))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            EngineError::ConflictingActivation { year, period }
        }
        other => other,
    }
}

// ============================================================================
// TESTS
// ============================================================================
