// 🔍 Rule Set Diff - Review aid comparing two rule sets key by key
//
// Read-only. Compares resolved views so a key that moved from composite-only
// to both regimes shows up as a modification of the withholding fields.

use crate::resolution::ResolvedRule;
use crate::rules::RuleKey;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifiedRule {
    pub key: RuleKey,
    pub changes: Vec<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSetDiff {
    /// None when there was nothing to compare against
    pub base_rule_set_id: Option<String>,
    pub target_rule_set_id: String,
    pub added: Vec<RuleKey>,
    pub removed: Vec<RuleKey>,
    pub modified: Vec<ModifiedRule>,

    /// Keys present in both sets, modified or not
    pub retained: usize,
}

impl RuleSetDiff {
    pub fn unchanged_count(&self) -> usize {
        self.retained - self.modified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} added, {} removed, {} modified, {} unchanged",
            self.added.len(),
            self.removed.len(),
            self.modified.len(),
            self.unchanged_count()
        )
    }
}

fn decimal_field(name: &str, old: Option<Decimal>, new: Option<Decimal>, out: &mut Vec<FieldChange>) {
    if old != new {
        out.push(FieldChange {
            field: name.to_string(),
            old: old.map(|d| d.normalize().to_string()),
            new: new.map(|d| d.normalize().to_string()),
        });
    }
}

fn flag_field(name: &str, old: Option<bool>, new: Option<bool>, out: &mut Vec<FieldChange>) {
    if old != new {
        out.push(FieldChange {
            field: name.to_string(),
            old: old.map(|b| b.to_string()),
            new: new.map(|b| b.to_string()),
        });
    }
}

/// Field-level differences between two resolved rows for the same key
pub fn compare_rules(old: &ResolvedRule, new: &ResolvedRule) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    decimal_field("withholding_rate", old.withholding_rate, new.withholding_rate, &mut changes);
    decimal_field(
        "withholding_income_threshold",
        old.withholding_income_threshold,
        new.withholding_income_threshold,
        &mut changes,
    );
    decimal_field(
        "withholding_tax_threshold",
        old.withholding_tax_threshold,
        new.withholding_tax_threshold,
        &mut changes,
    );
    decimal_field("composite_rate", old.composite_rate, new.composite_rate, &mut changes);
    decimal_field(
        "composite_income_threshold",
        old.composite_income_threshold,
        new.composite_income_threshold,
        &mut changes,
    );
    flag_field("composite_mandatory", old.composite_mandatory, new.composite_mandatory, &mut changes);
    changes
}

/// Diff target against base at (state, entity type) granularity
pub fn diff_resolved(
    base_rule_set_id: Option<&str>,
    base: &[ResolvedRule],
    target_rule_set_id: &str,
    target: &[ResolvedRule],
) -> RuleSetDiff {
    let base_by_key: BTreeMap<&RuleKey, &ResolvedRule> = base.iter().map(|r| (&r.key, r)).collect();
    let target_by_key: BTreeMap<&RuleKey, &ResolvedRule> = target.iter().map(|r| (&r.key, r)).collect();

    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut retained = 0;

    for (key, new) in &target_by_key {
        match base_by_key.get(key) {
            None => added.push((*key).clone()),
            Some(old) => {
                retained += 1;
                let changes = compare_rules(old, new);
                if !changes.is_empty() {
                    modified.push(ModifiedRule {
                        key: (*key).clone(),
                        changes,
                    });
                }
            }
        }
    }

    let removed = base_by_key
        .keys()
        .filter(|k| !target_by_key.contains_key(*k))
        .map(|k| (*k).clone())
        .collect();

    RuleSetDiff {
        base_rule_set_id: base_rule_set_id.map(|s| s.to_string()),
        target_rule_set_id: target_rule_set_id.to_string(),
        added,
        removed,
        modified,
        retained,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::EntityTypeCode;
    use rust_decimal_macros::dec;

    fn resolved(state: &str, entity: EntityTypeCode, wh_rate: Option<Decimal>, mandatory: Option<bool>) -> ResolvedRule {
        ResolvedRule {
            id: format!("rr-{state}"),
            rule_set_id: "rs".to_string(),
            key: RuleKey::new(state.parse().unwrap(), entity),
            withholding_rule_id: wh_rate.map(|_| "w".to_string()),
            withholding_rate: wh_rate,
            withholding_income_threshold: None,
            withholding_tax_threshold: None,
            composite_rule_id: mandatory.map(|_| "c".to_string()),
            composite_rate: mandatory.map(|_| dec!(0.09)),
            composite_income_threshold: None,
            composite_mandatory: mandatory,
        }
    }

    #[test]
    fn test_diff_added_removed_modified() {
        let base = vec![
            resolved("CA", EntityTypeCode::Partnership, Some(dec!(0.07)), Some(true)),
            resolved("NY", EntityTypeCode::Partnership, Some(dec!(0.0685)), None),
            resolved("OR", EntityTypeCode::Trust, Some(dec!(0.08)), None),
        ];
        let target = vec![
            resolved("CA", EntityTypeCode::Partnership, Some(dec!(0.075)), Some(true)),
            resolved("NY", EntityTypeCode::Partnership, Some(dec!(0.06850)), None),
            resolved("TX", EntityTypeCode::Corporation, None, Some(false)),
        ];

        let diff = diff_resolved(Some("base"), &base, "target", &target);

        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].state.as_str(), "TX");
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].state.as_str(), "OR");
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].key.state.as_str(), "CA");
        assert_eq!(
            diff.modified[0].changes,
            vec![FieldChange {
                field: "withholding_rate".to_string(),
                old: Some("0.07".to_string()),
                new: Some("0.075".to_string()),
            }]
        );
        // trailing zeros are not a change
        assert_eq!(diff.unchanged_count(), 1);
        assert_eq!(diff.added.len() + diff.retained, target.len());
    }

    #[test]
    fn test_every_modified_entry_lists_a_change() {
        let base = vec![resolved("CA", EntityTypeCode::Partnership, None, Some(true))];
        let target = vec![resolved("CA", EntityTypeCode::Partnership, Some(dec!(0.07)), None)];

        let diff = diff_resolved(Some("base"), &base, "target", &target);
        assert_eq!(diff.modified.len(), 1);
        let fields: Vec<&str> = diff.modified[0].changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["withholding_rate", "composite_rate", "composite_mandatory"]);
        assert!(diff.modified.iter().all(|m| !m.changes.is_empty()));
    }

    #[test]
    fn test_diff_without_base_marks_everything_added() {
        let target = vec![
            resolved("CA", EntityTypeCode::Partnership, Some(dec!(0.07)), None),
            resolved("NY", EntityTypeCode::Partnership, Some(dec!(0.06)), None),
        ];
        let diff = diff_resolved(None, &[], "target", &target);

        assert_eq!(diff.added.len(), 2);
        assert_eq!(diff.retained, 0);
        assert!(diff.base_rule_set_id.is_none());
        assert_eq!(diff.summary(), "2 added, 0 removed, 0 modified, 0 unchanged");
    }

    #[test]
    fn test_identical_sets_diff_empty() {
        let rules = vec![resolved("CA", EntityTypeCode::Partnership, Some(dec!(0.07)), Some(true))];
        let diff = diff_resolved(Some("a"), &rules, "b", &rules);
        assert!(diff.is_empty());
        assert_eq!(diff.unchanged_count(), 1);
    }
}
