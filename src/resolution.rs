// 🔗 Rule Resolution - Merge withholding + composite into one snapshot
//
// Pure function of a RuleSet's child rules: one ResolvedRule per key present
// in either collection. Ids are derived from (rule set, key) so resolving the
// same inputs twice yields identical rows.

use crate::reference::{EntityTypeCode, StateCode};
use crate::rules::{CompositeRule, RuleKey, WithholdingRule};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// RESOLVED RULE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRule {
    pub id: String,
    pub rule_set_id: String,
    pub key: RuleKey,

    // Withholding side (None when no withholding rule for the key)
    pub withholding_rule_id: Option<String>,
    pub withholding_rate: Option<Decimal>,
    pub withholding_income_threshold: Option<Decimal>,
    pub withholding_tax_threshold: Option<Decimal>,

    // Composite side (None when no composite rule for the key)
    pub composite_rule_id: Option<String>,
    pub composite_rate: Option<Decimal>,
    pub composite_income_threshold: Option<Decimal>,
    pub composite_mandatory: Option<bool>,
}

/// Deterministic id for the resolved row of a key
pub fn resolved_rule_id(rule_set_id: &str, key: &RuleKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rule_set_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(key.state.as_str().as_bytes());
    hasher.update([0x1f]);
    hasher.update(key.entity_type.as_str().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("rr-{}", &digest[..32])
}

/// Merge both collections over the union of their keys, ordered by key
pub fn resolve(
    rule_set_id: &str,
    withholding: &[WithholdingRule],
    composite: &[CompositeRule],
) -> Vec<ResolvedRule> {
    let wh_by_key: BTreeMap<&RuleKey, &WithholdingRule> =
        withholding.iter().map(|r| (&r.key, r)).collect();
    let comp_by_key: BTreeMap<&RuleKey, &CompositeRule> =
        composite.iter().map(|r| (&r.key, r)).collect();

    let keys: BTreeSet<&RuleKey> = wh_by_key.keys().chain(comp_by_key.keys()).copied().collect();

    keys.into_iter()
        .map(|key| {
            let wh = wh_by_key.get(key);
            let comp = comp_by_key.get(key);
            ResolvedRule {
                id: resolved_rule_id(rule_set_id, key),
                rule_set_id: rule_set_id.to_string(),
                key: key.clone(),
                withholding_rule_id: wh.map(|r| r.id.clone()),
                withholding_rate: wh.and_then(|r| r.rate),
                withholding_income_threshold: wh.and_then(|r| r.income_threshold),
                withholding_tax_threshold: wh.and_then(|r| r.tax_threshold),
                composite_rule_id: comp.map(|r| r.id.clone()),
                composite_rate: comp.and_then(|r| r.rate),
                composite_income_threshold: comp.and_then(|r| r.income_threshold),
                composite_mandatory: comp.and_then(|r| r.mandatory_filing),
            }
        })
        .collect()
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Read-only resolved view of one RuleSet, keyed for lookup
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResolvedRuleSet {
    pub rule_set_id: String,
    rules: BTreeMap<RuleKey, ResolvedRule>,
}

impl ResolvedRuleSet {
    pub fn new(rule_set_id: &str, rules: Vec<ResolvedRule>) -> Self {
        ResolvedRuleSet {
            rule_set_id: rule_set_id.to_string(),
            rules: rules.into_iter().map(|r| (r.key.clone(), r)).collect(),
        }
    }

    pub fn get(&self, state: &StateCode, entity_type: EntityTypeCode) -> Option<&ResolvedRule> {
        self.rules.get(&RuleKey::new(state.clone(), entity_type))
    }

    pub fn keys(&self) -> impl Iterator<Item = &RuleKey> {
        self.rules.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedRule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
