// 🧮 Tax Calculation - Exemption -> composite -> withholding, with audit trail
//
// Pure over (resolved snapshot, investor, distributions). Steps run in a
// fixed order and stop at the first skip. Every branch taken appends exactly
// one AuditEntry so any result can be reconstructed from its trail.
//
// Threshold comparisons are strictly greater-than and use unrounded values.
// Rounding to the configured scale happens last. Arithmetic is checked: an
// overflowing product is an audit outcome, never a panic.

use crate::reference::{EntityTypeCode, StateCode};
use crate::resolution::{ResolvedRule, ResolvedRuleSet};
use anyhow::{Context, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;

// ============================================================================
// INPUTS
// ============================================================================

/// The only investor attributes the engine reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investor {
    pub id: String,
    pub entity_type: EntityTypeCode,
    pub domicile_state: StateCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub id: String,
    pub investor_id: String,
    pub jurisdiction: StateCode,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(default)]
    pub composite_exemption: bool,
    #[serde(default)]
    pub withholding_exemption: bool,
}

/// Load distribution rows from CSV
/// (id, investor_id, jurisdiction, amount, composite_exemption, withholding_exemption)
pub fn read_distributions<R: Read>(reader: R) -> Result<Vec<Distribution>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut distributions = Vec::new();
    for (idx, record) in rdr.deserialize().enumerate() {
        let distribution: Distribution =
            record.with_context(|| format!("Failed to parse distribution row {}", idx + 2))?;
        distributions.push(distribution);
    }
    Ok(distributions)
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationStep {
    Exemption,
    Composite,
    Withholding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    InvestorMismatch,
    CompositeExempt,
    WithholdingExempt,
    DomicileMatch,
    ExemptionPassed,
    NoRuleFound,
    NotMandatory,
    NoRate,
    BelowIncomeThreshold,
    Applied,
    CompositeCovered,
    BelowTaxThreshold,
    ArithmeticOverflow,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::InvestorMismatch => "INVESTOR_MISMATCH",
            AuditOutcome::CompositeExempt => "COMPOSITE_EXEMPT",
            AuditOutcome::WithholdingExempt => "WITHHOLDING_EXEMPT",
            AuditOutcome::DomicileMatch => "DOMICILE_MATCH",
            AuditOutcome::ExemptionPassed => "EXEMPTION_PASSED",
            AuditOutcome::NoRuleFound => "NO_RULE_FOUND",
            AuditOutcome::NotMandatory => "NOT_MANDATORY",
            AuditOutcome::NoRate => "NO_RATE",
            AuditOutcome::BelowIncomeThreshold => "BELOW_INCOME_THRESHOLD",
            AuditOutcome::Applied => "APPLIED",
            AuditOutcome::CompositeCovered => "COMPOSITE_COVERED",
            AuditOutcome::BelowTaxThreshold => "BELOW_TAX_THRESHOLD",
            AuditOutcome::ArithmeticOverflow => "ARITHMETIC_OVERFLOW",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub distribution_id: String,
    pub investor_id: String,
    pub jurisdiction: StateCode,
    pub step: CalculationStep,
    pub outcome: AuditOutcome,

    /// ResolvedRule consulted, if any
    pub matched_rule_id: Option<String>,

    /// WithholdingRule / CompositeRule behind the matched row for this step
    pub source_rule_id: Option<String>,

    pub threshold: Option<Decimal>,
    pub rate: Option<Decimal>,

    /// Rounded tax, on APPLIED entries only
    pub tax: Option<Decimal>,
    pub reason: String,
}

// ============================================================================
// OUTPUTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionResult {
    pub distribution: Distribution,
    pub withholding_tax: Option<Decimal>,
    pub composite_tax: Option<Decimal>,
    pub applied: bool,
    pub audit: Vec<AuditEntry>,
}

impl DistributionResult {
    pub fn outcome_at(&self, step: CalculationStep) -> Option<AuditOutcome> {
        self.audit.iter().find(|e| e.step == step).map(|e| e.outcome)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub rows: usize,
    pub applied: usize,
    pub total_composite_tax: Decimal,
    pub total_withholding_tax: Decimal,
    pub no_rule_found: usize,

    /// Rows with an ARITHMETIC_OVERFLOW outcome
    pub overflowed: usize,

    /// A total could not be represented; the totals stop at the last
    /// representable sum
    pub totals_overflowed: bool,
}

impl BatchSummary {
    fn add_tax(total: &mut Decimal, tax: Option<Decimal>, overflowed: &mut bool) {
        let Some(tax) = tax else { return };
        match total.checked_add(tax) {
            Some(sum) => *total = sum,
            None => *overflowed = true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationBatch {
    pub rule_set_id: String,
    pub investor_id: String,
    pub results: Vec<DistributionResult>,
    pub summary: BatchSummary,
}

// ============================================================================
// CALCULATOR
// ============================================================================

pub struct TaxCalculator<'a> {
    rules: &'a ResolvedRuleSet,
    rounding_scale: u32,
}

/// Accumulates the trail for one distribution
struct Trail<'d> {
    distribution: &'d Distribution,
    entries: Vec<AuditEntry>,
}

impl<'d> Trail<'d> {
    fn new(distribution: &'d Distribution) -> Self {
        Trail {
            distribution,
            entries: Vec::new(),
        }
    }

    fn record(&mut self, step: CalculationStep, outcome: AuditOutcome, reason: impl Into<String>) -> &mut AuditEntry {
        self.entries.push(AuditEntry {
            distribution_id: self.distribution.id.clone(),
            investor_id: self.distribution.investor_id.clone(),
            jurisdiction: self.distribution.jurisdiction.clone(),
            step,
            outcome,
            matched_rule_id: None,
            source_rule_id: None,
            threshold: None,
            rate: None,
            tax: None,
            reason: reason.into(),
        });
        let last = self.entries.len() - 1;
        &mut self.entries[last]
    }

    fn record_rule(
        &mut self,
        step: CalculationStep,
        outcome: AuditOutcome,
        rule: &ResolvedRule,
        rate: Option<Decimal>,
        threshold: Option<Decimal>,
        reason: impl Into<String>,
    ) -> &mut AuditEntry {
        let source_rule_id = match step {
            CalculationStep::Composite => rule.composite_rule_id.clone(),
            CalculationStep::Withholding => rule.withholding_rule_id.clone(),
            CalculationStep::Exemption => None,
        };
        let entry = self.record(step, outcome, reason);
        entry.matched_rule_id = Some(rule.id.clone());
        entry.source_rule_id = source_rule_id;
        entry.rate = rate;
        entry.threshold = threshold;
        entry
    }
}

impl<'a> TaxCalculator<'a> {
    pub fn new(rules: &'a ResolvedRuleSet, rounding_scale: u32) -> Self {
        TaxCalculator { rules, rounding_scale }
    }

    fn round(&self, value: Decimal) -> Decimal {
        value.round_dp_with_strategy(self.rounding_scale, RoundingStrategy::MidpointAwayFromZero)
    }

    /// Run every distribution of one investor, in input order
    pub fn calculate(&self, investor: &Investor, distributions: &[Distribution]) -> CalculationBatch {
        let results: Vec<DistributionResult> = distributions
            .iter()
            .map(|d| self.calculate_one(investor, d))
            .collect();

        let mut summary = BatchSummary {
            rows: results.len(),
            ..BatchSummary::default()
        };
        for result in &results {
            if result.applied {
                summary.applied += 1;
            }
            BatchSummary::add_tax(
                &mut summary.total_composite_tax,
                result.composite_tax,
                &mut summary.totals_overflowed,
            );
            BatchSummary::add_tax(
                &mut summary.total_withholding_tax,
                result.withholding_tax,
                &mut summary.totals_overflowed,
            );
            if result.audit.iter().any(|e| e.outcome == AuditOutcome::NoRuleFound) {
                summary.no_rule_found += 1;
            }
            if result.audit.iter().any(|e| e.outcome == AuditOutcome::ArithmeticOverflow) {
                summary.overflowed += 1;
            }
        }

        if summary.totals_overflowed {
            tracing::warn!(investor_id = %investor.id, "batch tax totals overflowed");
        }

        tracing::info!(
            rule_set_id = %self.rules.rule_set_id,
            investor_id = %investor.id,
            rows = summary.rows,
            applied = summary.applied,
            no_rule_found = summary.no_rule_found,
            "calculation batch complete"
        );

        CalculationBatch {
            rule_set_id: self.rules.rule_set_id.clone(),
            investor_id: investor.id.clone(),
            results,
            summary,
        }
    }

    pub fn calculate_one(&self, investor: &Investor, distribution: &Distribution) -> DistributionResult {
        let mut trail = Trail::new(distribution);
        let (composite_tax, withholding_tax) = self.run_steps(investor, distribution, &mut trail);

        DistributionResult {
            distribution: distribution.clone(),
            withholding_tax,
            composite_tax,
            applied: composite_tax.is_some() || withholding_tax.is_some(),
            audit: trail.entries,
        }
    }

    fn run_steps(
        &self,
        investor: &Investor,
        distribution: &Distribution,
        trail: &mut Trail,
    ) -> (Option<Decimal>, Option<Decimal>) {
        use AuditOutcome::*;
        use CalculationStep::*;

        // Step 1: exemptions
        if distribution.investor_id != investor.id {
            trail.record(
                Exemption,
                InvestorMismatch,
                format!("distribution belongs to investor {}, not {}", distribution.investor_id, investor.id),
            );
            return (None, None);
        }
        if distribution.composite_exemption {
            trail.record(Exemption, CompositeExempt, "composite exemption flag set");
            return (None, None);
        }
        if distribution.withholding_exemption {
            trail.record(Exemption, WithholdingExempt, "withholding exemption flag set");
            return (None, None);
        }
        if distribution.jurisdiction == investor.domicile_state {
            trail.record(
                Exemption,
                DomicileMatch,
                format!("jurisdiction {} is the investor's tax domicile", distribution.jurisdiction),
            );
            return (None, None);
        }
        trail.record(Exemption, ExemptionPassed, "no exemption applies");

        let Some(rule) = self.rules.get(&distribution.jurisdiction, investor.entity_type) else {
            trail.record(
                Composite,
                NoRuleFound,
                format!(
                    "no rule for {}/{} in rule set {}",
                    distribution.jurisdiction, investor.entity_type, self.rules.rule_set_id
                ),
            );
            return (None, None);
        };

        let amount = distribution.amount;

        // Step 2: composite
        let composite_tax = self.composite_step(rule, amount, trail);

        // Step 3: withholding, only when composite did not cover the row
        let withholding_tax = if composite_tax.is_some() {
            trail.record_rule(
                Withholding,
                CompositeCovered,
                rule,
                None,
                None,
                "covered by composite filing",
            );
            None
        } else {
            self.withholding_step(rule, amount, trail)
        };

        (composite_tax, withholding_tax)
    }

    fn composite_step(&self, rule: &ResolvedRule, amount: Decimal, trail: &mut Trail) -> Option<Decimal> {
        use AuditOutcome::*;
        let step = CalculationStep::Composite;
        let rate = rule.composite_rate;
        let threshold = rule.composite_income_threshold;

        if rule.composite_mandatory != Some(true) {
            let reason = match rule.composite_mandatory {
                Some(false) => "composite filing not mandatory",
                _ => "composite filing unspecified",
            };
            trail.record_rule(step, NotMandatory, rule, rate, threshold, reason);
            return None;
        }
        let Some(rate) = rate else {
            trail.record_rule(step, NoRate, rule, None, threshold, "mandatory composite without a rate");
            return None;
        };
        if let Some(t) = threshold {
            if amount <= t {
                trail.record_rule(
                    step,
                    BelowIncomeThreshold,
                    rule,
                    Some(rate),
                    threshold,
                    format!("amount {amount} does not exceed composite income threshold {t}"),
                );
                return None;
            }
        }

        let Some(raw) = amount.checked_mul(rate) else {
            trail.record_rule(
                step,
                ArithmeticOverflow,
                rule,
                Some(rate),
                threshold,
                format!("amount {amount} x composite rate {rate} is not representable"),
            );
            return None;
        };
        let tax = self.round(raw);
        let reason = if threshold.is_some() {
            "composite applied, threshold exceeded"
        } else {
            "composite applied, no income threshold"
        };
        trail.record_rule(step, Applied, rule, Some(rate), threshold, reason).tax = Some(tax);
        Some(tax)
    }

    fn withholding_step(&self, rule: &ResolvedRule, amount: Decimal, trail: &mut Trail) -> Option<Decimal> {
        use AuditOutcome::*;
        let step = CalculationStep::Withholding;
        let income_threshold = rule.withholding_income_threshold;
        let tax_threshold = rule.withholding_tax_threshold;

        let Some(rate) = rule.withholding_rate else {
            trail.record_rule(step, NoRate, rule, None, income_threshold, "no withholding rate");
            return None;
        };
        if let Some(t) = income_threshold {
            if amount <= t {
                trail.record_rule(
                    step,
                    BelowIncomeThreshold,
                    rule,
                    Some(rate),
                    income_threshold,
                    format!("amount {amount} does not exceed withholding income threshold {t}"),
                );
                return None;
            }
        }

        let Some(tentative) = amount.checked_mul(rate) else {
            trail.record_rule(
                step,
                ArithmeticOverflow,
                rule,
                Some(rate),
                income_threshold,
                format!("amount {amount} x withholding rate {rate} is not representable"),
            );
            return None;
        };
        if let Some(t) = tax_threshold {
            if tentative <= t {
                trail.record_rule(
                    step,
                    BelowTaxThreshold,
                    rule,
                    Some(rate),
                    tax_threshold,
                    format!("tentative withholding {tentative} does not exceed tax threshold {t}"),
                );
                return None;
            }
        }

        let tax = self.round(tentative);
        let (threshold, reason) = match (tax_threshold, income_threshold) {
            (Some(_), _) => (tax_threshold, "withholding applied, tax threshold exceeded"),
            (None, Some(_)) => (income_threshold, "withholding applied, income threshold exceeded"),
            (None, None) => (None, "withholding applied, no thresholds"),
        };
        trail.record_rule(step, Applied, rule, Some(rate), threshold, reason).tax = Some(tax);
        Some(tax)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolution::resolve;
    use crate::rules::{CompositeRule, RuleKey, WithholdingRule};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn state(code: &str) -> StateCode {
        code.parse().unwrap()
    }

    fn key(code: &str) -> RuleKey {
        RuleKey::new(state(code), EntityTypeCode::Partnership)
    }

    fn withholding(code: &str, rate: Decimal, income: Option<Decimal>, tax: Option<Decimal>) -> WithholdingRule {
        WithholdingRule {
            id: format!("w-{code}"),
            rule_set_id: "rs-2025-q1".to_string(),
            key: key(code),
            rate: Some(rate),
            income_threshold: income,
            tax_threshold: tax,
            source_row: 2,
        }
    }

    fn composite(code: &str, rate: Decimal, income: Option<Decimal>, mandatory: Option<bool>) -> CompositeRule {
        CompositeRule {
            id: format!("c-{code}"),
            rule_set_id: "rs-2025-q1".to_string(),
            key: key(code),
            rate: Some(rate),
            income_threshold: income,
            mandatory_filing: mandatory,
            source_row: 2,
        }
    }

    /// CA: composite 9% mandatory over 1000, withholding 7% no thresholds.
    /// NY: withholding 6.85% with a 25.00 tax threshold.
    /// OR: withholding 8% over 10000 income; composite not mandatory.
    fn snapshot() -> ResolvedRuleSet {
        let withholding = vec![
            withholding("CA", dec!(0.07), None, None),
            withholding("NY", dec!(0.0685), None, Some(dec!(25))),
            withholding("OR", dec!(0.08), Some(dec!(10000)), None),
        ];
        let composite = vec![
            composite("CA", dec!(0.09), Some(dec!(1000)), Some(true)),
            composite("OR", dec!(0.099), None, Some(false)),
        ];
        ResolvedRuleSet::new("rs-2025-q1", resolve("rs-2025-q1", &withholding, &composite))
    }

    fn investor(domicile: &str) -> Investor {
        Investor {
            id: "inv-1".to_string(),
            entity_type: EntityTypeCode::Partnership,
            domicile_state: state(domicile),
        }
    }

    fn distribution(jurisdiction: &str, amount: Decimal) -> Distribution {
        Distribution {
            id: format!("d-{jurisdiction}-{amount}"),
            investor_id: "inv-1".to_string(),
            jurisdiction: state(jurisdiction),
            amount,
            composite_exemption: false,
            withholding_exemption: false,
        }
    }

    #[test]
    fn test_scenario_a_composite_applied() {
        let rules = snapshot();
        let calc = TaxCalculator::new(&rules, 2);
        let result = calc.calculate_one(&investor("NY"), &distribution("CA", dec!(5000)));

        assert_eq!(result.composite_tax, Some(dec!(450.00)));
        assert_eq!(result.withholding_tax, None);
        assert!(result.applied);

        let composite = result.audit.iter().find(|e| e.step == CalculationStep::Composite).unwrap();
        assert_eq!(composite.outcome, AuditOutcome::Applied);
        assert_eq!(composite.reason, "composite applied, threshold exceeded");
        assert_eq!(composite.source_rule_id.as_deref(), Some("c-CA"));
        assert_eq!(composite.threshold, Some(dec!(1000)));
        assert_eq!(composite.rate, Some(dec!(0.09)));
        assert_eq!(result.outcome_at(CalculationStep::Withholding), Some(AuditOutcome::CompositeCovered));
    }

    #[test]
    fn test_scenario_b_falls_through_to_withholding() {
        let rules = snapshot();
        let calc = TaxCalculator::new(&rules, 2);
        let result = calc.calculate_one(&investor("NY"), &distribution("CA", dec!(500)));

        assert_eq!(result.composite_tax, None);
        assert_eq!(result.withholding_tax, Some(dec!(35.00)));
        assert_eq!(
            result.outcome_at(CalculationStep::Composite),
            Some(AuditOutcome::BelowIncomeThreshold)
        );
        let wh = result.audit.iter().find(|e| e.step == CalculationStep::Withholding).unwrap();
        assert_eq!(wh.outcome, AuditOutcome::Applied);
        assert_eq!(wh.source_rule_id.as_deref(), Some("w-CA"));
        assert_eq!(wh.tax, Some(dec!(35.00)));
    }

    #[test]
    fn test_scenario_c_domicile_match_skips_everything() {
        let rules = snapshot();
        let calc = TaxCalculator::new(&rules, 2);
        let result = calc.calculate_one(&investor("CA"), &distribution("CA", dec!(5000)));

        assert_eq!(result.composite_tax, None);
        assert_eq!(result.withholding_tax, None);
        assert!(!result.applied);
        assert_eq!(result.audit.len(), 1);
        assert_eq!(result.audit[0].outcome, AuditOutcome::DomicileMatch);
    }

    #[test]
    fn test_withholding_exemption_blocks_both_regimes() {
        let rules = snapshot();
        let calc = TaxCalculator::new(&rules, 2);
        let mut d = distribution("CA", dec!(5000));
        d.withholding_exemption = true;

        let result = calc.calculate_one(&investor("NY"), &d);
        assert_eq!(result.composite_tax, None);
        assert_eq!(result.withholding_tax, None);
        assert_eq!(result.audit.len(), 1);
        assert_eq!(result.audit[0].outcome, AuditOutcome::WithholdingExempt);
    }

    #[test]
    fn test_composite_exemption_recorded() {
        let rules = snapshot();
        let calc = TaxCalculator::new(&rules, 2);
        let mut d = distribution("NY", dec!(5000));
        d.composite_exemption = true;

        let result = calc.calculate_one(&investor("TX"), &d);
        assert!(!result.applied);
        assert_eq!(result.audit[0].outcome, AuditOutcome::CompositeExempt);
    }

    #[test]
    fn test_missing_rule_is_an_audit_outcome() {
        let rules = snapshot();
        let calc = TaxCalculator::new(&rules, 2);
        let batch = calc.calculate(
            &investor("NY"),
            &[distribution("TX", dec!(1000)), distribution("CA", dec!(5000))],
        );

        let first = &batch.results[0];
        assert!(!first.applied);
        assert_eq!(first.outcome_at(CalculationStep::Composite), Some(AuditOutcome::NoRuleFound));

        // the batch keeps going
        assert_eq!(batch.results[1].composite_tax, Some(dec!(450)));
        assert_eq!(batch.summary.rows, 2);
        assert_eq!(batch.summary.applied, 1);
        assert_eq!(batch.summary.no_rule_found, 1);
        assert_eq!(batch.summary.total_composite_tax, dec!(450));
        assert_eq!(batch.summary.total_withholding_tax, dec!(0));
    }

    #[test]
    fn test_tax_threshold_discards_small_withholding() {
        let rules = snapshot();
        let calc = TaxCalculator::new(&rules, 2);

        // 300 * 0.0685 = 20.55, not above 25
        let small = calc.calculate_one(&investor("CA"), &distribution("NY", dec!(300)));
        assert_eq!(small.withholding_tax, None);
        assert_eq!(
            small.outcome_at(CalculationStep::Withholding),
            Some(AuditOutcome::BelowTaxThreshold)
        );
        assert_eq!(
            small.outcome_at(CalculationStep::Composite),
            Some(AuditOutcome::NotMandatory)
        );

        // 1000 * 0.0685 = 68.50
        let large = calc.calculate_one(&investor("CA"), &distribution("NY", dec!(1000)));
        assert_eq!(large.withholding_tax, Some(dec!(68.50)));
    }

    #[test]
    fn test_threshold_boundary_is_strict() {
        let rules = snapshot();
        let calc = TaxCalculator::new(&rules, 2);
        let ny = investor("NY");

        let at = calc.calculate_one(&ny, &distribution("CA", dec!(1000)));
        assert_eq!(at.composite_tax, None);

        let above = calc.calculate_one(&ny, &distribution("CA", dec!(1000.01)));
        assert_eq!(above.composite_tax, Some(dec!(90.00)));

        let or_at = calc.calculate_one(&ny, &distribution("OR", dec!(10000)));
        assert_eq!(or_at.withholding_tax, None);
        let or_above = calc.calculate_one(&ny, &distribution("OR", dec!(10000.01)));
        assert_eq!(or_above.withholding_tax, Some(dec!(800.00)));
    }

    #[test]
    fn test_rounding_happens_after_threshold_comparison() {
        // 364.97 * 0.0685 = 25.000445: above 25 unrounded, 25.00 once rounded
        let rules = snapshot();
        let calc = TaxCalculator::new(&rules, 2);
        let result = calc.calculate_one(&investor("CA"), &distribution("NY", dec!(364.97)));
        assert_eq!(result.withholding_tax, Some(dec!(25.00)));
    }

    #[test]
    fn test_investor_mismatch_not_calculated() {
        let rules = snapshot();
        let calc = TaxCalculator::new(&rules, 2);
        let mut d = distribution("CA", dec!(5000));
        d.investor_id = "inv-2".to_string();

        let result = calc.calculate_one(&investor("NY"), &d);
        assert!(!result.applied);
        assert_eq!(result.audit[0].outcome, AuditOutcome::InvestorMismatch);
    }

    fn single_rule_snapshot(withholding_rate: Decimal) -> ResolvedRuleSet {
        let wh = vec![withholding("CA", withholding_rate, None, None)];
        ResolvedRuleSet::new("rs", resolve("rs", &wh, &[]))
    }

    #[test]
    fn test_overflowing_product_is_recorded_and_batch_continues() {
        // 150% is a valid rate; Decimal::MAX * 1.5 is not representable
        let rules = single_rule_snapshot(dec!(1.5));
        let calc = TaxCalculator::new(&rules, 2);
        let batch = calc.calculate(
            &investor("NY"),
            &[distribution("CA", Decimal::MAX), distribution("CA", dec!(100))],
        );

        let huge = &batch.results[0];
        assert!(!huge.applied);
        assert_eq!(huge.withholding_tax, None);
        assert_eq!(
            huge.outcome_at(CalculationStep::Withholding),
            Some(AuditOutcome::ArithmeticOverflow)
        );

        assert_eq!(batch.results[1].withholding_tax, Some(dec!(150.00)));
        assert_eq!(batch.summary.overflowed, 1);
        assert_eq!(batch.summary.total_withholding_tax, dec!(150));
        assert!(!batch.summary.totals_overflowed);
    }

    #[test]
    fn test_overflowing_totals_flagged_not_panicking() {
        let rules = single_rule_snapshot(dec!(1));
        let calc = TaxCalculator::new(&rules, 0);
        let batch = calc.calculate(
            &investor("NY"),
            &[distribution("CA", Decimal::MAX), distribution("CA", Decimal::MAX)],
        );

        assert_eq!(batch.summary.applied, 2);
        assert!(batch.summary.totals_overflowed);
        assert_eq!(batch.summary.total_withholding_tax, Decimal::MAX);
    }

    #[test]
    fn test_read_distributions_csv() {
        let data = "id,investor_id,jurisdiction,amount,composite_exemption,withholding_exemption\n\
                    d-1,inv-1,CA,5000.00,false,false\n\
                    d-2,inv-1,ny,250,false,true\n";
        let rows = read_distributions(data.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].amount, dec!(5000.00));
        assert_eq!(rows[1].jurisdiction.as_str(), "NY");
        assert!(rows[1].withholding_exemption);

        assert!(read_distributions("id,investor_id,jurisdiction,amount\nd-1,inv-1,ZZ,1\n".as_bytes()).is_err());
    }

    #[test]
    fn test_audit_serializes() {
        let rules = snapshot();
        let calc = TaxCalculator::new(&rules, 2);
        let result = calc.calculate_one(&investor("NY"), &distribution("CA", dec!(5000)));
        let json = serde_json::to_value(&result.audit).unwrap();
        assert_eq!(json[1]["outcome"], "APPLIED");
        assert_eq!(json[1]["step"], "composite");
    }

    proptest! {
        #[test]
        fn prop_calculation_is_idempotent(
            cents in 0i64..10_000_000,
            jurisdiction in prop::sample::select(vec!["CA", "NY", "OR", "TX"]),
            composite_exempt in any::<bool>(),
            withholding_exempt in any::<bool>(),
        ) {
            let rules = snapshot();
            let calc = TaxCalculator::new(&rules, 2);
            let mut d = distribution(jurisdiction, Decimal::new(cents, 2));
            d.composite_exemption = composite_exempt;
            d.withholding_exemption = withholding_exempt;
            let inv = investor("NY");

            let first = calc.calculate(&inv, std::slice::from_ref(&d));
            let second = calc.calculate(&inv, std::slice::from_ref(&d));
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_threshold_equal_never_triggers(threshold_cents in 0i64..100_000_000) {
            let threshold = Decimal::new(threshold_cents, 2);
            let wh = vec![WithholdingRule {
                income_threshold: Some(threshold),
                ..withholding("CA", dec!(0.05), None, None)
            }];
            let rules = ResolvedRuleSet::new("rs", resolve("rs", &wh, &[]));
            let calc = TaxCalculator::new(&rules, 2);
            let inv = investor("NY");

            let at = calc.calculate_one(&inv, &distribution("CA", threshold));
            prop_assert_eq!(at.withholding_tax, None);

            let above = calc.calculate_one(&inv, &distribution("CA", threshold + dec!(0.01)));
            prop_assert!(above.withholding_tax.is_some());
        }
    }
}
