// 🗺️ Reference Data - States and investor entity types
//
// Static lookup tables plus a registry that maps every accepted spelling
// ("CA", "California", "california ") and every entity label ("S Corp",
// "S-Corporation", "S_CORPORATION") onto one canonical value.

use crate::ingestion::normalize::fold_label;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// STATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    pub code: &'static str,
    pub name: &'static str,
}

/// 50 states + DC
pub const STATES: [State; 51] = [
    State { code: "AL", name: "Alabama" },
    State { code: "AK", name: "Alaska" },
    State { code: "AZ", name: "Arizona" },
    State { code: "AR", name: "Arkansas" },
    State { code: "CA", name: "California" },
    State { code: "CO", name: "Colorado" },
    State { code: "CT", name: "Connecticut" },
    State { code: "DE", name: "Delaware" },
    State { code: "DC", name: "District of Columbia" },
    State { code: "FL", name: "Florida" },
    State { code: "GA", name: "Georgia" },
    State { code: "HI", name: "Hawaii" },
    State { code: "ID", name: "Idaho" },
    State { code: "IL", name: "Illinois" },
    State { code: "IN", name: "Indiana" },
    State { code: "IA", name: "Iowa" },
    State { code: "KS", name: "Kansas" },
    State { code: "KY", name: "Kentucky" },
    State { code: "LA", name: "Louisiana" },
    State { code: "ME", name: "Maine" },
    State { code: "MD", name: "Maryland" },
    State { code: "MA", name: "Massachusetts" },
    State { code: "MI", name: "Michigan" },
    State { code: "MN", name: "Minnesota" },
    State { code: "MS", name: "Mississippi" },
    State { code: "MO", name: "Missouri" },
    State { code: "MT", name: "Montana" },
    State { code: "NE", name: "Nebraska" },
    State { code: "NV", name: "Nevada" },
    State { code: "NH", name: "New Hampshire" },
    State { code: "NJ", name: "New Jersey" },
    State { code: "NM", name: "New Mexico" },
    State { code: "NY", name: "New York" },
    State { code: "NC", name: "North Carolina" },
    State { code: "ND", name: "North Dakota" },
    State { code: "OH", name: "Ohio" },
    State { code: "OK", name: "Oklahoma" },
    State { code: "OR", name: "Oregon" },
    State { code: "PA", name: "Pennsylvania" },
    State { code: "RI", name: "Rhode Island" },
    State { code: "SC", name: "South Carolina" },
    State { code: "SD", name: "South Dakota" },
    State { code: "TN", name: "Tennessee" },
    State { code: "TX", name: "Texas" },
    State { code: "UT", name: "Utah" },
    State { code: "VT", name: "Vermont" },
    State { code: "VA", name: "Virginia" },
    State { code: "WA", name: "Washington" },
    State { code: "WV", name: "West Virginia" },
    State { code: "WI", name: "Wisconsin" },
    State { code: "WY", name: "Wyoming" },
];

/// Canonical 2-letter state code. Only constructible for codes in STATES.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StateCode(String);

impl StateCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for StateCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        STATES
            .iter()
            .find(|st| st.code == upper)
            .map(|st| StateCode(st.code.to_string()))
            .ok_or_else(|| format!("unknown state code: {s}"))
    }
}

impl TryFrom<String> for StateCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StateCode> for String {
    fn from(code: StateCode) -> Self {
        code.0
    }
}

impl fmt::Display for StateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// ENTITY TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityTypeCode {
    Corporation,
    Partnership,
    Individual,
    Trust,
    SCorporation,
    ExemptOrg,
    Ira,
    Estate,
    Llc,
}

impl EntityTypeCode {
    pub const ALL: [EntityTypeCode; 9] = [
        EntityTypeCode::Corporation,
        EntityTypeCode::Partnership,
        EntityTypeCode::Individual,
        EntityTypeCode::Trust,
        EntityTypeCode::SCorporation,
        EntityTypeCode::ExemptOrg,
        EntityTypeCode::Ira,
        EntityTypeCode::Estate,
        EntityTypeCode::Llc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityTypeCode::Corporation => "CORPORATION",
            EntityTypeCode::Partnership => "PARTNERSHIP",
            EntityTypeCode::Individual => "INDIVIDUAL",
            EntityTypeCode::Trust => "TRUST",
            EntityTypeCode::SCorporation => "S_CORPORATION",
            EntityTypeCode::ExemptOrg => "EXEMPT_ORG",
            EntityTypeCode::Ira => "IRA",
            EntityTypeCode::Estate => "ESTATE",
            EntityTypeCode::Llc => "LLC",
        }
    }

    /// Display label used in workbooks
    pub fn label(&self) -> &'static str {
        match self {
            EntityTypeCode::Corporation => "Corporation",
            EntityTypeCode::Partnership => "Partnership",
            EntityTypeCode::Individual => "Individual",
            EntityTypeCode::Trust => "Trust",
            EntityTypeCode::SCorporation => "S Corporation",
            EntityTypeCode::ExemptOrg => "Exempt Organization",
            EntityTypeCode::Ira => "IRA",
            EntityTypeCode::Estate => "Estate",
            EntityTypeCode::Llc => "Limited Liability Company",
        }
    }

    /// Alternative spellings seen in tax-rule workbooks
    fn synonyms(&self) -> &'static [&'static str] {
        match self {
            EntityTypeCode::Corporation => &["Corp", "C Corp", "C Corporation"],
            EntityTypeCode::Partnership => &["LP", "LLP", "General Partnership", "Limited Partnership"],
            EntityTypeCode::Individual => &["Individuals", "Natural Person", "Resident Individual"],
            EntityTypeCode::Trust => &["Trusts", "Grantor Trust", "Non-Grantor Trust"],
            EntityTypeCode::SCorporation => &["S Corp", "S-Corp", "S-Corporation"],
            EntityTypeCode::ExemptOrg => &[
                "Exempt Org",
                "Tax Exempt",
                "Tax-Exempt Organization",
                "Non-Profit",
                "Nonprofit",
            ],
            EntityTypeCode::Ira => &["Individual Retirement Account", "Retirement Account"],
            EntityTypeCode::Estate => &["Estates"],
            EntityTypeCode::Llc => &["L.L.C."],
        }
    }
}

impl FromStr for EntityTypeCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityTypeCode::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s.trim())
            .ok_or_else(|| format!("unknown entity type code: {s}"))
    }
}

impl fmt::Display for EntityTypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// REFERENCE REGISTRY
// ============================================================================

/// Synonym tables keyed by folded label
pub struct ReferenceData {
    states: HashMap<String, StateCode>,
    entity_types: HashMap<String, EntityTypeCode>,
}

impl ReferenceData {
    /// Registry with the built-in codes, names and labels
    pub fn new() -> Self {
        let mut registry = ReferenceData {
            states: HashMap::new(),
            entity_types: HashMap::new(),
        };

        for state in STATES.iter() {
            let code = StateCode(state.code.to_string());
            registry.states.insert(fold_label(state.code), code.clone());
            registry.states.insert(fold_label(state.name), code);
        }

        for entity in EntityTypeCode::ALL {
            registry.entity_types.insert(fold_label(entity.as_str()), entity);
            registry.entity_types.insert(fold_label(entity.label()), entity);
            for synonym in entity.synonyms() {
                registry.entity_types.insert(fold_label(synonym), entity);
            }
        }

        registry
    }

    /// Built-in tables extended with configured aliases.
    /// Aliases pointing at unknown state codes are ignored.
    pub fn with_aliases(
        state_aliases: &BTreeMap<String, String>,
        entity_aliases: &BTreeMap<String, EntityTypeCode>,
    ) -> Self {
        let mut registry = ReferenceData::new();

        for (alias, code) in state_aliases {
            match code.parse::<StateCode>() {
                Ok(code) => {
                    registry.states.insert(fold_label(alias), code);
                }
                Err(e) => tracing::warn!(alias = %alias, error = %e, "ignoring state alias"),
            }
        }

        for (alias, entity) in entity_aliases {
            registry.entity_types.insert(fold_label(alias), *entity);
        }

        registry
    }

    /// Resolve a state code or name
    pub fn resolve_state(&self, raw: &str) -> Option<StateCode> {
        self.states.get(&fold_label(raw)).cloned()
    }

    /// Resolve an entity-type code or label
    pub fn resolve_entity_type(&self, raw: &str) -> Option<EntityTypeCode> {
        self.entity_types.get(&fold_label(raw)).copied()
    }

    /// Every state code, in table order
    pub fn state_codes(&self) -> Vec<StateCode> {
        STATES.iter().map(|s| StateCode(s.code.to_string())).collect()
    }
}

impl Default for ReferenceData {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
