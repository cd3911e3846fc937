// ⚙️ Engine Configuration - Loaded from JSON, every field defaulted

use crate::ingestion::issue::Severity;
use crate::reference::{EntityTypeCode, ReferenceData};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Full-coverage policy check across both sheets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoveragePolicy {
    pub enabled: bool,

    /// Severity of COVERAGE_GAP issues (warning = never blocks activation)
    pub severity: Severity,

    /// Entity types every state is expected to cover
    pub entity_types: Vec<EntityTypeCode>,
}

impl Default for CoveragePolicy {
    fn default() -> Self {
        CoveragePolicy {
            enabled: false,
            severity: Severity::Warning,
            entity_types: EntityTypeCode::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub coverage: CoveragePolicy,

    /// Extra state spellings: label -> 2-letter code
    pub state_aliases: BTreeMap<String, String>,

    /// Extra entity labels: label -> canonical code
    pub entity_type_aliases: BTreeMap<String, EntityTypeCode>,

    /// Decimal places kept on computed tax amounts
    pub rounding_scale: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            coverage: CoveragePolicy::default(),
            state_aliases: BTreeMap::new(),
            entity_type_aliases: BTreeMap::new(),
            rounding_scale: 2,
        }
    }
}

impl EngineConfig {
    /// Load config from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: EngineConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;

        Ok(config)
    }

    /// Reference registry with configured aliases merged in
    pub fn reference_data(&self) -> ReferenceData {
        ReferenceData::with_aliases(&self.state_aliases, &self.entity_type_aliases)
    }
}

// ============================================================================
// TESTS
// ============================================================================
