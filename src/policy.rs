//! Global filtering policy: which options are banned and which equipment
//! classification is left out of modelling altogether.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::OptionInfo;
use crate::error::{Error, Result};

/// Filtering policy passed into every stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Policy {
    /// Options that must never be selected. They are still modeled (and
    /// forced false), but never probed or used as representatives.
    pub banned: BTreeSet<String>,
    /// Equipment classification whose options are not modeled at all.
    pub excluded_equipment_type: String,
    /// Skip standard-equipment options when choosing probe candidates.
    pub skip_standard_candidates: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            banned: ["0UB.89.24931", "0UD.89.24931"]
                .into_iter()
                .map(String::from)
                .collect(),
            excluded_equipment_type: "tequipment".to_string(),
            skip_standard_candidates: true,
        }
    }
}

impl Policy {
    /// A policy that bans nothing and models everything.
    pub fn permissive() -> Self {
        Self {
            banned: BTreeSet::new(),
            excluded_equipment_type: String::new(),
            skip_standard_candidates: false,
        }
    }

    pub fn with_banned(mut self, banned: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.banned = banned.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_excluded_equipment_type(mut self, equipment_type: impl Into<String>) -> Self {
        self.excluded_equipment_type = equipment_type.into();
        self
    }

    pub fn with_skip_standard_candidates(mut self, skip: bool) -> Self {
        self.skip_standard_candidates = skip;
        self
    }

    /// Loads a policy from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| Error::json(path, e))
    }

    pub fn is_banned(&self, id: &str) -> bool {
        self.banned.contains(id)
    }

    /// Whether the option gets a variable in the constraint model.
    pub fn is_modeled(&self, option: &OptionInfo) -> bool {
        self.excluded_equipment_type.is_empty() || option.equipment_type != self.excluded_equipment_type
    }

    /// Whether the option may stand in for its family in a base state.
    pub fn is_eligible(&self, option: &OptionInfo) -> bool {
        self.is_modeled(option) && !self.is_banned(&option.id)
    }

    /// Whether the option may be added to a base state by a probe.
    pub fn is_candidate(&self, option: &OptionInfo) -> bool {
        self.is_eligible(option) && !(self.skip_standard_candidates && option.is_standard)
    }
}
