use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::BaseState;

/// The oracle's answer to "what happens if `option_added` is added to
/// `base_options`".
///
/// Field names follow the JSON artifacts written by earlier runs, so caches
/// and constraint files stay interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub option_added: String,
    pub base_options: BaseState,
    /// Options the engine switched on as a consequence.
    #[serde(default)]
    pub engine_added_options: Vec<String>,
    /// Options the engine switched off as a consequence.
    #[serde(default)]
    pub removed_options: Vec<String>,
    #[serde(default)]
    pub user_added_options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feasible_options: Option<serde_json::Value>,
}

impl Observation {
    /// An observation with no effects.
    pub fn new(option_added: impl Into<String>, base_options: BaseState) -> Self {
        Self {
            option_added: option_added.into(),
            base_options,
            engine_added_options: Vec::new(),
            removed_options: Vec::new(),
            user_added_options: Vec::new(),
            feasible_options: None,
        }
    }

    pub fn with_engine_added(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.engine_added_options = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_removed(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.removed_options = ids.into_iter().map(Into::into).collect();
        self
    }
}

/// Reads a JSON array of observations.
///
/// Records without an added option (missing, `null` or empty
/// `optionAdded`) say nothing about a rule and are skipped with a warning.
pub fn load_observations(path: impl AsRef<Path>) -> Result<Vec<Observation>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let records: Vec<serde_json::Value> = serde_json::from_str(&text).map_err(|e| Error::json(path, e))?;

    let mut observations = Vec::with_capacity(records.len());
    let mut skipped = 0;
    for record in records {
        let has_option = record
            .get("optionAdded")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|id| !id.is_empty());
        if !has_option {
            skipped += 1;
            continue;
        }
        observations.push(serde_json::from_value(record).map_err(|e| Error::json(path, e))?);
    }
    if skipped > 0 {
        log::warn!("Skipped {} records without optionAdded in {}", skipped, path.display());
    }
    Ok(observations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_layout() {
        let json = r#"{
            "optionAdded": "B",
            "baseOptions": ["Z", "A"],
            "engineAddedOptions": ["C"],
            "removedOptions": [],
            "status": null
        }"#;
        let obs: Observation = serde_json::from_str(json).unwrap();
        assert_eq!(obs.option_added, "B");
        assert_eq!(obs.base_options, BaseState::new(["A", "Z"]));
        assert_eq!(obs.engine_added_options, ["C"]);
        assert!(obs.user_added_options.is_empty());
        assert!(obs.feasible_options.is_none());

        let back = serde_json::to_value(&obs).unwrap();
        assert_eq!(back["baseOptions"], serde_json::json!(["A", "Z"]));
        assert!(back.get("feasibleOptions").is_none());
    }

    #[test]
    fn test_load_skips_records_without_option() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feasibility.json");
        std::fs::write(
            &path,
            r#"[
                {"optionAdded": "B", "baseOptions": ["A"], "removedOptions": ["C"]},
                {"optionAdded": null, "baseOptions": ["A"]},
                {"optionAdded": "", "baseOptions": []},
                {"baseOptions": ["A"]}
            ]"#,
        )
        .unwrap();

        let observations = load_observations(&path).unwrap();
        assert_eq!(observations, [Observation::new("B", BaseState::new(["A"])).with_removed(["C"])]);
    }

    #[test]
    fn test_load_rejects_malformed_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"[{"optionAdded": "B", "baseOptions": 7}]"#).unwrap();
        assert!(matches!(load_observations(&path), Err(Error::Json { .. })));
    }
}
