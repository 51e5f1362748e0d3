//! Per-model pricing table, loaded once at startup from a JSON mapping.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Prices for a single model, all expressed per 1000 tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricingEntry {
    pub input: f64,
    pub output: f64,
    pub cache: f64,
    /// Whether this model supports structured (JSON-schema) output.
    #[serde(default)]
    pub json_schema: bool,
}

impl PricingEntry {
    fn validate(&self, model: &str) -> Result<()> {
        if self.input < 0.0 || self.output < 0.0 || self.cache < 0.0 {
            return Err(DispatchError::Config(format!(
                "model '{model}' has a negative price entry"
            )));
        }
        if self.cache > self.input {
            return Err(DispatchError::Config(format!(
                "model '{model}' has cache price greater than input price"
            )));
        }
        Ok(())
    }

    /// Cost of one call.
    pub fn cost(&self, input_tokens: u32, output_tokens: u32, cached_tokens: u32) -> f64 {
        let uncached = (input_tokens.saturating_sub(cached_tokens)) as f64;
        let cached = cached_tokens as f64;
        let output = output_tokens as f64;
        (uncached * self.input + cached * self.cache + output * self.output) / 1000.0
    }
}

/// Static mapping from model name to [`PricingEntry`].
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: HashMap<String, PricingEntry>,
}

impl PricingTable {
    /// Build a table from an already-parsed map, validating every entry.
    pub fn from_entries(entries: HashMap<String, PricingEntry>) -> Result<Self> {
        for (model, entry) in &entries {
            entry.validate(model)?;
        }
        Ok(Self { entries })
    }

    /// Parse a table from a JSON string of the form
    /// `{"model-name": {"input": 0.001, "output": 0.002, "cache": 0.0005}}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: HashMap<String, PricingEntry> = serde_json::from_str(json)
            .map_err(|e| DispatchError::Config(format!("invalid pricing table json: {e}")))?;
        Self::from_entries(entries)
    }

    /// Load a table from a JSON file on disk.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DispatchError::Config(format!("failed to read pricing table {}: {e}", path.display()))
        })?;
        Self::from_json(&contents)
    }

    pub fn get(&self, model: &str) -> Option<&PricingEntry> {
        self.entries.get(model)
    }

    /// Whether `model` is present and supports structured output.
    pub fn supports_json_schema(&self, model: &str) -> bool {
        self.entries.get(model).is_some_and(|e| e.json_schema)
    }

    /// Models in the table that support structured output, for the
    /// `SchemaUnsupported` error's "compatible models" list.
    pub fn compatible_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.json_schema)
            .map(|(model, _)| model.clone())
            .collect();
        models.sort();
        models
    }

    pub fn contains(&self, model: &str) -> bool {
        self.entries.contains_key(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> PricingTable {
        let json = r#"{
            "gpt-fast": {"input": 0.001, "output": 0.002, "cache": 0.0005, "json_schema": true},
            "gpt-slow": {"input": 0.01, "output": 0.03, "cache": 0.005}
        }"#;
        PricingTable::from_json(json).unwrap()
    }

    #[test]
    fn cost_law_matches_spec_example() {
        let table = sample_table();
        let entry = table.get("gpt-fast").unwrap();
        let cost = entry.cost(50, 20, 10);
        assert!((cost - 0.000_085).abs() < 1e-9);
    }

    #[test]
    fn schema_support_is_per_model() {
        let table = sample_table();
        assert!(table.supports_json_schema("gpt-fast"));
        assert!(!table.supports_json_schema("gpt-slow"));
        assert_eq!(table.compatible_models(), vec!["gpt-fast".to_string()]);
    }

    #[test]
    fn rejects_cache_price_above_input_price() {
        let mut entries = HashMap::new();
        entries.insert(
            "bad-model".to_string(),
            PricingEntry {
                input: 0.001,
                output: 0.002,
                cache: 0.01,
                json_schema: false,
            },
        );
        assert!(PricingTable::from_entries(entries).is_err());
    }

    #[test]
    fn unknown_model_is_not_contained() {
        let table = sample_table();
        assert!(!table.contains("does-not-exist"));
    }
}
