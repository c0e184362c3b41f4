//! Fact table shared between steps.

use super::StepActionError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// String-keyed JSON values produced by steps and consumed by later ones.
///
/// Within a forward run the table only grows: a step may add keys but never
/// replace a key another step produced. Keys are removed again when the step
/// that wrote them is rolled back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactTable {
    entries: BTreeMap<String, Value>,
}

impl FactTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for step outputs.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// String view of a fact: strings as-is, everything else as JSON text.
    pub fn get_text(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Fetch a fact a step cannot do without.
    pub fn require(&self, key: &str) -> Result<&Value, StepActionError> {
        self.entries
            .get(key)
            .ok_or_else(|| StepActionError::MissingFact(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merge a step's outputs.
    ///
    /// All-or-nothing: if any key already exists nothing is inserted and
    /// the offending key is returned. On success returns the merged keys.
    pub fn merge(&mut self, outputs: FactTable) -> Result<Vec<String>, String> {
        if let Some(existing) = outputs.keys().find(|k| self.contains(k)) {
            return Err(existing.to_string());
        }
        let keys: Vec<String> = outputs.entries.keys().cloned().collect();
        self.entries.extend(outputs.entries);
        Ok(keys)
    }

    /// Drop the given keys, e.g. when the step that produced them is undone.
    pub fn prune(&mut self, keys: &[String]) {
        for key in keys {
            self.entries.remove(key);
        }
    }
}

impl FromIterator<(String, Value)> for FactTable {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_rejects_existing_keys_atomically() {
        let mut facts = FactTable::new().with("tenant", "contoso");
        let outputs = FactTable::new().with("device_id", "abc").with("tenant", "fabrikam");

        let err = facts.merge(outputs).unwrap_err();
        assert_eq!(err, "tenant");
        assert!(!facts.contains("device_id"));
        assert_eq!(facts.get_text("tenant").as_deref(), Some("contoso"));
    }

    #[test]
    fn test_merge_and_prune() {
        let mut facts = FactTable::new();
        let keys = facts
            .merge(FactTable::new().with("a", 1).with("b", json!({"x": true})))
            .unwrap();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(facts.get_text("a").as_deref(), Some("1"));

        facts.prune(&keys);
        assert!(facts.is_empty());
    }

    #[test]
    fn test_require_missing_fact() {
        let facts = FactTable::new();
        assert!(matches!(
            facts.require("escrow_key"),
            Err(StepActionError::MissingFact(k)) if k == "escrow_key"
        ));
    }
}
