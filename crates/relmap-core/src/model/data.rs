use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::value::{Key, Value};

/// Detached field values of one entity
///
/// Used to attach rows loaded elsewhere, to merge state across units of work
/// and as the read-only view returned by `snapshot`. `references` holds the
/// target keys of owning to-one relationships, keyed by relationship name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityData {
    pub entity_type: String,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
    #[serde(default)]
    pub references: BTreeMap<String, Key>,
}

impl EntityData {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            values: BTreeMap::new(),
            references: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_reference(mut self, relationship: impl Into<String>, key: impl Into<Key>) -> Self {
        self.references.insert(relationship.into(), key.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(field.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_values() {
        let data = EntityData::new("Book")
            .with("title", "Ruslan and Ludmila")
            .with_reference("author", 1);
        assert_eq!(data.get("title"), Some(&Value::from("Ruslan and Ludmila")));
        assert_eq!(data.references.get("author"), Some(&Key::Int(1)));
    }

    #[test]
    fn test_deserializes_without_references() {
        let data: EntityData =
            serde_json::from_str(r#"{"entity_type":"Tag","values":{"name":"poetry"}}"#).unwrap();
        assert!(data.references.is_empty());
        assert_eq!(data.get("name"), Some(&Value::from("poetry")));
    }
}
