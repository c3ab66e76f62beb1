//! Seed parser with validation
//!
//! Checks the schema version and that seeded keys are unique per entity
//! type. Entity types, fields and relationships are checked on import
//! against the registry.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use relmap_core::Key;

use crate::errors::{seed_validation, Result};
use crate::seed::format::SeedV0;

/// Parse a seed file from a path
pub fn parse_seed_file(path: &Path) -> Result<SeedV0> {
    let content = fs::read_to_string(path)
        .map_err(|e| seed_validation(&format!("Failed to read seed file: {}", e)))?;

    parse_seed_str(&content)
}

/// Parse a seed from a string
pub fn parse_seed_str(content: &str) -> Result<SeedV0> {
    let seed: SeedV0 = serde_yaml::from_str(content)
        .map_err(|e| seed_validation(&format!("YAML parse error: {}", e)))?;

    validate_seed(&seed)?;

    Ok(seed)
}

fn validate_seed(seed: &SeedV0) -> Result<()> {
    if seed.schema_version != 0 {
        return Err(seed_validation(&format!(
            "Unsupported schema_version: {}. Expected 0",
            seed.schema_version
        )));
    }

    let mut seen: HashSet<(&str, Key)> = HashSet::new();
    for entity in &seed.entities {
        if entity.entity_type.is_empty() {
            return Err(seed_validation("Entity without entity_type"));
        }
        // Keys named `id` are the only ones the parser can see without a registry
        if let Some(key) = entity.values.get("id").and_then(Key::from_value) {
            if !seen.insert((entity.entity_type.as_str(), key.clone())) {
                return Err(seed_validation(&format!(
                    "Duplicate key {} for entity type {}",
                    key, entity.entity_type
                )));
            }
        }
    }

    for link in &seed.links {
        if link.relationship.is_empty() {
            return Err(seed_validation(&format!(
                "Link from {} {} has no relationship",
                link.entity_type, link.key
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::ExErrorKind;

    #[test]
    fn test_minimal_seed_parses() {
        let seed = parse_seed_str("schema_version: 0\n").unwrap();
        assert!(seed.entities.is_empty());
        assert!(seed.links.is_empty());
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let err = parse_seed_str("schema_version: 1\n").unwrap_err();
        assert_eq!(err.kind(), ExErrorKind::InvalidInput);
        assert_eq!(err.op(), Some("seed_parse"));
        assert!(err.message().contains("schema_version"));
    }

    #[test]
    fn test_duplicate_keys_are_rejected() {
        let yaml = r#"
schema_version: 0
entities:
  - entity_type: Author
    values: { id: 1, name: A }
  - entity_type: Author
    values: { id: 1, name: B }
"#;
        let err = parse_seed_str(yaml).unwrap_err();
        assert!(err.message().contains("Duplicate key 1"));
    }

    #[test]
    fn test_invalid_yaml_is_rejected() {
        let err = parse_seed_str("schema_version: [").unwrap_err();
        assert!(err.message().starts_with("YAML parse error"));
    }
}
