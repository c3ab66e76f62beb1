//! Embedded components
//!
//! An [`Embeddable`] is a reusable group of columns with no table or key of
//! its own. [`Embedded`] places one inside an entity under a field name; its
//! members become ordinary columns named `<field>.<member>` in the entity's
//! descriptor and are read back together through the unit of work.

use std::collections::BTreeMap;

use super::descriptor::ColumnMapping;

/// Separator between a component field and its member names
pub const MEMBER_SEPARATOR: char = '.';

/// Group of columns stored inline in the owning entity's table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embeddable {
    pub name: String,
    /// Member mappings; `field` is the member name
    pub columns: Vec<ColumnMapping>,
}

impl Embeddable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    #[must_use]
    pub fn column(mut self, column: ColumnMapping) -> Self {
        self.columns.push(column);
        self
    }
}

/// Use of an [`Embeddable`] as one field of an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embedded {
    pub field: String,
    pub embeddable: Embeddable,
    prefix: Option<String>,
    overrides: BTreeMap<String, String>,
}

impl Embedded {
    pub fn new(field: impl Into<String>, embeddable: Embeddable) -> Self {
        Self {
            field: field.into(),
            embeddable,
            prefix: None,
            overrides: BTreeMap::new(),
        }
    }

    /// Prepend `prefix` to every member column not overridden
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Store `member` in `column`
    #[must_use]
    pub fn override_column(mut self, member: impl Into<String>, column: impl Into<String>) -> Self {
        self.overrides.insert(member.into(), column.into());
        self
    }

    /// Member names in declaration order
    pub fn members(&self) -> Vec<String> {
        self.embeddable
            .columns
            .iter()
            .map(|c| c.field.clone())
            .collect()
    }

    /// Entity-level column mappings of the members
    pub fn columns(&self) -> Vec<ColumnMapping> {
        self.embeddable
            .columns
            .iter()
            .map(|member| {
                let column = match (self.overrides.get(&member.field), &self.prefix) {
                    (Some(column), _) => column.clone(),
                    (None, Some(prefix)) => format!("{}{}", prefix, member.column),
                    (None, None) => member.column.clone(),
                };
                let mut mapping = member.clone();
                mapping.field = member_field(&self.field, &member.field);
                mapping.column = column;
                mapping
            })
            .collect()
    }
}

/// Entity field name of `member` inside component `field`
pub fn member_field(field: &str, member: &str) -> String {
    format!("{}{}{}", field, MEMBER_SEPARATOR, member)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ColumnType;

    fn address() -> Embeddable {
        Embeddable::new("Address")
            .column(ColumnMapping::new("street", ColumnType::Text))
            .column(ColumnMapping::new("city", ColumnType::Text).not_null())
    }

    #[test]
    fn test_members_become_dotted_fields() {
        let columns = Embedded::new("home", address()).columns();
        let fields: Vec<_> = columns.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["home.street", "home.city"]);
        assert!(!columns[1].nullable);
    }

    #[test]
    fn test_prefix_and_override_rename_columns() {
        let columns = Embedded::new("billing", address())
            .prefix("billing_")
            .override_column("city", "invoice_city")
            .columns();
        let names: Vec<_> = columns.iter().map(|c| c.column.as_str()).collect();
        assert_eq!(names, vec!["billing_street", "invoice_city"]);
    }
}
