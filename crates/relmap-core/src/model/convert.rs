//! Per-column value conversion
//!
//! A converter sits between a field and its column: the unit of work and
//! callers see the field type, the store sees the column type. Null never
//! reaches a converter.

use std::fmt;
use std::sync::Arc;

use super::value::{ColumnType, Value};

/// Two-way mapping between a field value and its stored form
pub trait AttributeConverter: Send + Sync {
    /// Type of the values the field holds
    fn field_type(&self) -> ColumnType;

    /// Stored form of a non-null field value
    fn to_column(&self, value: Value) -> Result<Value, String>;

    /// Field value of a non-null stored value
    fn to_field(&self, value: Value) -> Result<Value, String>;
}

/// Named, shareable converter attached to a column mapping
///
/// Converters compare by name so that descriptors stay comparable.
#[derive(Clone)]
pub struct Converter {
    name: String,
    inner: Arc<dyn AttributeConverter>,
}

impl Converter {
    pub fn new(name: impl Into<String>, converter: impl AttributeConverter + 'static) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(converter),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> ColumnType {
        self.inner.field_type()
    }

    pub fn to_column(&self, value: Value) -> Result<Value, String> {
        self.inner.to_column(value)
    }

    pub fn to_field(&self, value: Value) -> Result<Value, String> {
        self.inner.to_field(value)
    }
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter").field("name", &self.name).finish()
    }
}

impl PartialEq for Converter {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Converter {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Booleans stored as 'Y' / 'N'
    struct YesNo;

    impl AttributeConverter for YesNo {
        fn field_type(&self) -> ColumnType {
            ColumnType::Bool
        }

        fn to_column(&self, value: Value) -> Result<Value, String> {
            match value {
                Value::Bool(true) => Ok(Value::from("Y")),
                Value::Bool(false) => Ok(Value::from("N")),
                other => Err(format!("expected bool, got {}", other.type_name())),
            }
        }

        fn to_field(&self, value: Value) -> Result<Value, String> {
            match value.as_str() {
                Some("Y") => Ok(Value::Bool(true)),
                Some("N") => Ok(Value::Bool(false)),
                _ => Err(format!("not a Y/N flag: {}", value)),
            }
        }
    }

    #[test]
    fn test_converter_maps_both_ways() {
        let converter = Converter::new("yes_no", YesNo);
        assert_eq!(converter.field_type(), ColumnType::Bool);
        assert_eq!(converter.to_column(Value::Bool(true)), Ok(Value::from("Y")));
        assert_eq!(converter.to_field(Value::from("N")), Ok(Value::Bool(false)));
        assert!(converter.to_field(Value::from("maybe")).is_err());
    }

    #[test]
    fn test_converters_compare_by_name() {
        assert_eq!(Converter::new("yes_no", YesNo), Converter::new("yes_no", YesNo));
        assert_ne!(Converter::new("yes_no", YesNo), Converter::new("flag", YesNo));
        assert_eq!(format!("{:?}", Converter::new("yes_no", YesNo)), "Converter { name: \"yes_no\" }");
    }
}
