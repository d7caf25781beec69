//! Immutable value snapshots

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::model::variable::Variable;

/// Origin of a table value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    /// Decoded from a `var` reply
    Local,
    /// Collected from a `getglobals` reply
    Global,
}

impl TableKind {
    pub fn label(&self) -> &'static str {
        match self {
            TableKind::Local => "table",
            TableKind::Global => "global table",
        }
    }
}

/// Snapshot of a variable's value
///
/// Equality and hashing use [`Value::value_string`] only, so two tables of
/// the same kind compare equal regardless of their elements.
#[derive(Debug, Clone)]
pub enum Value {
    Scalar(String),
    Table {
        kind: TableKind,
        elements: Vec<Variable>,
    },
}

impl Value {
    pub fn scalar(value: impl Into<String>) -> Self {
        Value::Scalar(value.into())
    }

    /// Display string: the scalar text, or the table label
    pub fn value_string(&self) -> &str {
        match self {
            Value::Scalar(value) => value,
            Value::Table { kind, .. } => kind.label(),
        }
    }

    /// `integer` when the value string parses as an integer, `text` otherwise
    pub fn reference_type_name(&self) -> &'static str {
        if self.value_string().parse::<i32>().is_ok() {
            "integer"
        } else {
            "text"
        }
    }

    /// Child variables of a table, empty for scalars
    pub fn variables(&self) -> &[Variable] {
        match self {
            Value::Scalar(_) => &[],
            Value::Table { elements, .. } => elements,
        }
    }

    pub fn has_variables(&self) -> bool {
        !self.variables().is_empty()
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Value::Table { .. })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.value_string() == other.value_string()
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value_string().hash(state);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_reference_type_name() {
        assert_eq!(Value::scalar("42").reference_type_name(), "integer");
        assert_eq!(Value::scalar("-7").reference_type_name(), "integer");
        assert_eq!(Value::scalar("3.5").reference_type_name(), "text");
        assert_eq!(Value::scalar("hello").reference_type_name(), "text");
        assert_eq!(Value::scalar("").reference_type_name(), "text");
        assert_eq!(Value::scalar("99999999999").reference_type_name(), "text");

        let table = Value::Table {
            kind: TableKind::Local,
            elements: Vec::new(),
        };
        assert_eq!(table.reference_type_name(), "text");
    }

    #[test]
    fn test_table_labels_and_children() {
        let elements = vec![Variable::Table {
            name: "t[1]".to_string(),
            value: "10".to_string(),
        }];
        let global = Value::Table {
            kind: TableKind::Global,
            elements,
        };

        assert_eq!(global.value_string(), "global table");
        assert!(global.has_variables());
        assert_eq!(global.variables()[0].name(), "t[1]");

        let empty = Value::Table {
            kind: TableKind::Local,
            elements: Vec::new(),
        };
        assert_eq!(empty.value_string(), "table");
        assert!(!empty.has_variables());
        assert!(!Value::scalar("1").has_variables());
    }

    #[test]
    fn test_equality_by_string() {
        assert_eq!(Value::scalar("5"), Value::scalar("5"));
        assert_ne!(Value::scalar("5"), Value::scalar("6"));
        assert_eq!(Value::scalar("table"), Value::Table {
            kind: TableKind::Local,
            elements: Vec::new(),
        });

        let set: HashSet<Value> = [Value::scalar("a"), Value::scalar("a"), Value::scalar("b")]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
    }
}
