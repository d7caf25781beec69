//! Variables of a stack frame
//!
//! Globals and table elements carry the value captured by the batch request
//! that produced them. Only plain locals are resolved on demand, with one
//! `var` round trip per read.

use std::fmt;

use crate::model::error::ModelError;
use crate::model::value::{TableKind, Value};
use crate::protocol::codec::{self, Command, GlobalEntry};
use crate::protocol::command::CommandSender;

/// One entry of a frame's variable list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variable {
    /// Local of frame `frame`, read lazily with `var`
    Local {
        frame: usize,
        name: String,
        /// Value listed in the frame data, if any; never used as the value
        listed: Option<String>,
    },
    Global { name: String, value: String },
    /// Element of a table, e.g. `t[1]`
    Table { name: String, value: String },
    GlobalTable { name: String, elements: Vec<Variable> },
    /// Presentation-only header placed before the globals
    Label {
        name: &'static str,
        value: &'static str,
    },
}

impl Variable {
    pub fn name(&self) -> &str {
        match self {
            Variable::Local { name, .. }
            | Variable::Global { name, .. }
            | Variable::Table { name, .. }
            | Variable::GlobalTable { name, .. } => name.as_str(),
            Variable::Label { name, .. } => name,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(
            self,
            Variable::Global { .. } | Variable::GlobalTable { .. } | Variable::Label { .. }
        )
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Variable::Table { .. } | Variable::GlobalTable { .. })
    }

    pub fn is_label(&self) -> bool {
        matches!(self, Variable::Label { .. })
    }

    /// Whether reading the value costs a command round trip
    pub fn requires_round_trip(&self) -> bool {
        matches!(self, Variable::Local { .. })
    }

    /// Current value; plain locals issue exactly one `var` request
    ///
    /// Globals and table elements return the value captured when the frame
    /// was built.
    pub async fn value<S>(&self, sender: &S) -> Result<Value, ModelError>
    where
        S: CommandSender + ?Sized,
    {
        match self {
            Variable::Local { frame, name, .. } => read_local(sender, *frame, name).await,
            Variable::Global { value, .. } | Variable::Table { value, .. } => {
                Ok(Value::scalar(value.as_str()))
            }
            Variable::GlobalTable { elements, .. } => Ok(Value::Table {
                kind: TableKind::Global,
                elements: elements.clone(),
            }),
            Variable::Label { value, .. } => Ok(Value::scalar(*value)),
        }
    }
}

/// A `var` reply containing `|` is a serialized table; its elements become
/// [`Variable::Table`] entries
async fn read_local<S>(sender: &S, frame: usize, name: &str) -> Result<Value, ModelError>
where
    S: CommandSender + ?Sized,
{
    let reply = sender
        .request(&Command::Var {
            frame,
            name: name.to_string(),
        })
        .await?;

    if !codec::is_table_reply(&reply) {
        return Ok(Value::Scalar(reply));
    }

    let elements = codec::decode_entries(&reply)?
        .into_iter()
        .map(|entry| Variable::Table {
            name: entry.name,
            value: entry.value,
        })
        .collect();

    Ok(Value::Table {
        kind: TableKind::Local,
        elements,
    })
}

impl From<GlobalEntry> for Variable {
    fn from(entry: GlobalEntry) -> Self {
        match entry {
            GlobalEntry::Scalar(entry) => Variable::Global {
                name: entry.name,
                value: entry.value,
            },
            GlobalEntry::Table { name, elements } => Variable::GlobalTable {
                name,
                elements: elements
                    .into_iter()
                    .map(|element| Variable::Table {
                        name: element.name,
                        value: element.value,
                    })
                    .collect(),
            },
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variable::Local {
                name,
                listed: Some(value),
                ..
            } => write!(f, "{name}={value}"),
            Variable::Local { name, .. } | Variable::GlobalTable { name, .. } => f.write_str(name),
            Variable::Global { name, value } | Variable::Table { name, value } => {
                write!(f, "{name}={value}")
            }
            Variable::Label { name, value } => {
                write!(f, "{}", format!("{name} {value}").trim())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedSender;

    fn local(frame: usize, name: &str) -> Variable {
        Variable::Local {
            frame,
            name: name.to_string(),
            listed: None,
        }
    }

    #[tokio::test]
    async fn test_local_value_issues_one_request() {
        let sender = ScriptedSender::with_replies(["42"]);

        let value = local(2, "count").value(&sender).await.unwrap();

        assert_eq!(value, Value::scalar("42"));
        assert_eq!(value.reference_type_name(), "integer");
        assert_eq!(sender.round_trips(), 1);
        assert_eq!(sender.sent_lines(), vec!["var 2 count"]);
    }

    #[tokio::test]
    async fn test_local_value_is_never_cached() {
        let sender = ScriptedSender::with_replies(["1", "2"]);
        let variable = local(0, "x");

        assert_eq!(variable.value(&sender).await.unwrap(), Value::scalar("1"));
        assert_eq!(variable.value(&sender).await.unwrap(), Value::scalar("2"));
        assert_eq!(sender.round_trips(), 2);
    }

    #[tokio::test]
    async fn test_local_table_reply_becomes_table_children() {
        let sender = ScriptedSender::with_replies(["list[1]=3|list[2]=1|"]);

        let value = local(0, "list").value(&sender).await.unwrap();

        assert!(value.is_table());
        assert_eq!(value.value_string(), "table");
        let children: Vec<String> = value.variables().iter().map(ToString::to_string).collect();
        assert_eq!(children, vec!["list[1]=3", "list[2]=1"]);
        assert!(value.variables().iter().all(Variable::is_table));
        assert!(value.variables().iter().all(|v| !v.is_global()));
    }

    #[tokio::test]
    async fn test_global_and_table_reads_skip_round_trips() {
        let sender = ScriptedSender::new();

        let global = Variable::Global {
            name: "g".to_string(),
            value: "5".to_string(),
        };
        let element = Variable::Table {
            name: "t[1]".to_string(),
            value: "10".to_string(),
        };
        let table = Variable::GlobalTable {
            name: "t".to_string(),
            elements: vec![element.clone()],
        };

        assert_eq!(global.value(&sender).await.unwrap(), Value::scalar("5"));
        assert_eq!(element.value(&sender).await.unwrap(), Value::scalar("10"));
        let table_value = table.value(&sender).await.unwrap();
        assert_eq!(table_value.value_string(), "global table");
        assert_eq!(table_value.variables(), &[element]);

        assert_eq!(sender.round_trips(), 0);
    }

    #[tokio::test]
    async fn test_local_value_propagates_rejection() {
        let sender = ScriptedSender::with_replies(["ERROR, command not found: var"]);

        let result = local(0, "x").value(&sender).await;
        assert!(matches!(result, Err(ModelError::Command(_))));
    }

    #[test]
    fn test_flags() {
        let table = Variable::GlobalTable {
            name: "t".to_string(),
            elements: Vec::new(),
        };
        assert!(table.is_global() && table.is_table());
        assert!(!local(0, "x").is_global() && !local(0, "x").is_table());
        assert!(local(0, "x").requires_round_trip());
        assert!(!table.requires_round_trip());
    }

    #[test]
    fn test_display() {
        let listed = Variable::Local {
            frame: 0,
            name: "x".to_string(),
            listed: Some("1".to_string()),
        };
        assert_eq!(listed.to_string(), "x=1");
        assert_eq!(local(0, "y").to_string(), "y");
        assert_eq!(
            Variable::Label {
                name: "GLOBAL",
                value: "VARIABLES"
            }
            .to_string(),
            "GLOBAL VARIABLES"
        );
        assert_eq!(Variable::Label { name: "", value: "" }.to_string(), "");
    }
}
