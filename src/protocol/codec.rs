//! Wire codec for the ldb debugger protocol
//!
//! Commands are single text lines terminated by `\n`. Replies and events are
//! single lines whose fields are separated by `|`. Global tables inside a
//! `getglobals` reply are bracketed by sentinel entries:
//!
//! ```text
//! g=5|startglobaltable=startglobaltable|t[1]=10|t[2]=20|endglobaltable=endglobaltable|
//! ```
//!
//! The `stack` reply carries every frame, outermost first, separated by `#`:
//!
//! ```text
//! @sort.lua|12|main|list|i|#@sort.lua|4|swap|a|b|#
//! ```

use std::fmt;

use crate::protocol::error::ProtocolError;

/// Separator between fields of a reply line
pub const FIELD_SEPARATOR: char = '|';

/// Separator between frames of a `stack` reply
pub const FRAME_SEPARATOR: char = '#';

/// Entry opening a global table in a `getglobals` reply
pub const START_GLOBAL_TABLE: &str = "startglobaltable=startglobaltable";

/// Entry closing a global table in a `getglobals` reply
pub const END_GLOBAL_TABLE: &str = "endglobaltable=endglobaltable";

// ============================================================================
// Commands
// ============================================================================

/// Step granularity requested from the debuggee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Into,
    Over,
    Return,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Into => "into",
            StepKind::Over => "over",
            StepKind::Return => "return",
        }
    }
}

/// A request sent on the command channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Whole call stack
    Stack,
    /// Value of one local in a frame
    Var { frame: usize, name: String },
    /// Assign an expression to a local in a frame
    SetVar {
        frame: usize,
        name: String,
        expression: String,
    },
    /// All globals, tables included
    GetGlobals,
    /// Lua value stack
    Data,
    /// Set a line breakpoint in the current script
    Break { line: u32 },
    /// Clear a line breakpoint in the current script
    Clear { line: u32 },
    Step(StepKind),
    Resume,
    Suspend,
    Terminate,
}

impl Command {
    /// Command keyword, used for logging and error context
    pub fn name(&self) -> &'static str {
        match self {
            Command::Stack => "stack",
            Command::Var { .. } => "var",
            Command::SetVar { .. } => "setvar",
            Command::GetGlobals => "getglobals",
            Command::Data => "data",
            Command::Break { .. } => "break",
            Command::Clear { .. } => "clear",
            Command::Step(_) => "step",
            Command::Resume => "resume",
            Command::Suspend => "suspend",
            Command::Terminate => "terminate",
        }
    }

    /// Encode as a newline-terminated wire line
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Var { frame, name } => write!(f, "var {frame} {name}"),
            Command::SetVar {
                frame,
                name,
                expression,
            } => write!(f, "setvar {frame} {name} {expression}"),
            Command::Break { line } => write!(f, "break {line}"),
            Command::Clear { line } => write!(f, "clear {line}"),
            Command::Step(kind) => write!(f, "step {}", kind.as_str()),
            other => f.write_str(other.name()),
        }
    }
}

// ============================================================================
// Field decoding
// ============================================================================

/// Split a reply line into its `|` separated fields
///
/// The line terminator and trailing empty fields (ldb ends every entry with
/// a separator) are dropped. Interior empty fields are kept.
pub fn decode_fields(line: &str) -> Vec<&str> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    while fields.last().is_some_and(|field| field.is_empty()) {
        fields.pop();
    }
    fields
}

/// One `name=value` entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    pub name: String,
    pub value: String,
}

impl Entry {
    /// Parse `name=value`, splitting at the first `=`
    pub fn parse(field: &str) -> Result<Self, ProtocolError> {
        let (name, value) = field
            .split_once('=')
            .ok_or_else(|| ProtocolError::MissingField {
                field: "value",
                input: field.to_string(),
            })?;
        Ok(Self {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    /// Wire form `name=value`
    pub fn to_wire(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// Decode a `|` separated list of `name=value` entries (a local table)
pub fn decode_entries(line: &str) -> Result<Vec<Entry>, ProtocolError> {
    decode_fields(line)
        .into_iter()
        .filter(|field| !field.is_empty())
        .map(Entry::parse)
        .collect()
}

/// Whether a `var` reply is a serialized table rather than a scalar
pub fn is_table_reply(reply: &str) -> bool {
    reply.contains(FIELD_SEPARATOR)
}

// ============================================================================
// Globals
// ============================================================================

/// One logical entry of a `getglobals` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalEntry {
    Scalar(Entry),
    Table { name: String, elements: Vec<Entry> },
}

/// Name of a global table, taken from the prefix of its first element
/// (`t[1]=10` names the table `t`)
pub fn table_name(elements: &[Entry]) -> String {
    elements
        .first()
        .map(|first| {
            first
                .name
                .split_once('[')
                .map_or(first.name.as_str(), |(prefix, _)| prefix)
                .to_string()
        })
        .unwrap_or_default()
}

/// Decode a `getglobals` reply
///
/// Scans the fields once with a `counting` flag: outside a table every entry
/// counts as one global; a start sentinel switches counting off and collects
/// elements until the end sentinel switches it back on, yielding a single
/// table entry. Tables do not nest.
pub fn decode_globals(line: &str) -> Result<Vec<GlobalEntry>, ProtocolError> {
    let mut globals = Vec::new();
    let mut counting = true;
    let mut table_start = 0;
    let mut elements = Vec::new();

    for (position, field) in decode_fields(line).into_iter().enumerate() {
        if field.is_empty() {
            continue;
        }

        if field == START_GLOBAL_TABLE {
            if !counting {
                return Err(ProtocolError::NestedTable { position });
            }
            counting = false;
            table_start = position;
        } else if field == END_GLOBAL_TABLE {
            if counting {
                return Err(ProtocolError::UnexpectedTableEnd { position });
            }
            counting = true;
            let elements = std::mem::take(&mut elements);
            globals.push(GlobalEntry::Table {
                name: table_name(&elements),
                elements,
            });
        } else if counting {
            globals.push(GlobalEntry::Scalar(Entry::parse(field)?));
        } else {
            elements.push(Entry::parse(field)?);
        }
    }

    if !counting {
        return Err(ProtocolError::UnterminatedTable {
            position: table_start,
        });
    }

    Ok(globals)
}

// ============================================================================
// Stack frames
// ============================================================================

/// Split a `stack` reply into per-frame data, outermost frame first
pub fn split_stack(blob: &str) -> Vec<&str> {
    blob.trim_end_matches(['\r', '\n'])
        .split(FRAME_SEPARATOR)
        .map(str::trim)
        .filter(|frame| !frame.is_empty())
        .collect()
}

/// A local as listed in frame data: `name=value` or a bare `name`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalField {
    pub name: String,
    pub value: Option<String>,
}

impl LocalField {
    pub fn parse(field: &str) -> Self {
        match field.split_once('=') {
            Some((name, value)) => Self {
                name: name.to_string(),
                value: Some(value.to_string()),
            },
            None => Self {
                name: field.to_string(),
                value: None,
            },
        }
    }

    /// Wire form, as it appeared in the frame data
    pub fn to_wire(&self) -> String {
        match &self.value {
            Some(value) => format!("{}={}", self.name, value),
            None => self.name.clone(),
        }
    }
}

/// Decoded `file|pc|name|locals...` frame data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    pub file: String,
    pub line: u32,
    pub function: String,
    pub locals: Vec<LocalField>,
}

/// Decode one frame of a `stack` reply
pub fn decode_frame(data: &str) -> Result<FrameRecord, ProtocolError> {
    let fields = decode_fields(data);
    let mut fields = fields.into_iter();

    let missing = |field| ProtocolError::MissingField {
        field,
        input: data.to_string(),
    };

    let file = fields.next().filter(|f| !f.is_empty()).ok_or_else(|| missing("file"))?;
    let pc = fields.next().ok_or_else(|| missing("program counter"))?;
    let function = fields.next().ok_or_else(|| missing("frame name"))?;

    let line = pc
        .trim()
        .parse::<u32>()
        .map_err(|_| ProtocolError::InvalidProgramCounter {
            value: pc.to_string(),
        })?;

    let locals = fields
        .filter(|field| !field.is_empty())
        .map(LocalField::parse)
        .collect();

    Ok(FrameRecord {
        file: file.to_string(),
        line,
        function: function.to_string(),
        locals,
    })
}
