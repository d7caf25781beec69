//! Wire-level decoding errors

/// Malformed data received from the debuggee
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// A required field is absent from a frame or entry
    #[error("Missing {field} in {input:?}")]
    MissingField { field: &'static str, input: String },

    /// Frame program counter is not a line number
    #[error("Invalid program counter: {value:?}")]
    InvalidProgramCounter { value: String },

    /// `startglobaltable` without a matching `endglobaltable`
    #[error("Global table starting at field {position} is never closed")]
    UnterminatedTable { position: usize },

    /// `endglobaltable` without an open table
    #[error("Unexpected end of global table at field {position}")]
    UnexpectedTableEnd { position: usize },

    /// `startglobaltable` while a table is already open
    #[error("Nested global table at field {position}")]
    NestedTable { position: usize },
}
