//! Stack and variable model
//!
//! Built from `stack`, `getglobals` and `var` replies. Globals and whole
//! tables are fetched in batch when a frame is built; plain locals are read
//! on demand.

pub mod error;
pub mod frame;
pub mod stack;
pub mod value;
pub mod variable;

pub use error::ModelError;
pub use frame::{GLOBAL_LABELS, GlobalLabels, StackFrame, ThreadId};
pub use stack::StackSnapshot;
pub use value::{TableKind, Value};
pub use variable::Variable;
