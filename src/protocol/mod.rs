//! ldb wire protocol
//!
//! - **Codec**: command encoding and reply/frame/global decoding
//! - **Framing**: newline framing over any [`Transport`](crate::io::Transport)
//! - **Command**: serialized request/response channel
//! - **Event**: background listener on the event socket

pub mod codec;
pub mod command;
pub mod error;
pub mod event;
pub mod framing;

pub use codec::{Command, Entry, FrameRecord, GlobalEntry, LocalField, StepKind};
pub use command::{CommandChannel, CommandError, CommandSender, SharedCommandChannel};
pub use error::ProtocolError;
pub use event::{
    DebugEvent, EventChannel, EventParser, LdbEventParser, ResumeReason, SuspendReason,
};
pub use framing::{LineFraming, LineFramingError};
