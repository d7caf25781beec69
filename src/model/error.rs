use crate::protocol::{CommandError, ProtocolError};

/// Failure while materializing frames or variable values
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
