use sgl_protocol::{
    BoundsError, CodecError, CommandId, ReturnKind, Status, TransferSizeError, WaitError,
};
use sgl_shm::ShmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error("segment already claimed by session {claim_id}")]
    AlreadyConnected { claim_id: u32 },

    #[error("host unresponsive: {0}")]
    HostUnresponsive(#[from] WaitError),

    #[error("{command} failed: {status}")]
    Protocol { command: CommandId, status: Status },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Bounds(#[from] BoundsError),

    #[error(transparent)]
    TransferSize(#[from] TransferSizeError),

    #[error("host published unknown status {0}")]
    UnknownStatus(u32),

    #[error("client is not connected")]
    NotConnected,

    #[error("{command} did not produce a {expected:?} reply")]
    UnexpectedReply {
        command: CommandId,
        expected: ReturnKind,
    },
}

impl ClientError {
    /// Wire status for cycle-local failures; `None` for connection-level ones.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
