use sgl_protocol::{BoundsError, CodecError, Status, TransferSizeError};
use sgl_shm::ShmError;
use thiserror::Error;

use crate::config::ConfigError;

/// Fatal host failures.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = HostError> = std::result::Result<T, E>;

/// Why a single cycle failed. The cycle still completes; the error only
/// decides the published status.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Bounds(#[from] BoundsError),

    #[error(transparent)]
    TransferSize(#[from] TransferSizeError),

    #[error("command submitted without a connected session")]
    NotConnected,
}

impl CycleError {
    pub fn status(&self) -> Status {
        match self {
            Self::Codec(err) => err.status(),
            Self::Bounds(_) => Status::Bounds,
            Self::TransferSize(_) => Status::TransferSize,
            Self::NotConnected => Status::NotConnected,
        }
    }
}
