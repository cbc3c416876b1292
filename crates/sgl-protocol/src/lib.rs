//! Wire protocol shared by the SGL host and client.
//!
//! The two peers talk through a single shared memory segment: a page of
//! control registers, a command area holding one encoded command at a time,
//! and a framebuffer region. This crate defines that layout and the state
//! machines that run over it, independent of how the segment is mapped.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod bulk;
pub mod codec;
pub mod command;
pub mod cycle;
pub mod error;
pub mod gl;
pub mod handshake;
pub mod layout;
pub mod regs;

pub use backoff::{Backoff, SpinPolicy, Wait};
pub use codec::{Arg, Call};
pub use command::{ArgKind, CommandId, ReturnKind, COMMAND_TABLE};
pub use error::{BoundsError, CodecError, Status, TransferSizeError, WaitError};
pub use handshake::ApiVersion;
pub use regs::{Reg, RegisterFile};
