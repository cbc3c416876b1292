//! Shared memory segments for SGL.
//!
//! A [`Segment`] is either a POSIX shared memory object mapped with
//! `MAP_SHARED` (the host creates it, the client attaches) or a heap
//! allocation with identical semantics for in-process use.

mod error;
mod mapping;
mod segment;

pub use error::{Result, ShmError};
pub use segment::Segment;
