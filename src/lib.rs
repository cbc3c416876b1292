//! SGL: GL call forwarding over a shared memory segment.
//!
//! - [`protocol`]: segment layout, command encoding and the cycle, handshake
//!   and bulk transfer state machines.
//! - [`shm`]: named and anonymous shared memory segments.
//! - [`host`]: the dispatcher executing commands against a GL backend.
//! - [`client`]: the caller side that forwards calls to the host.

pub use sgl_client as client;
pub use sgl_host as host;
pub use sgl_protocol as protocol;
pub use sgl_shm as shm;

pub use sgl_client::{Client, ClientConfig};
pub use sgl_host::{Dispatcher, HostConfig};
