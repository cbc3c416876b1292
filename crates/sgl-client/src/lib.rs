//! SGL client: the API-compatible caller side.
//!
//! A [`Client`] claims the shared segment, negotiates the API version and
//! then forwards calls one cycle at a time. Payloads larger than a record go
//! through [`BulkUpload`]; large results come back through staged downloads
//! transparently.

#![forbid(unsafe_code)]

pub mod bulk;
pub mod client;
pub mod config;
pub mod error;

pub use bulk::BulkUpload;
pub use client::{Client, FramebufferInfo, Response};
pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, Result};
