//! SGL host: owns the graphics context and executes commands submitted by
//! the client through the shared segment.
//!
//! This crate contains three layers:
//! 1. **Backend** (`backend`, `soft`): the [`GlBackend`] trait every decoded
//!    command ends up calling, plus a deterministic software implementation.
//! 2. **Handlers** (`handlers`): the command id → backend call table.
//! 3. **Dispatcher** (`dispatcher`): the connect handshake, the command cycle,
//!    bulk transfers, framebuffer publication and the stale lock watchdog.

#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod soft;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use sgl_shm::Segment;
use tracing::info;

pub use backend::GlBackend;
pub use config::{ConfigError, HostConfig};
pub use dispatcher::{CycleReport, Dispatcher, DispatcherConfig, PollOutcome};
pub use error::{CycleError, HostError, Result};
pub use soft::SoftGlBackend;

/// Creates the configured segment and serves it with the software backend
/// until `stop` is set.
pub fn serve(config: &HostConfig, stop: Arc<AtomicBool>) -> Result<()> {
    let segment = Arc::new(Segment::open_or_create(&config.shm_name, config.segment_size)?);
    let backend = SoftGlBackend::new(config.version);
    let mut dispatcher = Dispatcher::new(segment, backend, config.dispatcher_config());
    info!(
        name = %config.shm_name,
        size = config.segment_size,
        version = %config.version,
        "host serving"
    );
    dispatcher.run(&config.poll, stop, |outcome| match outcome {
        PollOutcome::Connected { claim_id, version } => {
            info!(claim_id, %version, "session opened");
        }
        PollOutcome::Rejected { active_claim } => {
            info!(active_claim, "second client turned away");
        }
        PollOutcome::WatchdogReset { claim_id } => {
            info!(?claim_id, "session reclaimed by watchdog");
        }
        PollOutcome::Cycle(_) | PollOutcome::Idle => {}
    });
    Ok(())
}
