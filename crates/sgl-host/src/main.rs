#![forbid(unsafe_code)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sgl_host::HostConfig;
use sgl_protocol::ApiVersion;

#[derive(Parser, Debug)]
#[command(
    name = "sgl-host",
    about = "Serve graphics API calls submitted through the SGL shared memory segment."
)]
struct Args {
    /// Shared memory object name (overrides SGL_SHM_NAME)
    #[arg(long, value_name = "NAME")]
    shm_name: Option<String>,

    /// Segment size in bytes (overrides SGL_SHM_SIZE)
    #[arg(long, value_name = "BYTES")]
    segment_size: Option<usize>,

    /// Highest API version offered, as major.minor (overrides SGL_GL_VERSION)
    #[arg(long, value_name = "VERSION")]
    gl_version: Option<ApiVersion>,

    /// Reclaim a lock held without a submission after this many milliseconds
    /// (overrides SGL_STALE_LOCK_MS)
    #[arg(long, value_name = "MS")]
    stale_lock_ms: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = HostConfig::from_env().context("invalid host configuration")?;
    if let Some(name) = args.shm_name {
        config.shm_name = name;
    }
    if let Some(size) = args.segment_size {
        config.segment_size = size;
    }
    if let Some(version) = args.gl_version {
        config.version = version;
    }
    if let Some(ms) = args.stale_lock_ms {
        config.stale_lock_timeout = Duration::from_millis(ms);
    }

    // No signal handling: the loop runs until the process is killed, and the
    // next host start reclaims the leftover segment.
    let stop = Arc::new(AtomicBool::new(false));
    sgl_host::serve(&config, stop)
        .with_context(|| format!("failed to serve shared segment {}", config.shm_name))
}
