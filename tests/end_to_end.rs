//! Real client against a real host thread, both mapping the same segment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use pretty_assertions::assert_eq;
use sgl::client::ClientError;
use sgl::host::{Dispatcher, DispatcherConfig, HostConfig, PollOutcome, SoftGlBackend};
use sgl::protocol::codec::bytes_to_u32s;
use sgl::protocol::gl;
use sgl::protocol::layout::{FRAMEBUFFER_REGION_OFFSET, LOCK_CLIENT, LOCK_FREE, MIN_SEGMENT_BYTES};
use sgl::protocol::{ApiVersion, Arg, CommandId, Reg, RegisterFile, SpinPolicy, Status};
use sgl::shm::Segment;
use sgl::{Client, ClientConfig};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A dispatcher polling on its own thread until dropped.
struct HostThread {
    stop: Arc<AtomicBool>,
    events: Receiver<PollOutcome>,
    handle: Option<JoinHandle<()>>,
}

impl HostThread {
    fn spawn(segment: Arc<Segment>) -> Self {
        init_tracing();
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, events) = mpsc::channel();
        let handle = thread::spawn({
            let stop = Arc::clone(&stop);
            move || {
                let backend = SoftGlBackend::new(ApiVersion::DEFAULT);
                let mut dispatcher = Dispatcher::new(segment, backend, DispatcherConfig::default());
                dispatcher.run(&SpinPolicy::default(), stop, |outcome| {
                    let _ = tx.send(*outcome);
                });
            }
        });
        Self {
            stop,
            events,
            handle: Some(handle),
        }
    }

    fn connections(&self) -> Vec<u32> {
        self.events
            .try_iter()
            .filter_map(|event| match event {
                PollOutcome::Connected { claim_id, .. } => Some(claim_id),
                _ => None,
            })
            .collect()
    }
}

impl Drop for HostThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

fn segment(size: usize) -> Arc<Segment> {
    Arc::new(Segment::anonymous(size).unwrap())
}

fn config() -> ClientConfig {
    ClientConfig::default().with_timeout(Some(Duration::from_secs(10)))
}

#[test]
fn connect_nop_and_disconnect() {
    let segment = segment(1 << 22);
    let host = HostThread::spawn(Arc::clone(&segment));

    let client = Client::connect(Arc::clone(&segment), &config()).unwrap();
    assert_ne!(client.claim_id(), 0);
    assert_eq!(client.version(), ApiVersion::new(4, 6));
    client.nop().unwrap();
    assert_eq!(segment.load(Reg::Lock), LOCK_FREE);

    let claim_id = client.claim_id();
    client.disconnect().unwrap();
    assert_eq!(segment.load(Reg::ClaimId), 0);
    assert_eq!(host.connections(), vec![claim_id]);
}

#[test]
fn second_client_is_turned_away_until_the_first_leaves() {
    let segment = segment(1 << 22);
    let _host = HostThread::spawn(Arc::clone(&segment));

    let first = Client::connect(Arc::clone(&segment), &config()).unwrap();
    let err = Client::connect(Arc::clone(&segment), &config()).unwrap_err();
    assert!(matches!(
        err,
        ClientError::AlreadyConnected { claim_id } if claim_id == first.claim_id()
    ));
    // The rejected attempt left the session alone.
    first.nop().unwrap();

    let first_claim = first.claim_id();
    drop(first);
    let second = Client::connect(Arc::clone(&segment), &config()).unwrap();
    assert_ne!(second.claim_id(), first_claim);
    second.nop().unwrap();
}

#[test]
fn framebuffer_round_trip_at_800x600() {
    let segment = segment(1 << 22);
    let _host = HostThread::spawn(Arc::clone(&segment));
    let client = Client::connect(Arc::clone(&segment), &config()).unwrap();

    client.report_dims(800, 600).unwrap();
    assert_eq!(client.get_size().unwrap(), (800, 600));
    client
        .call(
            CommandId::ClearColor,
            vec![Arg::F32(0.0), Arg::F32(0.0), Arg::F32(1.0), Arg::F32(1.0)],
        )
        .unwrap();
    client
        .call(CommandId::Clear, vec![Arg::U32(gl::COLOR_BUFFER_BIT)])
        .unwrap();

    let info = client.request_framebuffer(800, 600).unwrap();
    assert_eq!(info.offset, FRAMEBUFFER_REGION_OFFSET);
    assert_eq!(info.len, 800 * 600 * 4);
    let frame = client.read_framebuffer(&info).unwrap();
    assert_eq!(&frame[..4], &[255, 0, 0, 255]);
    assert_eq!(&frame[frame.len() - 4..], &[255, 0, 0, 255]);
}

#[test]
fn framebuffer_larger_than_the_segment_is_a_bounds_error() {
    let segment = segment(1 << 20);
    let _host = HostThread::spawn(Arc::clone(&segment));
    let client = Client::connect(Arc::clone(&segment), &config()).unwrap();

    let err = client.request_framebuffer(800, 600).unwrap_err();
    assert_eq!(err.status(), Some(Status::Bounds));
    // The session is still usable.
    client.nop().unwrap();
    assert_eq!(client.get_size().unwrap(), (0, 0));
}

#[test]
fn bulk_upload_holds_the_lock_across_blocks() {
    let segment = segment(1 << 22);
    let _host = HostThread::spawn(Arc::clone(&segment));
    let client = Client::connect(Arc::clone(&segment), &config()).unwrap();

    let names = client
        .call(CommandId::GenBuffers, vec![Arg::U32(1)])
        .unwrap()
        .into_bytes()
        .unwrap();
    let id = bytes_to_u32s(&names)[0];
    client
        .call(
            CommandId::BindBuffer,
            vec![Arg::U32(gl::ARRAY_BUFFER), Arg::U32(id)],
        )
        .unwrap();

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let mut upload = client.begin_upload(&payload).unwrap();
    let mut remaining = Vec::new();
    while let Some(left) = upload.send_next().unwrap() {
        assert_eq!(segment.load(Reg::Lock), LOCK_CLIENT);
        remaining.push(left);
    }
    assert_eq!(remaining, vec![6928, 3856, 784, 0]);
    assert_eq!(upload.blocks_sent(), 4);
    let response = upload
        .finish_with(
            CommandId::BufferData,
            vec![
                Arg::U32(gl::ARRAY_BUFFER),
                Arg::U32(gl::STATIC_DRAW),
                Arg::Staged,
            ],
        )
        .unwrap();
    assert_eq!(response.scalar(), None);
    assert_eq!(segment.load(Reg::Lock), LOCK_FREE);

    let bytes = client
        .call(
            CommandId::GetBufferSubData,
            vec![Arg::U32(gl::ARRAY_BUFFER), Arg::U32(0), Arg::U32(10_000)],
        )
        .unwrap()
        .into_bytes()
        .unwrap();
    assert_eq!(bytes, payload);
}

#[test]
fn abandoned_upload_is_discarded_by_the_host() {
    let segment = segment(1 << 22);
    let _host = HostThread::spawn(Arc::clone(&segment));
    let client = Client::connect(Arc::clone(&segment), &config()).unwrap();

    let payload = vec![1u8; 8000];
    let mut upload = client.begin_upload(&payload).unwrap();
    assert_eq!(upload.send_next().unwrap(), Some(8000 - 3072));
    drop(upload);
    assert_eq!(segment.load(Reg::Lock), LOCK_FREE);

    // A continuation block now has no upload to join.
    let err = client
        .call(CommandId::VpUploadStay, vec![Arg::Bytes(vec![0; 16])])
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::TransferSize));
    client.nop().unwrap();
}

#[test]
fn named_segment_served_by_the_host_entry_point() -> anyhow::Result<()> {
    init_tracing();
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH)?.subsec_nanos();
    let name = format!("sgl-e2e-{}-{nanos}", std::process::id());
    let host_config = HostConfig {
        shm_name: name.clone(),
        segment_size: MIN_SEGMENT_BYTES + (1 << 20),
        ..HostConfig::default()
    };

    let stop = Arc::new(AtomicBool::new(false));
    let host = thread::spawn({
        let stop = Arc::clone(&stop);
        move || sgl::host::serve(&host_config, stop)
    });

    let client_config = ClientConfig {
        shm_name: name.clone(),
        ..config()
    };
    let deadline = Instant::now() + Duration::from_secs(10);
    let client = loop {
        match Client::open(&client_config) {
            Ok(client) => break client,
            Err(ClientError::Shm(_)) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(err) => return Err(err.into()),
        }
    };
    client.nop()?;
    let context = client.create_context()?;
    assert!(client.set_context(context)?);
    assert_eq!(client.current_context()?, context);
    client.disconnect()?;

    stop.store(true, Ordering::SeqCst);
    host.join().expect("host thread panicked")?;
    assert!(Segment::open(&name).is_err());
    Ok(())
}
