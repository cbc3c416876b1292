//! Drives a dispatcher through the exact register/segment path a real client
//! uses, single-threaded: the test plays the client and calls
//! `Dispatcher::poll` where the host thread would.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use sgl_host::{Dispatcher, DispatcherConfig, PollOutcome, SoftGlBackend};
use sgl_protocol::bulk::{BlockPlan, DownloadBuffer};
use sgl_protocol::codec::{bytes_to_u32s, encode_call};
use sgl_protocol::cycle::{try_acquire_lock, ClientLock, Completion};
use sgl_protocol::gl;
use sgl_protocol::handshake::{
    await_connect, begin_connect, encode_request, ClaimTaken, ConnectOutcome,
};
use sgl_protocol::layout::{
    connect_word, pack_dims, BLOCK_SIZE, COMMAND_AREA_OFFSET, FRAMEBUFFER_REGION_OFFSET,
    LOCK_CLIENT, LOCK_FREE, MIN_SEGMENT_BYTES, RETVAL_ERROR, RETVAL_OK, RETVAL_VECTOR_OFFSET,
};
use sgl_protocol::{ApiVersion, Arg, Call, CommandId, Reg, RegisterFile, Status, Wait, WaitError};
use sgl_shm::Segment;

type Host = Dispatcher<SoftGlBackend>;

/// The host answers synchronously in these tests, so a client never has to
/// wait for it.
struct NoWait;

impl Wait for NoWait {
    fn wait(&mut self) -> Result<(), WaitError> {
        Err(WaitError::Cancelled)
    }
}

struct SyntheticClient {
    segment: Arc<Segment>,
}

impl SyntheticClient {
    fn connect(&self, host: &mut Host, requested: Option<ApiVersion>) -> (u32, ApiVersion) {
        begin_connect(&*self.segment, requested).unwrap();
        assert!(matches!(host.poll(), PollOutcome::Connected { .. }));
        match await_connect(&*self.segment, &mut NoWait).unwrap() {
            ConnectOutcome::Accepted { claim_id, version } => (claim_id, version),
            ConnectOutcome::Rejected => panic!("connect rejected"),
        }
    }

    /// One cycle on an already held lock.
    fn cycle(
        &self,
        lock: &mut ClientLock<'_, Segment>,
        host: &mut Host,
        submit: u32,
        record: &[u8],
    ) -> Completion {
        self.segment.write(COMMAND_AREA_OFFSET, record).unwrap();
        lock.submit(submit);
        assert!(matches!(host.poll(), PollOutcome::Cycle(_)));
        assert_eq!(self.segment.load(Reg::Submit), 0);
        lock.poll_ready().expect("host completed the cycle")
    }

    fn raw(&self, host: &mut Host, submit: u32, record: &[u8]) -> Completion {
        let mut lock = try_acquire_lock(&*self.segment).expect("lock is free");
        self.cycle(&mut lock, host, submit, record)
    }

    fn call(&self, host: &mut Host, id: CommandId, args: Vec<Arg>) -> Completion {
        let record = encode_call(&Call::new(id, args)).unwrap();
        self.raw(host, id.as_u32(), &record)
    }

    fn vector(&self, completion: Completion) -> Vec<u8> {
        self.segment
            .read(RETVAL_VECTOR_OFFSET, completion.retval as usize)
            .unwrap()
    }

    /// Uploads `payload` and runs `id` on the staged bytes, all under one lock.
    fn upload(&self, host: &mut Host, payload: &[u8], id: CommandId, args: Vec<Arg>) -> usize {
        let mut lock = try_acquire_lock(&*self.segment).unwrap();
        let mut cycles = 0;
        for (i, range) in BlockPlan::new(payload.len(), BLOCK_SIZE).enumerate() {
            let block = payload[range.clone()].to_vec();
            let call = if i == 0 {
                Call::new(
                    CommandId::VpUpload,
                    vec![Arg::U32(payload.len() as u32), Arg::Bytes(block)],
                )
            } else {
                Call::new(CommandId::VpUploadStay, vec![Arg::Bytes(block)])
            };
            let done = self.cycle(
                &mut lock,
                host,
                call.id.as_u32(),
                &encode_call(&call).unwrap(),
            );
            assert_eq!(done.status(), Some(Status::Ok));
            assert_eq!(done.retval as usize, payload.len() - range.end);
            assert_eq!(self.segment.load(Reg::Lock), LOCK_CLIENT);
            cycles += 1;
        }
        let record = encode_call(&Call::new(id, args)).unwrap();
        let done = self.cycle(&mut lock, host, id.as_u32(), &record);
        assert_eq!(done.status(), Some(Status::Ok));
        lock.release();
        assert_eq!(self.segment.load(Reg::Lock), LOCK_FREE);
        cycles
    }

    /// Runs a download command and collects its blocks. Returns the bytes and
    /// the number of `VpDownload` cycles.
    fn download(&self, host: &mut Host, id: CommandId, args: Vec<Arg>) -> (Vec<u8>, usize) {
        let mut lock = try_acquire_lock(&*self.segment).unwrap();
        let record = encode_call(&Call::new(id, args)).unwrap();
        let first = self.cycle(&mut lock, host, id.as_u32(), &record);
        assert_eq!(first.status(), Some(Status::Ok));

        let mut buffer = DownloadBuffer::new(first.retval as usize);
        let next = encode_call(&Call::new(CommandId::VpDownload, vec![])).unwrap();
        let mut cycles = 0;
        loop {
            let done = self.cycle(&mut lock, host, CommandId::VpDownload.as_u32(), &next);
            assert_eq!(done.status(), Some(Status::Ok));
            cycles += 1;
            if buffer.push(&self.vector(done)).unwrap() {
                break;
            }
        }
        (buffer.into_bytes(), cycles)
    }
}

fn setup(config: DispatcherConfig) -> (Host, SyntheticClient) {
    let segment = Arc::new(Segment::anonymous(MIN_SEGMENT_BYTES + (1 << 20)).unwrap());
    let host = Dispatcher::new(
        Arc::clone(&segment),
        SoftGlBackend::new(ApiVersion::DEFAULT),
        config,
    );
    (host, SyntheticClient { segment })
}

fn connected() -> (Host, SyntheticClient) {
    let (mut host, client) = setup(DispatcherConfig::default());
    client.connect(&mut host, None);
    (host, client)
}

#[test]
fn handshake_grants_default_version_and_hello_confirms_the_claim() {
    let (mut host, client) = setup(DispatcherConfig::default());
    let (claim_id, version) = client.connect(&mut host, None);
    assert_ne!(claim_id, 0);
    assert_eq!(version, ApiVersion::new(4, 6));
    assert_eq!(client.segment.load(Reg::Connect), connect_word::IDLE);

    let hello = client.call(&mut host, CommandId::HelloWorld, vec![Arg::U32(4242)]);
    assert_eq!(hello.status(), Some(Status::Ok));
    assert_eq!(hello.retval, claim_id);
}

#[test]
fn requested_versions_are_clamped_to_the_host_maximum() {
    let (mut host, client) = setup(DispatcherConfig {
        max_version: ApiVersion::new(4, 6),
        ..DispatcherConfig::default()
    });
    let (_, version) = client.connect(&mut host, Some(ApiVersion::new(9, 0)));
    assert_eq!(version, ApiVersion::new(4, 6));

    client.call(&mut host, CommandId::GoodbyeWorld, vec![]);
    let (_, version) = client.connect(&mut host, Some(ApiVersion::new(3, 3)));
    assert_eq!(version, ApiVersion::new(3, 3));
}

#[test]
fn nop_returns_the_ok_sentinel() {
    let (mut host, client) = connected();
    let done = client.call(&mut host, CommandId::Nop, vec![]);
    assert_eq!(done.retval, RETVAL_OK);
    assert_eq!(done.status(), Some(Status::Ok));
    assert_eq!(client.segment.load(Reg::ReadyHint), 0);
    assert_eq!(client.segment.load(Reg::Lock), LOCK_FREE);
}

#[test]
fn unknown_and_malformed_records_complete_with_an_error_status() {
    let (mut host, client) = connected();

    let mut unknown = 999u32.to_le_bytes().to_vec();
    unknown.extend_from_slice(&0u32.to_le_bytes());
    let done = client.raw(&mut host, 999, &unknown);
    assert_eq!(done.retval, RETVAL_ERROR);
    assert_eq!(done.status(), Some(Status::UnknownCommand));

    // Viewport needs 16 payload bytes.
    let mut truncated = CommandId::Viewport.as_u32().to_le_bytes().to_vec();
    truncated.extend_from_slice(&8u32.to_le_bytes());
    truncated.extend_from_slice(&[0; 8]);
    let done = client.raw(&mut host, CommandId::Viewport.as_u32(), &truncated);
    assert_eq!(done.status(), Some(Status::Malformed));

    let nop = encode_call(&Call::new(CommandId::Nop, vec![])).unwrap();
    let done = client.raw(&mut host, CommandId::Finish.as_u32(), &nop);
    assert_eq!(done.status(), Some(Status::Malformed));

    let mut oversized = CommandId::Nop.as_u32().to_le_bytes().to_vec();
    oversized.extend_from_slice(&5000u32.to_le_bytes());
    let done = client.raw(&mut host, CommandId::Nop.as_u32(), &oversized);
    assert_eq!(done.status(), Some(Status::Malformed));

    // The connection survives every one of them.
    let done = client.call(&mut host, CommandId::Nop, vec![]);
    assert_eq!(done.status(), Some(Status::Ok));
}

#[test]
fn second_connect_is_rejected_without_disturbing_the_session() {
    let (mut host, client) = setup(DispatcherConfig::default());
    let (claim_id, _) = client.connect(&mut host, None);

    assert_eq!(
        begin_connect(&*client.segment, None),
        Err(ClaimTaken { claim_id })
    );

    // A client that skips the claim gets turned away by the host.
    client
        .segment
        .store(Reg::Connect, encode_request(Some(ApiVersion::new(3, 0))));
    assert_eq!(
        host.poll(),
        PollOutcome::Rejected {
            active_claim: claim_id
        }
    );
    assert_eq!(client.segment.load(Reg::Connect), connect_word::REJECTED);
    assert_eq!(client.segment.load(Reg::ClaimId), claim_id);
    assert_eq!(client.segment.load(Reg::ApiMajor), 4);
    assert_eq!(client.segment.load(Reg::ApiMinor), 6);
    client.segment.store(Reg::Connect, connect_word::IDLE);

    let hello = client.call(&mut host, CommandId::HelloWorld, vec![Arg::U32(1)]);
    assert_eq!(hello.retval, claim_id);
}

#[test]
fn goodbye_frees_the_claim_for_the_next_client() {
    let (mut host, client) = setup(DispatcherConfig::default());
    let (first, _) = client.connect(&mut host, None);
    let done = client.call(&mut host, CommandId::GoodbyeWorld, vec![]);
    assert_eq!(done.status(), Some(Status::Ok));
    assert_eq!(client.segment.load(Reg::ClaimId), 0);

    let done = client.call(&mut host, CommandId::Nop, vec![]);
    assert_eq!(done.status(), Some(Status::NotConnected));

    let (second, _) = client.connect(&mut host, None);
    assert_ne!(second, 0);
    assert_ne!(second, first);
}

#[test]
fn framebuffer_is_published_bgra_top_row_first() {
    let (mut host, client) = connected();
    client.call(
        &mut host,
        CommandId::RequestFramebuffer,
        vec![Arg::U32(2), Arg::U32(2)],
    );
    client.call(
        &mut host,
        CommandId::ClearColor,
        vec![Arg::F32(0.0), Arg::F32(0.0), Arg::F32(1.0), Arg::F32(1.0)],
    );
    client.call(&mut host, CommandId::Clear, vec![Arg::U32(gl::COLOR_BUFFER_BIT)]);

    let done = client.call(
        &mut host,
        CommandId::RequestFramebuffer,
        vec![Arg::U32(2), Arg::U32(2)],
    );
    assert_eq!(done.status(), Some(Status::Ok));
    assert_eq!(done.retval, 16);
    let offset = client
        .segment
        .load_u64(Reg::FramebufferOffsetLo, Reg::FramebufferOffsetHi);
    assert_eq!(offset, FRAMEBUFFER_REGION_OFFSET as u64);
    let frame = client.segment.read(offset as usize, 16).unwrap();
    assert_eq!(frame, [255u8, 0, 0, 255].repeat(4));

    let size = client.call(&mut host, CommandId::GetSize, vec![]);
    assert_eq!(size.retval, pack_dims(2, 2));
}

#[test]
fn oversized_framebuffer_request_is_a_bounds_error() {
    let (mut host, client) = connected();
    let done = client.call(
        &mut host,
        CommandId::RequestFramebuffer,
        vec![Arg::U32(4096), Arg::U32(4096)],
    );
    assert_eq!(done.status(), Some(Status::Bounds));
    assert_eq!(done.retval, RETVAL_ERROR);
    assert_eq!(client.call(&mut host, CommandId::GetSize, vec![]).retval, 0);
}

#[test]
fn upload_and_download_move_multi_block_payloads() {
    let (mut host, client) = connected();
    let names = client.call(&mut host, CommandId::GenBuffers, vec![Arg::U32(1)]);
    let id = bytes_to_u32s(&client.vector(names))[0];
    client.call(
        &mut host,
        CommandId::BindBuffer,
        vec![Arg::U32(gl::ARRAY_BUFFER), Arg::U32(id)],
    );

    let payload: Vec<u8> = (0..7000u32).map(|i| (i % 251) as u8).collect();
    let cycles = client.upload(
        &mut host,
        &payload,
        CommandId::BufferData,
        vec![Arg::U32(gl::ARRAY_BUFFER), Arg::U32(gl::STATIC_DRAW), Arg::Staged],
    );
    assert_eq!(cycles, 3);
    assert_eq!(host.backend().buffer_contents(id), Some(payload.as_slice()));

    let (bytes, cycles) = client.download(
        &mut host,
        CommandId::GetBufferSubData,
        vec![Arg::U32(gl::ARRAY_BUFFER), Arg::U32(0), Arg::U32(7000)],
    );
    // Three data blocks plus the terminal empty one.
    assert_eq!(cycles, 4);
    assert_eq!(bytes, payload);
}

#[test]
fn gl_errors_travel_through_get_error_not_the_status() {
    let (mut host, client) = connected();
    let done = client.call(&mut host, CommandId::Enable, vec![Arg::U32(0xDEAD)]);
    assert_eq!(done.status(), Some(Status::Ok));
    let error = client.call(&mut host, CommandId::GetError, vec![]);
    assert_eq!(error.retval, gl::INVALID_ENUM);
    let error = client.call(&mut host, CommandId::GetError, vec![]);
    assert_eq!(error.retval, gl::NO_ERROR);
}

#[test]
fn watchdog_frees_a_dead_clients_lock_and_claim() {
    let (mut host, client) = setup(DispatcherConfig {
        stale_lock_timeout: Duration::ZERO,
        ..DispatcherConfig::default()
    });
    let (claim_id, _) = client.connect(&mut host, None);

    // The client dies holding the lock.
    std::mem::forget(try_acquire_lock(&*client.segment).unwrap());
    assert_eq!(
        host.poll(),
        PollOutcome::WatchdogReset {
            claim_id: Some(claim_id)
        }
    );
    assert_eq!(client.segment.load(Reg::Lock), LOCK_FREE);

    let (next, _) = client.connect(&mut host, None);
    assert_ne!(next, claim_id);
}
