//! Host side of the command cycle.
//!
//! [`Dispatcher::poll`] performs at most one unit of work per call: answer a
//! connect request, run one submitted command, or reclaim a lock abandoned by
//! a dead client. [`Dispatcher::run`] loops over it with an idle backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sgl_protocol::bulk::{DownloadSession, UploadSession};
use sgl_protocol::codec::{check_vector_len, decode_call, decode_header};
use sgl_protocol::cycle::{complete, take_submission};
use sgl_protocol::handshake::{decode_request, ConnectEvent, HostSession};
use sgl_protocol::layout::{
    framebuffer_bytes, framebuffer_fits, BLOCK_SIZE, CLAIM_PENDING, DEFAULT_MAX_TRANSFER_BYTES, COMMAND_AREA_OFFSET,
    COMMAND_HEADER_BYTES, FRAMEBUFFER_REGION_OFFSET, LOCK_CLIENT, LOCK_FREE, MAX_PAYLOAD_BYTES,
    RETVAL_ERROR, RETVAL_OK, RETVAL_VECTOR_OFFSET,
};
use sgl_protocol::{
    ApiVersion, BoundsError, Call, CodecError, CommandId, Reg, RegisterFile, SpinPolicy, Status,
    TransferSizeError, Wait,
};
use sgl_shm::Segment;
use tracing::{debug, info, warn};

use crate::backend::GlBackend;
use crate::error::CycleError;
use crate::handlers::{handler, Reply};

/// Commands the dispatcher executes itself instead of looking them up in
/// [`crate::handlers::HANDLERS`].
pub const BUILTIN_COMMANDS: &[CommandId] = &[
    CommandId::Nop,
    CommandId::RequestFramebuffer,
    CommandId::ReportDims,
    CommandId::HelloWorld,
    CommandId::GoodbyeWorld,
    CommandId::VpUpload,
    CommandId::VpUploadStay,
    CommandId::VpNull,
    CommandId::VpDownload,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Version granted to clients that do not request one.
    pub default_version: ApiVersion,
    pub max_version: ApiVersion,
    /// How long the client may hold `lock` without submitting, or leave a
    /// claim pending without a request, before the host reclaims it.
    pub stale_lock_timeout: Duration,
    pub block_size: usize,
    /// Largest `VpUpload` declaration accepted.
    pub max_transfer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_version: ApiVersion::DEFAULT,
            max_version: ApiVersion::DEFAULT,
            stale_lock_timeout: Duration::from_secs(5),
            block_size: BLOCK_SIZE,
            max_transfer: DEFAULT_MAX_TRANSFER_BYTES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleReport {
    /// Raw value of the `submit` register.
    pub command: u32,
    pub status: Status,
    pub retval: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Idle,
    Connected { claim_id: u32, version: ApiVersion },
    Rejected { active_claim: u32 },
    Cycle(CycleReport),
    /// The watchdog reclaimed an abandoned lock or claim.
    WatchdogReset { claim_id: Option<u32> },
}

/// Host-side bulk transfer state between cycles.
#[derive(Debug, Default)]
enum Transfer {
    #[default]
    Idle,
    Upload(UploadSession),
    /// A finished upload waiting for the command that consumes it.
    Staged(Vec<u8>),
    Download(DownloadSession),
}

/// Tracks how long the registers have looked abandoned.
#[derive(Debug, Default)]
struct LockWatch {
    stale_since: Option<Instant>,
}

impl LockWatch {
    fn observe(&mut self, stale: bool, now: Instant) -> Duration {
        if !stale {
            self.stale_since = None;
            return Duration::ZERO;
        }
        now.duration_since(*self.stale_since.get_or_insert(now))
    }

    fn clear(&mut self) {
        self.stale_since = None;
    }
}

pub struct Dispatcher<B> {
    segment: Arc<Segment>,
    backend: B,
    config: DispatcherConfig,
    session: HostSession,
    transfer: Transfer,
    watch: LockWatch,
    cycles: u64,
}

impl<B: GlBackend> Dispatcher<B> {
    /// Serves `segment` as created: registers are expected to be idle, which
    /// `Segment::open_or_create` and `Segment::anonymous` guarantee. A client
    /// may already be attaching by the time this runs.
    pub fn new(segment: Arc<Segment>, backend: B, config: DispatcherConfig) -> Self {
        let session = HostSession::new(config.default_version, config.max_version);
        Self {
            segment,
            backend,
            config,
            session,
            transfer: Transfer::Idle,
            watch: LockWatch::default(),
            cycles: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn session(&self) -> &HostSession {
        &self.session
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Number of completed command cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn poll(&mut self) -> PollOutcome {
        if let Some(event) = self.session.poll_connect(&*self.segment) {
            self.watch.clear();
            return match event {
                ConnectEvent::Accepted { claim_id, version } => {
                    self.transfer = Transfer::Idle;
                    PollOutcome::Connected { claim_id, version }
                }
                ConnectEvent::Rejected { active_claim } => PollOutcome::Rejected { active_claim },
            };
        }

        if let Some(command) = take_submission(&*self.segment) {
            self.watch.clear();
            return PollOutcome::Cycle(self.run_cycle(command));
        }

        self.check_watchdog().unwrap_or(PollOutcome::Idle)
    }

    /// Polls until `stop` is set, calling `on_event` for everything but idle
    /// polls.
    pub fn run(
        &mut self,
        policy: &SpinPolicy,
        stop: Arc<AtomicBool>,
        mut on_event: impl FnMut(&PollOutcome),
    ) {
        let mut backoff = policy
            .clone()
            .with_timeout(None)
            .backoff_with_cancel(Arc::clone(&stop));
        while !stop.load(Ordering::SeqCst) {
            match self.poll() {
                PollOutcome::Idle => {
                    if backoff.wait().is_err() {
                        break;
                    }
                }
                outcome => {
                    backoff.reset();
                    on_event(&outcome);
                }
            }
        }
        debug!(cycles = self.cycles, "dispatcher loop stopped");
    }

    fn run_cycle(&mut self, command: u32) -> CycleReport {
        let (retval, status) = match self.execute(command) {
            Ok(retval) => (retval, Status::Ok),
            Err(err) => {
                warn!(command, error = %err, "command failed");
                (RETVAL_ERROR, err.status())
            }
        };
        complete(&*self.segment, retval, status);
        self.cycles += 1;
        debug!(command, retval, %status, "cycle complete");
        CycleReport {
            command,
            status,
            retval,
        }
    }

    fn execute(&mut self, submit: u32) -> Result<u32, CycleError> {
        // Whatever a cycle does not explicitly carry forward is dropped.
        let transfer = std::mem::take(&mut self.transfer);
        if !self.session.is_active(&*self.segment) {
            return Err(CycleError::NotConnected);
        }
        let call = self.read_call(submit)?;

        match (call.id, transfer) {
            (CommandId::VpUpload, previous) => {
                if let Transfer::Upload(session) = &previous {
                    warn!(
                        received = session.received(),
                        declared = session.declared(),
                        "upload restarted before completion"
                    );
                }
                let declared = call.u32(0)? as usize;
                if declared > self.config.max_transfer {
                    return Err(TransferSizeError {
                        declared: self.config.max_transfer,
                        actual: declared,
                    }
                    .into());
                }
                let block = self.check_block(call.bytes(1)?)?;
                self.continue_upload(UploadSession::start(declared, block)?)
            }
            (CommandId::VpUploadStay, Transfer::Upload(mut session)) => {
                session.push(self.check_block(call.bytes(0)?)?)?;
                self.continue_upload(session)
            }
            (CommandId::VpUploadStay, _) => Err(TransferSizeError {
                declared: 0,
                actual: call.bytes(0)?.len(),
            }
            .into()),
            (CommandId::VpNull, _) => Ok(RETVAL_OK),
            (CommandId::VpDownload, Transfer::Download(mut session)) => {
                let block = session.next_block().to_vec();
                self.segment.write(RETVAL_VECTOR_OFFSET, &block)?;
                if !block.is_empty() {
                    self.transfer = Transfer::Download(session);
                }
                Ok(block.len() as u32)
            }
            (CommandId::VpDownload, _) => Err(TransferSizeError {
                declared: 0,
                actual: 0,
            }
            .into()),
            (_, Transfer::Upload(session)) => Err(session.short().into()),
            (_, Transfer::Download(session)) => Err(TransferSizeError {
                declared: session.total(),
                actual: session.sent(),
            }
            .into()),
            (_, Transfer::Staged(staged)) => self.dispatch(&call, staged),
            (_, Transfer::Idle) => self.dispatch(&call, Vec::new()),
        }
    }

    fn read_call(&self, submit: u32) -> Result<Call, CycleError> {
        let mut header = [0u8; COMMAND_HEADER_BYTES];
        self.segment.read_into(COMMAND_AREA_OFFSET, &mut header)?;
        let (id, len) = decode_header(header);
        if CommandId::from_u32(submit).is_none() {
            return Err(CodecError::UnknownCommand(submit).into());
        }
        if id != submit {
            return Err(CodecError::IdMismatch { submit, record: id }.into());
        }
        if len > MAX_PAYLOAD_BYTES {
            return Err(CodecError::Oversized {
                len,
                max: MAX_PAYLOAD_BYTES,
            }
            .into());
        }
        let record = self
            .segment
            .read(COMMAND_AREA_OFFSET, COMMAND_HEADER_BYTES + len)?;
        Ok(decode_call(&record)?)
    }

    fn check_block<'a>(&self, block: &'a [u8]) -> Result<&'a [u8], TransferSizeError> {
        if block.len() > self.config.block_size {
            return Err(TransferSizeError {
                declared: self.config.block_size,
                actual: block.len(),
            });
        }
        Ok(block)
    }

    /// Keeps an unfinished upload open or stages the finished bytes. Returns
    /// the byte count still expected.
    fn continue_upload(&mut self, session: UploadSession) -> Result<u32, CycleError> {
        let remaining = session.remaining();
        self.transfer = if session.is_complete() {
            Transfer::Staged(session.finish()?)
        } else {
            Transfer::Upload(session)
        };
        Ok(remaining as u32)
    }

    fn dispatch(&mut self, call: &Call, staged: Vec<u8>) -> Result<u32, CycleError> {
        let staged = if call.id.takes_staged() {
            staged
        } else {
            if !staged.is_empty() {
                warn!(
                    command = %call.id,
                    bytes = staged.len(),
                    "dropping uploaded bytes the command does not consume"
                );
            }
            Vec::new()
        };

        match call.id {
            CommandId::Nop => Ok(RETVAL_OK),
            CommandId::HelloWorld => {
                let pid = call.u32(0)?;
                let claim_id = self.session.claim_id().unwrap_or_default();
                info!(pid, claim_id, "client said hello");
                Ok(claim_id)
            }
            CommandId::GoodbyeWorld => {
                self.session.disconnect(&*self.segment);
                Ok(RETVAL_OK)
            }
            CommandId::ReportDims => {
                let (width, height) = (call.u32(0)?, call.u32(1)?);
                self.check_frame(width, height)?;
                self.backend.resize(width, height);
                Ok(RETVAL_OK)
            }
            CommandId::RequestFramebuffer => self.publish_frame(call.u32(0)?, call.u32(1)?),
            id => {
                let handler = handler(id).ok_or(CodecError::UnknownCommand(id.as_u32()))?;
                let reply = handler(&mut self.backend, call, staged)?;
                self.write_reply(reply)
            }
        }
    }

    fn write_reply(&mut self, reply: Reply) -> Result<u32, CycleError> {
        match reply {
            Reply::None => Ok(RETVAL_OK),
            Reply::Scalar(value) => Ok(value),
            Reply::Vector(bytes) => {
                check_vector_len(bytes.len())?;
                self.segment.write(RETVAL_VECTOR_OFFSET, &bytes)?;
                Ok(bytes.len() as u32)
            }
            Reply::Download(bytes) => {
                let total = u32::try_from(bytes.len()).map_err(|_| TransferSizeError {
                    declared: u32::MAX as usize,
                    actual: bytes.len(),
                })?;
                self.transfer = Transfer::Download(DownloadSession::new(bytes, self.config.block_size));
                Ok(total)
            }
        }
    }

    /// Size of a `width` x `height` frame, if it fits the framebuffer region.
    fn check_frame(&self, width: u32, height: u32) -> Result<usize, BoundsError> {
        let total = self.segment.len();
        match framebuffer_bytes(width, height) {
            Some(len) if framebuffer_fits(total, width, height) => Ok(len),
            len => Err(BoundsError {
                offset: FRAMEBUFFER_REGION_OFFSET,
                len: len.unwrap_or(usize::MAX),
                total,
            }),
        }
    }

    fn publish_frame(&mut self, width: u32, height: u32) -> Result<u32, CycleError> {
        let len = self.check_frame(width, height)?;
        let retval = u32::try_from(len).map_err(|_| BoundsError {
            offset: FRAMEBUFFER_REGION_OFFSET,
            len,
            total: self.segment.len(),
        })?;
        self.backend.resize(width, height);
        let mut frame = vec![0u8; len];
        self.backend.read_frame_bgra(&mut frame);
        self.segment.write(FRAMEBUFFER_REGION_OFFSET, &frame)?;
        self.segment.store_u64(
            Reg::FramebufferOffsetLo,
            Reg::FramebufferOffsetHi,
            FRAMEBUFFER_REGION_OFFSET as u64,
        );
        Ok(retval)
    }

    fn check_watchdog(&mut self) -> Option<PollOutcome> {
        let regs = &*self.segment;
        let lock_abandoned = regs.load(Reg::Lock) == LOCK_CLIENT && regs.load(Reg::Submit) == 0;
        let claim_abandoned = regs.load(Reg::ClaimId) == CLAIM_PENDING
            && decode_request(regs.load(Reg::Connect)).is_none();

        let stale_for = self
            .watch
            .observe(lock_abandoned || claim_abandoned, Instant::now());
        if stale_for < self.config.stale_lock_timeout {
            return None;
        }

        warn!(
            stale_ms = stale_for.as_millis() as u64,
            lock_abandoned, claim_abandoned, "reclaiming abandoned segment state"
        );
        self.transfer = Transfer::Idle;
        let _ = regs.compare_exchange(Reg::Lock, LOCK_CLIENT, LOCK_FREE);
        regs.store(Reg::ReadyHint, 0);
        let claim_id = self.session.disconnect(regs);
        self.watch.clear();
        Some(PollOutcome::WatchdogReset { claim_id })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sgl_protocol::codec::encode_call;
    use sgl_protocol::cycle::try_acquire_lock;
    use sgl_protocol::handshake::begin_connect;
    use sgl_protocol::layout::MIN_SEGMENT_BYTES;
    use sgl_protocol::Arg;

    use super::*;
    use crate::soft::SoftGlBackend;

    fn dispatcher(config: DispatcherConfig) -> Dispatcher<SoftGlBackend> {
        let segment = Arc::new(Segment::anonymous(MIN_SEGMENT_BYTES + (64 << 10)).unwrap());
        Dispatcher::new(segment, SoftGlBackend::new(ApiVersion::DEFAULT), config)
    }

    fn connect(d: &mut Dispatcher<SoftGlBackend>) -> u32 {
        begin_connect(&**d.segment(), None).unwrap();
        match d.poll() {
            PollOutcome::Connected { claim_id, .. } => claim_id,
            other => panic!("expected a connection, got {other:?}"),
        }
    }

    fn call(d: &mut Dispatcher<SoftGlBackend>, id: CommandId, args: Vec<Arg>) -> CycleReport {
        let segment = Arc::clone(d.segment());
        let record = encode_call(&Call::new(id, args)).unwrap();
        segment.write(COMMAND_AREA_OFFSET, &record).unwrap();
        let mut lock = try_acquire_lock(&*segment).unwrap();
        lock.submit(id.as_u32());
        let PollOutcome::Cycle(report) = d.poll() else {
            panic!("expected a cycle");
        };
        assert!(lock.poll_ready().is_some());
        report
    }

    #[test]
    fn commands_before_connecting_are_refused() {
        let mut d = dispatcher(DispatcherConfig::default());
        let report = call(&mut d, CommandId::Nop, vec![]);
        assert_eq!(report.status, Status::NotConnected);
        assert_eq!(report.retval, RETVAL_ERROR);
    }

    #[test]
    fn upload_then_staged_command_consumes_the_bytes() {
        let mut d = dispatcher(DispatcherConfig {
            block_size: 4,
            ..DispatcherConfig::default()
        });
        connect(&mut d);

        let report = call(
            &mut d,
            CommandId::VpUpload,
            vec![Arg::U32(6), Arg::Bytes(vec![1, 2, 3, 4])],
        );
        assert_eq!((report.status, report.retval), (Status::Ok, 2));
        let report = call(&mut d, CommandId::VpUploadStay, vec![Arg::Bytes(vec![5, 6])]);
        assert_eq!((report.status, report.retval), (Status::Ok, 0));
        assert!(matches!(d.transfer, Transfer::Staged(ref bytes) if bytes == &[1, 2, 3, 4, 5, 6]));

        // The next command consumes the staged bytes even if it has no use
        // for them.
        assert_eq!(call(&mut d, CommandId::Nop, vec![]).status, Status::Ok);
        assert!(matches!(d.transfer, Transfer::Idle));
    }

    #[test]
    fn oversized_block_and_interrupted_upload_are_transfer_errors() {
        let mut d = dispatcher(DispatcherConfig {
            block_size: 4,
            ..DispatcherConfig::default()
        });
        connect(&mut d);

        let report = call(
            &mut d,
            CommandId::VpUpload,
            vec![Arg::U32(8), Arg::Bytes(vec![0; 5])],
        );
        assert_eq!(report.status, Status::TransferSize);

        call(&mut d, CommandId::VpUpload, vec![Arg::U32(8), Arg::Bytes(vec![0; 4])]);
        let report = call(&mut d, CommandId::Finish, vec![]);
        assert_eq!(report.status, Status::TransferSize);
        assert_eq!(d.backend().stats().finishes, 0);

        // The session is gone; the connection keeps working.
        assert_eq!(call(&mut d, CommandId::Finish, vec![]).status, Status::Ok);
    }

    #[test]
    fn stray_transfer_commands_fail_cleanly() {
        let mut d = dispatcher(DispatcherConfig::default());
        connect(&mut d);
        assert_eq!(
            call(&mut d, CommandId::VpUploadStay, vec![Arg::Bytes(vec![1])]).status,
            Status::TransferSize
        );
        assert_eq!(call(&mut d, CommandId::VpDownload, vec![]).status, Status::TransferSize);
        assert_eq!(call(&mut d, CommandId::VpNull, vec![]).status, Status::Ok);
    }

    #[test]
    fn upload_declarations_over_the_limit_are_refused() {
        let mut d = dispatcher(DispatcherConfig {
            max_transfer: 1 << 16,
            ..DispatcherConfig::default()
        });
        connect(&mut d);

        let report = call(
            &mut d,
            CommandId::VpUpload,
            vec![Arg::U32(u32::MAX), Arg::Bytes(vec![0; 8])],
        );
        assert_eq!(report.status, Status::TransferSize);
        assert!(matches!(d.transfer, Transfer::Idle));

        let report = call(
            &mut d,
            CommandId::VpUpload,
            vec![Arg::U32(1 << 16), Arg::Bytes(vec![0; 8])],
        );
        assert_eq!((report.status, report.retval), (Status::Ok, (1 << 16) - 8));
    }

    #[test]
    fn unknown_submit_is_reported_before_a_record_mismatch() {
        let mut d = dispatcher(DispatcherConfig::default());
        connect(&mut d);
        let segment = Arc::clone(d.segment());
        // A stale Nop record left in the command area.
        let record = encode_call(&Call::new(CommandId::Nop, vec![])).unwrap();
        segment.write(COMMAND_AREA_OFFSET, &record).unwrap();

        let mut lock = try_acquire_lock(&*segment).unwrap();
        lock.submit(999);
        let PollOutcome::Cycle(report) = d.poll() else {
            panic!("expected a cycle");
        };
        assert_eq!(report.status, Status::UnknownCommand);
        assert!(lock.poll_ready().is_some());
    }

    #[test]
    fn frames_that_do_not_fit_touch_nothing() {
        let mut d = dispatcher(DispatcherConfig::default());
        connect(&mut d);
        let report = call(
            &mut d,
            CommandId::RequestFramebuffer,
            vec![Arg::U32(800), Arg::U32(600)],
        );
        assert_eq!(report.status, Status::Bounds);
        assert_eq!(d.backend().drawable_size(), (0, 0));
        assert_eq!(
            d.segment()
                .load_u64(Reg::FramebufferOffsetLo, Reg::FramebufferOffsetHi),
            0
        );

        let report = call(&mut d, CommandId::ReportDims, vec![Arg::U32(1 << 15), Arg::U32(1 << 15)]);
        assert_eq!(report.status, Status::Bounds);
    }

    #[test]
    fn watchdog_reclaims_a_lock_held_without_submitting() {
        let mut d = dispatcher(DispatcherConfig {
            stale_lock_timeout: Duration::ZERO,
            ..DispatcherConfig::default()
        });
        let claim_id = connect(&mut d);
        let segment = Arc::clone(d.segment());
        let lock = try_acquire_lock(&*segment).unwrap();
        std::mem::forget(lock);

        assert_eq!(
            d.poll(),
            PollOutcome::WatchdogReset {
                claim_id: Some(claim_id)
            }
        );
        assert_eq!(segment.load(Reg::Lock), LOCK_FREE);
        assert_eq!(segment.load(Reg::ClaimId), 0);
        assert_eq!(d.poll(), PollOutcome::Idle);
    }

    #[test]
    fn watchdog_waits_for_the_timeout() {
        let mut d = dispatcher(DispatcherConfig {
            stale_lock_timeout: Duration::from_secs(3600),
            ..DispatcherConfig::default()
        });
        connect(&mut d);
        let segment = Arc::clone(d.segment());
        let _lock = try_acquire_lock(&*segment).unwrap();
        assert_eq!(d.poll(), PollOutcome::Idle);
        assert_eq!(d.poll(), PollOutcome::Idle);
        assert_eq!(segment.load(Reg::Lock), LOCK_CLIENT);
    }

    #[test]
    fn lock_watch_measures_continuous_staleness() {
        let mut watch = LockWatch::default();
        let start = Instant::now();
        assert_eq!(watch.observe(true, start), Duration::ZERO);
        assert_eq!(
            watch.observe(true, start + Duration::from_millis(30)),
            Duration::from_millis(30)
        );
        assert_eq!(watch.observe(false, start + Duration::from_millis(40)), Duration::ZERO);
        assert_eq!(
            watch.observe(true, start + Duration::from_millis(50)),
            Duration::ZERO
        );
    }
}
