//! Caller side of the protocol.
//!
//! Every call is one or more complete cycles under a single acquisition of
//! `lock`: acquire, write the record, submit, wait for the host, read the
//! result, release. Bulk transfers keep the lock across all of their blocks.

use std::sync::Arc;

use sgl_protocol::bulk::DownloadBuffer;
use sgl_protocol::codec::{check_vector_len, encode_call};
use sgl_protocol::cycle::{acquire_lock, ClientLock, Completion};
use sgl_protocol::handshake::{await_connect, begin_connect, ClaimTaken, ConnectOutcome};
use sgl_protocol::layout::{unpack_dims, COMMAND_AREA_OFFSET, RETVAL_VECTOR_OFFSET};
use sgl_protocol::{
    ApiVersion, Arg, Call, CommandId, Reg, RegisterFile, ReturnKind, SpinPolicy, Status,
};
use sgl_shm::Segment;
use tracing::{debug, info, warn};

use crate::bulk::BulkUpload;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Decoded result of one call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    None,
    Scalar(u32),
    /// Vector results and downloads alike.
    Bytes(Vec<u8>),
}

impl Response {
    pub fn scalar(&self) -> Option<u32> {
        match self {
            Self::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Where the host published the last frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub offset: usize,
    pub width: u32,
    pub height: u32,
    pub len: usize,
}

pub(crate) type Lock<'c> = ClientLock<'c, Segment>;

/// A connected session. Dropping it says goodbye to the host.
#[derive(Debug)]
pub struct Client {
    segment: Arc<Segment>,
    policy: SpinPolicy,
    claim_id: u32,
    version: ApiVersion,
    connected: bool,
}

impl Client {
    /// Attaches to the named segment and connects.
    pub fn open(config: &ClientConfig) -> Result<Self> {
        let segment = Arc::new(Segment::open(&config.shm_name)?);
        Self::connect(segment, config)
    }

    /// Runs the connect handshake on `segment` and confirms the session with
    /// `HelloWorld`.
    pub fn connect(segment: Arc<Segment>, config: &ClientConfig) -> Result<Self> {
        let policy = config.poll.clone();
        begin_connect(&*segment, config.version)
            .map_err(|ClaimTaken { claim_id }| ClientError::AlreadyConnected { claim_id })?;
        let (claim_id, version) = match await_connect(&*segment, &mut policy.backoff())? {
            ConnectOutcome::Accepted { claim_id, version } => (claim_id, version),
            ConnectOutcome::Rejected => {
                return Err(ClientError::AlreadyConnected {
                    claim_id: segment.load(Reg::ClaimId),
                });
            }
        };

        let mut client = Self {
            segment,
            policy,
            claim_id,
            version,
            connected: true,
        };
        let confirmed = match client.call(CommandId::HelloWorld, vec![Arg::U32(std::process::id())]) {
            Ok(response) => response.scalar(),
            Err(err) => {
                client.connected = false;
                return Err(err);
            }
        };
        if confirmed != Some(claim_id) {
            warn!(claim_id, ?confirmed, "host did not confirm the session");
            client.connected = false;
            return Err(ClientError::NotConnected);
        }
        info!(claim_id, %version, "connected");
        Ok(client)
    }

    pub fn claim_id(&self) -> u32 {
        self.claim_id
    }

    pub fn version(&self) -> ApiVersion {
        self.version
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub(crate) fn lock(&self) -> Result<Lock<'_>> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }
        Ok(acquire_lock(&*self.segment, &mut self.policy.backoff())?)
    }

    /// Runs one command and collects its result by return kind. `Download`
    /// results are fetched block by block before the lock is released.
    pub fn call(&self, id: CommandId, args: Vec<Arg>) -> Result<Response> {
        let call = Call::new(id, args);
        call.validate()?;
        let mut lock = self.lock()?;
        self.call_locked(&mut lock, &call)
    }

    /// Uploads `payload` in blocks, then runs `id`, whose `Staged` argument
    /// receives the bytes.
    pub fn call_with_upload(&self, payload: &[u8], id: CommandId, args: Vec<Arg>) -> Result<Response> {
        self.begin_upload(payload)?.finish_with(id, args)
    }

    /// Starts a block-by-block upload of `payload`, holding the lock until the
    /// returned session is finished or dropped.
    pub fn begin_upload<'c, 'p>(&'c self, payload: &'p [u8]) -> Result<BulkUpload<'c, 'p>> {
        BulkUpload::start(self, self.lock()?, payload)
    }

    pub(crate) fn call_locked(&self, lock: &mut Lock<'_>, call: &Call) -> Result<Response> {
        let completion = self.cycle(lock, call)?;
        let retval = completion.retval;
        Ok(match call.id.returns() {
            ReturnKind::None => Response::None,
            ReturnKind::Scalar => Response::Scalar(retval),
            ReturnKind::Vector => Response::Bytes(self.read_vector(retval)?),
            ReturnKind::Download => Response::Bytes(self.download(lock, retval as usize)?),
        })
    }

    /// One cycle under an already held lock; fails on a non-OK status.
    pub(crate) fn cycle(&self, lock: &mut Lock<'_>, call: &Call) -> Result<Completion> {
        let record = encode_call(call)?;
        self.segment.write(COMMAND_AREA_OFFSET, &record)?;
        let completion = lock.transact(call.id.as_u32(), &mut self.policy.backoff())?;
        debug!(command = %call.id, retval = completion.retval, "cycle complete");
        match completion.status() {
            Some(Status::Ok) => Ok(completion),
            Some(status) => Err(ClientError::Protocol {
                command: call.id,
                status,
            }),
            None => Err(ClientError::UnknownStatus(completion.status)),
        }
    }

    fn read_vector(&self, len: u32) -> Result<Vec<u8>> {
        check_vector_len(len as usize)?;
        Ok(self.segment.read(RETVAL_VECTOR_OFFSET, len as usize)?)
    }

    fn download(&self, lock: &mut Lock<'_>, total: usize) -> Result<Vec<u8>> {
        let mut buffer = DownloadBuffer::new(total);
        let next = Call::new(CommandId::VpDownload, Vec::new());
        loop {
            let completion = self.cycle(lock, &next)?;
            let block = self.read_vector(completion.retval)?;
            match buffer.push(&block) {
                Ok(true) => return Ok(buffer.into_bytes()),
                Ok(false) => {}
                Err(err) => {
                    warn!(error = %err, "download size mismatch, resetting host transfer");
                    let _ = self.cycle(lock, &Call::new(CommandId::VpNull, Vec::new()));
                    return Err(err.into());
                }
            }
        }
    }

    /// Writes `record` and submits `submit` as is, returning the raw
    /// completion without interpreting the status.
    pub fn submit_raw(&self, submit: u32, record: &[u8]) -> Result<Completion> {
        let mut lock = self.lock()?;
        self.segment.write(COMMAND_AREA_OFFSET, record)?;
        Ok(lock.transact(submit, &mut self.policy.backoff())?)
    }

    pub fn nop(&self) -> Result<()> {
        self.call(CommandId::Nop, Vec::new()).map(drop)
    }

    pub fn current_context(&self) -> Result<u32> {
        self.scalar(CommandId::GetContext, Vec::new())
    }

    pub fn create_context(&self) -> Result<u32> {
        self.scalar(CommandId::CreateContext, Vec::new())
    }

    /// Returns `false` if the host does not know `context`.
    pub fn set_context(&self, context: u32) -> Result<bool> {
        Ok(self.scalar(CommandId::SetContext, vec![Arg::U32(context)])? != 0)
    }

    pub fn report_dims(&self, width: u32, height: u32) -> Result<()> {
        self.call(CommandId::ReportDims, vec![Arg::U32(width), Arg::U32(height)])
            .map(drop)
    }

    /// Drawable size as the host sees it.
    pub fn get_size(&self) -> Result<(u32, u32)> {
        Ok(unpack_dims(self.scalar(CommandId::GetSize, Vec::new())?))
    }

    /// Asks the host to render a `width` x `height` frame into the segment.
    pub fn request_framebuffer(&self, width: u32, height: u32) -> Result<FramebufferInfo> {
        let len = self.scalar(
            CommandId::RequestFramebuffer,
            vec![Arg::U32(width), Arg::U32(height)],
        )?;
        let offset = self
            .segment
            .load_u64(Reg::FramebufferOffsetLo, Reg::FramebufferOffsetHi) as usize;
        Ok(FramebufferInfo {
            offset,
            width,
            height,
            len: len as usize,
        })
    }

    /// Copies a published frame out of the segment.
    pub fn read_framebuffer(&self, info: &FramebufferInfo) -> Result<Vec<u8>> {
        Ok(self.segment.read(info.offset, info.len)?)
    }

    fn scalar(&self, id: CommandId, args: Vec<Arg>) -> Result<u32> {
        expect_scalar(id, self.call(id, args)?)
    }

    /// Ends the session. The claim is free for the next client once this
    /// returns.
    pub fn disconnect(mut self) -> Result<()> {
        self.goodbye()
    }

    fn goodbye(&mut self) -> Result<()> {
        let result = self.call(CommandId::GoodbyeWorld, Vec::new());
        self.connected = false;
        result?;
        info!(claim_id = self.claim_id, "disconnected");
        Ok(())
    }
}

fn expect_scalar(command: CommandId, response: Response) -> Result<u32> {
    response.scalar().ok_or(ClientError::UnexpectedReply {
        command,
        expected: ReturnKind::Scalar,
    })
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.connected {
            if let Err(err) = self.goodbye() {
                warn!(claim_id = self.claim_id, error = %err, "goodbye failed");
            }
        }
    }
}
