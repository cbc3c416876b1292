//! Client side of block-wise uploads.

use sgl_protocol::bulk::BlockPlan;
use sgl_protocol::layout::BLOCK_SIZE;
use sgl_protocol::{Arg, Call, CommandId, TransferSizeError};
use tracing::warn;

use crate::client::{Client, Lock, Response};
use crate::error::Result;

/// An upload in progress. Holds `lock` for its whole lifetime, so no other
/// command can interleave with the blocks.
///
/// Dropping an unfinished upload sends `VpNull` to discard the partial data
/// on the host.
pub struct BulkUpload<'c, 'p> {
    client: &'c Client,
    lock: Lock<'c>,
    payload: &'p [u8],
    plan: BlockPlan,
    blocks_sent: usize,
    /// Set once a cycle failed; the host has dropped the session by then, or
    /// is not answering at all.
    failed: bool,
}

impl<'c, 'p> BulkUpload<'c, 'p> {
    pub(crate) fn start(client: &'c Client, lock: Lock<'c>, payload: &'p [u8]) -> Result<Self> {
        if u32::try_from(payload.len()).is_err() {
            return Err(TransferSizeError {
                declared: u32::MAX as usize,
                actual: payload.len(),
            }
            .into());
        }
        Ok(Self {
            client,
            lock,
            payload,
            plan: BlockPlan::new(payload.len(), BLOCK_SIZE),
            blocks_sent: 0,
            failed: false,
        })
    }

    /// Bytes not yet sent.
    pub fn remaining(&self) -> usize {
        self.plan.remaining()
    }

    pub fn blocks_sent(&self) -> usize {
        self.blocks_sent
    }

    /// Sends the next block. Returns the byte count the host still expects,
    /// or `None` once every block is sent.
    pub fn send_next(&mut self) -> Result<Option<usize>> {
        let Some(range) = self.plan.next() else {
            return Ok(None);
        };
        let block = self.payload[range].to_vec();
        let call = if self.blocks_sent == 0 {
            Call::new(
                CommandId::VpUpload,
                vec![Arg::U32(self.payload.len() as u32), Arg::Bytes(block)],
            )
        } else {
            Call::new(CommandId::VpUploadStay, vec![Arg::Bytes(block)])
        };

        let completion = match self.client.cycle(&mut self.lock, &call) {
            Ok(completion) => completion,
            Err(err) => {
                self.failed = true;
                return Err(err);
            }
        };
        self.blocks_sent += 1;

        let expected = completion.retval as usize;
        if expected != self.plan.remaining() {
            self.failed = true;
            self.reset_host();
            return Err(TransferSizeError {
                declared: self.payload.len(),
                actual: self.payload.len().saturating_sub(expected),
            }
            .into());
        }
        Ok(Some(expected))
    }

    /// Sends every remaining block.
    pub fn finish(mut self) -> Result<()> {
        while self.send_next()?.is_some() {}
        Ok(())
    }

    /// Sends every remaining block, then runs `id` on the uploaded bytes
    /// under the same lock.
    pub fn finish_with(mut self, id: CommandId, args: Vec<Arg>) -> Result<Response> {
        while self.send_next()?.is_some() {}
        let call = Call::new(id, args);
        call.validate()?;
        self.client.call_locked(&mut self.lock, &call)
    }

    fn reset_host(&mut self) {
        let reset = Call::new(CommandId::VpNull, Vec::new());
        if let Err(err) = self.client.cycle(&mut self.lock, &reset) {
            warn!(error = %err, "failed to reset host transfer state");
        }
    }
}

impl Drop for BulkUpload<'_, '_> {
    fn drop(&mut self) {
        if self.blocks_sent > 0 && self.plan.remaining() > 0 && !self.failed {
            warn!(
                sent = self.blocks_sent,
                remaining = self.plan.remaining(),
                "upload abandoned before completion"
            );
            self.reset_host();
        }
    }
}
