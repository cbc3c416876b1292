//! Block-wise bulk transfers.
//!
//! Payloads larger than one record cross the segment in blocks of at most
//! [`BLOCK_SIZE`](crate::layout::BLOCK_SIZE) bytes, one block per cycle.
//! [`BlockPlan`] fixes the block boundaries; the session types track one
//! transfer on either side.

use std::ops::Range;

use crate::error::TransferSizeError;

/// Number of blocks needed to move `total` bytes.
pub fn block_count(total: usize, block_size: usize) -> usize {
    assert!(block_size > 0, "block size must be nonzero");
    total.div_ceil(block_size)
}

/// Iterator over the byte ranges of successive blocks.
#[derive(Clone, Debug)]
pub struct BlockPlan {
    total: usize,
    block_size: usize,
    next: usize,
}

impl BlockPlan {
    pub fn new(total: usize, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be nonzero");
        Self {
            total,
            block_size,
            next: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Bytes not yet covered by a yielded block.
    pub fn remaining(&self) -> usize {
        self.total - self.next
    }
}

impl Iterator for BlockPlan {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Range<usize>> {
        if self.next >= self.total {
            return None;
        }
        let start = self.next;
        let end = (start + self.block_size).min(self.total);
        self.next = end;
        Some(start..end)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = block_count(self.remaining(), self.block_size);
        (n, Some(n))
    }
}

impl ExactSizeIterator for BlockPlan {}

/// Host-side state of an upload in progress.
#[derive(Debug)]
pub struct UploadSession {
    declared: usize,
    data: Vec<u8>,
}

impl UploadSession {
    /// Starts a session for `declared` bytes with its first block. Memory
    /// grows with the bytes received, not with the declaration.
    pub fn start(declared: usize, first: &[u8]) -> Result<Self, TransferSizeError> {
        let mut session = Self {
            declared,
            data: Vec::with_capacity(first.len()),
        };
        session.push(first)?;
        Ok(session)
    }

    pub fn push(&mut self, block: &[u8]) -> Result<(), TransferSizeError> {
        if block.len() > self.remaining() {
            return Err(TransferSizeError {
                declared: self.declared,
                actual: self.data.len() + block.len(),
            });
        }
        self.data.extend_from_slice(block);
        Ok(())
    }

    pub fn declared(&self) -> usize {
        self.declared
    }

    pub fn received(&self) -> usize {
        self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.declared - self.data.len()
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// The uploaded bytes; fails if the session ended short.
    pub fn finish(self) -> Result<Vec<u8>, TransferSizeError> {
        if !self.is_complete() {
            return Err(self.short());
        }
        Ok(self.data)
    }

    /// Error describing a session cut off before all bytes arrived.
    pub fn short(&self) -> TransferSizeError {
        TransferSizeError {
            declared: self.declared,
            actual: self.data.len(),
        }
    }
}

/// Host-side state of a staged download.
#[derive(Debug)]
pub struct DownloadSession {
    data: Vec<u8>,
    plan: BlockPlan,
}

impl DownloadSession {
    pub fn new(data: Vec<u8>, block_size: usize) -> Self {
        let plan = BlockPlan::new(data.len(), block_size);
        Self { data, plan }
    }

    pub fn total(&self) -> usize {
        self.data.len()
    }

    /// Bytes handed out so far.
    pub fn sent(&self) -> usize {
        self.plan.total() - self.plan.remaining()
    }

    /// Next block to hand out. An empty slice is the terminal block.
    pub fn next_block(&mut self) -> &[u8] {
        match self.plan.next() {
            Some(range) => &self.data[range],
            None => &[],
        }
    }
}

/// Client-side accumulator for a download.
#[derive(Debug)]
pub struct DownloadBuffer {
    declared: usize,
    data: Vec<u8>,
}

impl DownloadBuffer {
    pub fn new(declared: usize) -> Self {
        Self {
            declared,
            data: Vec::new(),
        }
    }

    /// Appends one received block. Returns `true` once the terminal empty
    /// block has arrived and the byte count matched the declaration.
    pub fn push(&mut self, block: &[u8]) -> Result<bool, TransferSizeError> {
        if block.is_empty() {
            if self.data.len() != self.declared {
                return Err(TransferSizeError {
                    declared: self.declared,
                    actual: self.data.len(),
                });
            }
            return Ok(true);
        }
        if self.data.len() + block.len() > self.declared {
            return Err(TransferSizeError {
                declared: self.declared,
                actual: self.data.len() + block.len(),
            });
        }
        self.data.extend_from_slice(block);
        Ok(false)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}
