use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use sgl_protocol::layout::MIN_SEGMENT_BYTES;
use sgl_protocol::{BoundsError, Reg, RegisterFile};
use tracing::{debug, info};

use crate::error::{Result, ShmError};
use crate::mapping::{Backing, ShmMapping};

/// One shared segment: the register page, the command area and the
/// framebuffer region, mapped into this process.
///
/// All byte access is bounds-checked against the segment size before any
/// memory is touched. Registers are accessed atomically.
pub struct Segment {
    base: NonNull<u8>,
    len: usize,
    name: Option<String>,
    _backing: Backing,
}

// SAFETY: the segment is shared memory by construction. Registers are only
// accessed through atomics, and byte ranges are copied in and out with raw
// pointer copies; no Rust references into the mapping are handed out.
unsafe impl Send for Segment {}
// SAFETY: see above.
unsafe impl Sync for Segment {}

impl Segment {
    /// Host side: creates the named segment (or reclaims one of the same size
    /// whose host has exited), resets the registers and publishes
    /// `total_size`. A name another live host is serving fails with
    /// [`ShmError::InUse`] and is left untouched.
    ///
    /// The name is unlinked when the segment is closed.
    pub fn open_or_create(name: &str, size: usize) -> Result<Self> {
        check_min_size(size)?;
        let mapping = ShmMapping::open_or_create(name, size)?;
        let segment = Self::from_backing(Backing::Shm(mapping), size, Some(name.to_string()));
        segment.reset_registers();
        info!(name, size, "shared segment ready");
        Ok(segment)
    }

    /// Client side: attaches to a segment created by a host.
    pub fn open(name: &str) -> Result<Self> {
        let mapping = ShmMapping::open(name)?;
        let len = mapping.len();
        let segment = Self::from_backing(Backing::Shm(mapping), len, Some(name.to_string()));
        let published = segment.published_size();
        if published != len as u64 {
            return Err(ShmError::SizeMismatch {
                name: name.to_string(),
                expected: len as u64,
                found: published,
            });
        }
        debug!(name, size = len, "attached to shared segment");
        Ok(segment)
    }

    /// In-process segment with the same semantics as a named one.
    pub fn anonymous(size: usize) -> Result<Self> {
        check_min_size(size)?;
        let segment = Self::from_backing(Backing::heap(size), size, None);
        segment.reset_registers();
        Ok(segment)
    }

    fn from_backing(backing: Backing, len: usize, name: Option<String>) -> Self {
        Self {
            base: backing.base(),
            len,
            name,
            _backing: backing,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `total_size` as published in the registers.
    pub fn published_size(&self) -> u64 {
        self.load_u64(Reg::TotalSizeLo, Reg::TotalSizeHi)
    }

    /// Zeroes every register and publishes `total_size`.
    pub fn reset_registers(&self) {
        for reg in Reg::ALL {
            self.store(reg, 0);
        }
        self.store_u64(Reg::TotalSizeLo, Reg::TotalSizeHi, self.len as u64);
    }

    pub fn check_range(&self, offset: usize, len: usize) -> std::result::Result<(), BoundsError> {
        BoundsError::check(offset, len, self.len)
    }

    pub fn read(&self, offset: usize, len: usize) -> std::result::Result<Vec<u8>, BoundsError> {
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len];
        self.read_into(offset, &mut out)?;
        Ok(out)
    }

    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> std::result::Result<(), BoundsError> {
        self.check_range(offset, buf.len())?;
        // SAFETY: `offset..offset + buf.len()` lies inside the backing, checked
        // above, and `buf` is a distinct Rust allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> std::result::Result<(), BoundsError> {
        self.check_range(offset, bytes.len())?;
        // SAFETY: as in `read_into`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.as_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Unmaps the segment; a host segment also unlinks its name.
    pub fn close(self) {
        if let Some(name) = &self.name {
            debug!(name, "closing shared segment");
        }
    }

    fn register(&self, reg: Reg) -> &AtomicU32 {
        // SAFETY: every segment is at least MIN_SEGMENT_BYTES long, register
        // offsets are 4-byte aligned and lie in the first page, and the base is
        // page aligned (mmap) or 8-byte aligned (heap).
        unsafe { &*self.base.as_ptr().add(reg.offset()).cast::<AtomicU32>() }
    }
}

fn check_min_size(size: usize) -> Result<()> {
    if size < MIN_SEGMENT_BYTES {
        return Err(ShmError::TooSmall {
            size,
            min: MIN_SEGMENT_BYTES,
        });
    }
    Ok(())
}

impl RegisterFile for Segment {
    fn load(&self, reg: Reg) -> u32 {
        self.register(reg).load(Ordering::SeqCst)
    }

    fn store(&self, reg: Reg, value: u32) {
        self.register(reg).store(value, Ordering::SeqCst)
    }

    fn compare_exchange(&self, reg: Reg, current: u32, new: u32) -> std::result::Result<u32, u32> {
        self.register(reg)
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sgl_protocol::layout::{COMMAND_AREA_OFFSET, FRAMEBUFFER_REGION_OFFSET};

    use super::*;

    #[test]
    fn anonymous_segment_publishes_its_size() {
        let segment = Segment::anonymous(1 << 20).unwrap();
        assert_eq!(segment.len(), 1 << 20);
        assert_eq!(segment.published_size(), 1 << 20);
        assert_eq!(segment.load(Reg::Lock), 0);
        assert_eq!(segment.name(), None);
    }

    #[test]
    fn undersized_segment_is_refused() {
        let err = Segment::anonymous(MIN_SEGMENT_BYTES - 1).unwrap_err();
        assert!(matches!(err, ShmError::TooSmall { .. }));
    }

    #[test]
    fn bytes_round_trip_through_the_segment() {
        let segment = Segment::anonymous(MIN_SEGMENT_BYTES + 64).unwrap();
        segment.write(COMMAND_AREA_OFFSET, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(segment.read(COMMAND_AREA_OFFSET, 5).unwrap(), vec![1, 2, 3, 4, 5]);

        let mut buf = [0u8; 3];
        segment.read_into(COMMAND_AREA_OFFSET + 2, &mut buf).unwrap();
        assert_eq!(buf, [3, 4, 5]);
    }

    #[test]
    fn out_of_range_access_touches_nothing() {
        let size = FRAMEBUFFER_REGION_OFFSET + 16;
        let segment = Segment::anonymous(size).unwrap();
        segment.write(size - 4, &[7; 4]).unwrap();

        let err = segment.write(size - 2, &[9; 4]).unwrap_err();
        assert_eq!(
            err,
            BoundsError {
                offset: size - 2,
                len: 4,
                total: size
            }
        );
        assert_eq!(segment.read(size - 4, 4).unwrap(), vec![7; 4]);

        assert!(segment.read(size, 1).is_err());
        assert!(segment.read(usize::MAX, 2).is_err());
        assert!(segment.read(size, 0).is_ok());
    }

    #[test]
    fn huge_read_lengths_fail_before_allocating() {
        let segment = Segment::anonymous(MIN_SEGMENT_BYTES).unwrap();
        assert_eq!(
            segment.read(0, usize::MAX),
            Err(BoundsError {
                offset: 0,
                len: usize::MAX,
                total: MIN_SEGMENT_BYTES
            })
        );
        assert!(segment.read(COMMAND_AREA_OFFSET, u32::MAX as usize).is_err());
    }

    #[test]
    fn registers_live_in_the_first_page() {
        let segment = Segment::anonymous(MIN_SEGMENT_BYTES).unwrap();
        segment.store(Reg::Retval, 0xAABB_CCDD);
        assert_eq!(segment.read(4, 4).unwrap(), 0xAABB_CCDDu32.to_le_bytes());
        segment.write(16, &7u32.to_le_bytes()).unwrap();
        assert_eq!(segment.load(Reg::ClaimId), 7);
    }
}
