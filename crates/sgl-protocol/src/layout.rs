//! Shared memory layout contract for SGL.
//!
//! A single named segment is split into three fixed regions:
//!
//! - the register page (`0x0000..0x1000`): 32-bit control registers followed by
//!   the vector return slot,
//! - the command area (`0x1000..0x2000`): exactly one encoded command record,
//! - the framebuffer region (`0x2000..total_size`): the most recently published
//!   frame.
//!
//! Both peers compile against these constants; nothing here is negotiated at
//! runtime except the segment size, which the host publishes.

/// Well-known segment name used when no override is configured.
pub const SHARED_MEMORY_NAME: &str = "sharedgl_shared_memory";

/// Segment size used by the host when no override is configured.
pub const DEFAULT_SEGMENT_BYTES: usize = 32 << 20;

/// Byte offsets of the control registers. Every register is a little-endian
/// 32-bit slot; 64-bit values are split into `_LO`/`_HI` halves.
pub mod reg_offset {
    pub const SUBMIT: usize = 0;
    pub const RETVAL: usize = 4;
    pub const READY_HINT: usize = 8;
    pub const LOCK: usize = 12;
    pub const CLAIM_ID: usize = 16;
    pub const CONNECT: usize = 20;
    pub const FRAMEBUFFER_OFFSET_LO: usize = 24;
    pub const FRAMEBUFFER_OFFSET_HI: usize = 28;
    pub const TOTAL_SIZE_LO: usize = 32;
    pub const TOTAL_SIZE_HI: usize = 36;
    pub const STATUS: usize = 40;
    pub const API_MAJOR: usize = 44;
    pub const API_MINOR: usize = 48;
}

/// Start of the vector return slot.
pub const RETVAL_VECTOR_OFFSET: usize = 52;

/// Largest vector result the host can hand back in a single cycle.
pub const RETVAL_VECTOR_MAX_BYTES: usize = 4044;

pub const COMMAND_AREA_OFFSET: usize = 0x1000;
pub const COMMAND_AREA_BYTES: usize = 0x1000;

/// `[command id: u32][payload length: u32]`.
pub const COMMAND_HEADER_BYTES: usize = 8;

/// Largest payload that fits behind the header in the command area.
pub const MAX_PAYLOAD_BYTES: usize = COMMAND_AREA_BYTES - COMMAND_HEADER_BYTES;

pub const FRAMEBUFFER_REGION_OFFSET: usize = COMMAND_AREA_OFFSET + COMMAND_AREA_BYTES;

/// Smallest segment that still holds the register page and the command area.
pub const MIN_SEGMENT_BYTES: usize = FRAMEBUFFER_REGION_OFFSET;

/// Bulk transfer block size, in bytes.
pub const BLOCK_SIZE: usize = 3072;

/// Largest upload a host accepts unless configured otherwise.
pub const DEFAULT_MAX_TRANSFER_BYTES: usize = 64 << 20;

/// Published frames are BGRA8.
pub const FRAMEBUFFER_BYTES_PER_PIXEL: usize = 4;

/// Values of the `lock` register: which side may mutate the command and
/// result areas.
pub const LOCK_FREE: u32 = 0;
pub const LOCK_CLIENT: u32 = 1;
pub const LOCK_HOST: u32 = 2;

/// `claim_id` value while no client is attached.
pub const CLAIM_NONE: u32 = 0;
/// `claim_id` sentinel written by a client that is mid-handshake.
pub const CLAIM_PENDING: u32 = 0xFFFF_FFFF;

/// Values of the `connect` register.
pub mod connect_word {
    pub const IDLE: u32 = 0;
    pub const ACCEPTED: u32 = 1;
    pub const REJECTED: u32 = 2;
    /// Set on a client request; the low 31 bits carry the requested version.
    pub const REQUEST_BIT: u32 = 1 << 31;
}

/// `retval` for commands that complete without a value.
pub const RETVAL_OK: u32 = 0;
/// `retval` for cycles that failed at the protocol level.
pub const RETVAL_ERROR: u32 = 0xFFFF_FFFF;

const _: () = assert!(RETVAL_VECTOR_OFFSET + RETVAL_VECTOR_MAX_BYTES == COMMAND_AREA_OFFSET);
const _: () = assert!(reg_offset::API_MINOR + 4 == RETVAL_VECTOR_OFFSET);
// A full upload block plus its `VpUpload` arguments must fit one record.
const _: () = assert!(COMMAND_HEADER_BYTES + 8 + BLOCK_SIZE <= COMMAND_AREA_BYTES);
const _: () = assert!(BLOCK_SIZE <= RETVAL_VECTOR_MAX_BYTES);

/// Size in bytes of a `width` x `height` published frame, or `None` on
/// overflow.
pub fn framebuffer_bytes(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(FRAMEBUFFER_BYTES_PER_PIXEL)
}

/// Whether a frame of the given dimensions fits the framebuffer region of a
/// segment of `total_size` bytes.
pub fn framebuffer_fits(total_size: usize, width: u32, height: u32) -> bool {
    framebuffer_bytes(width, height)
        .and_then(|len| FRAMEBUFFER_REGION_OFFSET.checked_add(len))
        .is_some_and(|end| end <= total_size)
}

/// Packs two 16-bit values the way `GetSize` reports drawable dimensions.
pub const fn pack_dims(width: u32, height: u32) -> u32 {
    (width << 16) | (height & 0xFFFF)
}

pub const fn unpack_dims(packed: u32) -> (u32, u32) {
    ((packed >> 16) & 0xFFFF, packed & 0xFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_disjoint_and_ordered() {
        assert!(RETVAL_VECTOR_OFFSET + RETVAL_VECTOR_MAX_BYTES <= COMMAND_AREA_OFFSET);
        assert!(COMMAND_AREA_OFFSET + COMMAND_AREA_BYTES <= FRAMEBUFFER_REGION_OFFSET);
    }

    #[test]
    fn framebuffer_fit_respects_segment_size() {
        assert!(!framebuffer_fits(1 << 20, 800, 600));
        assert!(framebuffer_fits(1 << 22, 800, 600));
        assert!(framebuffer_fits(MIN_SEGMENT_BYTES, 0, 0));
        assert!(!framebuffer_fits(usize::MAX, u32::MAX, u32::MAX));
    }

    #[test]
    fn dims_pack_like_get_size() {
        assert_eq!(pack_dims(800, 600), (800 << 16) | 600);
        assert_eq!(unpack_dims(pack_dims(1920, 1080)), (1920, 1080));
    }
}
