//! Typed access to the control registers.

use crate::layout::reg_offset;

/// A 32-bit control register in the register page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reg {
    Submit,
    Retval,
    ReadyHint,
    Lock,
    ClaimId,
    Connect,
    FramebufferOffsetLo,
    FramebufferOffsetHi,
    TotalSizeLo,
    TotalSizeHi,
    Status,
    ApiMajor,
    ApiMinor,
}

impl Reg {
    pub const ALL: [Reg; 13] = [
        Reg::Submit,
        Reg::Retval,
        Reg::ReadyHint,
        Reg::Lock,
        Reg::ClaimId,
        Reg::Connect,
        Reg::FramebufferOffsetLo,
        Reg::FramebufferOffsetHi,
        Reg::TotalSizeLo,
        Reg::TotalSizeHi,
        Reg::Status,
        Reg::ApiMajor,
        Reg::ApiMinor,
    ];

    pub const fn offset(self) -> usize {
        match self {
            Reg::Submit => reg_offset::SUBMIT,
            Reg::Retval => reg_offset::RETVAL,
            Reg::ReadyHint => reg_offset::READY_HINT,
            Reg::Lock => reg_offset::LOCK,
            Reg::ClaimId => reg_offset::CLAIM_ID,
            Reg::Connect => reg_offset::CONNECT,
            Reg::FramebufferOffsetLo => reg_offset::FRAMEBUFFER_OFFSET_LO,
            Reg::FramebufferOffsetHi => reg_offset::FRAMEBUFFER_OFFSET_HI,
            Reg::TotalSizeLo => reg_offset::TOTAL_SIZE_LO,
            Reg::TotalSizeHi => reg_offset::TOTAL_SIZE_HI,
            Reg::Status => reg_offset::STATUS,
            Reg::ApiMajor => reg_offset::API_MAJOR,
            Reg::ApiMinor => reg_offset::API_MINOR,
        }
    }

    /// Index of the register when the register page is viewed as `u32[]`.
    pub const fn index(self) -> usize {
        self.offset() / 4
    }
}

/// Atomic view of the register page.
///
/// Implementations must perform every operation with sequentially consistent
/// ordering: the cycle protocol relies on a `submit` store being observed only
/// after the command area write that preceded it, and on `ready_hint` being
/// observed only after the result writes.
pub trait RegisterFile {
    fn load(&self, reg: Reg) -> u32;

    fn store(&self, reg: Reg, value: u32);

    /// Atomically replaces `current` with `new`, returning the previous value
    /// in either case.
    fn compare_exchange(&self, reg: Reg, current: u32, new: u32) -> Result<u32, u32>;

    fn load_u64(&self, lo: Reg, hi: Reg) -> u64 {
        (self.load(hi) as u64) << 32 | self.load(lo) as u64
    }

    fn store_u64(&self, lo: Reg, hi: Reg, value: u64) {
        self.store(lo, value as u32);
        self.store(hi, (value >> 32) as u32);
    }
}
