//! The closed command enumeration and its argument layouts.
//!
//! Every command is one row of [`COMMAND_TABLE`]: identifier, name, argument
//! shape and return contract. The codec and the host dispatcher are both
//! driven from this table.

use std::fmt;

/// Wire shape of one argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    U32,
    I32,
    F32,
    F64,
    U64,
    /// Fixed number of `f32`s, no length prefix.
    F32Array(usize),
    /// Length-prefixed `u32` list.
    U32Slice,
    /// Length-prefixed byte block, padded to 4 bytes.
    Bytes,
    /// Bytes delivered by the preceding bulk upload. Nothing on the wire.
    Staged,
}

/// How a command reports its result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnKind {
    /// `retval` is the OK sentinel.
    None,
    /// `retval` is the value.
    Scalar,
    /// `retval` is the byte length of the vector slot contents.
    Vector,
    /// `retval` is the total size; the bytes follow via `VpDownload`.
    Download,
}

#[derive(Debug)]
pub struct CommandRow {
    pub id: CommandId,
    pub name: &'static str,
    pub args: &'static [ArgKind],
    pub returns: ReturnKind,
}

macro_rules! command_table {
    ($($variant:ident = $id:literal => [$($arg:expr),* $(,)?] -> $ret:ident;)*) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(u32)]
        pub enum CommandId {
            $($variant = $id,)*
        }

        /// Every command, indexed by `id - 1`.
        pub const COMMAND_TABLE: &[CommandRow] = &[
            $(CommandRow {
                id: CommandId::$variant,
                name: stringify!($variant),
                args: &[$($arg),*],
                returns: ReturnKind::$ret,
            },)*
        ];
    };
}

use ArgKind::{Bytes, F32Array, Staged, U32Slice, F32, F64, I32, U32, U64};

command_table! {
    Nop = 1 => [] -> Scalar;
    GetContext = 2 => [] -> Scalar;
    SetContext = 3 => [U32] -> Scalar;
    GetSize = 4 => [] -> Scalar;
    CreateContext = 5 => [] -> Scalar;
    RequestFramebuffer = 6 => [U32, U32] -> Scalar;
    ReportDims = 7 => [U32, U32] -> None;
    HelloWorld = 8 => [U32] -> Scalar;
    GoodbyeWorld = 9 => [] -> None;
    VpUpload = 10 => [U32, Bytes] -> Scalar;
    VpUploadStay = 11 => [Bytes] -> Scalar;
    VpNull = 12 => [] -> None;
    VpDownload = 13 => [] -> Vector;

    Viewport = 14 => [I32, I32, I32, I32] -> None;
    Scissor = 15 => [I32, I32, I32, I32] -> None;
    ClearColor = 16 => [F32, F32, F32, F32] -> None;
    ClearDepth = 17 => [F64] -> None;
    Clear = 18 => [U32] -> None;
    Enable = 19 => [U32] -> None;
    Disable = 20 => [U32] -> None;
    IsEnabled = 21 => [U32] -> Scalar;
    BlendFunc = 22 => [U32, U32] -> None;
    DepthFunc = 23 => [U32] -> None;
    GetError = 24 => [] -> Scalar;
    GetIntegerv = 25 => [U32] -> Vector;
    GetFloatv = 26 => [U32] -> Vector;
    GetString = 27 => [U32] -> Vector;
    GenBuffers = 28 => [U32] -> Vector;
    DeleteBuffers = 29 => [U32Slice] -> None;
    BindBuffer = 30 => [U32, U32] -> None;
    BufferData = 31 => [U32, U32, Staged] -> None;
    BufferSubData = 32 => [U32, U32, Staged] -> None;
    GetBufferSubData = 33 => [U32, U32, U32] -> Download;
    GenTextures = 34 => [U32] -> Vector;
    DeleteTextures = 35 => [U32Slice] -> None;
    BindTexture = 36 => [U32, U32] -> None;
    TexParameteri = 37 => [U32, U32, I32] -> None;
    TexImage2D = 38 => [U32, I32, I32, I32, I32, U32, U32, Staged] -> None;
    DrawArrays = 39 => [U32, I32, I32] -> None;
    ReadPixels = 40 => [I32, I32, I32, I32, U32, U32] -> Download;
    Finish = 41 => [] -> None;
    Flush = 42 => [] -> None;
    Color4fv = 43 => [F32Array(4)] -> None;
    MatrixMode = 44 => [U32] -> None;
    LoadMatrixf = 45 => [F32Array(16)] -> None;
    PixelStorei = 46 => [U32, I32] -> None;
    DepthRange = 47 => [F64, F64] -> None;
    LineWidth = 48 => [F32] -> None;
    FenceSync = 49 => [U32, U32] -> Scalar;
    ClientWaitSync = 50 => [U32, U32, U64] -> Scalar;
}

// `CommandId::row` indexes the table by `id - 1`.
const _: () = {
    let mut i = 0;
    while i < COMMAND_TABLE.len() {
        assert!(COMMAND_TABLE[i].id as usize == i + 1);
        i += 1;
    }
};

impl CommandId {
    pub fn from_u32(value: u32) -> Option<Self> {
        let index = (value as usize).checked_sub(1)?;
        COMMAND_TABLE.get(index).map(|row| row.id)
    }

    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn row(self) -> &'static CommandRow {
        &COMMAND_TABLE[self as usize - 1]
    }

    pub fn name(self) -> &'static str {
        self.row().name
    }

    pub fn args(self) -> &'static [ArgKind] {
        self.row().args
    }

    pub fn returns(self) -> ReturnKind {
        self.row().returns
    }

    pub fn takes_staged(self) -> bool {
        self.args().contains(&ArgKind::Staged)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
