//! WSFS wire protocol constants and shared record types.
//!
//! Every frame, in both directions, starts with a one-byte client mark
//! followed by a one-byte code: the command opcode on requests and the
//! status code on responses. All fixed-width integers are little-endian;
//! strings are NUL-terminated UTF-8.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use crate::buffer::Frame;

/// Maximum length in bytes of one WebSocket message, header included.
pub const MAX_FRAME: usize = 8192;

/// Bytes of payload that fit in a streamed response frame after the
/// two-byte header.
pub const DATA_PER_FRAME: u64 = (MAX_FRAME - 2) as u64;

/// WebSocket subprotocol spoken by this crate. Negotiation is by exact
/// string match; `WSFS/draft.1` peers are rejected.
pub const SUBPROTOCOL: &str = "WSFS/draft.2";

/// HTTP header carrying the resume id: set on the upgrade response when a
/// session is created, echoed on the upgrade request when resuming.
pub const RESUME_HEADER: &str = "x-wsfs-resume";

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Open = 1,
    Close = 2,
    Read = 3,
    ReadDir = 4,
    ReadLink = 5,
    Write = 6,
    Seek = 7,
    Allocate = 8,
    GetAttr = 9,
    SetAttr = 10,
    Sync = 11,
    Mkdir = 12,
    SymLink = 13,
    Remove = 14,
    RmDir = 15,
    FsStat = 16,
    ReadAt = 17,
    WriteAt = 18,
    CopyFileRange = 19,
    Rename = 20,
    SetAttrByFd = 21,
    TreeDir = 22,
}

/// Response status codes.
///
/// [`ErrorCode::PartialResponse`] tags every non-terminal frame of a
/// multi-frame reply; any other code terminates the reply for its mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    PartialResponse = 1,
    Unknown = 2,
    Busy = 3,
    Exists = 4,
    NotExists = 5,
    Loop = 6,
    NoSpace = 7,
    NotEmpty = 8,
    Invalid = 9,
    InvalidFd = 10,
    Type = 11,
    Io = 12,
    NotSupport = 13,
    Access = 14,
    TooLong = 15,
}

impl ErrorCode {
    /// Decodes a status byte, collapsing out-of-range values to
    /// [`ErrorCode::Unknown`].
    pub fn from_wire(code: u8) -> Self {
        Self::from_u8(code).unwrap_or(ErrorCode::Unknown)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorCode::Ok => "ok",
            ErrorCode::PartialResponse => "partial response",
            ErrorCode::Unknown => "unknown error",
            ErrorCode::Busy => "resource busy",
            ErrorCode::Exists => "already exists",
            ErrorCode::NotExists => "no such file or directory",
            ErrorCode::Loop => "too many levels of symbolic links",
            ErrorCode::NoSpace => "no space left",
            ErrorCode::NotEmpty => "directory not empty",
            ErrorCode::Invalid => "invalid argument",
            ErrorCode::InvalidFd => "invalid file handle",
            ErrorCode::Type => "wrong file type",
            ErrorCode::Io => "i/o error",
            ErrorCode::NotSupport => "operation not supported",
            ErrorCode::Access => "access denied",
            ErrorCode::TooLong => "name too long",
        };
        f.write_str(text)
    }
}

impl std::error::Error for ErrorCode {}

// Open flags, POSIX semantics. The low two bits select the access mode.
pub const O_RDONLY: u32 = 0x0;
pub const O_WRONLY: u32 = 0x1;
pub const O_RDWR: u32 = 0x2;
pub const O_CREAT: u32 = 0x40;
pub const O_EXCL: u32 = 0x80;
pub const O_TRUNC: u32 = 0x200;
pub const O_APPEND: u32 = 0x400;
pub const O_DIRECTORY: u32 = 0x10000;

pub const ACCESS_MODE_MASK: u32 = 0x3;

// Allocate flags.
pub const FALLOC_FL_FALLOCATE: u32 = 0x00;
pub const FALLOC_FL_KEEP_SIZE: u32 = 0x01;
pub const FALLOC_FL_PUNCH_HOLE: u32 = 0x02;
pub const FALLOC_FL_COLLAPSE_RANGE: u32 = 0x08;
pub const FALLOC_FL_ZERO_RANGE: u32 = 0x10;
pub const FALLOC_FL_INSERT_RANGE: u32 = 0x20;
pub const FALLOC_FL_UNSHARE_RANGE: u32 = 0x40;

// Seek whence values. DATA and HOLE answer `NotSupport` on hosts without
// sparse-file seeking.
pub const SEEK_SET: u8 = 0;
pub const SEEK_CUR: u8 = 1;
pub const SEEK_END: u8 = 2;
pub const SEEK_DATA: u8 = 3;
pub const SEEK_HOLE: u8 = 4;

// Owner bits: bit 0 set when the file uid matches the configured
// principal uid, bit 1 for the gid.
pub const OWNER_NN: u8 = 0;
pub const OWNER_UN: u8 = 1;
pub const OWNER_NG: u8 = 2;
pub const OWNER_UG: u8 = 3;

// SetAttr flag bits. Unset fields are left unchanged.
pub const SETATTR_SIZE: u8 = 0b0001;
pub const SETATTR_MTIME: u8 = 0b0010;
pub const SETATTR_MODE: u8 = 0b0100;
pub const SETATTR_OWNER: u8 = 0b1000;

// TreeDir per-entry status bytes.
pub const TREEDIR_OK: u8 = 0;
pub const TREEDIR_OK_WITH_DATA: u8 = 1;
pub const TREEDIR_ENTER_DIR: u8 = 2;
pub const TREEDIR_END_DIR: u8 = 3;
pub const TREEDIR_END_DIR_WITH_FAIL: u8 = 4;

// Rename flags, renameat2 subset. Unknown bits answer `NotSupport`.
pub const RENAME_NOREPLACE: u32 = 0x1;
pub const RENAME_EXCHANGE: u32 = 0x2;

/// Fixed-width tail of a directory record: size, mtime, mode, owner.
pub const FILE_INFO_LEN: usize = 8 + 8 + 4 + 1;

/// File attributes as carried on the wire.
#[cfg_attr(test, derive(PartialEq, Eq))]
#[derive(Debug, Clone, Copy, Default)]
pub struct FileInfo {
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    /// POSIX mode bits including the file type.
    pub mode: u32,
    pub owner: u8,
}

impl FileInfo {
    /// Appends the fixed-width wire form to `frame`.
    pub fn put(&self, frame: &mut Frame) {
        frame.put_u64(self.size);
        frame.put_i64(self.mtime);
        frame.put_u32(self.mode);
        frame.put_u8(self.owner);
    }

    /// Reads the fixed-width wire form at `off`, or `None` when the frame
    /// is too short.
    pub fn read(frame: &Frame, off: usize) -> Option<FileInfo> {
        if !frame.ensure(off + FILE_INFO_LEN) {
            return None;
        }
        Some(FileInfo {
            size: frame.read_u64(off),
            mtime: frame.read_i64(off + 8),
            mode: frame.read_u32(off + 16),
            owner: frame.read_u8(off + 20),
        })
    }
}

/// One directory listing record.
#[cfg_attr(test, derive(PartialEq, Eq))]
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub info: FileInfo,
}

/// Filesystem totals returned by FsStat.
#[cfg_attr(test, derive(PartialEq, Eq))]
#[derive(Debug, Clone, Copy, Default)]
pub struct FsTotals {
    pub total: u64,
    pub free: u64,
    pub available: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_discriminants_are_stable() {
        assert_eq!(Opcode::from_u8(1), Some(Opcode::Open));
        assert_eq!(Opcode::from_u8(17), Some(Opcode::ReadAt));
        assert_eq!(Opcode::from_u8(22), Some(Opcode::TreeDir));
        assert_eq!(Opcode::from_u8(0), None);
        assert_eq!(Opcode::from_u8(23), None);
    }

    #[test]
    fn error_code_from_wire_collapses_unknown() {
        assert_eq!(ErrorCode::from_wire(0), ErrorCode::Ok);
        assert_eq!(ErrorCode::from_wire(15), ErrorCode::TooLong);
        assert_eq!(ErrorCode::from_wire(200), ErrorCode::Unknown);
    }

    #[test]
    fn file_info_round_trip() {
        let info = FileInfo { size: 42, mtime: -7, mode: 0o100644, owner: OWNER_UG };
        let mut frame = crate::buffer::take();
        frame.put_u8(0);
        frame.put_u8(0);
        info.put(&mut frame);
        assert_eq!(FileInfo::read(&frame, 2), Some(info));
        assert_eq!(FileInfo::read(&frame, 3), None);
    }
}
