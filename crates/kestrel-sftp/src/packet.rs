//! SFTPv6 packet types
//!
//! One [`Packet`] variant per implemented wire type, each with its own
//! decode and encode routine. Dispatch over received packets is a `match`
//! on the enum, so adding a variant without handling it everywhere is a
//! compile error. Type codes the server does not implement are not in
//! [`PacketType`] at all; the session skips those frames.

use crate::attrs::{Attrs, ExtensionPair};
use crate::blob::Blob;
use crate::decode::Decoder;
use crate::encode::Encoder;
use crate::error::{Error, Result};

/// Protocol version this server speaks. Also the minimum accepted.
pub const SFTP_VERSION: u32 = 6;

/// Wire type codes of the packets this server implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Opendir = 11,
    Readdir = 12,
    Realpath = 16,
    Stat = 17,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
}

impl PacketType {
    /// Wire code for this packet type.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parses a wire code. `None` for anything not implemented here
    /// (including valid SFTPv6 codes like RENAME); the caller skips the
    /// frame.
    pub fn from_code(code: u8) -> Option<PacketType> {
        match code {
            1 => Some(PacketType::Init),
            2 => Some(PacketType::Version),
            3 => Some(PacketType::Open),
            4 => Some(PacketType::Close),
            5 => Some(PacketType::Read),
            6 => Some(PacketType::Write),
            7 => Some(PacketType::Lstat),
            8 => Some(PacketType::Fstat),
            9 => Some(PacketType::Setstat),
            11 => Some(PacketType::Opendir),
            12 => Some(PacketType::Readdir),
            16 => Some(PacketType::Realpath),
            17 => Some(PacketType::Stat),
            101 => Some(PacketType::Status),
            102 => Some(PacketType::Handle),
            103 => Some(PacketType::Data),
            104 => Some(PacketType::Name),
            105 => Some(PacketType::Attrs),
            _ => None,
        }
    }
}

/// SSH_FX status codes (SFTPv6 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
    InvalidHandle = 9,
    NoSuchPath = 10,
    FileAlreadyExists = 11,
    WriteProtect = 12,
    NoMedia = 13,
    NoSpaceOnFilesystem = 14,
    QuotaExceeded = 15,
    UnknownPrincipal = 16,
    LockConflict = 17,
    DirNotEmpty = 18,
    NotADirectory = 19,
    InvalidFilename = 20,
    LinkLoop = 21,
    CannotDelete = 22,
    InvalidParameter = 23,
    FileIsADirectory = 24,
    ByteRangeLockConflict = 25,
    ByteRangeLockRefused = 26,
    DeletePending = 27,
    FileCorrupt = 28,
    OwnerInvalid = 29,
    GroupInvalid = 30,
    NoMatchingByteRangeLock = 31,
}

impl ErrorCode {
    /// Wire value for this status code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Parses a wire value.
    pub fn from_code(code: u32) -> Option<ErrorCode> {
        use ErrorCode::*;
        Some(match code {
            0 => Ok,
            1 => Eof,
            2 => NoSuchFile,
            3 => PermissionDenied,
            4 => Failure,
            5 => BadMessage,
            6 => NoConnection,
            7 => ConnectionLost,
            8 => OpUnsupported,
            9 => InvalidHandle,
            10 => NoSuchPath,
            11 => FileAlreadyExists,
            12 => WriteProtect,
            13 => NoMedia,
            14 => NoSpaceOnFilesystem,
            15 => QuotaExceeded,
            16 => UnknownPrincipal,
            17 => LockConflict,
            18 => DirNotEmpty,
            19 => NotADirectory,
            20 => InvalidFilename,
            21 => LinkLoop,
            22 => CannotDelete,
            23 => InvalidParameter,
            24 => FileIsADirectory,
            25 => ByteRangeLockConflict,
            26 => ByteRangeLockRefused,
            27 => DeletePending,
            28 => FileCorrupt,
            29 => OwnerInvalid,
            30 => GroupInvalid,
            31 => NoMatchingByteRangeLock,
            _ => return None,
        })
    }

    /// Translates a filesystem error into the status code reported to the
    /// client. Unrecognized kinds collapse to the generic failure code.
    pub fn from_io(err: &std::io::Error) -> ErrorCode {
        match err.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::NoSuchFile,
            std::io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Failure,
        }
    }
}

/// ACE4 access-mask bits carried in OPEN's `desired-access` field. Only
/// the bits this server acts on are named.
pub struct AceMask;

impl AceMask {
    pub const READ_DATA: u32 = 0x0000_0001;
    pub const WRITE_DATA: u32 = 0x0000_0002;
    pub const APPEND_DATA: u32 = 0x0000_0004;
    pub const SYNCHRONIZE: u32 = 0x0010_0000;
}

/// OPEN `flags` field: low 3 bits select the access disposition, the rest
/// are independent flags.
pub struct OpenFlags;

impl OpenFlags {
    pub const ACCESS_DISPOSITION_MASK: u32 = 0x0000_0007;
    pub const CREATE_NEW: u32 = 0;
    pub const CREATE_TRUNCATE: u32 = 1;
    pub const OPEN_EXISTING: u32 = 2;
    pub const OPEN_OR_CREATE: u32 = 3;
    pub const TRUNCATE_EXISTING: u32 = 4;

    pub const APPEND_DATA: u32 = 0x0000_0008;
    pub const APPEND_DATA_ATOMIC: u32 = 0x0000_0010;
    pub const TEXT_MODE: u32 = 0x0000_0020;
    pub const NOFOLLOW: u32 = 0x0000_0400;
    pub const DELETE_ON_CLOSE: u32 = 0x0000_0800;
}

/// REALPATH control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RealpathControl {
    /// Normalize only, no filesystem access.
    NoCheck = 1,
    /// Stat if possible, degrade to empty attrs on failure.
    StatIf = 2,
    /// Stat, failing the request when the target does not exist.
    StatAlways = 3,
}

impl RealpathControl {
    /// Wire code for this control value.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parses a wire code.
    pub fn from_code(code: u8) -> Option<RealpathControl> {
        match code {
            1 => Some(RealpathControl::NoCheck),
            2 => Some(RealpathControl::StatIf),
            3 => Some(RealpathControl::StatAlways),
            _ => None,
        }
    }
}

/// One entry in a NAME reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub filename: String,
    pub attrs: Attrs,
}

/// An SFTP packet, request or reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Client hello carrying the highest version it speaks.
    Init { version: u32 },
    /// Server reply to INIT with the negotiated version.
    Version {
        version: u32,
        extensions: Vec<ExtensionPair>,
    },
    /// Open (and possibly create) a file.
    Open {
        request_id: u32,
        filename: String,
        desired_access: u32,
        flags: u32,
        attrs: Attrs,
    },
    /// Release a file or directory handle.
    Close { request_id: u32, handle: Blob },
    /// Read up to `length` bytes at `offset`.
    Read {
        request_id: u32,
        handle: Blob,
        offset: u64,
        length: u32,
    },
    /// Write `data` at `offset` (offset ignored for append handles).
    Write {
        request_id: u32,
        handle: Blob,
        offset: u64,
        data: Blob,
    },
    /// Stat without following a final symlink.
    Lstat {
        request_id: u32,
        path: String,
        flags: u32,
    },
    /// Stat an open handle.
    Fstat {
        request_id: u32,
        handle: Blob,
        flags: u32,
    },
    /// Write attributes to a path.
    Setstat {
        request_id: u32,
        path: String,
        attrs: Attrs,
    },
    /// Open a directory for iteration.
    Opendir { request_id: u32, path: String },
    /// Fetch the next batch of directory entries.
    Readdir { request_id: u32, handle: Blob },
    /// Canonicalize a path, optionally stat'ing the result.
    Realpath {
        request_id: u32,
        original_path: String,
        control: RealpathControl,
        compose_path: Vec<String>,
    },
    /// Stat following symlinks.
    Stat {
        request_id: u32,
        path: String,
        flags: u32,
    },
    /// Operation outcome.
    Status {
        request_id: u32,
        code: ErrorCode,
        message: String,
        language: String,
    },
    /// Reply carrying a newly allocated handle.
    Handle { request_id: u32, handle: Blob },
    /// Reply to READ.
    Data {
        request_id: u32,
        data: Blob,
        end_of_file: bool,
    },
    /// Reply carrying one or more named entries.
    Name {
        request_id: u32,
        entries: Vec<NameEntry>,
        end_of_list: Option<bool>,
    },
    /// Reply to the stat family.
    Attrs { request_id: u32, attrs: Attrs },
}

impl Packet {
    /// Wire type of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Init { .. } => PacketType::Init,
            Packet::Version { .. } => PacketType::Version,
            Packet::Open { .. } => PacketType::Open,
            Packet::Close { .. } => PacketType::Close,
            Packet::Read { .. } => PacketType::Read,
            Packet::Write { .. } => PacketType::Write,
            Packet::Lstat { .. } => PacketType::Lstat,
            Packet::Fstat { .. } => PacketType::Fstat,
            Packet::Setstat { .. } => PacketType::Setstat,
            Packet::Opendir { .. } => PacketType::Opendir,
            Packet::Readdir { .. } => PacketType::Readdir,
            Packet::Realpath { .. } => PacketType::Realpath,
            Packet::Stat { .. } => PacketType::Stat,
            Packet::Status { .. } => PacketType::Status,
            Packet::Handle { .. } => PacketType::Handle,
            Packet::Data { .. } => PacketType::Data,
            Packet::Name { .. } => PacketType::Name,
            Packet::Attrs { .. } => PacketType::Attrs,
        }
    }

    /// Request id, when this packet carries one (INIT and VERSION do not).
    pub fn request_id(&self) -> Option<u32> {
        match self {
            Packet::Init { .. } | Packet::Version { .. } => None,
            Packet::Open { request_id, .. }
            | Packet::Close { request_id, .. }
            | Packet::Read { request_id, .. }
            | Packet::Write { request_id, .. }
            | Packet::Lstat { request_id, .. }
            | Packet::Fstat { request_id, .. }
            | Packet::Setstat { request_id, .. }
            | Packet::Opendir { request_id, .. }
            | Packet::Readdir { request_id, .. }
            | Packet::Realpath { request_id, .. }
            | Packet::Stat { request_id, .. }
            | Packet::Status { request_id, .. }
            | Packet::Handle { request_id, .. }
            | Packet::Data { request_id, .. }
            | Packet::Name { request_id, .. }
            | Packet::Attrs { request_id, .. } => Some(*request_id),
        }
    }

    /// True for the client-to-server request types that demand exactly
    /// one reply.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Packet::Open { .. }
                | Packet::Close { .. }
                | Packet::Read { .. }
                | Packet::Write { .. }
                | Packet::Lstat { .. }
                | Packet::Fstat { .. }
                | Packet::Setstat { .. }
                | Packet::Opendir { .. }
                | Packet::Readdir { .. }
                | Packet::Realpath { .. }
                | Packet::Stat { .. }
        )
    }

    /// Decodes the body of a frame whose type byte parsed to `ty`.
    pub fn decode<D: Decoder>(ty: PacketType, dec: &mut D) -> Result<Packet> {
        match ty {
            PacketType::Init => Ok(Packet::Init {
                version: dec.read_u32()?,
            }),
            PacketType::Version => {
                let version = dec.read_u32()?;
                let mut extensions = Vec::new();
                while let Some(name) = dec.read_opt_string()? {
                    let data = dec.read_string()?;
                    extensions.push(ExtensionPair { name, data });
                }
                Ok(Packet::Version {
                    version,
                    extensions,
                })
            }
            PacketType::Open => {
                let request_id = dec.read_u32()?;
                let filename = dec.read_string()?;
                let desired_access = dec.read_opt_u32()?.unwrap_or(0);
                let flags = dec.read_opt_u32()?.unwrap_or(0);
                let attrs =
                    Attrs::decode_opt(dec)?.unwrap_or_else(|| Attrs::empty(crate::attrs::FileType::Unknown));
                Ok(Packet::Open {
                    request_id,
                    filename,
                    desired_access,
                    flags,
                    attrs,
                })
            }
            PacketType::Close => Ok(Packet::Close {
                request_id: dec.read_u32()?,
                handle: dec.read_blob()?,
            }),
            PacketType::Read => Ok(Packet::Read {
                request_id: dec.read_u32()?,
                handle: dec.read_blob()?,
                offset: dec.read_u64()?,
                length: dec.read_u32()?,
            }),
            PacketType::Write => Ok(Packet::Write {
                request_id: dec.read_u32()?,
                handle: dec.read_blob()?,
                offset: dec.read_u64()?,
                data: dec.read_blob()?,
            }),
            PacketType::Lstat => Ok(Packet::Lstat {
                request_id: dec.read_u32()?,
                path: dec.read_string()?,
                flags: dec.read_u32()?,
            }),
            PacketType::Fstat => Ok(Packet::Fstat {
                request_id: dec.read_u32()?,
                handle: dec.read_blob()?,
                flags: dec.read_u32()?,
            }),
            PacketType::Setstat => Ok(Packet::Setstat {
                request_id: dec.read_u32()?,
                path: dec.read_string()?,
                attrs: Attrs::decode(dec)?,
            }),
            PacketType::Opendir => Ok(Packet::Opendir {
                request_id: dec.read_u32()?,
                path: dec.read_string()?,
            }),
            PacketType::Readdir => Ok(Packet::Readdir {
                request_id: dec.read_u32()?,
                handle: dec.read_blob()?,
            }),
            PacketType::Realpath => {
                let request_id = dec.read_u32()?;
                let original_path = dec.read_string()?;
                let control = match dec.read_opt_u8()? {
                    None => RealpathControl::NoCheck,
                    Some(code) => RealpathControl::from_code(code).ok_or_else(|| {
                        Error::protocol(format!("unknown realpath control byte {code}"))
                    })?,
                };
                let mut compose_path = Vec::new();
                while let Some(component) = dec.read_opt_string()? {
                    compose_path.push(component);
                }
                Ok(Packet::Realpath {
                    request_id,
                    original_path,
                    control,
                    compose_path,
                })
            }
            PacketType::Stat => Ok(Packet::Stat {
                request_id: dec.read_u32()?,
                path: dec.read_string()?,
                flags: dec.read_u32()?,
            }),
            PacketType::Status => {
                let request_id = dec.read_u32()?;
                let raw = dec.read_u32()?;
                let code = ErrorCode::from_code(raw)
                    .ok_or_else(|| Error::protocol(format!("unknown status code {raw}")))?;
                Ok(Packet::Status {
                    request_id,
                    code,
                    message: dec.read_string()?,
                    language: dec.read_string()?,
                })
            }
            PacketType::Handle => Ok(Packet::Handle {
                request_id: dec.read_u32()?,
                handle: dec.read_blob()?,
            }),
            PacketType::Data => Ok(Packet::Data {
                request_id: dec.read_u32()?,
                data: dec.read_blob()?,
                end_of_file: dec.read_opt_bool()?.unwrap_or(false),
            }),
            PacketType::Name => {
                let request_id = dec.read_u32()?;
                let count = dec.read_u32()?;
                let mut entries = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let filename = dec.read_string()?;
                    let attrs = Attrs::decode(dec)?;
                    entries.push(NameEntry { filename, attrs });
                }
                Ok(Packet::Name {
                    request_id,
                    entries,
                    end_of_list: dec.read_opt_bool()?,
                })
            }
            PacketType::Attrs => Ok(Packet::Attrs {
                request_id: dec.read_u32()?,
                attrs: Attrs::decode(dec)?,
            }),
        }
    }

    /// Encodes the packet body (everything after the type byte).
    pub fn encode_body<E: Encoder>(&self, enc: &mut E) -> Result<()> {
        match self {
            Packet::Init { version } => enc.put_u32(*version),
            Packet::Version {
                version,
                extensions,
            } => {
                enc.put_u32(*version)?;
                for ext in extensions {
                    enc.put_str(&ext.name)?;
                    enc.put_str(&ext.data)?;
                }
                Ok(())
            }
            Packet::Open {
                request_id,
                filename,
                desired_access,
                flags,
                attrs,
            } => {
                enc.put_u32(*request_id)?;
                enc.put_str(filename)?;
                enc.put_u32(*desired_access)?;
                enc.put_u32(*flags)?;
                attrs.encode(enc)
            }
            Packet::Close { request_id, handle } => {
                enc.put_u32(*request_id)?;
                enc.put_blob(handle)
            }
            Packet::Read {
                request_id,
                handle,
                offset,
                length,
            } => {
                enc.put_u32(*request_id)?;
                enc.put_blob(handle)?;
                enc.put_u64(*offset)?;
                enc.put_u32(*length)
            }
            Packet::Write {
                request_id,
                handle,
                offset,
                data,
            } => {
                enc.put_u32(*request_id)?;
                enc.put_blob(handle)?;
                enc.put_u64(*offset)?;
                enc.put_blob(data)
            }
            Packet::Lstat {
                request_id,
                path,
                flags,
            }
            | Packet::Stat {
                request_id,
                path,
                flags,
            } => {
                enc.put_u32(*request_id)?;
                enc.put_str(path)?;
                enc.put_u32(*flags)
            }
            Packet::Fstat {
                request_id,
                handle,
                flags,
            } => {
                enc.put_u32(*request_id)?;
                enc.put_blob(handle)?;
                enc.put_u32(*flags)
            }
            Packet::Setstat {
                request_id,
                path,
                attrs,
            } => {
                enc.put_u32(*request_id)?;
                enc.put_str(path)?;
                attrs.encode(enc)
            }
            Packet::Opendir { request_id, path } => {
                enc.put_u32(*request_id)?;
                enc.put_str(path)
            }
            Packet::Readdir { request_id, handle } => {
                enc.put_u32(*request_id)?;
                enc.put_blob(handle)
            }
            Packet::Realpath {
                request_id,
                original_path,
                control,
                compose_path,
            } => {
                enc.put_u32(*request_id)?;
                enc.put_str(original_path)?;
                // The control byte and compose list are both optional; a
                // lone NO_CHECK with no components is spelled by omission.
                if *control != RealpathControl::NoCheck || !compose_path.is_empty() {
                    enc.put_u8(control.code())?;
                }
                for component in compose_path {
                    enc.put_str(component)?;
                }
                Ok(())
            }
            Packet::Status {
                request_id,
                code,
                message,
                language,
            } => {
                enc.put_u32(*request_id)?;
                enc.put_u32(code.code())?;
                enc.put_str(message)?;
                enc.put_str(language)
            }
            Packet::Handle { request_id, handle } => {
                enc.put_u32(*request_id)?;
                enc.put_blob(handle)
            }
            Packet::Data {
                request_id,
                data,
                end_of_file,
            } => {
                enc.put_u32(*request_id)?;
                enc.put_blob(data)?;
                // Trailing optional field, written only when true.
                if *end_of_file {
                    enc.put_bool(true)?;
                }
                Ok(())
            }
            Packet::Name {
                request_id,
                entries,
                end_of_list,
            } => {
                enc.put_u32(*request_id)?;
                enc.put_u32(entries.len() as u32)?;
                for entry in entries {
                    enc.put_str(&entry.filename)?;
                    entry.attrs.encode(enc)?;
                }
                if let Some(eol) = end_of_list {
                    enc.put_bool(*eol)?;
                }
                Ok(())
            }
            Packet::Attrs { request_id, attrs } => {
                enc.put_u32(*request_id)?;
                attrs.encode(enc)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::SliceDecoder;

    #[test]
    fn test_type_codes_round_trip() {
        for code in 0..=u8::MAX {
            if let Some(ty) = PacketType::from_code(code) {
                assert_eq!(ty.code(), code);
            }
        }
        assert!(PacketType::from_code(13).is_none()); // REMOVE, unimplemented
        assert!(PacketType::from_code(18).is_none()); // RENAME, unimplemented
    }

    #[test]
    fn test_error_codes_round_trip() {
        for code in 0..=31 {
            assert_eq!(ErrorCode::from_code(code).unwrap().code(), code);
        }
        assert!(ErrorCode::from_code(32).is_none());
    }

    #[test]
    fn test_open_defaults_for_omitted_fields() {
        // id + filename only; access, flags and attrs are all omitted.
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_be_bytes());
        body.extend_from_slice(&5u32.to_be_bytes());
        body.extend_from_slice(b"a.txt");
        let mut dec = SliceDecoder::new(&body);
        let packet = Packet::decode(PacketType::Open, &mut dec).unwrap();
        match packet {
            Packet::Open {
                request_id,
                filename,
                desired_access,
                flags,
                attrs,
            } => {
                assert_eq!(request_id, 7);
                assert_eq!(filename, "a.txt");
                assert_eq!(desired_access, 0);
                assert_eq!(flags, 0);
                assert_eq!(attrs.valid_flags(), 0);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_realpath_control_defaults_to_no_check() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(b".");
        let mut dec = SliceDecoder::new(&body);
        match Packet::decode(PacketType::Realpath, &mut dec).unwrap() {
            Packet::Realpath {
                control,
                compose_path,
                ..
            } => {
                assert_eq!(control, RealpathControl::NoCheck);
                assert!(compose_path.is_empty());
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_io_error_translation() {
        use std::io::{Error as IoError, ErrorKind};
        assert_eq!(
            ErrorCode::from_io(&IoError::new(ErrorKind::NotFound, "gone")),
            ErrorCode::NoSuchFile
        );
        assert_eq!(
            ErrorCode::from_io(&IoError::new(ErrorKind::PermissionDenied, "no")),
            ErrorCode::PermissionDenied
        );
        assert_eq!(
            ErrorCode::from_io(&IoError::other("boom")),
            ErrorCode::Failure
        );
    }
}
