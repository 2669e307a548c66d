//! SFTPv6 file attribute records
//!
//! An attribute record is a 32-bit validity mask followed by a file type
//! byte and then one field per set mask bit, in a fixed order. Fields are
//! modeled as `Option`s and the mask is derived from which fields are
//! populated, so an encoded record can never disagree with its mask.
//! Decoding reconstructs the mask from the fields it consumed and rejects
//! the record when the result differs from the declared mask, since a
//! mismatch means the field boundaries were misread.

use crate::decode::Decoder;
use crate::encode::Encoder;
use crate::error::{Error, Result};

/// Validity mask bits (`valid-attribute-flags` in the protocol).
pub struct AttrFlags;

impl AttrFlags {
    pub const SIZE: u32 = 0x0000_0001;
    pub const PERMISSIONS: u32 = 0x0000_0004;
    pub const ACCESS_TIME: u32 = 0x0000_0008;
    pub const CREATE_TIME: u32 = 0x0000_0010;
    pub const MODIFY_TIME: u32 = 0x0000_0020;
    pub const ACL: u32 = 0x0000_0040;
    pub const OWNER_GROUP: u32 = 0x0000_0080;
    pub const SUBSECOND_TIMES: u32 = 0x0000_0100;
    pub const BITS: u32 = 0x0000_0200;
    pub const ALLOCATION_SIZE: u32 = 0x0000_0400;
    pub const TEXT_HINT: u32 = 0x0000_0800;
    pub const MIME_TYPE: u32 = 0x0000_1000;
    pub const LINK_COUNT: u32 = 0x0000_2000;
    pub const UNTRANSLATED_NAME: u32 = 0x0000_4000;
    pub const CTIME: u32 = 0x0000_8000;
    pub const EXTENDED: u32 = 0x8000_0000;

    /// Everything, for requests that want all available attributes.
    pub const ALL: u32 = 0xFFFF_FFFF;
}

/// `attrib-bits` flag values.
pub struct FileBits;

impl FileBits {
    pub const READONLY: u32 = 0x0000_0001;
    pub const SYSTEM: u32 = 0x0000_0002;
    pub const HIDDEN: u32 = 0x0000_0004;
    pub const CASE_INSENSITIVE: u32 = 0x0000_0008;
    pub const ARCHIVE: u32 = 0x0000_0010;
    pub const ENCRYPTED: u32 = 0x0000_0020;
    pub const COMPRESSED: u32 = 0x0000_0040;
    pub const SPARSE: u32 = 0x0000_0080;
    pub const APPEND_ONLY: u32 = 0x0000_0100;
    pub const IMMUTABLE: u32 = 0x0000_0200;
    pub const SYNC: u32 = 0x0000_0400;
    pub const TRANSLATION_ERR: u32 = 0x0000_0800;
}

/// File type codes carried in the attribute record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Regular = 1,
    Directory = 2,
    Symlink = 3,
    Special = 4,
    Unknown = 5,
    Socket = 6,
    CharDevice = 7,
    BlockDevice = 8,
    Fifo = 9,
}

impl FileType {
    /// Wire code for this type.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parses a wire code.
    pub fn from_code(code: u8) -> Option<FileType> {
        match code {
            1 => Some(FileType::Regular),
            2 => Some(FileType::Directory),
            3 => Some(FileType::Symlink),
            4 => Some(FileType::Special),
            5 => Some(FileType::Unknown),
            6 => Some(FileType::Socket),
            7 => Some(FileType::CharDevice),
            8 => Some(FileType::BlockDevice),
            9 => Some(FileType::Fifo),
            _ => None,
        }
    }
}

/// Seconds since the epoch plus an optional sub-second component.
///
/// The nanoseconds field is only carried on the wire when the record's
/// SUBSECOND_TIMES bit is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanoseconds: u32,
}

impl Timestamp {
    /// A whole-second timestamp.
    pub fn from_seconds(seconds: i64) -> Self {
        Timestamp {
            seconds,
            nanoseconds: 0,
        }
    }
}

/// `attrib-bits` / `attrib-bits-valid` pair. A bit in `bits` is only
/// meaningful when the same bit is set in `valid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttribBits {
    pub bits: u32,
    pub valid: u32,
}

impl AttribBits {
    /// Marks `mask` as known and sets or clears it.
    pub fn set(&mut self, mask: u32, on: bool) {
        self.valid |= mask;
        if on {
            self.bits |= mask;
        } else {
            self.bits &= !mask;
        }
    }
}

/// Vendor extension attribute, an opaque name/data pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionPair {
    pub name: String,
    pub data: String,
}

/// SFTPv6 file attribute record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attrs {
    pub file_type: FileType,
    /// When set, every timestamp carries a nanoseconds component.
    pub subsecond_times: bool,
    pub size: Option<u64>,
    pub allocation_size: Option<u64>,
    pub owner_group: Option<(String, String)>,
    pub permissions: Option<u32>,
    pub access_time: Option<Timestamp>,
    pub create_time: Option<Timestamp>,
    pub modify_time: Option<Timestamp>,
    pub change_time: Option<Timestamp>,
    pub acl: Option<String>,
    pub attrib_bits: Option<AttribBits>,
    pub text_hint: Option<u8>,
    pub mime_type: Option<String>,
    pub link_count: Option<u32>,
    pub untranslated_name: Option<String>,
    pub extensions: Option<Vec<ExtensionPair>>,
}

impl Default for Attrs {
    fn default() -> Self {
        Attrs::empty(FileType::Unknown)
    }
}

impl Attrs {
    /// A record with only the file type populated.
    pub fn empty(file_type: FileType) -> Self {
        Attrs {
            file_type,
            subsecond_times: false,
            size: None,
            allocation_size: None,
            owner_group: None,
            permissions: None,
            access_time: None,
            create_time: None,
            modify_time: None,
            change_time: None,
            acl: None,
            attrib_bits: None,
            text_hint: None,
            mime_type: None,
            link_count: None,
            untranslated_name: None,
            extensions: None,
        }
    }

    /// Marks a platform attribute bit as known.
    pub fn set_attrib_bit(&mut self, mask: u32, on: bool) {
        self.attrib_bits
            .get_or_insert_with(AttribBits::default)
            .set(mask, on);
    }

    /// Derives the validity mask from the populated fields.
    pub fn valid_flags(&self) -> u32 {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= AttrFlags::SIZE;
        }
        if self.allocation_size.is_some() {
            flags |= AttrFlags::ALLOCATION_SIZE;
        }
        if self.owner_group.is_some() {
            flags |= AttrFlags::OWNER_GROUP;
        }
        if self.permissions.is_some() {
            flags |= AttrFlags::PERMISSIONS;
        }
        if self.access_time.is_some() {
            flags |= AttrFlags::ACCESS_TIME;
        }
        if self.create_time.is_some() {
            flags |= AttrFlags::CREATE_TIME;
        }
        if self.modify_time.is_some() {
            flags |= AttrFlags::MODIFY_TIME;
        }
        if self.change_time.is_some() {
            flags |= AttrFlags::CTIME;
        }
        if self.subsecond_times {
            flags |= AttrFlags::SUBSECOND_TIMES;
        }
        if self.acl.is_some() {
            flags |= AttrFlags::ACL;
        }
        if self.attrib_bits.is_some() {
            flags |= AttrFlags::BITS;
        }
        if self.text_hint.is_some() {
            flags |= AttrFlags::TEXT_HINT;
        }
        if self.mime_type.is_some() {
            flags |= AttrFlags::MIME_TYPE;
        }
        if self.link_count.is_some() {
            flags |= AttrFlags::LINK_COUNT;
        }
        if self.untranslated_name.is_some() {
            flags |= AttrFlags::UNTRANSLATED_NAME;
        }
        if self.extensions.is_some() {
            flags |= AttrFlags::EXTENDED;
        }
        flags
    }

    fn put_time<E: Encoder>(&self, enc: &mut E, ts: Timestamp) -> Result<()> {
        enc.put_u64(ts.seconds as u64)?;
        if self.subsecond_times {
            enc.put_u32(ts.nanoseconds)?;
        }
        Ok(())
    }

    /// Encodes the record in wire order.
    pub fn encode<E: Encoder>(&self, enc: &mut E) -> Result<()> {
        enc.put_u32(self.valid_flags())?;
        enc.put_u8(self.file_type.code())?;
        if let Some(size) = self.size {
            enc.put_u64(size)?;
        }
        if let Some(alloc) = self.allocation_size {
            enc.put_u64(alloc)?;
        }
        if let Some((owner, group)) = &self.owner_group {
            enc.put_str(owner)?;
            enc.put_str(group)?;
        }
        if let Some(perms) = self.permissions {
            enc.put_u32(perms)?;
        }
        if let Some(ts) = self.access_time {
            self.put_time(enc, ts)?;
        }
        if let Some(ts) = self.create_time {
            self.put_time(enc, ts)?;
        }
        if let Some(ts) = self.modify_time {
            self.put_time(enc, ts)?;
        }
        if let Some(ts) = self.change_time {
            self.put_time(enc, ts)?;
        }
        if let Some(acl) = &self.acl {
            enc.put_str(acl)?;
        }
        if let Some(bits) = self.attrib_bits {
            enc.put_u32(bits.bits)?;
            enc.put_u32(bits.valid)?;
        }
        if let Some(hint) = self.text_hint {
            enc.put_u8(hint)?;
        }
        if let Some(mime) = &self.mime_type {
            enc.put_str(mime)?;
        }
        if let Some(links) = self.link_count {
            enc.put_u32(links)?;
        }
        if let Some(name) = &self.untranslated_name {
            enc.put_str(name)?;
        }
        if let Some(exts) = &self.extensions {
            enc.put_u32(exts.len() as u32)?;
            for ext in exts {
                enc.put_str(&ext.name)?;
                enc.put_str(&ext.data)?;
            }
        }
        Ok(())
    }

    /// Decodes a record, mask first.
    pub fn decode<D: Decoder>(dec: &mut D) -> Result<Attrs> {
        let flags = dec.read_u32()?;
        Attrs::decode_fields(dec, flags)
    }

    /// Decodes a record whose mask may be absent entirely (trailing
    /// optional attrs in OPEN). Absence at the mask boundary is `None`.
    pub fn decode_opt<D: Decoder>(dec: &mut D) -> Result<Option<Attrs>> {
        match dec.read_opt_u32()? {
            Some(flags) => Attrs::decode_fields(dec, flags).map(Some),
            None => Ok(None),
        }
    }

    fn read_time<D: Decoder>(dec: &mut D, subsecond: bool) -> Result<Timestamp> {
        let seconds = dec.read_u64()? as i64;
        let nanoseconds = if subsecond { dec.read_u32()? } else { 0 };
        Ok(Timestamp {
            seconds,
            nanoseconds,
        })
    }

    fn decode_fields<D: Decoder>(dec: &mut D, flags: u32) -> Result<Attrs> {
        let type_code = dec.read_u8()?;
        let file_type = FileType::from_code(type_code)
            .ok_or_else(|| Error::protocol(format!("unknown file type code {type_code}")))?;
        let subsecond = flags & AttrFlags::SUBSECOND_TIMES != 0;
        let mut attrs = Attrs::empty(file_type);
        attrs.subsecond_times = subsecond;

        if flags & AttrFlags::SIZE != 0 {
            attrs.size = Some(dec.read_u64()?);
        }
        if flags & AttrFlags::ALLOCATION_SIZE != 0 {
            attrs.allocation_size = Some(dec.read_u64()?);
        }
        if flags & AttrFlags::OWNER_GROUP != 0 {
            let owner = dec.read_string()?;
            let group = dec.read_string()?;
            attrs.owner_group = Some((owner, group));
        }
        if flags & AttrFlags::PERMISSIONS != 0 {
            attrs.permissions = Some(dec.read_u32()?);
        }
        if flags & AttrFlags::ACCESS_TIME != 0 {
            attrs.access_time = Some(Attrs::read_time(dec, subsecond)?);
        }
        if flags & AttrFlags::CREATE_TIME != 0 {
            attrs.create_time = Some(Attrs::read_time(dec, subsecond)?);
        }
        if flags & AttrFlags::MODIFY_TIME != 0 {
            attrs.modify_time = Some(Attrs::read_time(dec, subsecond)?);
        }
        if flags & AttrFlags::CTIME != 0 {
            attrs.change_time = Some(Attrs::read_time(dec, subsecond)?);
        }
        if flags & AttrFlags::ACL != 0 {
            attrs.acl = Some(dec.read_string()?);
        }
        if flags & AttrFlags::BITS != 0 {
            let bits = dec.read_u32()?;
            let valid = dec.read_u32()?;
            attrs.attrib_bits = Some(AttribBits { bits, valid });
        }
        if flags & AttrFlags::TEXT_HINT != 0 {
            attrs.text_hint = Some(dec.read_u8()?);
        }
        if flags & AttrFlags::MIME_TYPE != 0 {
            attrs.mime_type = Some(dec.read_string()?);
        }
        if flags & AttrFlags::LINK_COUNT != 0 {
            attrs.link_count = Some(dec.read_u32()?);
        }
        if flags & AttrFlags::UNTRANSLATED_NAME != 0 {
            attrs.untranslated_name = Some(dec.read_string()?);
        }
        if flags & AttrFlags::EXTENDED != 0 {
            let count = dec.read_u32()?;
            let mut exts = Vec::with_capacity(count.min(64) as usize);
            for _ in 0..count {
                let name = dec.read_string()?;
                let data = dec.read_string()?;
                exts.push(ExtensionPair { name, data });
            }
            attrs.extensions = Some(exts);
        }

        // Field boundaries are only trustworthy if we consumed exactly the
        // fields the mask declared.
        let reconstructed = attrs.valid_flags();
        if reconstructed != flags {
            return Err(Error::protocol(format!(
                "attribute flags mismatch (declared {flags:#x}, reconstructed {reconstructed:#x})"
            )));
        }
        Ok(attrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::SliceDecoder;
    use crate::encode::Encoder;
    use crate::error::Result;

    struct VecEncoder(Vec<u8>);

    impl Encoder for VecEncoder {
        fn put_u8(&mut self, v: u8) -> Result<()> {
            self.0.push(v);
            Ok(())
        }
        fn put_u32(&mut self, v: u32) -> Result<()> {
            self.0.extend_from_slice(&v.to_be_bytes());
            Ok(())
        }
        fn put_u64(&mut self, v: u64) -> Result<()> {
            self.0.extend_from_slice(&v.to_be_bytes());
            Ok(())
        }
        fn put_raw(&mut self, data: &[u8]) -> Result<()> {
            self.0.extend_from_slice(data);
            Ok(())
        }
    }

    fn encode(attrs: &Attrs) -> Vec<u8> {
        let mut enc = VecEncoder(Vec::new());
        attrs.encode(&mut enc).unwrap();
        enc.0
    }

    #[test]
    fn test_empty_attrs_is_flags_and_type_only() {
        let bytes = encode(&Attrs::empty(FileType::Directory));
        assert_eq!(bytes, [0, 0, 0, 0, 2]);
    }

    #[test]
    fn test_mask_derived_from_fields() {
        let mut attrs = Attrs::empty(FileType::Regular);
        attrs.size = Some(42);
        attrs.modify_time = Some(Timestamp::from_seconds(1_700_000_000));
        assert_eq!(
            attrs.valid_flags(),
            AttrFlags::SIZE | AttrFlags::MODIFY_TIME
        );
    }

    #[test]
    fn test_round_trip_with_subseconds_and_bits() {
        let mut attrs = Attrs::empty(FileType::Regular);
        attrs.subsecond_times = true;
        attrs.size = Some(1 << 40);
        attrs.owner_group = Some(("alice".into(), "staff".into()));
        attrs.permissions = Some(0o644);
        attrs.access_time = Some(Timestamp {
            seconds: 1_700_000_000,
            nanoseconds: 123_456_789,
        });
        attrs.modify_time = Some(Timestamp::from_seconds(1_700_000_001));
        attrs.set_attrib_bit(FileBits::HIDDEN, true);
        attrs.set_attrib_bit(FileBits::READONLY, false);
        attrs.extensions = Some(vec![ExtensionPair {
            name: "vendor@example".into(),
            data: "payload".into(),
        }]);

        let bytes = encode(&attrs);
        let mut dec = SliceDecoder::new(&bytes);
        let decoded = Attrs::decode(&mut dec).unwrap();
        assert_eq!(decoded, attrs);
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn test_declared_mask_mismatch_rejected() {
        // Declares SIZE but carries no size field bytes beyond garbage:
        // the decoder will read 8 bytes as the size and then run out, or
        // reconstruct a different mask. Declare an unknown bit instead so
        // the field bytes parse but the masks cannot match.
        let mut bytes = encode(&Attrs::empty(FileType::Regular));
        bytes[3] |= 0x02; // reserved bit the decoder never reconstructs
        let mut dec = SliceDecoder::new(&bytes);
        assert!(matches!(Attrs::decode(&mut dec), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unknown_file_type_rejected() {
        let bytes = [0, 0, 0, 0, 200];
        let mut dec = SliceDecoder::new(&bytes);
        assert!(matches!(Attrs::decode(&mut dec), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_extended_with_zero_pairs_round_trips() {
        let mut attrs = Attrs::empty(FileType::Regular);
        attrs.extensions = Some(Vec::new());
        let bytes = encode(&attrs);
        let mut dec = SliceDecoder::new(&bytes);
        assert_eq!(Attrs::decode(&mut dec).unwrap(), attrs);
    }

    #[test]
    fn test_decode_opt_absent_mask() {
        let mut dec = SliceDecoder::new(&[]);
        assert!(Attrs::decode_opt(&mut dec).unwrap().is_none());
    }
}
