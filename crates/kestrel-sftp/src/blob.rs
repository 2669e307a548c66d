//! Opaque byte-string values carried on the wire
//!
//! Handles, file data and other length-prefixed byte fields travel as
//! [`Blob`]s. A blob is immutable and cheap to clone; the contents are
//! shared, not copied.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Immutable byte string with a known length.
///
/// Connection handles are 4-byte big-endian integers wrapped in a blob;
/// [`Blob::from_handle`] and [`Blob::as_handle`] convert between the two
/// representations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Blob(Bytes);

impl Blob {
    /// Wraps an existing byte buffer without copying.
    pub fn new(bytes: Bytes) -> Self {
        Blob(bytes)
    }

    /// An empty blob.
    pub fn empty() -> Self {
        Blob(Bytes::new())
    }

    /// Encodes a handle number as a 4-byte big-endian blob.
    pub fn from_handle(handle: u32) -> Self {
        Blob(Bytes::copy_from_slice(&handle.to_be_bytes()))
    }

    /// Reads the blob back as a handle number.
    ///
    /// Fails when the blob is not exactly 4 bytes long; clients must echo
    /// handles verbatim, so anything else is a malformed handle.
    pub fn as_handle(&self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .0
            .as_ref()
            .try_into()
            .map_err(|_| Error::protocol(format!("invalid handle length {}", self.0.len())))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the blob holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrows the raw bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl From<Vec<u8>> for Blob {
    fn from(v: Vec<u8>) -> Self {
        Blob(Bytes::from(v))
    }
}

impl From<&[u8]> for Blob {
    fn from(v: &[u8]) -> Self {
        Blob(Bytes::copy_from_slice(v))
    }
}

impl AsRef<[u8]> for Blob {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}
