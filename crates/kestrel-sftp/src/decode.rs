//! Big-endian wire decoding
//!
//! All multi-byte integers on the wire are big-endian. Strings and blobs
//! are length-prefixed with a `u32` byte count; strings must be valid
//! UTF-8. The `opt` read variants exist for positions where the protocol
//! allows a value to be absent: they yield `None` only when the source is
//! exhausted exactly at the primitive boundary. Running dry in the middle
//! of a primitive is always a hard error.

use std::io::Read;

use bytes::{Buf, Bytes, BytesMut};

use crate::blob::Blob;
use crate::error::{Error, Result};

/// Chunk size for pulling bytes off the underlying stream.
const READ_CHUNK: usize = 8192;

/// Source of wire primitives.
pub trait Decoder {
    /// Reads a required byte.
    fn read_u8(&mut self) -> Result<u8>;
    /// Reads a required 32-bit big-endian integer.
    fn read_u32(&mut self) -> Result<u32>;
    /// Reads a required 64-bit big-endian integer.
    fn read_u64(&mut self) -> Result<u64>;
    /// Reads exactly `n` raw bytes with no length prefix.
    fn read_raw(&mut self, n: usize) -> Result<Blob>;
    /// Discards exactly `n` bytes.
    fn skip(&mut self, n: usize) -> Result<()>;

    /// Reads a required length-prefixed UTF-8 string.
    ///
    /// The declared length is validated (via `read_raw`) before the
    /// payload is pulled, so a hostile prefix cannot force buffering.
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        decode_string(self.read_raw(len)?)
    }

    /// Reads a required length-prefixed byte string.
    fn read_blob(&mut self) -> Result<Blob> {
        let len = self.read_u32()? as usize;
        self.read_raw(len)
    }

    /// Reads a byte, or `None` when the source is exhausted.
    fn read_opt_u8(&mut self) -> Result<Option<u8>>;
    /// Reads a 32-bit integer, or `None` when the source is exhausted.
    fn read_opt_u32(&mut self) -> Result<Option<u32>>;
    /// Reads a 64-bit integer, or `None` when the source is exhausted.
    fn read_opt_u64(&mut self) -> Result<Option<u64>>;
    /// Reads a string, or `None` when the source is exhausted.
    fn read_opt_string(&mut self) -> Result<Option<String>>;

    /// Reads a required boolean (any nonzero byte is true).
    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a boolean, or `None` when the source is exhausted.
    fn read_opt_bool(&mut self) -> Result<Option<bool>> {
        Ok(self.read_opt_u8()?.map(|b| b != 0))
    }
}

fn decode_string(raw: Blob) -> Result<String> {
    String::from_utf8(raw.as_slice().to_vec())
        .map_err(|_| Error::protocol("invalid UTF-8 in string field"))
}

/// Blocking decoder over any [`Read`] source.
///
/// Bytes are buffered internally; a primitive read blocks until enough
/// bytes have arrived or the stream ends.
pub struct StreamDecoder<R: Read> {
    source: R,
    buf: BytesMut,
}

impl<R: Read> StreamDecoder<R> {
    /// Wraps a byte stream.
    pub fn new(source: R) -> Self {
        StreamDecoder {
            source,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Blocks until `n` bytes are buffered.
    ///
    /// Returns `false` when `optional` is set and the stream ended with no
    /// bytes buffered at all. End-of-stream part way through the request
    /// is a protocol error regardless.
    fn gather(&mut self, n: usize, optional: bool) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.buf.len() < n {
            let want = (n - self.buf.len()).min(READ_CHUNK);
            match self.source.read(&mut chunk[..want]) {
                Ok(0) => {
                    if optional && self.buf.is_empty() {
                        return Ok(false);
                    }
                    return Err(Error::protocol("unexpected end of stream"));
                }
                Ok(read) => self.buf.extend_from_slice(&chunk[..read]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn take(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n).freeze()
    }
}

impl<R: Read> Decoder for StreamDecoder<R> {
    fn read_u8(&mut self) -> Result<u8> {
        self.gather(1, false)?;
        Ok(self.buf.get_u8())
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.gather(4, false)?;
        Ok(self.buf.get_u32())
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.gather(8, false)?;
        Ok(self.buf.get_u64())
    }

    fn read_raw(&mut self, n: usize) -> Result<Blob> {
        self.gather(n, false)?;
        Ok(Blob::new(self.take(n)))
    }

    fn skip(&mut self, mut n: usize) -> Result<()> {
        while n > 0 {
            let step = n.min(READ_CHUNK);
            self.gather(step, false)?;
            self.buf.advance(step);
            n -= step;
        }
        Ok(())
    }

    fn read_opt_u8(&mut self) -> Result<Option<u8>> {
        if !self.gather(1, true)? {
            return Ok(None);
        }
        Ok(Some(self.buf.get_u8()))
    }

    fn read_opt_u32(&mut self) -> Result<Option<u32>> {
        if !self.gather(4, true)? {
            return Ok(None);
        }
        Ok(Some(self.buf.get_u32()))
    }

    fn read_opt_u64(&mut self) -> Result<Option<u64>> {
        if !self.gather(8, true)? {
            return Ok(None);
        }
        Ok(Some(self.buf.get_u64()))
    }

    fn read_opt_string(&mut self) -> Result<Option<String>> {
        let Some(len) = self.read_opt_u32()? else {
            return Ok(None);
        };
        decode_string(self.read_raw(len as usize)?).map(Some)
    }
}

/// Decoder over an in-memory slice, used by tests and by replies decoded
/// out of captured buffers.
pub struct SliceDecoder<'a> {
    buf: &'a [u8],
}

impl<'a> SliceDecoder<'a> {
    /// Wraps a byte slice.
    pub fn new(buf: &'a [u8]) -> Self {
        SliceDecoder { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.len() < n {
            return Err(Error::protocol("unexpected end of stream"));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        head
    }
}

impl Decoder for SliceDecoder<'_> {
    fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.take(1)[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4));
        Ok(u32::from_be_bytes(bytes))
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8));
        Ok(u64::from_be_bytes(bytes))
    }

    fn read_raw(&mut self, n: usize) -> Result<Blob> {
        self.need(n)?;
        Ok(Blob::from(self.take(n)))
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.take(n);
        Ok(())
    }

    fn read_opt_u8(&mut self) -> Result<Option<u8>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        self.read_u8().map(Some)
    }

    fn read_opt_u32(&mut self) -> Result<Option<u32>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        self.read_u32().map(Some)
    }

    fn read_opt_u64(&mut self) -> Result<Option<u64>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        self.read_u64().map(Some)
    }

    fn read_opt_string(&mut self) -> Result<Option<String>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        self.read_string().map(Some)
    }
}

/// Scopes a decoder to a single frame of known length.
///
/// Every primitive read is charged against the frame's declared length
/// before it touches the underlying decoder; reading past the boundary is
/// a fatal malformed-packet error. Inside a frame the `opt` variants key
/// off the frame budget, not the stream: they yield `None` exactly when
/// the frame has zero bytes left.
pub struct FrameDecoder<'a, D: Decoder> {
    inner: &'a mut D,
    remaining: usize,
}

impl<'a, D: Decoder> FrameDecoder<'a, D> {
    /// Scopes `inner` to a frame of `length` bytes.
    pub fn new(inner: &'a mut D, length: usize) -> Self {
        FrameDecoder {
            inner,
            remaining: length,
        }
    }

    /// Bytes of the frame not yet consumed.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Consumes and discards whatever is left of the frame.
    ///
    /// Unknown packet types and ignored trailing fields must be skipped
    /// this way so the next frame starts at the right offset.
    pub fn skip_remaining(&mut self) -> Result<()> {
        let n = self.remaining;
        self.remaining = 0;
        self.inner.skip(n)
    }

    fn charge(&mut self, n: usize) -> Result<()> {
        if self.remaining < n {
            return Err(Error::protocol("read past frame boundary"));
        }
        self.remaining -= n;
        Ok(())
    }
}

impl<D: Decoder> Decoder for FrameDecoder<'_, D> {
    fn read_u8(&mut self) -> Result<u8> {
        self.charge(1)?;
        self.inner.read_u8()
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.charge(4)?;
        self.inner.read_u32()
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.charge(8)?;
        self.inner.read_u64()
    }

    // A length prefix claiming more than the frame has left is rejected
    // here, before the payload is pulled off the underlying stream.
    fn read_raw(&mut self, n: usize) -> Result<Blob> {
        self.charge(n)?;
        self.inner.read_raw(n)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.charge(n)?;
        self.inner.skip(n)
    }

    fn read_opt_u8(&mut self) -> Result<Option<u8>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.read_u8().map(Some)
    }

    fn read_opt_u32(&mut self) -> Result<Option<u32>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.read_u32().map(Some)
    }

    fn read_opt_u64(&mut self) -> Result<Option<u64>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.read_u64().map(Some)
    }

    fn read_opt_string(&mut self) -> Result<Option<String>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.read_string().map(Some)
    }
}
