//! Big-endian wire encoding
//!
//! Outbound packets are length-framed: a `u32` byte count covering the
//! type byte and body, then the type byte, then the body. The body length
//! is not knowable up front (attribute records and name lists are
//! variable), so [`PacketEncoder`] encodes in two passes: a dry counting
//! pass into a bounded scratch buffer, then either an in-place header
//! patch (packet fits in scratch, single write) or a second streaming
//! pass now that the total length is known.

use std::io::Write;

use crate::blob::Blob;
use crate::error::Result;
use crate::packet::Packet;

/// Scratch buffer capacity. Packets that fit are written in one syscall.
const SCRATCH_CAPACITY: usize = 0x10000;

/// Sink for wire primitives.
pub trait Encoder {
    /// Writes a byte.
    fn put_u8(&mut self, v: u8) -> Result<()>;
    /// Writes a 32-bit big-endian integer.
    fn put_u32(&mut self, v: u32) -> Result<()>;
    /// Writes a 64-bit big-endian integer.
    fn put_u64(&mut self, v: u64) -> Result<()>;
    /// Writes raw bytes with no length prefix.
    fn put_raw(&mut self, data: &[u8]) -> Result<()>;

    /// Writes a boolean as a single byte.
    fn put_bool(&mut self, v: bool) -> Result<()> {
        self.put_u8(u8::from(v))
    }

    /// Writes a length-prefixed UTF-8 string. The prefix is the byte
    /// count, not the character count.
    fn put_str(&mut self, s: &str) -> Result<()> {
        self.put_u32(s.len() as u32)?;
        self.put_raw(s.as_bytes())
    }

    /// Writes a length-prefixed byte string.
    fn put_blob(&mut self, b: &Blob) -> Result<()> {
        self.put_u32(b.len() as u32)?;
        self.put_raw(b.as_slice())
    }
}

/// One encoding pass over a packet body.
///
/// With `sink` unset this is the counting pass: scratch overflow discards
/// the buffered bytes and only tallies them. With `sink` set overflow
/// flushes to the writer instead, streaming the body out.
struct PassEncoder<'a, W: Write> {
    scratch: &'a mut Vec<u8>,
    sink: Option<&'a mut W>,
    spilled: usize,
}

impl<W: Write> PassEncoder<'_, W> {
    fn spill(&mut self) -> Result<()> {
        match self.sink.as_mut() {
            Some(w) => w.write_all(self.scratch)?,
            None => self.spilled += self.scratch.len(),
        }
        self.scratch.clear();
        Ok(())
    }
}

impl<W: Write> Encoder for PassEncoder<'_, W> {
    fn put_u8(&mut self, v: u8) -> Result<()> {
        self.put_raw(&[v])
    }

    fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put_raw(&v.to_be_bytes())
    }

    fn put_u64(&mut self, v: u64) -> Result<()> {
        self.put_raw(&v.to_be_bytes())
    }

    fn put_raw(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let space = SCRATCH_CAPACITY - self.scratch.len();
            if space == 0 {
                self.spill()?;
                continue;
            }
            let n = space.min(data.len());
            self.scratch.extend_from_slice(&data[..n]);
            data = &data[n..];
        }
        Ok(())
    }
}

/// Length-framing packet writer over any [`Write`] sink.
pub struct PacketEncoder<W: Write> {
    writer: W,
    scratch: Vec<u8>,
}

impl<W: Write> PacketEncoder<W> {
    /// Wraps a byte sink.
    pub fn new(writer: W) -> Self {
        PacketEncoder {
            writer,
            scratch: Vec::with_capacity(SCRATCH_CAPACITY),
        }
    }

    /// Encodes one packet, frames it, and flushes the sink.
    pub fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let Self { writer, scratch } = self;

        scratch.clear();
        scratch.extend_from_slice(&[0u8; 4]);
        scratch.push(packet.packet_type().code());

        // Counting pass. Overflowed bytes are discarded, only tallied.
        let spilled = {
            let mut pass: PassEncoder<'_, W> = PassEncoder {
                scratch: &mut *scratch,
                sink: None,
                spilled: 0,
            };
            packet.encode_body(&mut pass)?;
            pass.spilled
        };

        if spilled == 0 {
            // Fits in scratch: patch the length header in place.
            let frame_len = (scratch.len() - 4) as u32;
            scratch[..4].copy_from_slice(&frame_len.to_be_bytes());
            writer.write_all(scratch)?;
        } else {
            // Oversized packet: total body length is now known, encode
            // again streaming straight to the sink.
            let frame_len = (spilled + scratch.len() - 4) as u32;
            scratch.clear();
            scratch.extend_from_slice(&frame_len.to_be_bytes());
            scratch.push(packet.packet_type().code());
            let mut pass = PassEncoder {
                scratch: &mut *scratch,
                sink: Some(&mut *writer),
                spilled: 0,
            };
            packet.encode_body(&mut pass)?;
            pass.spill()?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Consumes the encoder, returning the sink.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Encodes a packet into a standalone byte vector.
pub fn encode_to_vec(packet: &Packet) -> Result<Vec<u8>> {
    let mut enc = PacketEncoder::new(Vec::new());
    enc.write_packet(packet)?;
    Ok(enc.into_inner())
}
