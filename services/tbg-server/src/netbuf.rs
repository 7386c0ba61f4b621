//! Message passing over TCP connections.
//!
//! Clients speak a minimal TLV: {type, length}, with length 0xff
//! followed by a 32-bit little-endian extended length. The framing
//! assumes an in-order reliable byte stream and makes no attempt to
//! resynchronise; a connection that faults is torn down.

use std::io;
use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};

/// Growth unit for elastic buffers. Rounding the resize requests up
/// saves a pile of tiny reallocations.
const BUF_UNIT: usize = 4096;

/// Elastic byte buffer with separate append and consume positions.
/// Grows so that capacity ≥ in-ptr + length; never shrinks.
#[derive(Debug, Default)]
pub struct Buf {
    buf: Vec<u8>,
    in_ptr: usize,
    out_ptr: usize,
}

impl Buf {
    pub fn new() -> Buf {
        Buf::default()
    }

    pub fn reset(&mut self) {
        self.in_ptr = 0;
        self.out_ptr = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.in_ptr == self.out_ptr
    }

    /// Bytes appended but not yet consumed.
    pub fn available(&self) -> usize {
        self.in_ptr - self.out_ptr
    }

    /// Make room for `length` more bytes.
    pub fn ensure(&mut self, length: usize) {
        let size = self.in_ptr + length;
        if size > self.buf.len() {
            let new_size = BUF_UNIT * (1 + size / BUF_UNIT);
            self.buf.resize(new_size, 0);
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure(data.len());
        self.buf[self.in_ptr..self.in_ptr + data.len()].copy_from_slice(data);
        self.in_ptr += data.len();
    }

    pub fn append8(&mut self, data: u8) {
        self.append(&[data]);
    }

    pub fn append32(&mut self, data: u32) {
        let mut raw = [0u8; 4];
        LittleEndian::write_u32(&mut raw, data);
        self.append(&raw);
    }

    /// The unconsumed region.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.out_ptr..self.in_ptr]
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.out_ptr += n;
        if self.out_ptr == self.in_ptr {
            self.reset();
        }
    }
}

/// One decoded TLV message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvMsg {
    pub typ: u8,
    pub data: Vec<u8>,
}

const TLV_EXT_MARK: u8 = 0xff;
const TLV_HDR_SHORT: usize = 2;
const TLV_HDR_EXT: usize = 6;

#[derive(Debug)]
enum DecState {
    Header,
    HeaderExt,
    Data,
}

/// Streaming TLV decoder. Consumes input per-message: each call to
/// [`TlvDecoder::decode`] takes only the bytes belonging to the next
/// message and yields at most that one message, leaving the rest in
/// the buffer for the next call.
#[derive(Debug)]
pub struct TlvDecoder {
    state: DecState,
    hdr: [u8; TLV_HDR_EXT],
    hdr_have: usize,
    need: usize,
    typ: u8,
    data: Vec<u8>,
}

impl Default for TlvDecoder {
    fn default() -> TlvDecoder {
        TlvDecoder::new()
    }
}

impl TlvDecoder {
    pub fn new() -> TlvDecoder {
        TlvDecoder {
            state: DecState::Header,
            hdr: [0; TLV_HDR_EXT],
            hdr_have: 0,
            need: 0,
            typ: 0,
            data: Vec::new(),
        }
    }

    fn fill_hdr(&mut self, buf: &mut Buf, upto: usize) -> bool {
        while self.hdr_have < upto {
            let pending = buf.pending();
            if pending.is_empty() {
                return false;
            }
            self.hdr[self.hdr_have] = pending[0];
            self.hdr_have += 1;
            buf.consume(1);
        }
        true
    }

    /// Run buffered bytes through the decoder. Returns as soon as one
    /// message completes; otherwise the buffer has been drained.
    pub fn decode(&mut self, buf: &mut Buf) -> Option<TlvMsg> {
        loop {
            match self.state {
                DecState::Header => {
                    if !self.fill_hdr(buf, TLV_HDR_SHORT) {
                        return None;
                    }
                    self.typ = self.hdr[0];
                    if self.hdr[1] == TLV_EXT_MARK {
                        self.state = DecState::HeaderExt;
                    } else {
                        self.need = self.hdr[1] as usize;
                        self.data.clear();
                        self.state = DecState::Data;
                    }
                }
                DecState::HeaderExt => {
                    if !self.fill_hdr(buf, TLV_HDR_EXT) {
                        return None;
                    }
                    self.need = LittleEndian::read_u32(&self.hdr[2..6]) as usize;
                    self.data.clear();
                    self.state = DecState::Data;
                }
                DecState::Data => {
                    let want = self.need - self.data.len();
                    let take = want.min(buf.available());
                    self.data.extend_from_slice(&buf.pending()[..take]);
                    buf.consume(take);
                    if self.data.len() < self.need {
                        return None;
                    }
                    self.state = DecState::Header;
                    self.hdr_have = 0;
                    return Some(TlvMsg {
                        typ: self.typ,
                        data: std::mem::take(&mut self.data),
                    });
                }
            }
        }
    }
}

/// Encode one TLV message into `buf`.
pub fn tlv_encode(buf: &mut Buf, typ: u8, data: &[u8]) {
    buf.append8(typ);
    if data.len() >= TLV_EXT_MARK as usize {
        buf.append8(TLV_EXT_MARK);
        buf.append32(data.len() as u32);
    } else {
        buf.append8(data.len() as u8);
    }
    buf.append(data);
}

/// Double-buffered transmit queue for one client connection.
///
/// New messages land in the active buffer while the non-active buffer
/// drains to the socket; when the non-active buffer empties the two
/// swap. The owner keeps WRITABLE interest registered exactly while
/// [`Netbuf::has_pending`] is true.
#[derive(Debug, Default)]
pub struct Netbuf {
    txbuf: [Buf; 2],
    bufsel: usize,
}

fn drain(buf: &mut Buf, w: &mut dyn Write) -> io::Result<bool> {
    while !buf.is_empty() {
        match w.write(buf.pending()) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf.consume(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

impl Netbuf {
    pub fn new() -> Netbuf {
        Netbuf::default()
    }

    pub fn add_msg(&mut self, typ: u8, data: &[u8]) {
        tlv_encode(&mut self.txbuf[self.bufsel], typ, data);
    }

    pub fn has_pending(&self) -> bool {
        !self.txbuf[0].is_empty() || !self.txbuf[1].is_empty()
    }

    /// Push as much buffered data as the socket will take. `Ok(true)`
    /// means everything has been sent.
    pub fn send(&mut self, w: &mut dyn Write) -> io::Result<bool> {
        let non_active = 1 - self.bufsel;
        let mut all_sent = true;

        if !self.txbuf[non_active].is_empty() {
            all_sent = drain(&mut self.txbuf[non_active], w)?;
        }

        if all_sent {
            // Non-active buffer is empty: swap, and drain what used to
            // be the active buffer.
            self.txbuf[non_active].reset();
            let draining = self.bufsel;
            self.bufsel = non_active;
            if !self.txbuf[draining].is_empty() {
                all_sent = drain(&mut self.txbuf[draining], w)?;
            }
        }

        Ok(all_sent)
    }
}
