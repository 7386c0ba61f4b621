//! Host-side Touchbridge library.
//!
//! [`Tbg`] is a blocking client connection to the bridge daemon: it
//! frames messages over TLV, stamps nothing itself (the daemon owns the
//! source pair), and matches responses against monotonic deadlines.
//! The daemon itself lives in [`srv`], the adapter seam in [`bridge`],
//! and the simulated bus in [`sim`].

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use tbg_protocol::{hex, ErrorCode, Msg, PORT_CONFIG};

pub mod api;
pub mod bridge;
pub mod netbuf;
pub mod sim;
pub mod srv;

mod adisc;
pub use adisc::{lowest_free_addr, AdiscMode, NodeInfo};

use api::{DEFAULT_TIMEOUT_MS, TLV_TYPE_MSG};
use netbuf::{tlv_encode, Buf, TlvDecoder};

/// A client connection to the bridge daemon.
pub struct Tbg {
    stream: TcpStream,
    decoder: TlvDecoder,
    rxbuf: Buf,
    /// Default per-response wait.
    pub timeout: Duration,
}

impl Tbg {
    pub fn connect(server: &str) -> io::Result<Tbg> {
        let stream = TcpStream::connect(server)?;
        stream.set_nodelay(true)?;
        Ok(Tbg {
            stream,
            decoder: TlvDecoder::new(),
            rxbuf: Buf::new(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        })
    }

    /// Send one frame to the daemon. The source pair is left for the
    /// daemon to stamp.
    pub fn send_msg(&mut self, msg: &Msg) -> io::Result<()> {
        log::debug!("sending: {}", msg);
        let hex = hex::to_hex(msg);
        let mut out = Buf::new();
        tlv_encode(&mut out, TLV_TYPE_MSG, hex.as_bytes());
        self.stream.write_all(out.pending())
    }

    /// Send a request to `addr`:`port`.
    pub fn request(&mut self, addr: u8, port: u8, data: &[u8]) -> io::Result<()> {
        self.send_msg(&Msg::request(addr, port, data))
    }

    /// Send a request and wait up to the default timeout for any
    /// response.
    pub fn request_response(&mut self, addr: u8, port: u8, data: &[u8]) -> io::Result<Option<Msg>> {
        self.request(addr, port, data)?;
        self.wait_response(self.timeout)
    }

    /// Wait for the next frame from the daemon. `Ok(None)` is a
    /// timeout.
    pub fn wait_response(&mut self, timeout: Duration) -> io::Result<Option<Msg>> {
        self.wait_until(Instant::now() + timeout)
    }

    fn wait_until(&mut self, deadline: Instant) -> io::Result<Option<Msg>> {
        loop {
            while let Some(tlv) = self.decoder.decode(&mut self.rxbuf) {
                if tlv.typ != TLV_TYPE_MSG {
                    continue;
                }
                let msg = hex::from_hex(&tlv.data)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                if msg.is_error_response() {
                    log::warn!("touchbridge error: {}", ErrorCode::describe(msg.data[0]));
                }
                log::debug!("response: {}", msg);
                return Ok(Some(msg));
            }

            // Poll timeouts are recomputed from the deadline after
            // every wakeup; an expired deadline means give up now.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::from_secs(0) {
                return Ok(None);
            }
            self.stream.set_read_timeout(Some(remaining))?;
            let mut tmp = [0u8; 4096];
            match self.stream.read(&mut tmp) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "daemon closed the connection",
                    ))
                }
                Ok(n) => self.rxbuf.append(&tmp[..n]),
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for a response from a specific source address and/or port.
    ///
    /// Non-matching frames are discarded but do not reset the clock:
    /// every partial match shrinks the remaining budget from the same
    /// deadline, so a chatty bus cannot make us wait forever.
    pub fn wait_response_from(
        &mut self,
        addr: Option<u8>,
        port: Option<u8>,
        timeout: Duration,
    ) -> io::Result<Option<Msg>> {
        self.wait_from_until(addr, port, Instant::now() + timeout)
    }

    pub(crate) fn wait_from_until(
        &mut self,
        addr: Option<u8>,
        port: Option<u8>,
        deadline: Instant,
    ) -> io::Result<Option<Msg>> {
        while let Some(msg) = self.wait_until(deadline)? {
            let addr_ok = addr.map_or(true, |a| msg.src_addr() == a);
            let port_ok = port.map_or(true, |p| msg.src_port() == p);
            if addr_ok && port_ok {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    /// Discard whatever responses are already in flight.
    pub fn flush_responses(&mut self) -> io::Result<()> {
        while self.wait_response(Duration::from_millis(1))?.is_some() {}
        Ok(())
    }

    /// Fetch a configuration string, accumulating 8-byte chunks until
    /// the terminating NUL. `Ok(None)` means a timeout or an error
    /// response along the way.
    pub fn get_conf_string(
        &mut self,
        addr: u8,
        conf_cmd: u8,
        conf_port: u8,
    ) -> io::Result<Option<String>> {
        let mut collected = Vec::new();
        let mut offs = 0u8;
        loop {
            let req = if conf_cmd & tbg_protocol::CONF_BIT_PORT != 0 {
                vec![conf_cmd, conf_port, offs]
            } else {
                vec![conf_cmd, offs]
            };
            self.request(addr, PORT_CONFIG, &req)?;
            let resp =
                match self.wait_response_from(Some(addr), Some(PORT_CONFIG), self.timeout)? {
                    Some(r) => r,
                    None => return Ok(None),
                };
            if resp.is_error_response() {
                return Ok(None);
            }
            let chunk = resp.payload();
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                collected.extend_from_slice(&chunk[..nul]);
                break;
            }
            collected.extend_from_slice(chunk);
            offs = offs.wrapping_add(8);
        }
        Ok(Some(String::from_utf8_lossy(&collected).into_owned()))
    }

    /// Fetch the description of one of a port's configs.
    pub fn get_conf_descr(
        &mut self,
        addr: u8,
        conf_num: u8,
        conf_port: u8,
    ) -> io::Result<Option<String>> {
        let mut collected = Vec::new();
        let mut offs = 0u8;
        loop {
            let cmd = tbg_protocol::PORTCONF_CMD_GET_CONF_DESCR | tbg_protocol::CONF_BIT_PORT;
            self.request(addr, PORT_CONFIG, &[cmd, conf_port, conf_num, offs])?;
            let resp =
                match self.wait_response_from(Some(addr), Some(PORT_CONFIG), self.timeout)? {
                    Some(r) => r,
                    None => return Ok(None),
                };
            if resp.is_error_response() {
                return Ok(None);
            }
            let chunk = resp.payload();
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                collected.extend_from_slice(&chunk[..nul]);
                break;
            }
            collected.extend_from_slice(chunk);
            offs = offs.wrapping_add(8);
        }
        Ok(Some(String::from_utf8_lossy(&collected).into_owned()))
    }
}
