//! The bridge daemon.
//!
//! One thread, one poll loop. The daemon owns the single CAN adapter
//! and multiplexes it among any number of local TCP clients: outbound
//! requests are stamped with the daemon's bus address and a rolling
//! source port, and every frame received from the bus is fanned out to
//! every connected client, which demultiplex by the stamped pair.

use std::collections::HashMap;
use std::io::{self, Read};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use tbg_protocol::{hex, Msg};

use crate::api::TLV_TYPE_MSG;
use crate::bridge::{Bridge, BridgeIo, Config, Status};
use crate::netbuf::{Buf, Netbuf, TlvDecoder};

const LISTENER: Token = Token(0);

/// Poll tick; also the cadence of the adapter's time advance.
const POLL_TICK: Duration = Duration::from_millis(5);

/// Bounded spin waiting for a free transmit mailbox.
const TX_SPIN_LIMIT: u32 = 100_000;

struct Client {
    stream: TcpStream,
    decoder: TlvDecoder,
    rxbuf: Buf,
    netbuf: Netbuf,
    writable: bool,
    peer: String,
}

pub struct Server<T: BridgeIo> {
    bridge: Bridge<T>,
    tbg_addr: u8,
    src_port: u8,
    clients: HashMap<Token, Client>,
    next_token: usize,
}

impl<T: BridgeIo> Server<T> {
    pub fn new(io: T, tbg_addr: u8) -> Server<T> {
        Server {
            bridge: Bridge::new(io),
            tbg_addr: tbg_addr & 0x3f,
            src_port: 0,
            clients: HashMap::new(),
            next_token: 1,
        }
    }

    /// Run the daemon on an already-bound listener. Never returns under
    /// normal operation.
    pub fn run(&mut self, listener: std::net::TcpListener) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);

        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(64);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        // A stuck interrupt line is cleared by reading status once;
        // then enable receive interrupts and reset the overflow latch.
        let initial = self.bridge.read_status();
        log::debug!("bridge initial status: {:?}", initial);
        self.bridge
            .write_config(Config::RX_DATA_AVAIL_IE | Config::RX_OVERFLOW_RESET);

        log::info!("listening, bus address {}", self.tbg_addr);

        let mut last_tick = Instant::now();
        loop {
            poll.poll(&mut events, Some(POLL_TICK))?;

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_clients(&poll, &mut listener)?,
                    token => {
                        let mut dead = false;
                        if event.is_readable() {
                            dead = self.client_readable(&poll, token)?;
                        }
                        if !dead && event.is_writable() {
                            dead = self.client_writable(&poll, token)?;
                        }
                        if dead {
                            self.remove_client(&poll, token);
                        }
                    }
                }
            }

            let now = Instant::now();
            self.bridge.tick(now.duration_since(last_tick));
            last_tick = now;

            self.drain_rx(&poll)?;
        }
    }

    fn accept_clients(&mut self, poll: &Poll, listener: &mut TcpListener) -> io::Result<()> {
        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    poll.registry()
                        .register(&mut stream, token, Interest::READABLE)?;
                    log::info!("client {} joined", peer);
                    self.clients.insert(
                        token,
                        Client {
                            stream,
                            decoder: TlvDecoder::new(),
                            rxbuf: Buf::new(),
                            netbuf: Netbuf::new(),
                            writable: false,
                            peer: peer.to_string(),
                        },
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain what the socket has, decode complete TLV messages, and
    /// push the carried frames towards the bus. Returns true when the
    /// client should be removed.
    fn client_readable(&mut self, poll: &Poll, token: Token) -> io::Result<bool> {
        let mut tmp = [0u8; 4096];
        loop {
            let client = match self.clients.get_mut(&token) {
                Some(c) => c,
                None => return Ok(false),
            };
            match client.stream.read(&mut tmp) {
                Ok(0) => {
                    log::info!("client {} left", client.peer);
                    return Ok(true);
                }
                Ok(n) => {
                    client.rxbuf.append(&tmp[..n]);
                    loop {
                        let client = self.clients.get_mut(&token).unwrap();
                        let tlv = match client.decoder.decode(&mut client.rxbuf) {
                            Some(t) => t,
                            None => break,
                        };
                        self.handle_tlv(poll, tlv.typ, &tlv.data)?;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("client {}: read: {}", client.peer, e);
                    return Ok(true);
                }
            }
        }
    }

    fn handle_tlv(&mut self, poll: &Poll, typ: u8, data: &[u8]) -> io::Result<()> {
        if typ != TLV_TYPE_MSG {
            log::debug!("ignoring TLV type {}", typ);
            return Ok(());
        }
        let mut msg = match hex::from_hex(data) {
            Ok(m) => m,
            Err(e) => {
                // Invalid frame: dropped, never forwarded.
                log::warn!("bad hex frame from client: {}", e);
                return Ok(());
            }
        };

        // Stamp the source pair: our address, and a rolling port that
        // identifies this request among everything else in flight.
        msg.set_src_addr(self.tbg_addr);
        msg.set_src_port(self.src_port);
        self.src_port = (self.src_port + 1) & 0x3f;

        // The adapter takes a frame only while a transmit mailbox is
        // free; spin briefly, then give up rather than wedge the loop.
        let mut spins = 0u32;
        while !self.bridge.read_status().contains(Status::TX_BUF_EMPTY) {
            spins += 1;
            if spins > TX_SPIN_LIMIT {
                log::warn!("tx mailboxes stuck, dropping frame");
                return Ok(());
            }
        }
        log::debug!("tbg tx: {}", msg);
        self.bridge.send_msg(&msg);

        // Anything the bus produced in reaction gets fanned out now.
        self.drain_rx(poll)
    }

    /// Drain the receive side until the status bit clears, fanning each
    /// frame out to every client.
    fn drain_rx(&mut self, poll: &Poll) -> io::Result<()> {
        loop {
            let status = self.bridge.read_status();
            if status.contains(Status::RX_OVERFLOW) {
                log::warn!("bridge rx overflow, frames were lost");
                self.bridge
                    .write_config(Config::RX_DATA_AVAIL_IE | Config::RX_OVERFLOW_RESET);
            }
            if !status.contains(Status::RX_DATA_AVAIL) {
                return Ok(());
            }
            let msg = self.bridge.recv_msg();
            log::debug!("tbg rx: {}", msg);
            self.broadcast(poll, &msg)?;
        }
    }

    /// Queue a frame to every connected client and chase WRITABLE
    /// interest for those that now have pending data.
    fn broadcast(&mut self, poll: &Poll, msg: &Msg) -> io::Result<()> {
        let hex = hex::to_hex(msg);
        for (token, client) in self.clients.iter_mut() {
            client.netbuf.add_msg(TLV_TYPE_MSG, hex.as_bytes());
            if !client.writable {
                client.writable = true;
                poll.registry().reregister(
                    &mut client.stream,
                    *token,
                    Interest::READABLE | Interest::WRITABLE,
                )?;
            }
        }
        Ok(())
    }

    /// Returns true when the client should be removed.
    fn client_writable(&mut self, poll: &Poll, token: Token) -> io::Result<bool> {
        let client = match self.clients.get_mut(&token) {
            Some(c) => c,
            None => return Ok(false),
        };
        match client.netbuf.send(&mut client.stream) {
            Ok(true) => {
                // Both buffers empty: back to read-only interest.
                client.writable = false;
                poll.registry()
                    .reregister(&mut client.stream, token, Interest::READABLE)?;
                Ok(false)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                log::warn!("client {}: write: {}", client.peer, e);
                Ok(true)
            }
        }
    }

    /// Drop a client; whatever it had pending goes with it.
    fn remove_client(&mut self, poll: &Poll, token: Token) {
        if let Some(mut client) = self.clients.remove(&token) {
            let _ = poll.registry().deregister(&mut client.stream);
        }
    }
}
