//! Host side of the CAN bridge.
//!
//! The bridge co-processor is reached through four bus primitives:
//! an address/config write, an address/status read, and data writes and
//! reads against the selected register. The electrical layer behind
//! those primitives (a byte-wide parallel bus on real hardware) is out
//! of scope here; [`BridgeIo`] is its seam, and the simulated bus in
//! [`crate::sim`] is the in-tree implementation.

use std::time::Duration;

use tbg_protocol::hex::{from_wire, to_wire, MSG_WIRE_SIZE};
use tbg_protocol::Msg;

pub use tbg_node::bridge::{Config, Status, STAT_BIT_MASK};

pub trait BridgeIo: Send {
    /// Address/config write (register select + interrupt enables).
    fn write_addr_config(&mut self, byte: u8);
    /// Address/status read; de-asserts the interrupt line.
    fn read_addr_status(&mut self) -> u8;
    /// Data writes into the selected register.
    fn write_data(&mut self, data: &[u8]);
    /// Data reads from the selected register.
    fn read_data(&mut self, data: &mut [u8]);
    /// Advance any machinery behind the bus. Hardware backends have
    /// nothing to do here.
    fn tick(&mut self, _elapsed: Duration) {}
}

/// Frame-level operations over the raw bus primitives.
///
/// The data-path operations assume the CAN register (number 0) is the
/// selected one; every status read resets the data pointers, so the
/// send/receive sequences below stay aligned.
pub struct Bridge<T: BridgeIo> {
    io: T,
}

impl<T: BridgeIo> Bridge<T> {
    pub fn new(io: T) -> Bridge<T> {
        Bridge { io }
    }

    pub fn read_status(&mut self) -> Status {
        Status::from_bits_truncate(self.io.read_addr_status() & STAT_BIT_MASK)
    }

    /// Program the interrupt enables (and optionally reset the overflow
    /// latch). Selects the CAN register as a side effect.
    pub fn write_config(&mut self, conf: Config) {
        self.io.write_addr_config(conf.bits());
    }

    pub fn send_msg(&mut self, msg: &Msg) {
        self.io.write_data(&to_wire(msg));
    }

    pub fn recv_msg(&mut self) -> Msg {
        let mut raw = [0u8; MSG_WIRE_SIZE];
        self.io.read_data(&mut raw);
        from_wire(&raw)
    }

    pub fn tick(&mut self, elapsed: Duration) {
        self.io.tick(elapsed);
    }
}
