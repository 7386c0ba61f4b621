//! Device side of the host bridge.
//!
//! The bridge co-processor presents four pseudo-registers over a
//! byte-wide parallel bus. One address/config byte selects a register
//! and programs the interrupt enables; data bytes then accumulate into
//! the selected register, committing when its declared size is reached.
//! Reads prefetch the whole register on the first octet.

use std::collections::VecDeque;

use tbg_protocol::hex::{from_wire, to_wire, MSG_WIRE_SIZE};
use tbg_protocol::{Msg, MsgFifo};

pub const REG_CAN: u8 = 0;
pub const REG_FILT1: u8 = 1;
pub const REG_FILT2: u8 = 2;
pub const REG_CFG1: u8 = 3;
pub const REG_NUMOF: u8 = 4;

const REG_SIZES: [usize; REG_NUMOF as usize] = [MSG_WIRE_SIZE, 8, 8, 8];

bitflags::bitflags! {
    /// Low nibble of the addr/status read.
    pub struct Status: u8 {
        const TX_BUF_EMPTY  = 0x01;
        const RX_DATA_AVAIL = 0x02;
        const RX_OVERFLOW   = 0x04;
    }
}

bitflags::bitflags! {
    /// Low nibble of the addr/config write.
    pub struct Config: u8 {
        const TX_BUF_EMPTY_IE  = 0x01;
        const RX_DATA_AVAIL_IE = 0x02;
        const RX_OVERFLOW_RESET = 0x04;
    }
}

pub const ADDR_SHIFT: u8 = 4;
pub const STAT_BIT_MASK: u8 = 0x0f;

pub const CFG1_LOOPBACK: u32 = 0x0000_0001;
pub const CFG1_SILENT: u32 = 0x0000_0002;

/// How many outbound frames can wait in the CAN transmit mailboxes.
const TX_MAILBOXES: usize = 3;

const REG_BUF_SIZE: usize = 16;

pub struct Registers {
    addr: u8,
    conf: Config,
    overflow: bool,
    int_line: bool,
    rd_ptr: usize,
    wr_ptr: usize,
    rd_buf: [u8; REG_BUF_SIZE],
    wr_buf: [u8; REG_BUF_SIZE],
    rx_fifo: MsgFifo,
    tx_queue: VecDeque<Msg>,
    filters: [(u32, u32); 2],
    cfg1: u32,
}

impl Registers {
    pub fn new(rx_capacity: usize) -> Registers {
        Registers {
            addr: 0,
            conf: Config::empty(),
            overflow: false,
            int_line: false,
            rd_ptr: 0,
            wr_ptr: 0,
            rd_buf: [0; REG_BUF_SIZE],
            wr_buf: [0; REG_BUF_SIZE],
            rx_fifo: MsgFifo::new(rx_capacity),
            tx_queue: VecDeque::new(),
            filters: [(0, 0); 2],
            cfg1: 0,
        }
    }

    fn reg_size(&self) -> Option<usize> {
        REG_SIZES.get(self.addr as usize).copied()
    }

    /// Address/config write: select a register, reset the data pointers
    /// and program the interrupt enables. The overflow-reset bit clears
    /// the sticky overflow status.
    pub fn write_addr_config(&mut self, byte: u8) {
        self.rd_ptr = 0;
        self.wr_ptr = 0;
        self.addr = byte >> ADDR_SHIFT;
        self.conf = Config::from_bits_truncate(byte & STAT_BIT_MASK);
        if self.conf.contains(Config::RX_OVERFLOW_RESET) {
            self.overflow = false;
        }
    }

    /// Address/status read: resets the data pointers and de-asserts the
    /// interrupt line.
    pub fn read_addr_status(&mut self) -> u8 {
        self.rd_ptr = 0;
        self.wr_ptr = 0;
        self.int_line = false;
        let mut stat = Status::empty();
        if !self.rx_fifo.is_empty() {
            stat.insert(Status::RX_DATA_AVAIL);
        }
        if self.tx_queue.len() < TX_MAILBOXES {
            stat.insert(Status::TX_BUF_EMPTY);
        }
        if self.overflow {
            stat.insert(Status::RX_OVERFLOW);
        }
        (self.addr << ADDR_SHIFT) | stat.bits()
    }

    /// One data-byte write into the selected register.
    pub fn write_data(&mut self, byte: u8) {
        let size = match self.reg_size() {
            Some(s) => s,
            None => return,
        };
        self.wr_buf[self.wr_ptr] = byte;
        self.wr_ptr += 1;
        if self.wr_ptr == size {
            self.wr_ptr = 0;
            self.commit();
        }
    }

    /// One data-byte read from the selected register. The first octet
    /// prefetches the register; reading past the end wraps.
    pub fn read_data(&mut self) -> u8 {
        let size = match self.reg_size() {
            Some(s) => s,
            None => return 0x55,
        };
        if self.rd_ptr == 0 {
            self.prefetch();
        }
        let byte = self.rd_buf[self.rd_ptr];
        self.rd_ptr += 1;
        if self.rd_ptr == size {
            self.rd_ptr = 0;
        }
        byte
    }

    fn commit(&mut self) {
        match self.addr {
            REG_CAN => {
                let mut raw = [0u8; MSG_WIRE_SIZE];
                raw.copy_from_slice(&self.wr_buf[..MSG_WIRE_SIZE]);
                let msg = from_wire(&raw);
                if self.cfg1 & CFG1_LOOPBACK != 0 {
                    self.rx_frame(&msg);
                }
                if self.cfg1 & CFG1_SILENT != 0 {
                    return;
                }
                if self.tx_queue.len() >= TX_MAILBOXES {
                    log::warn!("bridge: no free tx mailbox, frame dropped");
                    return;
                }
                self.tx_queue.push_back(msg);
            }
            REG_FILT1 | REG_FILT2 => {
                let id = u32::from_le_bytes([
                    self.wr_buf[0],
                    self.wr_buf[1],
                    self.wr_buf[2],
                    self.wr_buf[3],
                ]);
                let mask = u32::from_le_bytes([
                    self.wr_buf[4],
                    self.wr_buf[5],
                    self.wr_buf[6],
                    self.wr_buf[7],
                ]);
                self.filters[(self.addr - REG_FILT1) as usize] = (id, mask);
            }
            REG_CFG1 => {
                let data = u32::from_le_bytes([
                    self.wr_buf[0],
                    self.wr_buf[1],
                    self.wr_buf[2],
                    self.wr_buf[3],
                ]);
                let mask = u32::from_le_bytes([
                    self.wr_buf[4],
                    self.wr_buf[5],
                    self.wr_buf[6],
                    self.wr_buf[7],
                ]);
                self.cfg1 = (self.cfg1 & !mask) | (data & mask);
            }
            _ => {}
        }
    }

    fn prefetch(&mut self) {
        match self.addr {
            REG_CAN => {
                let msg = self.rx_fifo.pop().unwrap_or_default();
                self.rd_buf[..MSG_WIRE_SIZE].copy_from_slice(&to_wire(&msg));
            }
            REG_CFG1 => {
                self.rd_buf[..4].copy_from_slice(&self.cfg1.to_le_bytes());
                for b in self.rd_buf[4..8].iter_mut() {
                    *b = 0;
                }
            }
            // The filter registers are write-only; reads see whatever
            // the buffer last held.
            _ => {}
        }
    }

    /// CAN side: a frame arrived off the bus. Called from rx interrupt
    /// context on real hardware.
    pub fn rx_frame(&mut self, msg: &Msg) {
        if !self.rx_fifo.push(msg) {
            self.overflow = true;
        }
        if self.conf.contains(Config::RX_DATA_AVAIL_IE) {
            self.int_line = true;
        }
    }

    /// CAN side: drain one committed outbound frame.
    pub fn take_tx(&mut self) -> Option<Msg> {
        let msg = self.tx_queue.pop_front();
        if msg.is_some() && self.conf.contains(Config::TX_BUF_EMPTY_IE) {
            self.int_line = true;
        }
        msg
    }

    pub fn interrupt_asserted(&self) -> bool {
        self.int_line
    }

    pub fn cfg1(&self) -> u32 {
        self.cfg1
    }

    pub fn filter(&self, index: usize) -> (u32, u32) {
        self.filters[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(regs: &mut Registers, addr: u8, conf: Config) {
        regs.write_addr_config((addr << ADDR_SHIFT) | conf.bits());
    }

    fn sample() -> Msg {
        let mut msg = Msg::request(10, 2, &[1, 2, 3]);
        msg.set_src_addr(62);
        msg
    }

    #[test]
    fn can_write_commits_at_size() {
        let mut regs = Registers::new(4);
        select(&mut regs, REG_CAN, Config::empty());
        let raw = to_wire(&sample());
        for b in raw[..MSG_WIRE_SIZE - 1].iter() {
            regs.write_data(*b);
        }
        // Nothing commits until the final octet lands.
        assert!(regs.take_tx().is_none());
        regs.write_data(raw[MSG_WIRE_SIZE - 1]);
        assert_eq!(regs.take_tx(), Some(sample()));
        assert!(regs.take_tx().is_none());
    }

    #[test]
    fn can_read_prefetches_and_wraps() {
        let mut regs = Registers::new(4);
        regs.rx_frame(&sample());
        select(&mut regs, REG_CAN, Config::empty());
        let mut raw = [0u8; MSG_WIRE_SIZE];
        for b in raw.iter_mut() {
            *b = regs.read_data();
        }
        assert_eq!(from_wire(&raw), sample());
        // Pointer wrapped: the next read prefetches again (empty fifo
        // reads back as a zeroed frame).
        let first = regs.read_data();
        assert_eq!(first, 0);
    }

    #[test]
    fn status_reflects_fifo_and_mailboxes() {
        let mut regs = Registers::new(2);
        select(&mut regs, REG_CAN, Config::empty());
        let stat = Status::from_bits_truncate(regs.read_addr_status() & STAT_BIT_MASK);
        assert!(stat.contains(Status::TX_BUF_EMPTY));
        assert!(!stat.contains(Status::RX_DATA_AVAIL));

        regs.rx_frame(&sample());
        let stat = Status::from_bits_truncate(regs.read_addr_status() & STAT_BIT_MASK);
        assert!(stat.contains(Status::RX_DATA_AVAIL));
        // Address nibble rides along.
        assert_eq!(regs.read_addr_status() >> ADDR_SHIFT, REG_CAN);
    }

    #[test]
    fn overflow_is_sticky_until_reset() {
        let mut regs = Registers::new(1);
        regs.rx_frame(&sample());
        regs.rx_frame(&sample());
        let stat = Status::from_bits_truncate(regs.read_addr_status() & STAT_BIT_MASK);
        assert!(stat.contains(Status::RX_OVERFLOW));

        // Draining the fifo does not clear the overflow latch.
        select(&mut regs, REG_CAN, Config::empty());
        for _ in 0..MSG_WIRE_SIZE {
            regs.read_data();
        }
        let stat = Status::from_bits_truncate(regs.read_addr_status() & STAT_BIT_MASK);
        assert!(stat.contains(Status::RX_OVERFLOW));

        select(&mut regs, REG_CAN, Config::RX_OVERFLOW_RESET);
        let stat = Status::from_bits_truncate(regs.read_addr_status() & STAT_BIT_MASK);
        assert!(!stat.contains(Status::RX_OVERFLOW));
    }

    #[test]
    fn rx_interrupt_follows_enable_and_status_read() {
        let mut regs = Registers::new(4);
        regs.rx_frame(&sample());
        assert!(!regs.interrupt_asserted());

        select(&mut regs, REG_CAN, Config::RX_DATA_AVAIL_IE);
        regs.rx_frame(&sample());
        assert!(regs.interrupt_asserted());
        regs.read_addr_status();
        assert!(!regs.interrupt_asserted());
    }

    #[test]
    fn filters_commit_id_and_mask() {
        let mut regs = Registers::new(4);
        select(&mut regs, REG_FILT2, Config::empty());
        for b in 0x11223344u32.to_le_bytes().iter() {
            regs.write_data(*b);
        }
        for b in 0x1fffffffu32.to_le_bytes().iter() {
            regs.write_data(*b);
        }
        assert_eq!(regs.filter(1), (0x11223344, 0x1fffffff));
    }

    #[test]
    fn cfg1_masked_update_and_loopback() {
        let mut regs = Registers::new(4);
        select(&mut regs, REG_CFG1, Config::empty());
        for b in CFG1_LOOPBACK.to_le_bytes().iter() {
            regs.write_data(*b);
        }
        for b in CFG1_LOOPBACK.to_le_bytes().iter() {
            regs.write_data(*b);
        }
        assert_eq!(regs.cfg1(), CFG1_LOOPBACK);

        // With loopback set, a transmitted frame comes straight back.
        select(&mut regs, REG_CAN, Config::empty());
        for b in to_wire(&sample()).iter() {
            regs.write_data(*b);
        }
        let stat = Status::from_bits_truncate(regs.read_addr_status() & STAT_BIT_MASK);
        assert!(stat.contains(Status::RX_DATA_AVAIL));
    }
}
