//! Touchbridge wire protocol.
//!
//! A Touchbridge message is a 29-bit extended CAN identifier plus up to
//! eight data octets. The identifier packs source and destination
//! address/port pairs, a message type and a pair of state/continuation
//! flags; the layout is fixed by the bus protocol, so all access goes
//! through explicit shift/mask accessors on the numeric id rather than
//! any in-memory bit-field overlay.

use core::fmt;

use num_traits::FromPrimitive;

pub mod fifo;
pub mod hex;

pub use fifo::MsgFifo;

pub const PROTOCOL_VER_TYPE: u8 = 1;
pub const PROTOCOL_VER_MAJOR: u8 = 1;
pub const PROTOCOL_VER_MINOR: u8 = 0;

/// Destination address of broadcast messages.
pub const ADDR_BROADCAST: u8 = 0;
/// Soft address of a node which has not been through address discovery.
pub const ADDR_UNASSIGNED: u8 = 63;
/// Address conventionally taken by the bridge daemon.
pub const ADDR_SERVER: u8 = 62;

// Ports common to all nodes.
pub const PORT_TSTRIGGER: u8 = 0;
pub const PORT_ADISC: u8 = 1;
pub const PORT_CONFIG: u8 = 2;
pub const PORT_FAULTS: u8 = 3;

/// First port number available to device-specific ports. Ports between
/// the common ports and this base are a reserved gap.
pub const DEVICE_PORT_BASE: u8 = 8;

pub const PORTS_MAX: u8 = 64;

/// Message type field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum MsgType {
    Response = 0,
    Request = 1,
    ErrorResponse = 2,
    Indication = 3,
}

/// Error codes carried in data\[0\] of an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum ErrorCode {
    None = 0,
    Unimplemented = 1,
    NoPort = 2,
    NoConf = 3,
    ReadOnly = 4,
    WriteOnly = 5,
    Length = 6,
    Range = 7,
    Value = 8,
    Fault = 9,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::None => "Success",
            ErrorCode::Unimplemented => "Unimplemented",
            ErrorCode::NoPort => "Port not available",
            ErrorCode::NoConf => "Config not available",
            ErrorCode::ReadOnly => "Read only",
            ErrorCode::WriteOnly => "Write only",
            ErrorCode::Length => "Incorrect message length",
            ErrorCode::Range => "Out of range",
            ErrorCode::Value => "Incorrect value",
            ErrorCode::Fault => "Hardware fault",
        }
    }

    /// Error string for a raw wire code, tolerating codes we don't know.
    pub fn describe(code: u8) -> &'static str {
        match ErrorCode::from_u8(code) {
            Some(e) => e.as_str(),
            None => "Unknown error code",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Port classes. The set is closed: it is fixed by the wire protocol,
/// not by any particular board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum PortClass {
    NotPresent = 0,
    Common,
    Estop,
    Alarms,
    Reserved,
    DigitalIn,
    DigitalOut,
    AnalogueIn,
    AnalogueOut,
    AnalogueOutCh,
    CounterTimer,
    Uart,
    Spi,
    I2c,
    Buf8Read,
    Buf8Write,
    Buf16Read,
    Buf16Write,
    BufExec,
    Stepper,
    MotionBuf,
    In32,
    Out32,
}

/// Global configuration commands serviced by the config port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum GlobalConf {
    Nop = 0,
    Ping = 1,
    Protocol = 2,
    Reset = 3,
    IdLsw = 4,
    IdMsw = 5,
    HardAddr = 6,
    BlinkLeds = 7,
    ProductIdStr = 8,
    FirmwareVerStr = 9,
    UserIdString = 10,
    SaveUserIdString = 11,
}

// Config-request command byte: {cmd:6, is-port:1, is-write:1}.
pub const CONF_BITS_CMD: u8 = 0x3f;
pub const CONF_BIT_PORT: u8 = 0x40;
pub const CONF_BIT_WRITE: u8 = 0x80;

pub const CONF_REQ_LEN_MIN: u8 = 1;
pub const PORTCONF_REQ_LEN_MIN: u8 = 2;

// Port-config commands common to all ports.
pub const PORTCONF_CMD_GET_CLASS: u8 = 0;
pub const PORTCONF_CMD_GET_DESCR: u8 = 1;
pub const PORTCONF_CMD_GET_CONF_DESCR: u8 = 2;
pub const PORTCONF_CMD_EN_TSTRIGGER: u8 = 3;
pub const PORTCONF_CMD_COM_NUMOF: u8 = 4;

/// First config command number belonging to the port's own table.
pub const DEVICE_PORTCONF_CMD_BASE: u8 = 8;

bitflags::bitflags! {
    /// Address-discovery command bits (request data[0]).
    pub struct AdiscFlags: u8 {
        const RETURN_ID       = 0x01;
        const RETURN_ID_MSW   = 0x02;
        const MATCH_ID        = 0x04;
        const MATCH_ID_MSW    = 0x08;
        const ASSIGN_ADDR     = 0x10;
        const SET_SHORTLIST   = 0x20;
        const CLR_SHORTLIST   = 0x40;
        const MATCH_SHORTLIST = 0x80;
    }
}

bitflags::bitflags! {
    /// Latched node fault bits.
    pub struct Faults: u16 {
        const OVERVOLT    = 0x0001;
        const UNDERVOLT   = 0x0002;
        const OVERCURRENT = 0x0004;
        const OVERTEMP    = 0x0008;
    }
}

// Address-discovery message layout.
pub const ADISC_REQ_DATA_CMD: usize = 0;
pub const ADISC_REQ_DATA_ADDR: usize = 1;
pub const ADISC_REQ_DATA_ID0: usize = 2;
pub const ADISC_REQ_LEN_MIN: u8 = 2;
pub const ADISC_REQ_LEN_ID: u8 = 8;
pub const ADISC_RESP_DATA_ID0: usize = 0;
pub const ADISC_RESP_DATA_SOFT_ADDR: usize = 6;
pub const ADISC_RESP_DATA_HARD_ADDR: usize = 7;

/// Size in octets of one half of the 96-bit node unique id.
pub const ID_HALF_LEN: usize = 6;

// Identifier bit offsets.
const SRC_PORT_SHIFT: u32 = 0;
const SRC_ADDR_SHIFT: u32 = 6;
const DST_PORT_SHIFT: u32 = 12;
const DST_ADDR_SHIFT: u32 = 18;
const STATE_SHIFT: u32 = 24;
const CONT_SHIFT: u32 = 25;
const TYPE_SHIFT: u32 = 27;
const EID_SHIFT: u32 = 29;
const RTR_SHIFT: u32 = 30;

const PORT_MASK: u32 = 0x3f;
const ADDR_MASK: u32 = 0x3f;
const FLAG_MASK: u32 = 0x01;
const TYPE_MASK: u32 = 0x03;

fn get_bits(id: u32, shift: u32, mask: u32) -> u32 {
    (id >> shift) & mask
}

fn set_bits(id: &mut u32, shift: u32, mask: u32, value: u32) {
    *id = (*id & !(mask << shift)) | ((value & mask) << shift);
}

/// One Touchbridge message: identifier, length and data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Msg {
    pub id: u32,
    pub len: u8,
    pub data: [u8; 8],
}

impl Msg {
    pub fn new() -> Msg {
        Msg::default()
    }

    pub fn src_port(&self) -> u8 {
        get_bits(self.id, SRC_PORT_SHIFT, PORT_MASK) as u8
    }

    pub fn src_addr(&self) -> u8 {
        get_bits(self.id, SRC_ADDR_SHIFT, ADDR_MASK) as u8
    }

    pub fn dst_port(&self) -> u8 {
        get_bits(self.id, DST_PORT_SHIFT, PORT_MASK) as u8
    }

    pub fn dst_addr(&self) -> u8 {
        get_bits(self.id, DST_ADDR_SHIFT, ADDR_MASK) as u8
    }

    pub fn state(&self) -> bool {
        get_bits(self.id, STATE_SHIFT, FLAG_MASK) != 0
    }

    pub fn continued(&self) -> bool {
        get_bits(self.id, CONT_SHIFT, FLAG_MASK) != 0
    }

    pub fn msg_type(&self) -> MsgType {
        match get_bits(self.id, TYPE_SHIFT, TYPE_MASK) {
            0 => MsgType::Response,
            1 => MsgType::Request,
            2 => MsgType::ErrorResponse,
            _ => MsgType::Indication,
        }
    }

    pub fn eid(&self) -> bool {
        get_bits(self.id, EID_SHIFT, FLAG_MASK) != 0
    }

    pub fn rtr(&self) -> bool {
        get_bits(self.id, RTR_SHIFT, FLAG_MASK) != 0
    }

    pub fn set_src_port(&mut self, v: u8) {
        set_bits(&mut self.id, SRC_PORT_SHIFT, PORT_MASK, v as u32);
    }

    pub fn set_src_addr(&mut self, v: u8) {
        set_bits(&mut self.id, SRC_ADDR_SHIFT, ADDR_MASK, v as u32);
    }

    pub fn set_dst_port(&mut self, v: u8) {
        set_bits(&mut self.id, DST_PORT_SHIFT, PORT_MASK, v as u32);
    }

    pub fn set_dst_addr(&mut self, v: u8) {
        set_bits(&mut self.id, DST_ADDR_SHIFT, ADDR_MASK, v as u32);
    }

    pub fn set_state(&mut self, v: bool) {
        set_bits(&mut self.id, STATE_SHIFT, FLAG_MASK, v as u32);
    }

    pub fn set_continued(&mut self, v: bool) {
        set_bits(&mut self.id, CONT_SHIFT, FLAG_MASK, v as u32);
    }

    pub fn set_msg_type(&mut self, t: MsgType) {
        set_bits(&mut self.id, TYPE_SHIFT, TYPE_MASK, t as u32);
    }

    pub fn set_eid(&mut self, v: bool) {
        set_bits(&mut self.id, EID_SHIFT, FLAG_MASK, v as u32);
    }

    pub fn set_rtr(&mut self, v: bool) {
        set_bits(&mut self.id, RTR_SHIFT, FLAG_MASK, v as u32);
    }

    /// Touchbridge only uses extended ids and never RTR.
    pub fn is_valid(&self) -> bool {
        self.eid() && !self.rtr()
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst_addr() == ADDR_BROADCAST
    }

    /// True for Response and ErrorResponse frames. Responding to these
    /// could start an endless exchange, so dispatchers drop them.
    pub fn is_response_kind(&self) -> bool {
        matches!(self.msg_type(), MsgType::Response | MsgType::ErrorResponse)
    }

    pub fn is_error_response(&self) -> bool {
        self.msg_type() == MsgType::ErrorResponse
    }

    /// Set the CAN-level bits every transmitted frame carries.
    pub fn prepare_tx(&mut self) {
        self.set_eid(true);
        self.set_rtr(false);
    }

    /// Build a request frame. The source pair is left zero; on the host
    /// path the daemon stamps it before the frame reaches the bus.
    pub fn request(dst_addr: u8, dst_port: u8, data: &[u8]) -> Msg {
        let mut msg = Msg::new();
        msg.set_dst_addr(dst_addr);
        msg.set_dst_port(dst_port);
        msg.set_msg_type(MsgType::Request);
        msg.prepare_tx();
        msg.set_payload(data);
        msg
    }

    /// Build a response skeleton for `req`: type Response, src/dst
    /// swapped, given state/continued flags and length.
    pub fn response_to(req: &Msg, state: bool, cont: bool, len: u8) -> Msg {
        let mut resp = Msg::new();
        resp.set_msg_type(MsgType::Response);
        resp.set_state(state);
        resp.set_continued(cont);
        resp.set_dst_port(req.src_port());
        resp.set_dst_addr(req.src_addr());
        resp.set_src_port(req.dst_port());
        resp.set_src_addr(req.dst_addr());
        resp.len = len;
        resp
    }

    /// Build an error response for `req`, or None when the request was a
    /// broadcast: broadcast requests are never answered with errors.
    pub fn error_response_to(req: &Msg, code: ErrorCode) -> Option<Msg> {
        if req.is_broadcast() {
            return None;
        }
        let mut resp = Msg::response_to(req, false, false, 1);
        resp.set_msg_type(MsgType::ErrorResponse);
        resp.data[0] = code as u8;
        Some(resp)
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len.min(8) as usize]
    }

    pub fn set_payload(&mut self, data: &[u8]) {
        let n = data.len().min(8);
        self.data[..n].copy_from_slice(&data[..n]);
        self.len = n as u8;
    }

    pub fn data_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    pub fn data_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    pub fn set_data_u16(&mut self, offset: usize, v: u16) {
        self.data[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn set_data_u32(&mut self, offset: usize, v: u32) {
        self.data[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    }
}

impl fmt::Display for Msg {
    /// Diagnostic dump: `REQ 05:00 => 10:02  0x01 0x41  .A`
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self.msg_type() {
            MsgType::Response => "RES",
            MsgType::Request => "REQ",
            MsgType::ErrorResponse => "ERR",
            MsgType::Indication => "IND",
        };
        write!(
            f,
            "{} {:02}:{:02} => {:02}:{:02} ",
            name,
            self.src_addr(),
            self.src_port(),
            self.dst_addr(),
            self.dst_port()
        )?;
        for b in self.payload() {
            write!(f, " 0x{:02X}", b)?;
        }
        write!(f, "  ")?;
        for &b in self.payload() {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, ".")?;
            }
        }
        Ok(())
    }
}

/// Fill an adisc request payload: command bits, candidate address and a
/// 48-bit id half-word, LSB first.
pub fn adisc_data(cmd: AdiscFlags, addr: u8, id: u64) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[ADISC_REQ_DATA_CMD] = cmd.bits();
    data[ADISC_REQ_DATA_ADDR] = addr;
    for (i, b) in data[ADISC_REQ_DATA_ID0..].iter_mut().enumerate() {
        *b = (id >> (8 * i)) as u8;
    }
    data
}

/// Extract the 48-bit id half-word from an adisc response.
pub fn adisc_resp_id(msg: &Msg) -> u64 {
    let mut id = 0u64;
    for i in 0..ID_HALF_LEN {
        id |= (msg.data[ADISC_RESP_DATA_ID0 + i] as u64) << (8 * i);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_bit_layout() {
        // Ping request from 5:0 to 10:2, per the wire layout.
        let mut msg = Msg::new();
        msg.set_src_port(0);
        msg.set_src_addr(5);
        msg.set_dst_port(2);
        msg.set_dst_addr(10);
        msg.set_msg_type(MsgType::Request);
        msg.set_eid(true);
        assert_eq!(msg.id, 0x2828_2140);
    }

    #[test]
    fn field_round_trip() {
        let mut msg = Msg::new();
        msg.set_src_port(63);
        msg.set_src_addr(1);
        msg.set_dst_port(0);
        msg.set_dst_addr(62);
        msg.set_state(true);
        msg.set_continued(true);
        msg.set_msg_type(MsgType::ErrorResponse);
        msg.set_eid(true);
        msg.set_rtr(true);
        assert_eq!(msg.src_port(), 63);
        assert_eq!(msg.src_addr(), 1);
        assert_eq!(msg.dst_port(), 0);
        assert_eq!(msg.dst_addr(), 62);
        assert!(msg.state());
        assert!(msg.continued());
        assert_eq!(msg.msg_type(), MsgType::ErrorResponse);
        assert!(msg.eid());
        assert!(msg.rtr());

        // Fields don't bleed into each other.
        msg.set_src_port(0);
        assert_eq!(msg.src_addr(), 1);
        assert_eq!(msg.dst_addr(), 62);
    }

    #[test]
    fn validity() {
        let mut msg = Msg::new();
        assert!(!msg.is_valid());
        msg.set_eid(true);
        assert!(msg.is_valid());
        msg.set_rtr(true);
        assert!(!msg.is_valid());
    }

    #[test]
    fn response_swaps_addressing() {
        let req = Msg::request(10, 2, &[1, 2, 3]);
        let mut req = req;
        req.set_src_addr(5);
        req.set_src_port(7);
        let resp = Msg::response_to(&req, false, false, 0);
        assert_eq!(resp.msg_type(), MsgType::Response);
        assert_eq!(resp.dst_addr(), 5);
        assert_eq!(resp.dst_port(), 7);
        assert_eq!(resp.src_addr(), 10);
        assert_eq!(resp.src_port(), 2);
        assert_eq!(resp.len, 0);
    }

    #[test]
    fn error_response_carries_code() {
        let mut req = Msg::request(9, 7, &[]);
        req.set_src_addr(3);
        let resp = Msg::error_response_to(&req, ErrorCode::NoPort).unwrap();
        assert_eq!(resp.msg_type(), MsgType::ErrorResponse);
        assert_eq!(resp.len, 1);
        assert_eq!(resp.data[0], 2);
    }

    #[test]
    fn broadcast_never_gets_error_response() {
        let req = Msg::request(ADDR_BROADCAST, 7, &[]);
        assert!(Msg::error_response_to(&req, ErrorCode::NoPort).is_none());
    }

    #[test]
    fn adisc_data_round_trip() {
        let data = adisc_data(AdiscFlags::RETURN_ID | AdiscFlags::RETURN_ID_MSW, 17, 0x0102_0304_0506);
        assert_eq!(data[0], 0x03);
        assert_eq!(data[1], 17);
        // LSB-first half-word.
        assert_eq!(&data[2..8], &[0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);

        let mut resp = Msg::new();
        resp.data[..6].copy_from_slice(&data[2..8]);
        resp.len = 8;
        assert_eq!(adisc_resp_id(&resp), 0x0102_0304_0506);
    }

    #[test]
    fn dump_format() {
        let mut msg = Msg::request(10, 2, &[0x01, 0x41, 0x42, 0x43]);
        msg.set_src_addr(5);
        let s = format!("{}", msg);
        assert!(s.starts_with("REQ 05:00 => 10:02 "), "{}", s);
        assert!(s.contains("0x41"));
        assert!(s.ends_with(".ABC"), "{}", s);
    }
}
