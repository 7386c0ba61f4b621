//! Touchbridge node framework.
//!
//! A node is a device on the bus: a set of numbered ports behind a
//! per-device soft address. This crate implements the request dispatcher
//! and the four common ports every node carries (timestamp trigger,
//! address discovery, configuration, faults), leaving the device ports
//! to board code via the [`PortHandler`] trait.

use tbg_protocol::{
    ErrorCode, Faults, Msg, PortClass, ADDR_UNASSIGNED, DEVICE_PORT_BASE, PORT_ADISC, PORT_CONFIG,
    PORT_FAULTS, PORT_TSTRIGGER,
};

mod adisc;
pub mod boards;
pub mod bridge;
mod config;
pub mod debounce;
pub mod supply;

/// Outcome of a port or config handler: `Ok(true)` sends the prepared
/// response, `Ok(false)` stays silent, `Err` becomes an error response
/// (suppressed for broadcast requests).
pub type HandlerResult = Result<bool, ErrorCode>;

/// Read-only view of node state available to device port handlers.
pub struct Ctx {
    pub addr: u8,
    pub faults: Faults,
    /// True while a latched supply fault is forcing power outputs off.
    pub outputs_inhibited: bool,
}

/// Capability set of one device port.
pub trait PortHandler: Send {
    fn handle(&mut self, ctx: &Ctx, req: &Msg, resp: &mut Msg) -> HandlerResult;

    /// Number of device configs this port exposes.
    fn conf_count(&self) -> u8 {
        0
    }

    /// Capabilities of device config `idx` (0-based within this port),
    /// or None if there is no such config.
    fn conf_info(&self, _idx: u8) -> Option<ConfInfo> {
        None
    }

    fn conf_read(&mut self, _idx: u8, _ctx: &Ctx, _req: &Msg, _resp: &mut Msg) -> HandlerResult {
        Err(ErrorCode::NoConf)
    }

    fn conf_write(&mut self, _idx: u8, _ctx: &Ctx, _req: &Msg, _resp: &mut Msg) -> HandlerResult {
        Err(ErrorCode::NoConf)
    }
}

/// A config is a (read?, write?, description) triple; a missing half
/// produces the read-only/write-only error taxonomy.
#[derive(Clone, Copy)]
pub struct ConfInfo {
    pub readable: bool,
    pub writable: bool,
    pub descr: &'static str,
}

/// One device port: number ≥ 8, a wire-level class, a description and
/// an optional handler. A port without a handler answers every request
/// with `unimplemented`.
pub struct Port {
    pub number: u8,
    pub class: PortClass,
    pub descr: &'static str,
    pub handler: Option<Box<dyn PortHandler>>,
}

/// Immutable identity of a node.
pub struct NodeIdent {
    /// 96-bit hardware unique id; low half-word first.
    pub unique_id: [u8; 12],
    /// JSON product descriptor.
    pub product_id: &'static str,
    pub firmware_version: &'static str,
}

const USER_ID_LEN: usize = 32;

pub struct Node {
    ident: NodeIdent,
    ports: Vec<Port>,
    user_id: [u8; USER_ID_LEN],
    addr: u8,
    shortlist: bool,
    faults: Faults,
    inhibit: Faults,
}

impl Node {
    pub fn new(ident: NodeIdent, ports: Vec<Port>) -> Node {
        Node {
            ident,
            ports,
            user_id: [0; USER_ID_LEN],
            addr: ADDR_UNASSIGNED,
            shortlist: false,
            faults: Faults::empty(),
            inhibit: Faults::empty(),
        }
    }

    pub fn addr(&self) -> u8 {
        self.addr
    }

    pub fn ident(&self) -> &NodeIdent {
        &self.ident
    }

    pub fn faults(&self) -> Faults {
        self.faults
    }

    /// Latch a fault bit. Fault bits are sticky: they stay set until an
    /// explicit clear through the faults port.
    pub fn latch_fault(&mut self, f: Faults) {
        if !self.faults.contains(f) {
            log::warn!("node {}: fault latched: {:?}", self.addr, f);
        }
        self.faults.insert(f);
    }

    /// Current output-inhibit set, maintained by the supply monitor.
    pub fn inhibit(&self) -> Faults {
        self.inhibit
    }

    pub fn set_inhibit(&mut self, f: Faults) {
        self.inhibit = f;
    }

    pub fn outputs_inhibited(&self) -> bool {
        !self.inhibit.is_empty()
    }

    /// Does this frame address us (directly or by broadcast)?
    pub fn accepts(&self, msg: &Msg) -> bool {
        msg.is_broadcast() || msg.dst_addr() == self.addr
    }

    fn ctx(&self) -> Ctx {
        Ctx {
            addr: self.addr,
            faults: self.faults,
            outputs_inhibited: self.outputs_inhibited(),
        }
    }

    fn device_port_index(&self, number: u8) -> Option<usize> {
        self.ports.iter().position(|p| p.number == number)
    }

    /// Dispatch one inbound frame, producing at most one outbound frame.
    ///
    /// Response-kind frames are dropped (answering them could loop
    /// forever), as are frames for other addresses. The response
    /// skeleton carries the node's own address as source even when the
    /// request was a broadcast, so the reply stays routable. Broadcast
    /// requests are answered only on the address-discovery port; on
    /// every other port a broadcast produces neither a response nor an
    /// error response.
    pub fn dispatch(&mut self, req: &Msg) -> Option<Msg> {
        if req.is_response_kind() {
            return None;
        }
        if !self.accepts(req) {
            return None;
        }

        let mut resp = Msg::response_to(req, false, false, 0);
        resp.set_src_addr(self.addr);

        let port = req.dst_port();
        let result = match port {
            PORT_TSTRIGGER => Err(ErrorCode::Unimplemented),
            PORT_ADISC => adisc::handle(self, req, &mut resp),
            PORT_CONFIG => config::handle(self, req, &mut resp),
            PORT_FAULTS => self.faults_port(req, &mut resp),
            n => self.device_port(n, req, &mut resp),
        };

        match result {
            Ok(true) => {
                if req.is_broadcast() && port != PORT_ADISC {
                    return None;
                }
                resp.prepare_tx();
                Some(resp)
            }
            Ok(false) => None,
            Err(code) => {
                log::debug!("node {}: port {} error: {}", self.addr, port, code);
                let mut err = Msg::error_response_to(req, code)?;
                err.set_src_addr(self.addr);
                err.prepare_tx();
                Some(err)
            }
        }
    }

    fn device_port(&mut self, number: u8, req: &Msg, resp: &mut Msg) -> HandlerResult {
        if number < DEVICE_PORT_BASE {
            // Reserved gap between the common and device ports.
            return Err(ErrorCode::NoPort);
        }
        let idx = self.device_port_index(number).ok_or(ErrorCode::NoPort)?;
        let ctx = self.ctx();
        match self.ports[idx].handler {
            Some(ref mut h) => h.handle(&ctx, req, resp),
            None => Err(ErrorCode::Unimplemented),
        }
    }

    /// Faults port: zero-length reads return the bitmap; a two-byte
    /// write clears the masked bits and reports which bits it cleared.
    fn faults_port(&mut self, req: &Msg, resp: &mut Msg) -> HandlerResult {
        match req.len {
            0 => {
                resp.set_data_u16(0, self.faults.bits());
                resp.len = 2;
                Ok(true)
            }
            2 => {
                let mask = Faults::from_bits_truncate(req.data_u16(0));
                let cleared = self.faults & mask;
                self.faults.remove(mask);
                resp.set_data_u16(0, cleared.bits());
                resp.len = 2;
                Ok(true)
            }
            _ => Err(ErrorCode::Length),
        }
    }

    // Accessors used by the common-port modules in this crate.

    pub(crate) fn unique_id_half(&self, high: bool) -> &[u8] {
        if high {
            &self.ident.unique_id[6..12]
        } else {
            &self.ident.unique_id[0..6]
        }
    }

    pub(crate) fn shortlist(&self) -> bool {
        self.shortlist
    }

    pub(crate) fn set_shortlist(&mut self, v: bool) {
        self.shortlist = v;
    }

    /// Set the soft address directly. Normal operation assigns
    /// addresses through the discovery port; this is for bring-up and
    /// bench setups.
    pub fn set_addr(&mut self, v: u8) {
        self.addr = v;
    }

    pub(crate) fn user_id_bytes(&self) -> &[u8] {
        let end = self
            .user_id
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(USER_ID_LEN);
        &self.user_id[..end]
    }

    pub(crate) fn write_user_id(&mut self, offset: usize, bytes: &[u8]) -> Result<(), ErrorCode> {
        // Keep the final octet as a permanent terminator.
        if offset + bytes.len() > USER_ID_LEN - 1 {
            return Err(ErrorCode::Range);
        }
        self.user_id[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub const TEST_ID: [u8; 12] = [
        0x0C, 0x0B, 0x0A, 0x09, 0x08, 0x07, // low half, LSB first
        0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // high half, LSB first
    ];

    pub fn bare_node() -> Node {
        Node::new(
            NodeIdent {
                unique_id: TEST_ID,
                product_id: "{\"id\":\"TBG-TEST\"}",
                firmware_version: "1.0-test",
            },
            Vec::new(),
        )
    }

    /// Addressed request to an assigned-address node.
    pub fn req_to(node: &Node, port: u8, data: &[u8]) -> Msg {
        let mut req = Msg::request(node.addr(), port, data);
        req.set_src_addr(5);
        req.set_src_port(0);
        req
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use tbg_protocol::{MsgType, ADDR_BROADCAST};

    #[test]
    fn ping_round_trip() {
        let mut node = bare_node();
        node.set_addr(10);
        let mut req = Msg::request(10, PORT_CONFIG, &[0x01, 0x41, 0x42, 0x43]);
        req.set_src_addr(5);
        let resp = node.dispatch(&req).unwrap();
        assert_eq!(resp.msg_type(), MsgType::Response);
        assert_eq!(resp.dst_addr(), 5);
        assert_eq!(resp.dst_port(), 0);
        assert_eq!(resp.src_addr(), 10);
        assert_eq!(resp.src_port(), PORT_CONFIG);
        assert_eq!(resp.payload(), &[0x01, 0x41, 0x42, 0x43]);
    }

    #[test]
    fn foreign_address_is_ignored() {
        let mut node = bare_node();
        node.set_addr(10);
        let req = Msg::request(11, PORT_CONFIG, &[0x01]);
        assert!(node.dispatch(&req).is_none());
    }

    #[test]
    fn responses_are_never_answered() {
        let mut node = bare_node();
        node.set_addr(10);
        let mut msg = Msg::request(10, PORT_CONFIG, &[0x01]);
        msg.set_msg_type(MsgType::Response);
        assert!(node.dispatch(&msg).is_none());
        msg.set_msg_type(MsgType::ErrorResponse);
        assert!(node.dispatch(&msg).is_none());
    }

    #[test]
    fn broadcast_ping_is_silent() {
        let mut node = bare_node();
        node.set_addr(10);
        let req = Msg::request(ADDR_BROADCAST, PORT_CONFIG, &[0x01, 0x55]);
        assert!(node.dispatch(&req).is_none());
    }

    #[test]
    fn broadcast_error_is_silent() {
        let mut node = bare_node();
        node.set_addr(10);
        let req = Msg::request(ADDR_BROADCAST, 7, &[]);
        assert!(node.dispatch(&req).is_none());
    }

    #[test]
    fn reserved_gap_port_is_no_port() {
        let mut node = bare_node();
        node.set_addr(10);
        for port in 4..8 {
            let resp = node.dispatch(&req_to(&node, port, &[])).unwrap();
            assert_eq!(resp.msg_type(), MsgType::ErrorResponse);
            assert_eq!(resp.data[0], ErrorCode::NoPort as u8);
        }
    }

    #[test]
    fn unmapped_device_port_is_no_port() {
        let mut node = bare_node();
        node.set_addr(10);
        let resp = node.dispatch(&req_to(&node, 8, &[])).unwrap();
        assert_eq!(resp.msg_type(), MsgType::ErrorResponse);
        assert_eq!(resp.data[0], ErrorCode::NoPort as u8);
    }

    #[test]
    fn handlerless_port_is_unimplemented() {
        let mut node = Node::new(
            NodeIdent {
                unique_id: TEST_ID,
                product_id: "{}",
                firmware_version: "0",
            },
            vec![Port {
                number: 8,
                class: PortClass::DigitalOut,
                descr: "Dead port",
                handler: None,
            }],
        );
        node.set_addr(10);
        let resp = node.dispatch(&req_to(&node, 8, &[])).unwrap();
        assert_eq!(resp.data[0], ErrorCode::Unimplemented as u8);
    }

    #[test]
    fn tstrigger_is_unimplemented() {
        let mut node = bare_node();
        node.set_addr(10);
        let resp = node.dispatch(&req_to(&node, PORT_TSTRIGGER, &[])).unwrap();
        assert_eq!(resp.msg_type(), MsgType::ErrorResponse);
        assert_eq!(resp.data[0], ErrorCode::Unimplemented as u8);
    }

    #[test]
    fn faults_read_and_clear() {
        let mut node = bare_node();
        node.set_addr(10);
        node.latch_fault(Faults::UNDERVOLT | Faults::OVERTEMP);

        // Clear with mask 0x0002: reply names the cleared bits.
        let resp = node
            .dispatch(&req_to(&node, PORT_FAULTS, &[0x02, 0x00]))
            .unwrap();
        assert_eq!(resp.payload(), &[0x02, 0x00]);
        assert_eq!(node.faults(), Faults::OVERTEMP);

        // A follow-up read sees the remaining latch.
        let resp = node.dispatch(&req_to(&node, PORT_FAULTS, &[])).unwrap();
        assert_eq!(resp.payload(), &[0x08, 0x00]);
    }

    #[test]
    fn faults_bad_length() {
        let mut node = bare_node();
        node.set_addr(10);
        let resp = node.dispatch(&req_to(&node, PORT_FAULTS, &[1])).unwrap();
        assert_eq!(resp.data[0], ErrorCode::Length as u8);
    }

    #[test]
    fn user_id_write_bounds() {
        let mut node = bare_node();
        assert!(node.write_user_id(0, b"press-shop").is_ok());
        assert_eq!(node.user_id_bytes(), b"press-shop");
        assert_eq!(node.write_user_id(28, b"abcd"), Err(ErrorCode::Range));
    }
}
