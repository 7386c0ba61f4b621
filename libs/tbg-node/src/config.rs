//! Configuration port.
//!
//! The first data byte selects {cmd:6, is-port:1, is-write:1}. Global
//! form indexes the node-wide config table; port form takes a port
//! number in data[1] and resolves either a port-common config (0–3) or
//! the port's own table (8 upward).

use num_traits::FromPrimitive;

use tbg_protocol::{
    ErrorCode, GlobalConf, Msg, CONF_BIT_PORT, CONF_BIT_WRITE, CONF_BITS_CMD, CONF_REQ_LEN_MIN,
    DEVICE_PORTCONF_CMD_BASE, DEVICE_PORT_BASE, ID_HALF_LEN, PORTCONF_CMD_COM_NUMOF,
    PORTCONF_CMD_EN_TSTRIGGER, PORTCONF_CMD_GET_CLASS, PORTCONF_CMD_GET_CONF_DESCR,
    PORTCONF_CMD_GET_DESCR, PORTCONF_REQ_LEN_MIN, PORT_ADISC, PORT_CONFIG, PORT_FAULTS,
    PORT_TSTRIGGER, PROTOCOL_VER_MAJOR, PROTOCOL_VER_MINOR, PROTOCOL_VER_TYPE,
};
use tbg_protocol::PortClass;

use crate::{HandlerResult, Node};

const COMMON_PORT_DESCRS: [(u8, &str); 4] = [
    (PORT_TSTRIGGER, "Timestamp Trigger"),
    (PORT_ADISC, "Address Discovery"),
    (PORT_CONFIG, "Configuration"),
    (PORT_FAULTS, "Faults"),
];

const PORT_COMMON_CONF_DESCRS: [&str; 4] = [
    "Port Class",
    "Port Description",
    "Port Config Description",
    "Timestamp Trigger",
];

pub(crate) fn handle(node: &mut Node, req: &Msg, resp: &mut Msg) -> HandlerResult {
    if req.len < CONF_REQ_LEN_MIN {
        return Err(ErrorCode::Length);
    }

    let bits = req.data[0];
    let cmd = bits & CONF_BITS_CMD;
    let write = bits & CONF_BIT_WRITE != 0;

    if bits & CONF_BIT_PORT != 0 {
        if req.len < PORTCONF_REQ_LEN_MIN {
            return Err(ErrorCode::Length);
        }
        port_conf(node, req.data[1], cmd, write, req, resp)
    } else {
        global_conf(node, cmd, write, req, resp)
    }
}

/// Deliver a string in 8-byte chunks from `offset`, trailing NUL
/// included. An offset past the end yields a single NUL, which is how
/// readers detect end-of-string.
fn read_str8(resp: &mut Msg, s: &[u8], offset: u8) -> HandlerResult {
    let slen = s.len() + 1;
    let off = offset as usize;
    if off >= slen {
        resp.len = 1;
        resp.data[0] = 0;
    } else {
        let n = (slen - off).min(8);
        for i in 0..n {
            resp.data[i] = if off + i < s.len() { s[off + i] } else { 0 };
        }
        resp.len = n as u8;
    }
    Ok(true)
}

fn global_conf(node: &mut Node, cmd: u8, write: bool, req: &Msg, resp: &mut Msg) -> HandlerResult {
    let conf = GlobalConf::from_u8(cmd).ok_or(ErrorCode::NoConf)?;
    match conf {
        // Deliberately silent in both directions.
        GlobalConf::Nop => Ok(false),

        GlobalConf::Ping => {
            resp.set_payload(req.payload());
            Ok(true)
        }

        GlobalConf::Protocol => {
            if write {
                return Err(ErrorCode::ReadOnly);
            }
            resp.set_payload(&[PROTOCOL_VER_TYPE, PROTOCOL_VER_MAJOR, PROTOCOL_VER_MINOR]);
            Ok(true)
        }

        GlobalConf::Reset => {
            if !write {
                return Err(ErrorCode::WriteOnly);
            }
            Err(ErrorCode::Unimplemented)
        }

        GlobalConf::IdLsw | GlobalConf::IdMsw => {
            if write {
                return Err(ErrorCode::ReadOnly);
            }
            let half = node.unique_id_half(conf == GlobalConf::IdMsw);
            resp.data[..ID_HALF_LEN].copy_from_slice(half);
            resp.len = ID_HALF_LEN as u8;
            Ok(true)
        }

        GlobalConf::HardAddr | GlobalConf::SaveUserIdString => Err(ErrorCode::Unimplemented),

        GlobalConf::BlinkLeds => {
            if !write {
                return Err(ErrorCode::WriteOnly);
            }
            // No indicator hardware fitted here.
            Err(ErrorCode::Unimplemented)
        }

        GlobalConf::ProductIdStr => {
            if write {
                return Err(ErrorCode::ReadOnly);
            }
            if req.len < CONF_REQ_LEN_MIN + 1 {
                return Err(ErrorCode::Length);
            }
            let s = node.ident().product_id.as_bytes();
            read_str8(resp, s, req.data[1])
        }

        GlobalConf::FirmwareVerStr => {
            if write {
                return Err(ErrorCode::ReadOnly);
            }
            if req.len < CONF_REQ_LEN_MIN + 1 {
                return Err(ErrorCode::Length);
            }
            let s = node.ident().firmware_version.as_bytes();
            read_str8(resp, s, req.data[1])
        }

        GlobalConf::UserIdString => {
            if req.len < CONF_REQ_LEN_MIN + 1 {
                return Err(ErrorCode::Length);
            }
            let offset = req.data[1];
            if write {
                let bytes = &req.data[2..req.len as usize];
                node.write_user_id(offset as usize, bytes)?;
                Ok(true)
            } else {
                read_str8(resp, node.user_id_bytes(), offset)
            }
        }
    }
}

enum PortRef {
    Common(usize),
    Device(usize),
}

fn find_port(node: &Node, number: u8) -> Result<PortRef, ErrorCode> {
    if number < DEVICE_PORT_BASE {
        if (number as usize) < COMMON_PORT_DESCRS.len() {
            Ok(PortRef::Common(number as usize))
        } else {
            Err(ErrorCode::NoPort)
        }
    } else {
        node.ports
            .iter()
            .position(|p| p.number == number)
            .map(PortRef::Device)
            .ok_or(ErrorCode::NoPort)
    }
}

fn port_conf(
    node: &mut Node,
    port_number: u8,
    cmd: u8,
    write: bool,
    req: &Msg,
    resp: &mut Msg,
) -> HandlerResult {
    let pref = find_port(node, port_number)?;

    if cmd < DEVICE_PORTCONF_CMD_BASE {
        if cmd >= PORTCONF_CMD_COM_NUMOF {
            return Err(ErrorCode::Unimplemented);
        }
        return port_common_conf(node, &pref, cmd, write, req, resp);
    }

    // The port's own config table.
    let idx = cmd - DEVICE_PORTCONF_CMD_BASE;
    let pidx = match pref {
        PortRef::Common(_) => return Err(ErrorCode::NoConf),
        PortRef::Device(i) => i,
    };
    let ctx = node.ctx();
    let port = &mut node.ports[pidx];
    let handler = match port.handler {
        Some(ref mut h) => h,
        None => return Err(ErrorCode::NoConf),
    };
    let info = handler.conf_info(idx).ok_or(ErrorCode::NoConf)?;
    if !info.readable && !info.writable {
        return Err(ErrorCode::Unimplemented);
    }
    if write {
        if !info.writable {
            return Err(ErrorCode::ReadOnly);
        }
        handler.conf_write(idx, &ctx, req, resp)
    } else {
        if !info.readable {
            return Err(ErrorCode::WriteOnly);
        }
        handler.conf_read(idx, &ctx, req, resp)
    }
}

fn port_common_conf(
    node: &mut Node,
    pref: &PortRef,
    cmd: u8,
    write: bool,
    req: &Msg,
    resp: &mut Msg,
) -> HandlerResult {
    let (class, descr, conf_count) = match *pref {
        PortRef::Common(i) => (PortClass::Common, COMMON_PORT_DESCRS[i].1, 0),
        PortRef::Device(i) => {
            let port = &node.ports[i];
            let count = port.handler.as_ref().map_or(0, |h| h.conf_count());
            (port.class, port.descr, count)
        }
    };

    match cmd {
        PORTCONF_CMD_GET_CLASS => {
            if write {
                return Err(ErrorCode::ReadOnly);
            }
            resp.set_payload(&[class as u8, conf_count]);
            Ok(true)
        }

        PORTCONF_CMD_GET_DESCR => {
            if write {
                return Err(ErrorCode::ReadOnly);
            }
            if req.len < PORTCONF_REQ_LEN_MIN + 1 {
                return Err(ErrorCode::Length);
            }
            read_str8(resp, descr.as_bytes(), req.data[2])
        }

        PORTCONF_CMD_GET_CONF_DESCR => {
            if write {
                return Err(ErrorCode::ReadOnly);
            }
            if req.len < PORTCONF_REQ_LEN_MIN + 2 {
                return Err(ErrorCode::Length);
            }
            let conf_num = req.data[2];
            let offset = req.data[3];
            let conf_descr = conf_descr(node, pref, conf_num)?;
            read_str8(resp, conf_descr.as_bytes(), offset)
        }

        PORTCONF_CMD_EN_TSTRIGGER => {
            if !write {
                return Err(ErrorCode::WriteOnly);
            }
            Err(ErrorCode::Unimplemented)
        }

        _ => Err(ErrorCode::Unimplemented),
    }
}

fn conf_descr(node: &Node, pref: &PortRef, conf_num: u8) -> Result<&'static str, ErrorCode> {
    if conf_num < DEVICE_PORTCONF_CMD_BASE {
        if conf_num >= PORTCONF_CMD_COM_NUMOF {
            return Err(ErrorCode::Unimplemented);
        }
        return Ok(PORT_COMMON_CONF_DESCRS[conf_num as usize]);
    }
    let idx = conf_num - DEVICE_PORTCONF_CMD_BASE;
    match *pref {
        PortRef::Common(_) => Err(ErrorCode::NoConf),
        PortRef::Device(i) => {
            let handler = node.ports[i].handler.as_ref().ok_or(ErrorCode::NoConf)?;
            let info = handler.conf_info(idx).ok_or(ErrorCode::NoConf)?;
            Ok(info.descr)
        }
    }
}
