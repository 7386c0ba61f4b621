//! Touchbridge command-line client.
//!
//! Thin front end over the host library: every subcommand is a short
//! request/response exchange with the bridge daemon. Exit code is 0 on
//! success, non-zero on timeout or protocol error.

use std::io::BufRead;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use tbg_protocol::{
    ErrorCode, MsgType, CONF_BITS_CMD, CONF_BIT_PORT, PORTCONF_CMD_GET_CONF_DESCR, PORT_CONFIG,
};
use tbg_server::{api, Tbg};

/// Device-port conventions shared by the stock cards.
const DIN_PORT: u8 = 8;
const DOUT_PORT: u8 = 8;
const AOUT_PORT: u8 = 11;

#[derive(Debug, Parser)]
#[clap(name = "tbg", about = "Touchbridge command line client")]
struct Cli {
    /// Bridge daemon endpoint
    #[clap(long, short, default_value = api::DEFAULT_ENDPOINT)]
    server: String,

    /// Per-response timeout in milliseconds
    #[clap(long, default_value_t = api::DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full rediscover and auto-assign; prints the inventory as JSON
    Adisc,

    /// Print one node's JSON descriptor
    Info { addr: u8 },

    /// Fetch a configuration string
    Getstr {
        addr: u8,
        conf: u8,
        port: Option<u8>,
        conf_num: Option<u8>,
    },

    /// Send a raw request and print the response
    Tbg {
        dst_addr: u8,
        dst_port: u8,
        /// Data bytes; 0x-prefixed values occupy their natural width,
        /// little-endian
        bytes: Vec<String>,
    },

    /// Digital output by pin number (1-8); streams stdin without VALUE
    Dout {
        node: u8,
        pin: u8,
        value: Option<u8>,
    },

    /// Digital output by mask
    Dout2 {
        node: u8,
        mask: u8,
        value: Option<u8>,
    },

    /// Stream debounced edges of one input pin to stdout
    Din { node: u8, pin: u8 },

    /// Analogue output by pin number (1-8)
    Aout {
        node: u8,
        pin: u8,
        value: Option<u16>,
    },

    /// Analogue input (reserved)
    Ain { node: u8, pin: u8 },
}

fn pin_mask(pin: u8) -> Result<u32> {
    if pin < 1 || pin > 8 {
        bail!("pin number {} out of bounds", pin);
    }
    Ok(1 << (pin - 1))
}

/// Read whitespace-led integers from stdin, one per line, until EOF.
fn stdin_values() -> impl Iterator<Item = Result<i64>> {
    std::io::stdin().lock().lines().filter_map(|line| {
        let line = match line {
            Ok(l) => l,
            Err(e) => return Some(Err(e.into())),
        };
        let token = line.split_whitespace().next()?.to_string();
        Some(parse_int(&token))
    })
}

fn parse_int(s: &str) -> Result<i64> {
    let v = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)?
    } else {
        s.parse::<i64>()?
    };
    Ok(v)
}

fn dout(tbg: &mut Tbg, node: u8, value: u32, mask: u32) -> Result<()> {
    let mut data = [0u8; 8];
    data[..4].copy_from_slice(&value.to_le_bytes());
    data[4..].copy_from_slice(&mask.to_le_bytes());
    log::debug!("dout: node {}, value {:#010x}, mask {:#010x}", node, value, mask);
    tbg.request(node, DOUT_PORT, &data)?;
    tbg.flush_responses()?;
    Ok(())
}

fn aout(tbg: &mut Tbg, node: u8, pin: u8, value: u16) -> Result<()> {
    let data = [pin, value as u8, (value >> 8) as u8];
    log::debug!("aout: node {}, pin {}, value {}", node, pin, value);
    tbg.request(node, AOUT_PORT, &data)?;
    tbg.flush_responses()?;
    Ok(())
}

fn adisc_cmd(tbg: &mut Tbg) -> Result<()> {
    let nodes = tbg.adisc_and_assign()?;
    if nodes.is_empty() {
        bail!("no nodes found");
    }
    let list: Vec<_> = nodes.iter().map(|n| n.to_json()).collect();
    println!("{}", serde_json::to_string_pretty(&list)?);
    Ok(())
}

fn info_cmd(tbg: &mut Tbg, addr: u8) -> Result<()> {
    let node = tbg.node_info(addr)?.ok_or_else(|| anyhow!("Timeout"))?;
    println!("{}", node.to_json());
    Ok(())
}

fn getstr_cmd(tbg: &mut Tbg, addr: u8, conf: u8, port: Option<u8>, conf_num: Option<u8>) -> Result<()> {
    let cmd = conf & CONF_BITS_CMD;
    let s = if cmd == PORTCONF_CMD_GET_CONF_DESCR && port.is_some() {
        let conf_num =
            conf_num.ok_or_else(|| anyhow!("usage: tbg getstr addr 2 port conf_num"))?;
        tbg.get_conf_descr(addr, conf_num, port.unwrap())?
    } else if let Some(port) = port {
        tbg.get_conf_string(addr, cmd | CONF_BIT_PORT, port)?
    } else {
        tbg.get_conf_string(addr, cmd, 0)?
    };
    let s = s.ok_or_else(|| anyhow!("Timeout"))?;
    if !s.is_empty() {
        println!("{}", s);
    }
    Ok(())
}

fn tbg_cmd(tbg: &mut Tbg, dst_addr: u8, dst_port: u8, bytes: &[String]) -> Result<()> {
    let mut data = Vec::new();
    for arg in bytes {
        let value = parse_int(arg).with_context(|| format!("bad data byte {:?}", arg))?;
        // 0x-prefixed arguments take their written width, LSB first;
        // everything else is a single byte.
        let width = if arg.starts_with("0x") || arg.starts_with("0X") {
            (arg.len() - 1) / 2
        } else {
            1
        };
        for i in 0..width {
            if data.len() >= 8 {
                break;
            }
            data.push((value >> (8 * i)) as u8);
        }
    }

    tbg.request(dst_addr, dst_port, &data)?;
    match tbg.wait_response(tbg.timeout)? {
        None => bail!("Timeout"),
        Some(resp) => {
            println!("{}", resp);
            if resp.is_error_response() {
                bail!("{}", ErrorCode::describe(resp.data[0]));
            }
        }
    }
    Ok(())
}

fn din_cmd(tbg: &mut Tbg, node: u8, pin: u8) -> Result<()> {
    let mask = pin_mask(pin)?;

    // Enable rising and falling events for every pin. This also lets
    // the daemon see that somebody cares about this card.
    tbg.request(node, PORT_CONFIG, &[0xc8, DIN_PORT, 0xff, 0, 0, 0])?;
    tbg.request(node, PORT_CONFIG, &[0xc9, DIN_PORT, 0xff, 0, 0, 0])?;
    tbg.flush_responses()?;

    loop {
        let msg = match tbg.wait_response(Duration::from_secs(3600))? {
            Some(m) => m,
            None => continue,
        };
        if msg.msg_type() == MsgType::Indication
            && msg.src_addr() == node
            && msg.src_port() == DIN_PORT
        {
            let events = msg.data_u32(0);
            let state = msg.data_u32(4);
            if events & mask != 0 {
                println!("{}", if state & mask != 0 { 1 } else { 0 });
            }
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut tbg = Tbg::connect(&cli.server)
        .with_context(|| format!("connecting to {}", cli.server))?;
    tbg.timeout = Duration::from_millis(cli.timeout_ms);

    match cli.command {
        Commands::Adisc => adisc_cmd(&mut tbg),

        Commands::Info { addr } => info_cmd(&mut tbg, addr),

        Commands::Getstr { addr, conf, port, conf_num } => {
            getstr_cmd(&mut tbg, addr, conf, port, conf_num)
        }

        Commands::Tbg { dst_addr, dst_port, bytes } => {
            tbg_cmd(&mut tbg, dst_addr, dst_port, &bytes)
        }

        Commands::Dout { node, pin, value } => {
            let mask = pin_mask(pin)?;
            match value {
                Some(v) => dout(&mut tbg, node, if v != 0 { 0xff } else { 0 }, mask),
                None => {
                    for v in stdin_values() {
                        let v = v?;
                        dout(&mut tbg, node, if v != 0 { 0xff } else { 0 }, mask)?;
                    }
                    Ok(())
                }
            }
        }

        Commands::Dout2 { node, mask, value } => match value {
            Some(v) => dout(&mut tbg, node, v as u32, mask as u32),
            None => {
                for v in stdin_values() {
                    let v = v?;
                    dout(&mut tbg, node, v as u32, mask as u32)?;
                }
                Ok(())
            }
        },

        Commands::Din { node, pin } => din_cmd(&mut tbg, node, pin),

        Commands::Aout { node, pin, value } => {
            if pin < 1 || pin > 8 {
                bail!("pin number {} out of bounds", pin);
            }
            let pin = pin - 1;
            match value {
                Some(v) => aout(&mut tbg, node, pin, v),
                None => {
                    for v in stdin_values() {
                        let v = v?.max(0).min(0xffff) as u16;
                        aout(&mut tbg, node, pin, v)?;
                    }
                    Ok(())
                }
            }
        }

        Commands::Ain { .. } => {
            bail!("analogue input is reserved and not implemented yet");
        }
    }
}
