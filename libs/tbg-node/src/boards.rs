//! Representative cards built on the node framework.
//!
//! Real deployments put one of these behind each CAN transceiver; the
//! hosted build shares them between the port handlers and the simulated
//! bus, so the state sits behind `Arc<Mutex<..>>` handles the same way
//! the hosted hardware backends do elsewhere in the tree.

use std::sync::{Arc, Mutex};

use tbg_protocol::{ErrorCode, Msg, MsgType, PortClass, ADDR_BROADCAST};

use crate::debounce::{Debouncer, DinConfig};
use crate::supply::{PowerMonitor, SupplyLimits};
use crate::{ConfInfo, Ctx, HandlerResult, Node, NodeIdent, Port, PortHandler};

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const INPUT_PRODUCT_ID: &str = "{\"id\":\"TBG-INPUT\",\"rev\":3,\"opt\":[],\"descr\":\"Touchbridge 8 Channel Opto-Isolated Input Card\",\"mfg\":\"Airborne Engineering Limited\"}";
pub const OUTPUT_PRODUCT_ID: &str = "{\"id\":\"TBG-HSO\",\"rev\":3,\"opt\":[],\"descr\":\"Touchbridge 8 Channel High-Side Output Card\",\"mfg\":\"Airborne Engineering Limited\"}";

/// Digital-input port number on the input card.
pub const DIN_PORT: u8 = 8;
pub const DIN_CHANNELS: usize = 8;

/// Digital-output and analogue-output port numbers on the output card.
pub const DOUT_PORT: u8 = 8;
pub const AOUT_PORT: u8 = 11;
pub const PWM_CHANNELS: usize = 8;
/// Default PWM reload value: 25 kHz at the reference timer clock.
pub const PWM_RELOAD: u16 = 1440 - 1;

// ---------------------------------------------------------------------------
// Input card

pub struct DinState {
    pub conf: DinConfig,
    debouncer: Debouncer,
    inputs: u32,
    pending_events: u32,
    pending_inputs: u32,
}

impl DinState {
    fn new() -> DinState {
        DinState {
            conf: DinConfig::default(),
            debouncer: Debouncer::new(DIN_CHANNELS),
            inputs: 0,
            pending_events: 0,
            pending_inputs: 0,
        }
    }

    /// Present a new raw input word to the card.
    pub fn set_inputs(&mut self, inputs: u32) {
        self.inputs = inputs;
    }

    pub fn inputs(&self) -> u32 {
        self.inputs
    }

    /// One debounce tick. Runs in timer interrupt context on hardware.
    pub fn tick(&mut self) {
        let events = self.debouncer.tick(&self.conf, self.inputs);
        if events != 0 {
            self.pending_events = events;
            self.pending_inputs = self.inputs;
        }
    }

    /// Snapshot-and-clear of the published event pair. This is the one
    /// critical section shared with the tick context.
    pub fn take_events(&mut self) -> Option<(u32, u32)> {
        if self.pending_events == 0 {
            return None;
        }
        let out = (self.pending_events, self.pending_inputs);
        self.pending_events = 0;
        Some(out)
    }
}

struct DinPort(Arc<Mutex<DinState>>);

impl PortHandler for DinPort {
    fn handle(&mut self, _ctx: &Ctx, _req: &Msg, resp: &mut Msg) -> HandlerResult {
        let state = self.0.lock().unwrap();
        resp.set_payload(&[state.inputs as u8]);
        Ok(true)
    }

    fn conf_count(&self) -> u8 {
        4
    }

    fn conf_info(&self, idx: u8) -> Option<ConfInfo> {
        let descr = match idx {
            0 => "Rising Edge Event Mask",
            1 => "Falling Edge Event Mask",
            2 => "Debounce Enable Mask",
            3 => "Debounce Time",
            _ => return None,
        };
        Some(ConfInfo {
            readable: true,
            writable: true,
            descr,
        })
    }

    fn conf_read(&mut self, idx: u8, _ctx: &Ctx, _req: &Msg, resp: &mut Msg) -> HandlerResult {
        let state = self.0.lock().unwrap();
        match idx {
            0 => resp.set_data_u32(0, state.conf.rising_edge_mask),
            1 => resp.set_data_u32(0, state.conf.falling_edge_mask),
            2 => resp.set_data_u32(0, state.conf.debounce_enable_mask),
            3 => {
                resp.set_payload(&[state.conf.debounce_time]);
                return Ok(true);
            }
            _ => return Err(ErrorCode::NoConf),
        }
        resp.len = 4;
        Ok(true)
    }

    fn conf_write(&mut self, idx: u8, _ctx: &Ctx, req: &Msg, _resp: &mut Msg) -> HandlerResult {
        let mut state = self.0.lock().unwrap();
        if idx == 3 {
            if req.len < 3 {
                return Err(ErrorCode::Length);
            }
            state.conf.debounce_time = req.data[2];
            return Ok(true);
        }
        if req.len < 2 + 4 {
            return Err(ErrorCode::Length);
        }
        let value = req.data_u32(2);
        match idx {
            0 => state.conf.rising_edge_mask = value,
            1 => state.conf.falling_edge_mask = value,
            2 => state.conf.debounce_enable_mask = value,
            _ => return Err(ErrorCode::NoConf),
        }
        Ok(true)
    }
}

/// Build the input-card node. The returned handle drives the card's
/// inputs and collects its debounced events.
pub fn input_card(unique_id: [u8; 12]) -> (Node, Arc<Mutex<DinState>>) {
    let state = Arc::new(Mutex::new(DinState::new()));
    let ports = vec![Port {
        number: DIN_PORT,
        class: PortClass::DigitalIn,
        descr: "Digital Input;{uint32_t data,uint32_t mask}",
        handler: Some(Box::new(DinPort(state.clone()))),
    }];
    let node = Node::new(
        NodeIdent {
            unique_id,
            product_id: INPUT_PRODUCT_ID,
            firmware_version: FIRMWARE_VERSION,
        },
        ports,
    );
    (node, state)
}

/// Broadcast indication carrying a debounced event word and the raw
/// input state.
pub fn din_indication(addr: u8, events: u32, inputs: u32) -> Msg {
    let mut ind = Msg::new();
    ind.set_msg_type(MsgType::Indication);
    ind.set_src_addr(addr);
    ind.set_src_port(DIN_PORT);
    ind.set_dst_addr(ADDR_BROADCAST);
    ind.set_dst_port(0);
    ind.set_data_u32(0, events);
    ind.set_data_u32(4, inputs);
    ind.len = 8;
    ind.prepare_tx();
    ind
}

// ---------------------------------------------------------------------------
// Output card

pub struct OutState {
    pub outputs: u32,
    pub pwm: [u16; PWM_CHANNELS],
    pub pwm_reload: u16,
    /// Measured rail voltage fed to the supply monitor each cycle.
    pub supply_mv: u32,
    monitor: PowerMonitor,
}

impl OutState {
    fn new(limits: SupplyLimits) -> OutState {
        OutState {
            outputs: 0,
            pwm: [0; PWM_CHANNELS],
            pwm_reload: PWM_RELOAD,
            supply_mv: 24_000,
            monitor: PowerMonitor::new(limits),
        }
    }

    /// One PWM cycle: run the supply monitor and force the outputs off
    /// while any supply fault is latched.
    pub fn tick(&mut self, node: &mut Node) {
        let mv = self.supply_mv;
        self.monitor.step(mv, node);
        if node.outputs_inhibited() {
            self.outputs = 0;
            self.pwm = [0; PWM_CHANNELS];
        }
    }
}

struct DoutPort(Arc<Mutex<OutState>>);

impl PortHandler for DoutPort {
    /// {value: u32, mask: u32}; a 4-byte request writes every channel.
    fn handle(&mut self, ctx: &Ctx, req: &Msg, resp: &mut Msg) -> HandlerResult {
        if ctx.outputs_inhibited {
            return Err(ErrorCode::Fault);
        }
        if req.len != 4 && req.len != 8 {
            return Err(ErrorCode::Length);
        }
        let value = req.data_u32(0);
        let mask = if req.len == 8 { req.data_u32(4) } else { !0 };
        let mut state = self.0.lock().unwrap();
        state.outputs = (state.outputs & !mask) | (value & mask);
        resp.set_payload(&[state.outputs as u8]);
        Ok(true)
    }
}

struct AoutPort(Arc<Mutex<OutState>>);

impl PortHandler for AoutPort {
    /// {channel: u8, value: u16}.
    fn handle(&mut self, ctx: &Ctx, req: &Msg, resp: &mut Msg) -> HandlerResult {
        if ctx.outputs_inhibited {
            return Err(ErrorCode::Fault);
        }
        if req.len != 3 {
            return Err(ErrorCode::Length);
        }
        let channel = req.data[0] as usize;
        if channel >= PWM_CHANNELS {
            return Err(ErrorCode::Range);
        }
        let mut state = self.0.lock().unwrap();
        let limit = state.pwm_reload;
        state.pwm[channel] = req.data_u16(1).min(limit);
        resp.len = 0;
        Ok(true)
    }

    fn conf_count(&self) -> u8 {
        2
    }

    fn conf_info(&self, idx: u8) -> Option<ConfInfo> {
        match idx {
            0 => Some(ConfInfo {
                readable: true,
                writable: false,
                descr: "Max PWM value",
            }),
            // Frequency is configuration, not channel data.
            1 => Some(ConfInfo {
                readable: true,
                writable: true,
                descr: "PWM Frequency (timer reload)",
            }),
            _ => None,
        }
    }

    fn conf_read(&mut self, idx: u8, _ctx: &Ctx, _req: &Msg, resp: &mut Msg) -> HandlerResult {
        let state = self.0.lock().unwrap();
        match idx {
            0 | 1 => {
                resp.set_data_u16(0, state.pwm_reload);
                resp.len = 2;
                Ok(true)
            }
            _ => Err(ErrorCode::NoConf),
        }
    }

    fn conf_write(&mut self, idx: u8, _ctx: &Ctx, req: &Msg, _resp: &mut Msg) -> HandlerResult {
        match idx {
            1 => {
                if req.len < 2 + 2 {
                    return Err(ErrorCode::Length);
                }
                let mut state = self.0.lock().unwrap();
                state.pwm_reload = req.data_u16(2);
                Ok(true)
            }
            _ => Err(ErrorCode::NoConf),
        }
    }
}

/// Build the output-card node. The returned handle carries the output
/// state, the measured rail voltage and the supply monitor.
pub fn output_card(unique_id: [u8; 12]) -> (Node, Arc<Mutex<OutState>>) {
    let state = Arc::new(Mutex::new(OutState::new(SupplyLimits::default())));
    let ports = vec![
        Port {
            number: DOUT_PORT,
            class: PortClass::DigitalOut,
            descr: "Digital Output;{uint32_t data,uint32_t mask}",
            handler: Some(Box::new(DoutPort(state.clone()))),
        },
        Port {
            number: AOUT_PORT,
            class: PortClass::AnalogueOutCh,
            descr: "PWM Output, Specified Channel;{uint8_t channel_number,uint16_t value}",
            handler: Some(Box::new(AoutPort(state.clone()))),
        },
    ];
    let node = Node::new(
        NodeIdent {
            unique_id,
            product_id: OUTPUT_PRODUCT_ID,
            firmware_version: FIRMWARE_VERSION,
        },
        ports,
    );
    (node, state)
}
