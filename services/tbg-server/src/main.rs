//! Bridge daemon entry point.
//!
//! Owns the CAN adapter and serves any number of local TCP clients.
//! This build drives the simulated bus; real-hardware adapters plug in
//! behind the bridge-I/O seam.

use clap::Parser;

use tbg_server::api;
use tbg_server::sim::SimBus;
use tbg_server::srv::Server;

#[derive(Debug, Parser)]
#[clap(name = "tbg-server", about = "Touchbridge bridge daemon")]
struct Args {
    /// TCP endpoint to listen on
    #[clap(long, default_value = api::DEFAULT_ENDPOINT)]
    listen: String,

    /// The daemon's own bus address (0-63)
    #[clap(long, default_value_t = tbg_protocol::ADDR_SERVER)]
    tbg_address: u8,

    /// Simulated input cards to put on the bus
    #[clap(long, default_value_t = 1)]
    sim_inputs: usize,

    /// Simulated output cards to put on the bus
    #[clap(long, default_value_t = 1)]
    sim_outputs: usize,
}

/// Deterministic per-card unique ids: the high half names the product
/// family, the low half the unit.
fn sim_id(family: u8, index: usize) -> [u8; 12] {
    let mut id = [0u8; 12];
    id[0] = index as u8 + 1;
    id[1] = 0x5a;
    id[2] = 0xc3;
    id[6] = family;
    id[7] = 0x38;
    id[11] = 0x01;
    id
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut bus = SimBus::new();
    for i in 0..args.sim_inputs {
        bus.add_input_card(sim_id(0x10, i));
    }
    for i in 0..args.sim_outputs {
        bus.add_output_card(sim_id(0x20, i));
    }
    log::info!(
        "simulated bus: {} input, {} output cards",
        args.sim_inputs,
        args.sim_outputs
    );

    let listener = std::net::TcpListener::bind(&args.listen)?;
    log::info!("tbg-server listening on {}", args.listen);

    let mut server = Server::new(bus, args.tbg_address);
    server.run(listener)
}
