// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Simulate an interconnection network under synthetic load.
//!
//! The model builds the chosen topology, attaches a traffic generator to
//! every endpoint and runs until all generators have drained. Delivery
//! counts and packet latencies are reported at the end.
//!
//! # Examples
//!
//! Uniform random traffic on a 4x4 mesh:
//! ```text
//! cargo run --bin sim-network --release -- --topology mesh --shape 4x4 --stdout
//! ```
//!
//! A dragonfly under Valiant routing:
//! ```text
//! cargo run --bin sim-network --release -- --topology dragonfly --dragonfly-algorithm valiant
//! ```

use clap::Parser;

use brunel_engine::engine::Engine;
use brunel_engine::run_simulation;
use brunel_engine::types::SimError;
use brunel_fabric::builder::{
    Network, build_dragonfly, build_fattree, build_hyperx, build_mesh, build_single_router,
};
use brunel_fabric::link_control::{CheckerboardAlg, LinkControlParams};
use brunel_fabric::router::RouterParams;
use brunel_fabric::topology::dragonfly::{DragonflyAlgorithm, DragonflyParams, GlobalRouteMode};
use brunel_fabric::topology::fattree::{FatTreeAlgorithm, FatTreeParams};
use brunel_fabric::topology::hyperx::{HyperXAlgorithm, HyperXParams};
use brunel_fabric::topology::mesh::MeshParams;
use brunel_fabric::traffic_gen::{
    AddressMode, TrafficGen, TrafficGenParams, UniformDist,
};
use brunel_fabric::units::{Bandwidth, DataSize};
use brunel_track::tracker::{dev_null_tracker, stdout_tracker};
use brunel_track::{error, info};

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq)]
enum TopologyKind {
    Single,
    #[default]
    Mesh,
    Hyperx,
    Fattree,
    Dragonfly,
}

/// Command-line arguments.
#[derive(Parser)]
#[command(about = "Interconnection network simulation")]
struct Cli {
    /// Enable logging to the console.
    #[arg(long, default_value = "false")]
    stdout: bool,

    /// Level of log message to display.
    #[arg(long, default_value = "Info")]
    stdout_level: log::Level,

    /// Which topology to build.
    #[clap(long, default_value_t, value_enum)]
    topology: TopologyKind,

    /// Shape of the mesh/hyperX networks ("4x4") or endpoint count of the
    /// single router.
    #[arg(long, default_value = "4x4")]
    shape: String,

    /// Links between routers per dimension for mesh/hyperX.
    #[arg(long, default_value = "1x1")]
    width: String,

    /// Endpoints per router for mesh/hyperX.
    #[arg(long, default_value = "1")]
    local_ports: usize,

    /// Shape of the fat tree ("downs,ups:...").
    #[arg(long, default_value = "2,2:2,2")]
    fattree_shape: String,

    /// Fat-tree routing algorithm [deterministic | adaptive].
    #[arg(long, default_value = "deterministic")]
    fattree_algorithm: String,

    /// HyperX routing algorithm [DOR | DORND | MINA | VALIANT | DOAL |
    /// VDAL].
    #[arg(long, default_value = "DOR")]
    hyperx_algorithm: String,

    /// Dragonfly hosts per router (p).
    #[arg(long, default_value = "4")]
    hosts_per_router: u32,

    /// Dragonfly routers per group (a).
    #[arg(long, default_value = "4")]
    routers_per_group: u32,

    /// Dragonfly global links per router (h).
    #[arg(long, default_value = "2")]
    intergroup_per_router: u32,

    /// Dragonfly links between each pair of groups (n).
    #[arg(long, default_value = "1")]
    intergroup_links: u32,

    /// Dragonfly group count (g).
    #[arg(long, default_value = "5")]
    num_groups: u32,

    /// Dragonfly routing algorithm [minimal | valiant | adaptive-local].
    #[arg(long, default_value = "minimal")]
    dragonfly_algorithm: String,

    /// How the dragonfly global link map names target groups
    /// [absolute | relative].
    #[arg(long, default_value = "relative")]
    global_route_mode: String,

    /// Link bandwidth, all links.
    #[arg(long, default_value = "16Gb/s")]
    link_bw: String,

    /// Flit size for bandwidth accounting.
    #[arg(long, default_value = "64b")]
    flit_size: String,

    /// Input buffer per virtual channel.
    #[arg(long, default_value = "1KiB")]
    input_buf_size: String,

    /// Output buffer per virtual channel.
    #[arg(long, default_value = "1KiB")]
    output_buf_size: String,

    /// Virtual networks requested by every endpoint.
    #[arg(long, default_value = "1")]
    vns: usize,

    /// Checkerboard factor spreading each VN over several VCs.
    #[arg(long, default_value = "1")]
    checkerboard: usize,

    /// Checkerboard algorithm [deterministic | roundrobin].
    #[arg(long, default_value = "deterministic")]
    checkerboard_alg: String,

    /// Packets each endpoint sends.
    #[arg(long, default_value = "100")]
    packets_to_send: u64,

    /// Size of each packet.
    #[arg(long, default_value = "32B")]
    packet_size: String,

    /// Ticks of the message clock between packets.
    #[arg(long, default_value = "0")]
    delay_between_packets: u64,

    /// Endpoint message clock in MHz.
    #[arg(long, default_value = "250")]
    message_rate_mhz: f64,

    /// Seed for the traffic generators.
    #[arg(long, default_value = "1")]
    seed: u64,
}

fn build_network(cli: &Cli, engine: &mut Engine) -> Result<Network, SimError> {
    let link_bw = Bandwidth::parse(&cli.link_bw)?;
    let router_params = RouterParams::new(link_bw, DataSize::parse(&cli.flit_size)?)?
        .with_buffers(
            DataSize::parse(&cli.input_buf_size)?,
            DataSize::parse(&cli.output_buf_size)?,
        );
    let lc_params = LinkControlParams::new(
        link_bw,
        DataSize::parse(&cli.input_buf_size)?,
        DataSize::parse(&cli.output_buf_size)?,
    )
    .with_checkerboard(cli.checkerboard, CheckerboardAlg::parse(&cli.checkerboard_alg)?);

    let top = engine.top().clone();
    match cli.topology {
        TopologyKind::Single => {
            let endpoints = cli.shape.parse::<usize>().unwrap_or(4);
            build_single_router(engine, &top, endpoints, router_params, &lc_params, cli.vns)
        }
        TopologyKind::Mesh => {
            let params = MeshParams::parse(&cli.shape, &cli.width, cli.local_ports)?;
            build_mesh(engine, &top, &params, &router_params, &lc_params, cli.vns)
        }
        TopologyKind::Hyperx => {
            let params = HyperXParams::parse(
                &cli.shape,
                &cli.width,
                cli.local_ports,
                HyperXAlgorithm::parse(&cli.hyperx_algorithm)?,
            )?;
            build_hyperx(engine, &top, &params, &router_params, &lc_params, cli.vns)
        }
        TopologyKind::Fattree => {
            let params = FatTreeParams::parse(&cli.fattree_shape)?;
            build_fattree(
                engine,
                &top,
                &params,
                FatTreeAlgorithm::parse(&cli.fattree_algorithm)?,
                0.5,
                &router_params,
                &lc_params,
                cli.vns,
            )
        }
        TopologyKind::Dragonfly => {
            let mut params = DragonflyParams::new(
                cli.hosts_per_router,
                cli.routers_per_group,
                cli.intergroup_per_router,
                cli.intergroup_links,
                cli.num_groups,
                DragonflyAlgorithm::parse(&cli.dragonfly_algorithm)?,
            )?;
            params.global_route_mode = GlobalRouteMode::parse(&cli.global_route_mode)?;
            build_dragonfly(engine, &top, &params, None, &router_params, &lc_params, cli.vns)
        }
    }
}

fn main() -> Result<(), SimError> {
    let cli = Cli::parse();

    let tracker = if cli.stdout {
        stdout_tracker(cli.stdout_level)
    } else {
        dev_null_tracker()
    };

    let mut engine = Engine::new(&tracker);
    let network = build_network(&cli, &mut engine)?;
    let num_endpoints = network.endpoints.len();

    let top = engine.top().clone();
    info!(top ;
        "{:?} network with {} routers and {} endpoints, {} packets each",
        cli.topology,
        network.routers.len(),
        num_endpoints,
        cli.packets_to_send,
    );

    let packet_size = DataSize::parse(&cli.packet_size)?;
    let mut generators = Vec::with_capacity(num_endpoints);
    for (id, endpoint) in network.endpoints.iter().enumerate() {
        let params = TrafficGenParams {
            id: id as i64,
            num_peers: num_endpoints,
            packets_to_send: cli.packets_to_send,
            packet_size,
            delay_between_packets: cli.delay_between_packets,
            message_rate_mhz: cli.message_rate_mhz,
            address_mode: AddressMode::Sequential,
        };
        let dest_gen = Box::new(UniformDist::new(
            0,
            num_endpoints as i64 - 1,
            cli.seed ^ id as u64,
        ));
        generators.push(TrafficGen::new_and_register(
            &engine,
            &top,
            &format!("gen{id}"),
            params,
            endpoint.clone(),
            dest_gen,
        )?);
    }

    run_simulation!(engine);

    let total_sent: u64 = generators.iter().map(|g| g.num_sent()).sum();
    let total_received: u64 = generators.iter().map(|g| g.num_received()).sum();
    if total_sent != total_received {
        error!(top ; "{total_received}/{total_sent} packets received");
        error!(top ; "Deadlock detected at {:.2}ns", engine.time_now_ns());
        tracker.shutdown();
        return Err(SimError("Deadlock".to_string()));
    }

    let mut max_latency: f64 = 0.0;
    let mut mean_sum = 0.0;
    let mut total_bits = 0u64;
    for endpoint in &network.endpoints {
        let stats = endpoint.stats();
        if stats.packet_latency.count() > 0 {
            max_latency = max_latency.max(stats.packet_latency.max());
            mean_sum += stats.packet_latency.mean();
        }
        total_bits += stats.send_bit_count.value();
    }

    info!(top ; "Pass ({:.2}ns)", engine.time_now_ns());
    info!(top ;
        "{total_received} packets, {total_bits} bits moved, mean latency {:.1}ns, max {:.1}ns",
        mean_sum / num_endpoints as f64,
        max_latency,
    );

    println!(
        "delivered {total_received}/{total_sent} packets in {:.2}ns (mean latency {:.1}ns)",
        engine.time_now_ns(),
        mean_sum / num_endpoints as f64,
    );
    Ok(())
}
