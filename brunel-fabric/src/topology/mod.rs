// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Routing policies.
//!
//! A [`Topology`] decides, per packet, which output port and virtual
//! channel to use next. Topologies are consulted by the
//! [`Router`](crate::router::Router) and hold no per-packet state of their
//! own; everything a packet needs along the way travels with it in its
//! [`RouteState`](crate::event::RouteState).

pub mod dragonfly;
pub mod dragonfly_legacy;
pub mod fattree;
pub mod hyperx;
pub mod mesh;
pub mod single_router;

use std::cell::RefCell;
use std::rc::Rc;

use brunel_engine::types::{SimError, SimResult};

use crate::event::{InternalEvent, PacketEvent, TopologyEvent};
use crate::request::NodeId;

/// What is attached to a router port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    /// The port connects to another router.
    RouterToRouter,
    /// The port connects to an endpoint.
    RouterToNic,
    /// The port exists in the layout but has no peer (for example the
    /// negative-direction ports of a mesh edge router).
    Unconnected,
}

/// Credit or occupancy values shared between a router (writer) and an
/// adaptive topology (reader). Indexed by `port * num_vcs + vc`.
pub type SharedCredits = Rc<RefCell<Vec<u32>>>;

pub trait Topology {
    /// Wrap a packet arriving from an endpoint for in-fabric transport.
    ///
    /// The packet arrives with its virtual channel already placed at the
    /// base of this topology's VC group.
    fn process_input(&self, packet: PacketEvent) -> Result<InternalEvent, SimError>;

    /// Select `next_port` and `vc` for a packet that arrived on
    /// (`port`, `vc`).
    fn route(&self, port: usize, vc: usize, ev: &mut InternalEvent) -> SimResult;

    /// Make a fresh routing decision for a packet that has been held at an
    /// input. Adaptive topologies override this; the default repeats
    /// [`route`](Topology::route).
    fn reroute(&self, port: usize, vc: usize, ev: &mut InternalEvent) -> SimResult {
        self.route(port, vc, ev)
    }

    /// Init-phase variant of [`process_input`](Topology::process_input).
    fn process_init_data_input(&self, packet: PacketEvent) -> Result<InternalEvent, SimError>;

    /// Populate the output ports for untimed init-phase data. A
    /// destination of [`BROADCAST_ADDR`](crate::request::BROADCAST_ADDR)
    /// fans out so that every endpoint receives exactly one copy.
    fn route_init_data(
        &self,
        port: usize,
        ev: &mut InternalEvent,
        out_ports: &mut Vec<usize>,
    ) -> SimResult;

    /// Whether `port` faces a router, an endpoint, or nothing.
    fn port_state(&self, port: usize) -> PortState;

    fn is_host_port(&self, port: usize) -> bool {
        self.port_state(port) == PortState::RouterToNic
    }

    /// Total number of ports on a router of this topology.
    fn num_ports(&self) -> usize;

    /// The number of virtual channels needed to carry `vns` virtual
    /// networks deadlock free.
    fn num_vcs(&self, vns: usize) -> usize {
        vns
    }

    /// The endpoint id attached to `port`, if it is a host port.
    fn endpoint_id(&self, port: usize) -> NodeId;

    /// Give the topology read access to the router's per-(port, VC)
    /// output credit counts. Topologies that do not route adaptively
    /// ignore this.
    fn set_output_buffer_credits(&self, _credits: SharedCredits, _num_vcs: usize) {}

    /// Give the topology read access to the router's per-(port, VC)
    /// output queue occupancy, in flits.
    fn set_output_queue_lengths(&self, _lengths: SharedCredits, _num_vcs: usize) {}

    /// Deliver a topology event that arrived on `port`.
    fn recv_topology_event(&self, _port: usize, _ev: TopologyEvent) {}
}

/// Decompose a router index into per-dimension coordinates, least
/// significant dimension first.
pub(crate) fn decompose(mut index: usize, shape: &[u32]) -> Vec<u32> {
    let mut loc = Vec::with_capacity(shape.len());
    for size in shape {
        loc.push((index % *size as usize) as u32);
        index /= *size as usize;
    }
    loc
}

/// Inverse of [`decompose`].
pub(crate) fn recompose(loc: &[u32], shape: &[u32]) -> usize {
    let mut index = 0usize;
    for dim in (0..shape.len()).rev() {
        index = index * shape[dim] as usize + loc[dim] as usize;
    }
    index
}

/// Parse a shape string such as "4x4x2" into per-dimension sizes.
pub(crate) fn parse_dim_string(shape: &str) -> Result<Vec<u32>, SimError> {
    let mut dims = Vec::new();
    for part in shape.split('x') {
        match part.parse::<u32>() {
            Ok(value) if value > 0 => dims.push(value),
            _ => {
                return brunel_engine::sim_error!("malformed shape string '{shape}'");
            }
        }
    }
    Ok(dims)
}
