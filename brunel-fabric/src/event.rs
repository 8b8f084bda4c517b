// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The events exchanged between link controls and routers.
//!
//! A fabric link carries exactly one type, [`FabricEvent`]. Endpoint links
//! carry packets; router to router links carry [`InternalEvent`]s which
//! keep the per-topology routing state attached. Credits flow against the
//! direction of the data they account for.

use std::fmt;

use brunel_engine::traits::{SimObject, TotalBytes};
use brunel_track::id::Unique;
use brunel_track::{Id, NO_ID};

use crate::request::{NetworkRequest, NodeId};
use crate::topology::dragonfly::DragonflyAddr;
use crate::units::Bandwidth;

/// A request in flight through the fabric.
#[derive(Clone, Debug)]
pub struct PacketEvent {
    pub request: NetworkRequest,

    /// Size quantized to the link's flit size. At least one.
    pub size_in_flits: u32,

    /// Time the packet entered the fabric, for latency accounting.
    pub injection_time_ns: f64,

    /// The virtual channel the packet occupies on the link it is
    /// currently crossing.
    pub vc: usize,
}

impl PacketEvent {
    #[must_use]
    pub fn new(request: NetworkRequest, size_in_flits: u32) -> Self {
        Self {
            request,
            size_in_flits,
            injection_time_ns: 0.0,
            vc: 0,
        }
    }
}

impl fmt::Display for PacketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} flits, vc {})",
            self.request, self.size_in_flits, self.vc
        )
    }
}

/// Credits returned to the upstream side of a link.
#[derive(Clone, Copy, Debug)]
pub struct CreditEvent {
    pub vc: usize,
    pub credits: u32,
}

/// Commands exchanged while a link is brought up.
#[derive(Clone, Copy, Debug)]
pub enum InitEvent {
    /// Endpoint asks the router for this many virtual networks.
    RequestVns(usize),
    /// Router reports the total number of virtual channels.
    SetVcs(usize),
    /// Router reports the endpoint id attached to this port.
    ReportId(NodeId),
    /// Endpoint reports its configured bandwidth for checking.
    ReportBw(Bandwidth),
    /// Router reports the flit size used for bandwidth accounting.
    ReportFlitSize(u64),
    /// Router reports the port index of this link.
    ReportPort(usize),
}

/// Topology-internal control able to consume bandwidth.
///
/// A size of zero flits makes the event free.
#[derive(Clone, Copy, Debug, Default)]
pub struct TopologyEvent {
    pub size_in_flits: u32,
}

/// Per-topology routing state attached to an [`InternalEvent`].
#[derive(Clone, Debug)]
pub enum RouteState {
    /// No state beyond the destination id is needed.
    Direct,
    Mesh {
        dest_loc: Vec<u32>,
    },
    HyperX {
        dest_loc: Vec<u32>,
        val_loc: Vec<u32>,
        /// False while still heading for the Valiant intermediate router.
        val_route_dest: bool,
        rerouted: bool,
    },
    Dragonfly {
        dest: DragonflyAddr,
        src_group: u32,
        global_slice: u16,
    },
}

/// A packet wrapped with the routing decision for its next hop.
#[derive(Clone, Debug)]
pub struct InternalEvent {
    pub packet: PacketEvent,

    /// Output port selected by the topology.
    pub next_port: usize,

    /// Virtual channel for the next link.
    pub vc: usize,

    /// Virtual channel on which to return credits to the upstream side of
    /// the link the packet arrived on.
    pub credit_return_vc: usize,

    pub route: RouteState,
}

impl InternalEvent {
    #[must_use]
    pub fn new(packet: PacketEvent, route: RouteState) -> Self {
        let vc = packet.vc;
        Self {
            packet,
            next_port: 0,
            vc,
            credit_return_vc: vc,
            route,
        }
    }

    #[must_use]
    pub fn src(&self) -> NodeId {
        self.packet.request.src
    }

    #[must_use]
    pub fn dest(&self) -> NodeId {
        self.packet.request.dest
    }

    #[must_use]
    pub fn flit_count(&self) -> u32 {
        self.packet.size_in_flits
    }
}

impl fmt::Display for InternalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> port {} vc {}",
            self.packet, self.next_port, self.vc
        )
    }
}

/// The single event type carried on fabric links.
#[derive(Clone, Debug)]
pub enum FabricEvent {
    /// A packet on an endpoint link.
    Packet(PacketEvent),
    /// A packet between routers, with routing state attached.
    Internal(InternalEvent),
    /// Credits travelling upstream.
    Credit(CreditEvent),
    /// Link bring-up commands.
    Init(InitEvent),
    /// Untimed init-phase data on an endpoint link.
    UntimedPacket(PacketEvent),
    /// Untimed init-phase data between routers.
    UntimedInternal(InternalEvent),
    /// Topology-internal control.
    Topology(TopologyEvent),
}

impl fmt::Display for FabricEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FabricEvent::Packet(p) => write!(f, "packet {p}"),
            FabricEvent::Internal(ev) => write!(f, "internal {ev}"),
            FabricEvent::Credit(c) => write!(f, "credit vc {} +{}", c.vc, c.credits),
            FabricEvent::Init(i) => write!(f, "init {i:?}"),
            FabricEvent::UntimedPacket(p) => write!(f, "untimed packet {p}"),
            FabricEvent::UntimedInternal(ev) => write!(f, "untimed internal {ev}"),
            FabricEvent::Topology(t) => write!(f, "topology event ({} flits)", t.size_in_flits),
        }
    }
}

impl TotalBytes for FabricEvent {
    fn total_bytes(&self) -> usize {
        match self {
            FabricEvent::Packet(p) | FabricEvent::UntimedPacket(p) => p.request.total_bytes(),
            FabricEvent::Internal(ev) | FabricEvent::UntimedInternal(ev) => {
                ev.packet.request.total_bytes()
            }
            FabricEvent::Credit(_) | FabricEvent::Init(_) | FabricEvent::Topology(_) => {
                std::mem::size_of::<usize>()
            }
        }
    }
}

impl Unique for FabricEvent {
    fn id(&self) -> Id {
        match self {
            FabricEvent::Packet(p) | FabricEvent::UntimedPacket(p) => p.request.id(),
            FabricEvent::Internal(ev) | FabricEvent::UntimedInternal(ev) => ev.packet.request.id(),
            FabricEvent::Credit(_) | FabricEvent::Init(_) | FabricEvent::Topology(_) => NO_ID,
        }
    }
}

impl SimObject for FabricEvent {}
