// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Multi-dimensional hyperX.
//!
//! Like a mesh, but every pair of routers in a dimension is directly
//! connected, so any unaligned dimension can be corrected with a single
//! hop. Port layout per router: for each dimension, `(size - 1) *
//! dim_width` links (one bundle per other router in the dimension, ordered
//! by coordinate with the own coordinate skipped), then the local
//! endpoint ports.

use std::cell::RefCell;
use std::rc::Rc;

use brunel_engine::sim_error;
use brunel_engine::types::{SimError, SimResult};
use brunel_track::entity::Entity;
use brunel_track::id::Unique;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::event::{InternalEvent, PacketEvent, RouteState};
use crate::request::{BROADCAST_ADDR, NodeId};
use crate::topology::{
    PortState, SharedCredits, Topology, decompose, parse_dim_string, recompose,
};

/// Routing algorithm run at each hyperX router.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HyperXAlgorithm {
    /// Strict dimension order, lowest unaligned dimension first.
    #[default]
    Dor,
    /// Dimension order with a per-packet random permutation of the
    /// dimensions.
    Dornd,
    /// Minimal adaptive: the unaligned dimension with the most downstream
    /// credits wins, ties to the lower port.
    Mina,
    /// Route through a random intermediate router, dimension ordered on
    /// both halves.
    Valiant,
    /// Dimension-order adaptive local: dimension order, with the parallel
    /// link chosen by credit count.
    Doal,
    /// Valiant combined with adaptive link selection.
    Vdal,
}

impl HyperXAlgorithm {
    pub fn parse(name: &str) -> Result<Self, SimError> {
        match name {
            "DOR" => Ok(Self::Dor),
            "DORND" => Ok(Self::Dornd),
            "MINA" => Ok(Self::Mina),
            "VALIANT" => Ok(Self::Valiant),
            "DOAL" => Ok(Self::Doal),
            "VDAL" => Ok(Self::Vdal),
            _ => sim_error!("unknown hyperx algorithm '{name}'"),
        }
    }

    fn is_valiant(self) -> bool {
        matches!(self, Self::Valiant | Self::Vdal)
    }

    fn is_adaptive(self) -> bool {
        matches!(self, Self::Mina | Self::Doal | Self::Vdal)
    }
}

/// Shape of a hyperX network.
#[derive(Clone, Debug)]
pub struct HyperXParams {
    pub shape: Vec<u32>,
    pub width: Vec<u32>,
    pub local_ports: usize,
    pub algorithm: HyperXAlgorithm,
}

impl HyperXParams {
    pub fn parse(
        shape: &str,
        width: &str,
        local_ports: usize,
        algorithm: HyperXAlgorithm,
    ) -> Result<Self, SimError> {
        let shape = parse_dim_string(shape)?;
        let width = parse_dim_string(width)?;
        if shape.len() != width.len() {
            return sim_error!("hyperx shape and width must have the same number of dimensions");
        }
        if local_ports == 0 {
            return sim_error!("hyperx requires at least one local port per router");
        }
        Ok(Self {
            shape,
            width,
            local_ports,
            algorithm,
        })
    }

    #[must_use]
    pub fn num_routers(&self) -> usize {
        self.shape.iter().product::<u32>() as usize
    }

    #[must_use]
    pub fn num_endpoints(&self) -> usize {
        self.num_routers() * self.local_ports
    }

    #[must_use]
    pub fn ports_per_router(&self) -> usize {
        self.local_port_start() + self.local_ports
    }

    /// The link-`link` port through which a router at `my_coord` reaches
    /// the router at `other_coord` in `dim`.
    #[must_use]
    pub fn bundle_port(&self, dim: usize, my_coord: u32, other_coord: u32, link: usize) -> usize {
        let start: usize = self
            .shape
            .iter()
            .zip(&self.width)
            .take(dim)
            .map(|(s, w)| (*s as usize - 1) * *w as usize)
            .sum();
        let index = if other_coord < my_coord {
            other_coord
        } else {
            other_coord - 1
        } as usize;
        start + index * self.width[dim] as usize + link
    }

    #[must_use]
    pub fn local_port_start(&self) -> usize {
        self.shape
            .iter()
            .zip(&self.width)
            .map(|(s, w)| (*s as usize - 1) * *w as usize)
            .sum()
    }

    #[must_use]
    pub fn local_port(&self, index: usize) -> usize {
        self.local_port_start() + index
    }
}

pub struct HyperX {
    entity: Rc<Entity>,
    params: HyperXParams,
    my_loc: Vec<u32>,

    port_start: Vec<usize>,
    local_port_start: usize,
    num_ports: usize,

    rng: RefCell<Xoshiro256PlusPlus>,
    output_credits: RefCell<Option<(SharedCredits, usize)>>,
}

impl HyperX {
    pub fn new(
        parent: &Rc<Entity>,
        params: HyperXParams,
        router_id: usize,
    ) -> Result<Self, SimError> {
        if router_id >= params.num_routers() {
            return sim_error!("hyperx router id {router_id} outside shape");
        }

        let mut port_start = Vec::with_capacity(params.shape.len());
        let mut next = 0usize;
        for (size, width) in params.shape.iter().zip(&params.width) {
            port_start.push(next);
            next += (*size as usize - 1) * *width as usize;
        }
        let local_port_start = next;
        let num_ports = local_port_start + params.local_ports;

        let my_loc = decompose(router_id, &params.shape);

        Ok(Self {
            entity: Rc::new(Entity::new(parent, "topo")),
            params,
            my_loc,
            port_start,
            local_port_start,
            num_ports,
            rng: RefCell::new(Xoshiro256PlusPlus::seed_from_u64(router_id as u64)),
            output_credits: RefCell::new(None),
        })
    }

    fn dest_router(&self, dest: NodeId) -> usize {
        dest as usize / self.params.local_ports
    }

    fn id_to_location(&self, dest: NodeId) -> Vec<u32> {
        decompose(self.dest_router(dest), &self.params.shape)
    }

    /// First link of the bundle leading to `coord` in `dim`.
    fn bundle_start(&self, dim: usize, coord: u32) -> usize {
        let index = if coord < self.my_loc[dim] {
            coord
        } else {
            coord - 1
        } as usize;
        self.port_start[dim] + index * self.params.width[dim] as usize
    }

    /// The dimension a router-to-router port belongs to.
    fn port_dimension(&self, port: usize) -> Option<usize> {
        if port >= self.local_port_start {
            return None;
        }
        (0..self.params.shape.len())
            .rev()
            .find(|&dim| port >= self.port_start[dim])
    }

    fn credits_for(&self, port: usize, vc: usize) -> u32 {
        match self.output_credits.borrow().as_ref() {
            Some((credits, num_vcs)) => credits.borrow()[port * num_vcs + vc],
            None => 0,
        }
    }

    /// The parallel link within a bundle used for deterministic routing.
    fn deterministic_link(&self, dim: usize, ev: &InternalEvent) -> usize {
        self.dest_router(ev.dest()) % self.params.width[dim] as usize
    }

    /// The parallel link within a bundle with the most downstream credits.
    fn adaptive_link(&self, bundle_start: usize, width: usize, vc: usize) -> usize {
        let mut best = 0usize;
        let mut best_credits = self.credits_for(bundle_start, vc);
        for link in 1..width {
            let credits = self.credits_for(bundle_start + link, vc);
            if credits > best_credits {
                best = link;
                best_credits = credits;
            }
        }
        best
    }

    /// Dimension-ordered routing towards `target`, visiting dimensions in
    /// the order given.
    fn route_dor(
        &self,
        target: &[u32],
        dim_order: &[usize],
        adaptive_links: bool,
        ev: &mut InternalEvent,
    ) -> Option<usize> {
        for &dim in dim_order {
            if target[dim] != self.my_loc[dim] {
                let bundle = self.bundle_start(dim, target[dim]);
                let width = self.params.width[dim] as usize;
                let link = if adaptive_links {
                    self.adaptive_link(bundle, width, ev.vc)
                } else {
                    self.deterministic_link(dim, ev)
                };
                return Some(bundle + link);
            }
        }
        None
    }

    /// Minimal adaptive routing: the candidate output with the most
    /// downstream credits across all unaligned dimensions.
    fn route_mina(&self, target: &[u32], ev: &mut InternalEvent) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for dim in 0..self.params.shape.len() {
            if target[dim] == self.my_loc[dim] {
                continue;
            }
            let bundle = self.bundle_start(dim, target[dim]);
            for link in 0..self.params.width[dim] as usize {
                let port = bundle + link;
                let credits = self.credits_for(port, ev.vc);
                let better = match best {
                    Some((_, best_credits)) => credits > best_credits,
                    None => true,
                };
                if better {
                    best = Some((port, credits));
                }
            }
        }
        best.map(|(port, _)| port)
    }
}

impl Topology for HyperX {
    fn process_input(&self, packet: PacketEvent) -> Result<InternalEvent, SimError> {
        let dest_loc = self.id_to_location(packet.request.dest);

        let (val_loc, val_route_dest) = if self.params.algorithm.is_valiant() {
            let mut rng = self.rng.borrow_mut();
            let val_loc: Vec<u32> = self
                .params
                .shape
                .iter()
                .map(|size| rng.gen_range(0..*size))
                .collect();
            (val_loc, false)
        } else {
            (Vec::new(), true)
        };

        Ok(InternalEvent::new(
            packet,
            RouteState::HyperX {
                dest_loc,
                val_loc,
                val_route_dest,
                rerouted: false,
            },
        ))
    }

    fn route(&self, _port: usize, _vc: usize, ev: &mut InternalEvent) -> SimResult {
        let (dest_loc, val_loc, mut val_route_dest) = match &ev.route {
            RouteState::HyperX {
                dest_loc,
                val_loc,
                val_route_dest,
                ..
            } => (dest_loc.clone(), val_loc.clone(), *val_route_dest),
            _ => {
                return sim_error!("{}: routed event is not a hyperx event", self.entity);
            }
        };

        // Finished with the Valiant intermediate: switch target and move
        // to the second VC of the group so the two halves cannot deadlock
        // against each other.
        if !val_route_dest && val_loc == self.my_loc {
            val_route_dest = true;
            ev.vc += 1;
            if let RouteState::HyperX {
                val_route_dest: flag,
                ..
            } = &mut ev.route
            {
                *flag = true;
            }
        }

        let target = if val_route_dest { &dest_loc } else { &val_loc };

        let next_port = match self.params.algorithm {
            HyperXAlgorithm::Dor | HyperXAlgorithm::Valiant => {
                let order: Vec<usize> = (0..self.params.shape.len()).collect();
                self.route_dor(target, &order, false, ev)
            }
            HyperXAlgorithm::Doal | HyperXAlgorithm::Vdal => {
                let order: Vec<usize> = (0..self.params.shape.len()).collect();
                self.route_dor(target, &order, true, ev)
            }
            HyperXAlgorithm::Dornd => {
                // The permutation is fixed per packet so that every hop
                // walks the dimensions in the same order.
                let mut order: Vec<usize> = (0..self.params.shape.len()).collect();
                let mut rng = Xoshiro256PlusPlus::seed_from_u64(ev.packet.request.id().0);
                order.shuffle(&mut rng);
                self.route_dor(target, &order, false, ev)
            }
            HyperXAlgorithm::Mina => self.route_mina(target, ev),
        };

        ev.next_port = match next_port {
            Some(port) => port,
            // All dimensions aligned: deliver locally
            None => {
                self.local_port_start + (ev.dest() as usize % self.params.local_ports)
            }
        };
        Ok(())
    }

    fn reroute(&self, port: usize, vc: usize, ev: &mut InternalEvent) -> SimResult {
        if self.params.algorithm.is_adaptive() {
            if let RouteState::HyperX { rerouted, .. } = &mut ev.route {
                *rerouted = true;
            }
        }
        self.route(port, vc, ev)
    }

    fn process_init_data_input(&self, packet: PacketEvent) -> Result<InternalEvent, SimError> {
        let dest_loc = if packet.request.dest == BROADCAST_ADDR {
            Vec::new()
        } else {
            self.id_to_location(packet.request.dest)
        };
        Ok(InternalEvent::new(
            packet,
            RouteState::HyperX {
                dest_loc,
                val_loc: Vec::new(),
                val_route_dest: true,
                rerouted: false,
            },
        ))
    }

    fn route_init_data(
        &self,
        port: usize,
        ev: &mut InternalEvent,
        out_ports: &mut Vec<usize>,
    ) -> SimResult {
        if ev.dest() != BROADCAST_ADDR {
            self.route(port, 0, ev)?;
            out_ports.push(ev.next_port);
            return Ok(());
        }

        // Within a dimension every router is one hop away, so a broadcast
        // travelling along dimension `d` stops there and spawns copies
        // into every higher dimension.
        let arrival_dim = self.port_dimension(port);

        for local in self.local_port_start..self.num_ports {
            if local != port {
                out_ports.push(local);
            }
        }

        let spawn_from = match arrival_dim {
            Some(dim) => dim + 1,
            None => 0,
        };
        for dim in spawn_from..self.params.shape.len() {
            for coord in 0..self.params.shape[dim] {
                if coord != self.my_loc[dim] {
                    out_ports.push(self.bundle_start(dim, coord));
                }
            }
        }
        Ok(())
    }

    fn port_state(&self, port: usize) -> PortState {
        if port >= self.num_ports {
            PortState::Unconnected
        } else if port >= self.local_port_start {
            PortState::RouterToNic
        } else {
            PortState::RouterToRouter
        }
    }

    fn num_ports(&self) -> usize {
        self.num_ports
    }

    fn num_vcs(&self, vns: usize) -> usize {
        // Valiant variants need the two route halves on separate VCs
        if self.params.algorithm.is_valiant() {
            vns * 2
        } else {
            vns
        }
    }

    fn endpoint_id(&self, port: usize) -> NodeId {
        if port < self.local_port_start || port >= self.num_ports {
            return -1;
        }
        let router = recompose(&self.my_loc, &self.params.shape);
        (router * self.params.local_ports + (port - self.local_port_start)) as NodeId
    }

    fn set_output_buffer_credits(&self, credits: SharedCredits, num_vcs: usize) {
        *self.output_credits.borrow_mut() = Some((credits, num_vcs));
    }
}
