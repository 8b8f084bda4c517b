// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! k-ary n-cube mesh without wraparound links.
//!
//! Port layout per router: for each dimension, a contiguous range of
//! positive-direction links followed by the same number of
//! negative-direction links (`dim_width` parallel links each way), then
//! the local endpoint ports at the tail.
//!
//! Routing is dimension ordered: the first dimension in which the current
//! router differs from the destination is corrected first. Parallel links
//! are selected by hashing the remaining distance in the dimension, so a
//! given (source, destination) pair always takes the same path.

use std::rc::Rc;

use brunel_engine::sim_error;
use brunel_engine::types::{SimError, SimResult};
use brunel_track::entity::Entity;

use crate::event::{InternalEvent, PacketEvent, RouteState};
use crate::request::{BROADCAST_ADDR, NodeId};
use crate::topology::{PortState, Topology, decompose, parse_dim_string, recompose};

/// Shape of a mesh network.
#[derive(Clone, Debug)]
pub struct MeshParams {
    /// Routers in each dimension, for example `[4, 4, 2]`.
    pub shape: Vec<u32>,
    /// Parallel links between routers in each dimension.
    pub width: Vec<u32>,
    /// Endpoints attached to each router.
    pub local_ports: usize,
}

impl MeshParams {
    /// Build the parameters from "4x4x2" style shape and width strings.
    pub fn parse(shape: &str, width: &str, local_ports: usize) -> Result<Self, SimError> {
        let shape = parse_dim_string(shape)?;
        let width = parse_dim_string(width)?;
        if shape.len() != width.len() {
            return sim_error!("mesh shape and width must have the same number of dimensions");
        }
        if local_ports == 0 {
            return sim_error!("mesh requires at least one local port per router");
        }
        Ok(Self {
            shape,
            width,
            local_ports,
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

    /// First port of the given dimension and direction.
    #[must_use]
    pub fn direction_port(&self, dim: usize, positive: bool, link: usize) -> usize {
        let start: usize = self.width[..dim].iter().map(|w| 2 * *w as usize).sum();
        if positive {
            start + link
        } else {
            start + self.width[dim] as usize + link
        }
    }

    #[must_use]
    pub fn local_port_start(&self) -> usize {
        self.width.iter().map(|w| 2 * *w as usize).sum()
    }

    #[must_use]
    pub fn local_port(&self, index: usize) -> usize {
        self.local_port_start() + index
    }
}

pub struct Mesh {
    entity: Rc<Entity>,
    params: MeshParams,
    my_loc: Vec<u32>,

    /// First positive-direction port of each dimension.
    port_start: Vec<usize>,
    local_port_start: usize,
    num_ports: usize,
}

/// The dimension a port belongs to and whether packets leaving through it
/// travel in the positive direction.
struct DimPort {
    dim: usize,
    positive: bool,
}

impl Mesh {
    pub fn new(parent: &Rc<Entity>, params: MeshParams, router_id: usize) -> Result<Self, SimError> {
        if router_id >= params.num_routers() {
            return sim_error!("mesh router id {router_id} outside shape");
        }

        let mut port_start = Vec::with_capacity(params.shape.len());
        let mut next = 0usize;
        for w in &params.width {
            port_start.push(next);
            next += 2 * *w as usize;
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
        })
    }

    fn dest_router(&self, dest: NodeId) -> usize {
        dest as usize / self.params.local_ports
    }

    fn dest_local_port(&self, dest: NodeId) -> usize {
        dest as usize % self.params.local_ports
    }

    fn id_to_location(&self, dest: NodeId) -> Vec<u32> {
        decompose(self.dest_router(dest), &self.params.shape)
    }

    /// Which dimension/direction a router-to-router port serves.
    fn port_direction(&self, port: usize) -> Option<DimPort> {
        for (dim, start) in self.port_start.iter().enumerate() {
            let width = self.params.width[dim] as usize;
            if port >= *start && port < start + 2 * width {
                return Some(DimPort {
                    dim,
                    positive: port < start + width,
                });
            }
        }
        None
    }

    fn has_neighbour(&self, dim: usize, positive: bool) -> bool {
        if positive {
            self.my_loc[dim] + 1 < self.params.shape[dim]
        } else {
            self.my_loc[dim] > 0
        }
    }

    /// First port of the requested direction in the requested dimension.
    fn direction_port(&self, dim: usize, positive: bool) -> usize {
        if positive {
            self.port_start[dim]
        } else {
            self.port_start[dim] + self.params.width[dim] as usize
        }
    }

    fn choose_multipath(&self, start_port: usize, num_ports: usize, dest_dist: u32) -> usize {
        start_port + (dest_dist as usize % num_ports)
    }
}

impl Topology for Mesh {
    fn process_input(&self, packet: PacketEvent) -> Result<InternalEvent, SimError> {
        let dest_loc = self.id_to_location(packet.request.dest);
        Ok(InternalEvent::new(packet, RouteState::Mesh { dest_loc }))
    }

    fn route(&self, _port: usize, _vc: usize, ev: &mut InternalEvent) -> SimResult {
        let dest_loc = match &ev.route {
            RouteState::Mesh { dest_loc } => dest_loc.clone(),
            _ => {
                return sim_error!("{}: routed event is not a mesh event", self.entity);
            }
        };

        for dim in 0..self.params.shape.len() {
            if dest_loc[dim] != self.my_loc[dim] {
                let positive = dest_loc[dim] > self.my_loc[dim];
                let dist = dest_loc[dim].abs_diff(self.my_loc[dim]);
                let start = self.direction_port(dim, positive);
                ev.next_port =
                    self.choose_multipath(start, self.params.width[dim] as usize, dist);
                return Ok(());
            }
        }

        ev.next_port = self.local_port_start + self.dest_local_port(ev.dest());
        Ok(())
    }

    fn process_init_data_input(&self, packet: PacketEvent) -> Result<InternalEvent, SimError> {
        let dest_loc = if packet.request.dest == BROADCAST_ADDR {
            Vec::new()
        } else {
            self.id_to_location(packet.request.dest)
        };
        Ok(InternalEvent::new(packet, RouteState::Mesh { dest_loc }))
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

        // Flood dimension by dimension: a broadcast travelling along
        // dimension `d` keeps going in its direction and spawns copies
        // into every higher dimension, so each router sees it exactly
        // once. The direction of travel is known from the arrival port.
        let (first_dim, continue_dir) = match self.port_direction(port) {
            // Arrival on our positive-direction port means the packet was
            // travelling in the negative direction.
            Some(DimPort { dim, positive }) => (dim, Some((dim, !positive))),
            None => (0, None),
        };

        // Local delivery, skipping the arrival port for a local injection
        for local in self.local_port_start..self.num_ports {
            if local != port {
                out_ports.push(local);
            }
        }

        // Keep travelling along the arrival dimension
        if let Some((dim, positive)) = continue_dir {
            if self.has_neighbour(dim, positive) {
                out_ports.push(self.direction_port(dim, positive));
            }
        }

        // Spawn into higher dimensions (all dimensions for an injection)
        let spawn_from = match continue_dir {
            Some(_) => first_dim + 1,
            None => 0,
        };
        for dim in spawn_from..self.params.shape.len() {
            for positive in [true, false] {
                if self.has_neighbour(dim, positive) {
                    out_ports.push(self.direction_port(dim, positive));
                }
            }
        }
        Ok(())
    }

    fn port_state(&self, port: usize) -> PortState {
        if port >= self.num_ports {
            return PortState::Unconnected;
        }
        if port >= self.local_port_start {
            return PortState::RouterToNic;
        }
        match self.port_direction(port) {
            Some(DimPort { dim, positive }) if self.has_neighbour(dim, positive) => {
                PortState::RouterToRouter
            }
            _ => PortState::Unconnected,
        }
    }

    fn num_ports(&self) -> usize {
        self.num_ports
    }

    fn endpoint_id(&self, port: usize) -> NodeId {
        if port < self.local_port_start || port >= self.num_ports {
            return -1;
        }
        let router = recompose(&self.my_loc, &self.params.shape);
        (router * self.params.local_ports + (port - self.local_port_start)) as NodeId
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use brunel_track::entity::toplevel;
    use brunel_track::test_helpers::create_tracker;

    use super::*;
    use crate::request::NetworkRequest;

    fn mesh(top: &Rc<Entity>, shape: &str, width: &str, local: usize, id: usize) -> Mesh {
        Mesh::new(top, MeshParams::parse(shape, width, local).unwrap(), id).unwrap()
    }

    fn routed(top: &Rc<Entity>, topo: &Mesh, src: NodeId, dest: NodeId) -> InternalEvent {
        let request = NetworkRequest::new(top, src, dest, 0, 64);
        let mut ev = topo.process_input(PacketEvent::new(request, 1)).unwrap();
        topo.route(0, 0, &mut ev).unwrap();
        ev
    }

    #[test]
    fn locations() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");
        let topo = mesh(&top, "4x4x2", "1x1x1", 2, 0);

        assert_eq!(topo.params.num_routers(), 32);
        assert_eq!(topo.params.num_endpoints(), 64);
        assert_eq!(topo.params.ports_per_router(), 8);
        assert_eq!(topo.params.local_port(1), 7);

        assert_eq!(topo.id_to_location(0), vec![0, 0, 0]);
        assert_eq!(topo.id_to_location(2), vec![1, 0, 0]);
        assert_eq!(topo.id_to_location(9), vec![0, 1, 0]);
        assert_eq!(topo.id_to_location(33), vec![0, 0, 1]);
        assert_eq!(recompose(&[3, 3, 1], &[4, 4, 2]), 31);
    }

    #[test]
    fn dimension_order_route() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");

        // 2x2 mesh, one endpoint per router: endpoint ids equal router ids
        let r0 = mesh(&top, "2x2", "1x1", 1, 0);
        let ev = routed(&top, &r0, 0, 3);
        // x corrected first: towards (1, 0) through the positive-x port
        assert_eq!(ev.next_port, 0);

        let r1 = mesh(&top, "2x2", "1x1", 1, 1);
        let ev = routed(&top, &r1, 0, 3);
        // x aligned at router (1, 0): continue along +y
        assert_eq!(ev.next_port, 2);

        let r3 = mesh(&top, "2x2", "1x1", 1, 3);
        let ev = routed(&top, &r3, 0, 3);
        // Arrived: deliver to the local port
        assert_eq!(ev.next_port, r3.local_port_start);
    }

    #[test]
    fn multipath_links_spread_by_distance() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");
        let topo = mesh(&top, "4", "2", 1, 0);

        // Distance 1 and 3 pick different parallel links, distance 2 wraps
        let ev = routed(&top, &topo, 0, 1);
        assert_eq!(ev.next_port, 1);
        let ev = routed(&top, &topo, 0, 2);
        assert_eq!(ev.next_port, 0);
        let ev = routed(&top, &topo, 0, 3);
        assert_eq!(ev.next_port, 1);
    }

    #[test]
    fn edge_ports_are_unconnected() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");

        let corner = mesh(&top, "2x2", "1x1", 1, 0);
        assert_eq!(corner.port_state(0), PortState::RouterToRouter); // +x
        assert_eq!(corner.port_state(1), PortState::Unconnected); // -x
        assert_eq!(corner.port_state(2), PortState::RouterToRouter); // +y
        assert_eq!(corner.port_state(3), PortState::Unconnected); // -y
        assert_eq!(corner.port_state(4), PortState::RouterToNic);
    }

    /// Walk a broadcast through every router of a 3x3 mesh and check each
    /// router is visited exactly once.
    #[test]
    fn broadcast_covers_mesh_once() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");

        let params = || MeshParams::parse("3x3", "1x1", 1).unwrap();
        let routers: Vec<Mesh> = (0..9)
            .map(|id| Mesh::new(&top, params(), id).unwrap())
            .collect();

        let mut visited = HashSet::new();
        // (router, arrival port)
        let mut pending = vec![(4usize, routers[4].local_port_start)];

        while let Some((rtr, port)) = pending.pop() {
            assert!(visited.insert(rtr), "router {rtr} visited twice");

            let request = NetworkRequest::new(&top, 4, BROADCAST_ADDR, 0, 64);
            let mut ev = routers[rtr]
                .process_init_data_input(PacketEvent::new(request, 1))
                .unwrap();
            let mut out_ports = Vec::new();
            routers[rtr]
                .route_init_data(port, &mut ev, &mut out_ports)
                .unwrap();

            for out in out_ports {
                if out >= routers[rtr].local_port_start {
                    continue;
                }
                let dir = routers[rtr].port_direction(out).unwrap();
                let mut loc = routers[rtr].my_loc.clone();
                if dir.positive {
                    loc[dir.dim] += 1;
                } else {
                    loc[dir.dim] -= 1;
                }
                let next = recompose(&loc, &[3, 3]);
                // The packet arrives on the opposite-direction port
                let arrival = routers[next].direction_port(dir.dim, !dir.positive);
                pending.push((next, arrival));
            }
        }

        assert_eq!(visited.len(), 9);
    }
}
