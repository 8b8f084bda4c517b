// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Dragonfly.
//!
//! Groups of `a` fully connected routers, each carrying `p` hosts and `h`
//! global links, with `n` links between every pair of groups. Router port
//! layout:
//!
//! ```txt
//! [0, p)          hosts
//! [p, p+a-1)      other routers in the group
//! [p+a-1, k)      global links
//! ```
//!
//! The assignment of global links to target groups is described by a
//! global link map shared, read only, by every router of the simulation.
//! Deadlock freedom relies on three VCs per virtual network and a strictly
//! non-decreasing VC across global hops.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use brunel_engine::sim_error;
use brunel_engine::types::{SimError, SimResult};
use brunel_track::entity::Entity;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::event::{InternalEvent, PacketEvent, RouteState};
use crate::request::{BROADCAST_ADDR, NodeId};
use crate::topology::{PortState, SharedCredits, Topology};

/// Marker used in broadcast addresses.
const ADDR_NONE: u32 = u32::MAX;

/// Decoded location of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DragonflyAddr {
    pub group: u32,
    /// Intermediate group for Valiant routing; equal to `group` once the
    /// packet no longer needs an intermediate hop.
    pub mid_group: u32,
    pub router: u32,
    pub host: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DragonflyAlgorithm {
    #[default]
    Minimal,
    Valiant,
    AdaptiveLocal,
}

impl DragonflyAlgorithm {
    pub fn parse(name: &str) -> Result<Self, SimError> {
        match name {
            "minimal" => Ok(Self::Minimal),
            "valiant" => Ok(Self::Valiant),
            "adaptive-local" => Ok(Self::AdaptiveLocal),
            _ => sim_error!("unknown dragonfly algorithm '{name}'"),
        }
    }
}

/// How target groups in the global link map are interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GlobalRouteMode {
    /// Entries name the destination group directly.
    #[default]
    Absolute,
    /// Entries count forward from the source group, skipping it.
    Relative,
}

impl GlobalRouteMode {
    pub fn parse(name: &str) -> Result<Self, SimError> {
        match name {
            "absolute" => Ok(Self::Absolute),
            "relative" => Ok(Self::Relative),
            _ => sim_error!("unknown global route mode '{name}'"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DragonflyParams {
    /// Hosts per router (p).
    pub hosts_per_router: u32,
    /// Routers per group (a).
    pub routers_per_group: u32,
    /// Global links per router (h).
    pub intergroup_per_router: u32,
    /// Links between each pair of groups (n).
    pub intergroup_links: u32,
    /// Number of groups (g).
    pub num_groups: u32,
    pub algorithm: DragonflyAlgorithm,
    pub adaptive_threshold: f64,
    pub global_route_mode: GlobalRouteMode,
}

impl DragonflyParams {
    pub fn new(
        hosts_per_router: u32,
        routers_per_group: u32,
        intergroup_per_router: u32,
        intergroup_links: u32,
        num_groups: u32,
        algorithm: DragonflyAlgorithm,
    ) -> Result<Self, SimError> {
        let params = Self {
            hosts_per_router,
            routers_per_group,
            intergroup_per_router,
            intergroup_links,
            num_groups,
            algorithm,
            adaptive_threshold: 2.0,
            global_route_mode: GlobalRouteMode::Relative,
        };
        if params.global_slots() < params.global_targets() {
            return sim_error!(
                "dragonfly with {} groups needs {} global links per group but has {}",
                num_groups,
                params.global_targets(),
                params.global_slots()
            );
        }
        Ok(params)
    }

    /// Router radix (k).
    #[must_use]
    pub fn radix(&self) -> u32 {
        self.hosts_per_router + self.routers_per_group - 1 + self.intergroup_per_router
    }

    #[must_use]
    pub fn num_endpoints(&self) -> usize {
        (self.hosts_per_router * self.routers_per_group * self.num_groups) as usize
    }

    /// Global link slots per group (a * h).
    fn global_slots(&self) -> usize {
        (self.routers_per_group * self.intergroup_per_router) as usize
    }

    /// Global link endpoints each group must provide.
    fn global_targets(&self) -> usize {
        ((self.num_groups - 1) * self.intergroup_links) as usize
    }

    /// The default wiring: slot `s` serves target group index `s % (g-1)`
    /// on slice `s / (g-1)`.
    #[must_use]
    pub fn default_global_link_map(&self) -> Vec<i64> {
        let targets = self.global_targets() as i64;
        (0..self.global_slots() as i64)
            .map(|slot| if slot < targets { slot } else { -1 })
            .collect()
    }
}

/// A (router in group, port on router) pair reached through the global
/// link map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouterPortPair {
    pub router: u32,
    pub port: u32,
}

/// The global-link wiring of a group, shared read-only by every router.
///
/// `map[slot]` (with `slot = router_in_group * h + port_offset`) holds
/// `target_index * n + slice` for the group reached through that global
/// link, or -1 for an unused slot. Built once, before the simulation
/// starts.
pub struct RouteToGroup {
    pairs: HashMap<(u32, u32), RouterPortPair>,
    used_ports: std::collections::HashSet<(u32, u32)>,
    mode: GlobalRouteMode,
    num_groups: u32,
    intergroup_links: u32,
}

impl RouteToGroup {
    pub fn new(params: &DragonflyParams, map: &[i64]) -> Result<Rc<Self>, SimError> {
        if map.len() != params.global_slots() {
            return sim_error!(
                "global link map has {} entries, expected {}",
                map.len(),
                params.global_slots()
            );
        }

        let first_global = params.hosts_per_router + params.routers_per_group - 1;
        let mut pairs = HashMap::new();
        let mut used_ports = std::collections::HashSet::new();
        for (slot, entry) in map.iter().enumerate() {
            if *entry < 0 {
                continue;
            }
            let target = (*entry / params.intergroup_links as i64) as u32;
            let slice = (*entry % params.intergroup_links as i64) as u32;
            let pair = RouterPortPair {
                router: slot as u32 / params.intergroup_per_router,
                port: first_global + slot as u32 % params.intergroup_per_router,
            };
            if pairs.insert((target, slice), pair).is_some() {
                return sim_error!("global link map repeats target {target} slice {slice}");
            }
            used_ports.insert((pair.router, pair.port));
        }

        Ok(Rc::new(Self {
            pairs,
            used_ports,
            mode: params.global_route_mode,
            num_groups: params.num_groups,
            intergroup_links: params.intergroup_links,
        }))
    }

    /// Whether the map wires this (router, port) to another group. Unused
    /// global-port slots stay unconnected.
    pub fn is_wired(&self, router: u32, port: u32) -> bool {
        self.used_ports.contains(&(router, port))
    }

    /// The (router, port) within `src_group` through which `dest_group` is
    /// reached on `slice`.
    pub fn pair(
        &self,
        src_group: u32,
        dest_group: u32,
        slice: u32,
    ) -> Result<RouterPortPair, SimError> {
        let target = match self.mode {
            GlobalRouteMode::Absolute => dest_group,
            GlobalRouteMode::Relative => {
                (dest_group + self.num_groups - src_group - 1) % self.num_groups
            }
        };
        let slice = slice % self.intergroup_links;
        match self.pairs.get(&(target, slice)) {
            Some(pair) => Ok(*pair),
            None => sim_error!(
                "no global link from group {src_group} to group {dest_group} slice {slice}"
            ),
        }
    }
}

pub struct Dragonfly {
    entity: Rc<Entity>,
    params: DragonflyParams,
    group_id: u32,
    router_id: u32,

    route_to_group: Rc<RouteToGroup>,
    rng: RefCell<Xoshiro256PlusPlus>,
    output_queue_lengths: RefCell<Option<(SharedCredits, usize)>>,
}

impl Dragonfly {
    pub fn new(
        parent: &Rc<Entity>,
        params: DragonflyParams,
        route_to_group: Rc<RouteToGroup>,
        router: usize,
    ) -> Result<Self, SimError> {
        let total_routers = (params.routers_per_group * params.num_groups) as usize;
        if router >= total_routers {
            return sim_error!("dragonfly router id {router} outside network");
        }
        let group_id = router as u32 / params.routers_per_group;
        let router_id = router as u32 % params.routers_per_group;

        Ok(Self {
            entity: Rc::new(Entity::new(parent, "topo")),
            params,
            group_id,
            router_id,
            route_to_group,
            rng: RefCell::new(Xoshiro256PlusPlus::seed_from_u64(router as u64)),
            output_queue_lengths: RefCell::new(None),
        })
    }

    fn id_to_location(&self, id: NodeId) -> DragonflyAddr {
        if id == BROADCAST_ADDR {
            return DragonflyAddr {
                group: ADDR_NONE,
                mid_group: ADDR_NONE,
                router: ADDR_NONE,
                host: ADDR_NONE,
            };
        }
        let id = id as u32;
        let hosts_per_group = self.params.hosts_per_router * self.params.routers_per_group;
        DragonflyAddr {
            group: id / hosts_per_group,
            mid_group: ADDR_NONE,
            router: (id % hosts_per_group) / self.params.hosts_per_router,
            host: id % self.params.hosts_per_router,
        }
    }

    fn first_group_port(&self) -> u32 {
        self.params.hosts_per_router
    }

    fn first_global_port(&self) -> u32 {
        self.params.hosts_per_router + self.params.routers_per_group - 1
    }

    fn port_for_router(&self, router: u32) -> u32 {
        let mut port = self.params.hosts_per_router + router;
        if router > self.router_id {
            port -= 1;
        }
        port
    }

    fn port_for_group(&self, group: u32, slice: u32) -> Result<u32, SimError> {
        let pair = self.route_to_group.pair(self.group_id, group, slice)?;
        if pair.router == self.router_id {
            Ok(pair.port)
        } else {
            Ok(self.port_for_router(pair.router))
        }
    }

    fn queue_length(&self, port: u32, vc: usize) -> Option<u32> {
        self.output_queue_lengths
            .borrow()
            .as_ref()
            .map(|(lengths, num_vcs)| lengths.borrow()[port as usize * num_vcs + vc])
    }

    fn random_other_group(&self, dest_group: u32) -> u32 {
        let mut rng = self.rng.borrow_mut();
        loop {
            let group = rng.gen_range(0..self.params.num_groups);
            if group != self.group_id && group != dest_group {
                return group;
            }
        }
    }

    /// Pick the intermediate group for a packet entering the fabric here.
    fn choose_mid_group(&self, dest: &DragonflyAddr, slice: u32, vc: usize) -> u32 {
        if dest.group == self.group_id {
            return dest.group;
        }
        match self.params.algorithm {
            DragonflyAlgorithm::Minimal => dest.group,
            DragonflyAlgorithm::Valiant => self.random_other_group(dest.group),
            DragonflyAlgorithm::AdaptiveLocal => {
                // Compare the minimal global port with a random
                // alternative, when both can be judged from this router
                let candidate = self.random_other_group(dest.group);
                let minimal_port = match self.port_for_group(dest.group, slice) {
                    Ok(port) => port,
                    Err(_) => return dest.group,
                };
                let candidate_port = match self.port_for_group(candidate, slice) {
                    Ok(port) => port,
                    Err(_) => return dest.group,
                };
                match (
                    self.queue_length(minimal_port, vc),
                    self.queue_length(candidate_port, vc),
                ) {
                    (Some(minimal), Some(alternative))
                        if minimal as f64
                            > self.params.adaptive_threshold * alternative as f64 =>
                    {
                        candidate
                    }
                    _ => dest.group,
                }
            }
        }
    }

    fn global_slice(&self, src: NodeId, dest: NodeId) -> u16 {
        ((src as u64).wrapping_mul(31).wrapping_add(dest as u64)
            % self.params.intergroup_links as u64) as u16
    }

    /// This router's slice-0 global ports, one per reachable group, so a
    /// broadcast crosses each group pair exactly once.
    fn push_global_broadcast_ports(&self, out_ports: &mut Vec<usize>) -> SimResult {
        for group in 0..self.params.num_groups {
            if group == self.group_id {
                continue;
            }
            let pair = self.route_to_group.pair(self.group_id, group, 0)?;
            if pair.router == self.router_id {
                out_ports.push(pair.port as usize);
            }
        }
        Ok(())
    }
}

impl Topology for Dragonfly {
    fn process_input(&self, packet: PacketEvent) -> Result<InternalEvent, SimError> {
        let mut dest = self.id_to_location(packet.request.dest);
        let slice = self.global_slice(packet.request.src, packet.request.dest);
        dest.mid_group = self.choose_mid_group(&dest, slice as u32, packet.vc);

        Ok(InternalEvent::new(
            packet,
            RouteState::Dragonfly {
                dest,
                src_group: self.group_id,
                global_slice: slice,
            },
        ))
    }

    fn route(&self, port: usize, _vc: usize, ev: &mut InternalEvent) -> SimResult {
        let (mut dest, slice) = match &ev.route {
            RouteState::Dragonfly {
                dest, global_slice, ..
            } => (*dest, *global_slice as u32),
            _ => {
                return sim_error!("{}: routed event is not a dragonfly event", self.entity);
            }
        };

        // Arrived over a global link: a new group, a new VC
        if port as u32 >= self.first_global_port() {
            ev.vc += 1;
        }

        // The intermediate group, once reached, is done with
        if dest.mid_group != dest.group && dest.mid_group == self.group_id {
            dest.mid_group = dest.group;
            if let RouteState::Dragonfly { dest: d, .. } = &mut ev.route {
                d.mid_group = dest.group;
            }
        }

        let next_port = if dest.group != self.group_id {
            let target = if dest.mid_group == dest.group {
                dest.group
            } else {
                dest.mid_group
            };
            self.port_for_group(target, slice)?
        } else if dest.router != self.router_id {
            self.port_for_router(dest.router)
        } else {
            dest.host
        };

        ev.next_port = next_port as usize;
        Ok(())
    }

    fn reroute(&self, port: usize, vc: usize, ev: &mut InternalEvent) -> SimResult {
        // A held packet that has not yet left its source group may revise
        // its intermediate-group decision against fresh queue lengths
        if self.params.algorithm == DragonflyAlgorithm::AdaptiveLocal {
            if let RouteState::Dragonfly {
                dest,
                src_group,
                global_slice,
            } = &mut ev.route
            {
                if *src_group == self.group_id && dest.group != self.group_id {
                    dest.mid_group = self.choose_mid_group(dest, *global_slice as u32, ev.vc);
                }
            }
        }
        self.route(port, vc, ev)
    }

    fn process_init_data_input(&self, packet: PacketEvent) -> Result<InternalEvent, SimError> {
        let mut dest = self.id_to_location(packet.request.dest);
        dest.mid_group = dest.group;
        Ok(InternalEvent::new(
            packet,
            RouteState::Dragonfly {
                dest,
                src_group: self.group_id,
                global_slice: 0,
            },
        ))
    }

    fn route_init_data(
        &self,
        port: usize,
        ev: &mut InternalEvent,
        out_ports: &mut Vec<usize>,
    ) -> SimResult {
        let (dest_host, src_group) = match &ev.route {
            RouteState::Dragonfly {
                dest, src_group, ..
            } => (dest.host, *src_group),
            _ => {
                return sim_error!("{}: routed event is not a dragonfly event", self.entity);
            }
        };

        if dest_host != ADDR_NONE {
            self.route(port, 0, ev)?;
            out_ports.push(ev.next_port);
            return Ok(());
        }

        let p = self.params.hosts_per_router;
        let port = port as u32;

        if port >= self.first_global_port() {
            // Came in from another group: send to local hosts and the
            // other routers in the group
            for out in 0..self.first_global_port() {
                out_ports.push(out as usize);
            }
        } else if port >= p {
            // Came in from another router in the group: send to hosts,
            // and to other groups if this is the source group
            for out in 0..p {
                out_ports.push(out as usize);
            }
            if src_group == self.group_id {
                self.push_global_broadcast_ports(out_ports)?;
            }
        } else {
            // Came in from a host: send everywhere else
            for out in 0..self.first_global_port() {
                if out != port {
                    out_ports.push(out as usize);
                }
            }
            self.push_global_broadcast_ports(out_ports)?;
        }
        Ok(())
    }

    fn port_state(&self, port: usize) -> PortState {
        let port = port as u32;
        if port < self.params.hosts_per_router {
            PortState::RouterToNic
        } else if port < self.first_global_port() {
            PortState::RouterToRouter
        } else if port < self.params.radix() {
            // Global-port slots the link map does not use have no peer
            if self.route_to_group.is_wired(self.router_id, port) {
                PortState::RouterToRouter
            } else {
                PortState::Unconnected
            }
        } else {
            PortState::Unconnected
        }
    }

    fn num_ports(&self) -> usize {
        self.params.radix() as usize
    }

    fn num_vcs(&self, vns: usize) -> usize {
        vns * 3
    }

    fn endpoint_id(&self, port: usize) -> NodeId {
        let per_group = self.params.routers_per_group * self.params.hosts_per_router;
        (self.group_id * per_group + self.router_id * self.params.hosts_per_router) as NodeId
            + port as NodeId
    }

    fn set_output_queue_lengths(&self, lengths: SharedCredits, num_vcs: usize) {
        *self.output_queue_lengths.borrow_mut() = Some((lengths, num_vcs));
    }
}

#[cfg(test)]
mod tests {
    use brunel_track::entity::toplevel;
    use brunel_track::test_helpers::create_tracker;

    use super::*;
    use crate::request::NetworkRequest;

    fn params(algorithm: DragonflyAlgorithm) -> DragonflyParams {
        // p=4, a=4, h=2, g=5, n=1
        DragonflyParams::new(4, 4, 2, 1, 5, algorithm).unwrap()
    }

    fn dragonfly(top: &Rc<Entity>, algorithm: DragonflyAlgorithm, router: usize) -> Dragonfly {
        let params = params(algorithm);
        let map = params.default_global_link_map();
        let rtg = RouteToGroup::new(&params, &map).unwrap();
        Dragonfly::new(top, params, rtg, router).unwrap()
    }

    fn routed(
        top: &Rc<Entity>,
        topo: &Dragonfly,
        src: NodeId,
        dest: NodeId,
        port: usize,
    ) -> InternalEvent {
        let request = NetworkRequest::new(top, src, dest, 0, 64);
        let mut ev = topo.process_input(PacketEvent::new(request, 1)).unwrap();
        topo.route(port, 0, &mut ev).unwrap();
        ev
    }

    #[test]
    fn addresses() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");
        let topo = dragonfly(&top, DragonflyAlgorithm::Minimal, 0);

        let addr = topo.id_to_location(77);
        assert_eq!(addr.group, 4);
        assert_eq!(addr.router, 3);
        assert_eq!(addr.host, 1);

        assert_eq!(topo.endpoint_id(2), 2);
    }

    #[test]
    fn minimal_path_across_groups() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");

        // Group 0 router 0 to an endpoint on group 4 router 3. The
        // default map reaches relative group 3 (= group 4) through router
        // 1 slot 1.
        let r0 = dragonfly(&top, DragonflyAlgorithm::Minimal, 0);
        let ev = routed(&top, &r0, 0, 77, 0);
        assert_eq!(ev.next_port, 4); // intra-group hop to router 1
        assert_eq!(ev.vc, 0);

        let r1 = dragonfly(&top, DragonflyAlgorithm::Minimal, 1);
        let ev = routed(&top, &r1, 0, 77, 4);
        assert_eq!(ev.next_port, 8); // global link slot 1 on router 1
        assert_eq!(ev.vc, 0);

        // Arrival in group 4 comes over a global port and bumps the VC
        let r16 = dragonfly(&top, DragonflyAlgorithm::Minimal, 16);
        let ev = routed(&top, &r16, 0, 77, 7);
        assert_eq!(ev.next_port, 6); // intra-group hop to router 3
        assert_eq!(ev.vc, 1);

        let r19 = dragonfly(&top, DragonflyAlgorithm::Minimal, 19);
        let ev = routed(&top, &r19, 0, 77, 4);
        assert_eq!(ev.next_port, 1); // local delivery to host 1
        assert_eq!(ev.vc, 0);
    }

    #[test]
    fn valiant_avoids_endpoints_groups() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");
        let topo = dragonfly(&top, DragonflyAlgorithm::Valiant, 0);

        for _ in 0..50 {
            let request = NetworkRequest::new(&top, 0, 77, 0, 64);
            let ev = topo.process_input(PacketEvent::new(request, 1)).unwrap();
            match ev.route {
                RouteState::Dragonfly { dest, .. } => {
                    assert_ne!(dest.mid_group, 0);
                    assert_ne!(dest.mid_group, 4);
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn valiant_vc_never_decreases() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");
        let topo = dragonfly(&top, DragonflyAlgorithm::Minimal, 16);

        // Two global arrivals move the VC up twice, still inside the
        // three-VC group
        let request = NetworkRequest::new(&top, 0, 77, 0, 64);
        let mut ev = topo.process_input(PacketEvent::new(request, 1)).unwrap();
        topo.route(7, 0, &mut ev).unwrap();
        let after_first = ev.vc;
        topo.route(8, after_first, &mut ev).unwrap();
        assert!(ev.vc >= after_first);
        assert!(ev.vc < 3);
    }

    #[test]
    fn adaptive_local_diverts_under_congestion() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");
        let topo = dragonfly(&top, DragonflyAlgorithm::AdaptiveLocal, 0);

        let num_vcs = 3;
        let lengths: SharedCredits =
            Rc::new(RefCell::new(vec![0; topo.num_ports() * num_vcs]));
        topo.set_output_queue_lengths(lengths.clone(), num_vcs);

        // Group 1 is minimal for destination 16 and reached from router 0
        // slot 0, which is port 7. Congest it heavily.
        lengths.borrow_mut()[7 * num_vcs] = 100;

        let mut diverted = false;
        for _ in 0..50 {
            let request = NetworkRequest::new(&top, 0, 16, 0, 64);
            let ev = topo.process_input(PacketEvent::new(request, 1)).unwrap();
            if let RouteState::Dragonfly { dest, .. } = ev.route {
                if dest.mid_group != dest.group {
                    diverted = true;
                }
            }
        }
        assert!(diverted);
    }

    #[test]
    fn broadcast_fanout_rules() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");
        let topo = dragonfly(&top, DragonflyAlgorithm::Minimal, 0);

        let fanout = |arrival: usize| {
            let request = NetworkRequest::new(&top, 0, BROADCAST_ADDR, 0, 64);
            let mut ev = topo
                .process_init_data_input(PacketEvent::new(request, 1))
                .unwrap();
            let mut out_ports = Vec::new();
            topo.route_init_data(arrival, &mut ev, &mut out_ports).unwrap();
            out_ports
        };

        // From a host: everywhere except the arrival port
        assert_eq!(fanout(0), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        // From a group neighbour in the source group: hosts and globals
        assert_eq!(fanout(5), vec![0, 1, 2, 3, 7, 8]);
        // From a global link: hosts and group neighbours
        assert_eq!(fanout(7), vec![0, 1, 2, 3, 4, 5, 6]);
    }
}
