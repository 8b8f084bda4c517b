// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Fat tree.
//!
//! The shape string gives the number of down and up links per router for
//! each level, levels separated by colons: "2,2:4" is a two-level tree
//! whose edge routers have two hosts and two up links. Down ports come
//! first in the port layout, up ports follow.
//!
//! Up routing is deterministic by destination hash, or adaptive on the
//! downstream credit counts. Down routing is exact by subtree.

use std::cell::RefCell;
use std::rc::Rc;

use brunel_engine::sim_error;
use brunel_engine::types::{SimError, SimResult};
use brunel_track::entity::Entity;

use crate::event::{InternalEvent, PacketEvent, RouteState};
use crate::request::{BROADCAST_ADDR, NodeId};
use crate::topology::{PortState, SharedCredits, Topology};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FatTreeAlgorithm {
    #[default]
    Deterministic,
    Adaptive,
}

impl FatTreeAlgorithm {
    pub fn parse(name: &str) -> Result<Self, SimError> {
        match name {
            "deterministic" => Ok(Self::Deterministic),
            "adaptive" => Ok(Self::Adaptive),
            _ => sim_error!("unknown fattree routing algorithm '{name}'"),
        }
    }
}

/// Per-level down/up link counts.
#[derive(Clone, Debug)]
pub struct FatTreeParams {
    pub levels: Vec<(usize, usize)>,
}

impl FatTreeParams {
    /// Parse a shape string such as "2,2:2,2" or "4,2:8".
    pub fn parse(shape: &str) -> Result<Self, SimError> {
        let mut levels = Vec::new();
        for level in shape.split(':') {
            let mut parts = level.split(',');
            let downs = parts.next().and_then(|p| p.parse::<usize>().ok());
            let ups = match parts.next() {
                Some(p) => p.parse::<usize>().ok(),
                None => Some(0),
            };
            match (downs, ups, parts.next()) {
                (Some(downs), Some(ups), None) if downs > 0 => levels.push((downs, ups)),
                _ => {
                    return sim_error!("malformed fattree shape '{shape}'");
                }
            }
        }
        if levels.is_empty() {
            return sim_error!("malformed fattree shape '{shape}'");
        }
        Ok(Self { levels })
    }

    #[must_use]
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    #[must_use]
    pub fn total_hosts(&self) -> usize {
        self.levels.iter().map(|(downs, _)| *downs).product()
    }

    /// Number of routers at each level.
    #[must_use]
    pub fn routers_per_level(&self) -> Vec<usize> {
        let mut counts = Vec::with_capacity(self.levels.len());
        let mut count = self.total_hosts() / self.levels[0].0;
        counts.push(count);
        for level in 1..self.levels.len() {
            count = count * self.levels[level - 1].1 / self.levels[level].0;
            counts.push(count);
        }
        counts
    }

    /// Hosts under one level-`level` router.
    #[must_use]
    pub fn subtree_hosts(&self, level: usize) -> usize {
        self.levels[..=level].iter().map(|(downs, _)| *downs).product()
    }
}

pub struct FatTree {
    entity: Rc<Entity>,
    params: FatTreeParams,
    level: usize,

    downs: usize,
    ups: usize,
    num_ports: usize,

    /// Host id range served by this router's subtree.
    low_host: NodeId,
    high_host: NodeId,

    /// Hosts under each down subtree.
    hosts_per_down: usize,

    algorithm: FatTreeAlgorithm,
    adaptive_threshold: f64,
    output_credits: RefCell<Option<(SharedCredits, usize)>>,
}

impl FatTree {
    pub fn new(
        parent: &Rc<Entity>,
        params: FatTreeParams,
        level: usize,
        level_id: usize,
        algorithm: FatTreeAlgorithm,
        adaptive_threshold: f64,
    ) -> Result<Self, SimError> {
        let routers_per_level = params.routers_per_level();
        if level >= params.num_levels() || level_id >= routers_per_level[level] {
            return sim_error!("fattree router {level_id} at level {level} outside shape");
        }

        let (downs, ups) = params.levels[level];
        let subtree = params.subtree_hosts(level);
        let routers_per_group = routers_per_level[level] * subtree / params.total_hosts();
        let group = level_id / routers_per_group;
        let low_host = (group * subtree) as NodeId;

        Ok(Self {
            entity: Rc::new(Entity::new(parent, "topo")),
            level,
            downs,
            ups,
            num_ports: downs + ups,
            low_host,
            high_host: low_host + subtree as NodeId,
            hosts_per_down: subtree / downs,
            algorithm,
            adaptive_threshold,
            output_credits: RefCell::new(None),
            params,
        })
    }

    fn serves(&self, dest: NodeId) -> bool {
        dest >= self.low_host && dest < self.high_host
    }

    fn down_port(&self, dest: NodeId) -> usize {
        (dest - self.low_host) as usize / self.hosts_per_down
    }

    fn deterministic_up_port(&self, dest: NodeId) -> usize {
        let subtree = (self.high_host - self.low_host) as usize;
        self.downs + (dest as usize / subtree) % self.ups
    }

    fn credits_for(&self, port: usize, vc: usize) -> Option<u32> {
        self.output_credits
            .borrow()
            .as_ref()
            .map(|(credits, num_vcs)| credits.borrow()[port * num_vcs + vc])
    }

    fn adaptive_up_port(&self, dest: NodeId, vc: usize) -> usize {
        let deterministic = self.deterministic_up_port(dest);

        let mut best = deterministic;
        let mut best_credits = match self.credits_for(deterministic, vc) {
            Some(credits) => credits,
            None => return deterministic,
        };
        for port in self.downs..self.downs + self.ups {
            let credits = self.credits_for(port, vc).unwrap_or(0);
            if credits > best_credits {
                best = port;
                best_credits = credits;
            }
        }

        // Not worth deviating when even the best port is nearly out of
        // credits
        if (best_credits as f64) < self.adaptive_threshold {
            return deterministic;
        }
        best
    }
}

impl Topology for FatTree {
    fn process_input(&self, packet: PacketEvent) -> Result<InternalEvent, SimError> {
        Ok(InternalEvent::new(packet, RouteState::Direct))
    }

    fn route(&self, _port: usize, _vc: usize, ev: &mut InternalEvent) -> SimResult {
        let dest = ev.dest();
        if self.serves(dest) {
            ev.next_port = self.down_port(dest);
            return Ok(());
        }
        if self.ups == 0 {
            return sim_error!("{}: destination {dest} not under the root", self.entity);
        }
        ev.next_port = match self.algorithm {
            FatTreeAlgorithm::Deterministic => self.deterministic_up_port(dest),
            FatTreeAlgorithm::Adaptive => self.adaptive_up_port(dest, ev.vc),
        };
        Ok(())
    }

    fn process_init_data_input(&self, packet: PacketEvent) -> Result<InternalEvent, SimError> {
        Ok(InternalEvent::new(packet, RouteState::Direct))
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

        if port < self.downs {
            // Came from below: cover the sibling subtrees and climb one
            // link towards a single root, which will fan back down
            for down in 0..self.downs {
                if down != port {
                    out_ports.push(down);
                }
            }
            if self.ups > 0 && self.level + 1 < self.params.num_levels() {
                out_ports.push(self.downs);
            }
        } else {
            // Came from above: cover the whole subtree
            for down in 0..self.downs {
                out_ports.push(down);
            }
        }
        Ok(())
    }

    fn port_state(&self, port: usize) -> PortState {
        if port >= self.num_ports {
            PortState::Unconnected
        } else if port < self.downs {
            if self.level == 0 {
                PortState::RouterToNic
            } else {
                PortState::RouterToRouter
            }
        } else if self.level + 1 < self.params.num_levels() {
            PortState::RouterToRouter
        } else {
            // Up ports of the top level have no peer
            PortState::Unconnected
        }
    }

    fn num_ports(&self) -> usize {
        self.num_ports
    }

    fn endpoint_id(&self, port: usize) -> NodeId {
        if self.level == 0 && port < self.downs {
            self.low_host + port as NodeId
        } else {
            -1
        }
    }

    fn set_output_buffer_credits(&self, credits: SharedCredits, num_vcs: usize) {
        *self.output_credits.borrow_mut() = Some((credits, num_vcs));
    }
}

#[cfg(test)]
mod tests {
    use brunel_track::entity::toplevel;
    use brunel_track::test_helpers::create_tracker;

    use super::*;
    use crate::request::NetworkRequest;

    fn tree(
        top: &Rc<Entity>,
        level: usize,
        level_id: usize,
        algorithm: FatTreeAlgorithm,
    ) -> FatTree {
        let params = FatTreeParams::parse("2,2:2,2").unwrap();
        FatTree::new(top, params, level, level_id, algorithm, 1.0).unwrap()
    }

    fn routed(top: &Rc<Entity>, topo: &FatTree, dest: NodeId) -> InternalEvent {
        let request = NetworkRequest::new(top, 0, dest, 0, 64);
        let mut ev = topo.process_input(PacketEvent::new(request, 1)).unwrap();
        topo.route(0, 0, &mut ev).unwrap();
        ev
    }

    #[test]
    fn shapes() {
        let params = FatTreeParams::parse("2,2:2,2").unwrap();
        assert_eq!(params.total_hosts(), 4);
        assert_eq!(params.routers_per_level(), vec![2, 2]);

        let params = FatTreeParams::parse("4,2:8").unwrap();
        assert_eq!(params.total_hosts(), 32);
        assert_eq!(params.routers_per_level(), vec![8, 2]);
        assert_eq!(params.levels[1], (8, 0));

        assert!(FatTreeParams::parse("").is_err());
        assert!(FatTreeParams::parse("2,2,2").is_err());
        assert!(FatTreeParams::parse("0,2").is_err());
    }

    #[test]
    fn deterministic_up_and_down() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");

        // Edge router 0 serves hosts 0..2
        let edge = tree(&top, 0, 0, FatTreeAlgorithm::Deterministic);
        assert_eq!(routed(&top, &edge, 1).next_port, 1);
        assert_eq!(routed(&top, &edge, 3).next_port, 3);

        // Top router 1 serves everything and routes down by subtree
        let root = tree(&top, 1, 1, FatTreeAlgorithm::Deterministic);
        assert_eq!(routed(&top, &root, 3).next_port, 1);
        assert_eq!(routed(&top, &root, 0).next_port, 0);
    }

    #[test]
    fn adaptive_avoids_empty_port() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");

        let edge = tree(&top, 0, 0, FatTreeAlgorithm::Adaptive);
        let num_vcs = 1;
        let credits: SharedCredits = Rc::new(RefCell::new(vec![0; edge.num_ports() * num_vcs]));
        edge.set_output_buffer_credits(credits.clone(), num_vcs);

        // Deterministic choice for host 3 is port 3; starve it of credits
        // and fill port 2
        credits.borrow_mut()[3] = 0;
        credits.borrow_mut()[2] = 8;
        assert_eq!(routed(&top, &edge, 3).next_port, 2);

        // With the deterministic port healthy again it stays the best
        // choice only if it has the most credits
        credits.borrow_mut()[3] = 16;
        assert_eq!(routed(&top, &edge, 3).next_port, 3);
    }

    #[test]
    fn broadcast_climbs_one_root() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");

        let edge = tree(&top, 0, 0, FatTreeAlgorithm::Deterministic);
        let request = NetworkRequest::new(&top, 0, BROADCAST_ADDR, 0, 64);
        let mut ev = edge
            .process_init_data_input(PacketEvent::new(request, 1))
            .unwrap();
        let mut out_ports = Vec::new();
        edge.route_init_data(0, &mut ev, &mut out_ports).unwrap();
        assert_eq!(out_ports, vec![1, 2]);

        // From above, the whole subtree is covered
        let mut out_ports = Vec::new();
        edge.route_init_data(2, &mut ev, &mut out_ports).unwrap();
        assert_eq!(out_ports, vec![0, 1]);
    }
}
