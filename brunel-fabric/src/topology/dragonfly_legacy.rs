// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The original dragonfly.
//!
//! A simpler variant with a single global link per (router, group) pair
//! and a fixed wiring instead of a global link map. Retained so that old
//! configurations keep running; new configurations should use
//! [`Dragonfly`](crate::topology::dragonfly::Dragonfly), and constructing
//! this variant says so in the log.

use std::cell::RefCell;
use std::rc::Rc;

use brunel_engine::sim_error;
use brunel_engine::types::{SimError, SimResult};
use brunel_track::entity::Entity;
use brunel_track::warn;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::event::{InternalEvent, PacketEvent, RouteState};
use crate::request::{BROADCAST_ADDR, NodeId};
use crate::topology::dragonfly::DragonflyAddr;
use crate::topology::{PortState, Topology};

const ADDR_NONE: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LegacyAlgorithm {
    #[default]
    Minimal,
    Valiant,
}

#[derive(Clone, Debug)]
pub struct DragonflyLegacyParams {
    pub hosts_per_router: u32,
    pub routers_per_group: u32,
    pub intergroup_per_router: u32,
    pub num_groups: u32,
    pub algorithm: LegacyAlgorithm,
}

impl DragonflyLegacyParams {
    #[must_use]
    pub fn radix(&self) -> u32 {
        self.hosts_per_router + self.routers_per_group - 1 + self.intergroup_per_router
    }

    #[must_use]
    pub fn num_endpoints(&self) -> usize {
        (self.hosts_per_router * self.routers_per_group * self.num_groups) as usize
    }
}

pub struct DragonflyLegacy {
    entity: Rc<Entity>,
    params: DragonflyLegacyParams,
    algorithm: LegacyAlgorithm,
    group_id: u32,
    router_id: u32,
    rng: RefCell<Xoshiro256PlusPlus>,
}

impl DragonflyLegacy {
    pub fn new(
        parent: &Rc<Entity>,
        params: DragonflyLegacyParams,
        router: usize,
    ) -> Result<Self, SimError> {
        let total_routers = (params.routers_per_group * params.num_groups) as usize;
        if router >= total_routers {
            return sim_error!("dragonfly router id {router} outside network");
        }

        let entity = Rc::new(Entity::new(parent, "topo"));
        warn!(entity ; "the legacy dragonfly is no longer supported; use the dragonfly topology");

        // Valiant is pointless with two groups or fewer
        let algorithm = if params.num_groups <= 2 {
            LegacyAlgorithm::Minimal
        } else {
            params.algorithm
        };

        Ok(Self {
            entity,
            group_id: router as u32 / params.routers_per_group,
            router_id: router as u32 % params.routers_per_group,
            algorithm,
            rng: RefCell::new(Xoshiro256PlusPlus::seed_from_u64(router as u64)),
            params,
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

    fn first_global_port(&self) -> u32 {
        self.params.hosts_per_router + self.params.routers_per_group - 1
    }

    /// The router in this group holding the single link to `group`.
    fn router_to_group(&self, group: u32) -> Result<u32, SimError> {
        if group < self.group_id {
            Ok(group / self.params.intergroup_per_router)
        } else if group > self.group_id {
            Ok((group - 1) / self.params.intergroup_per_router)
        } else {
            sim_error!("{}: trying to find router to own group", self.entity)
        }
    }

    fn port_for_router(&self, router: u32) -> u32 {
        let mut port = self.params.hosts_per_router + router;
        if router > self.router_id {
            port -= 1;
        }
        port
    }

    /// Returns a local router port if the group cannot be reached from
    /// this router.
    fn port_for_group(&self, group: u32) -> Result<u32, SimError> {
        let target_router = self.router_to_group(group)?;
        if target_router == self.router_id {
            let mut port = self.first_global_port();
            if group < self.group_id {
                port += group % self.params.intergroup_per_router;
            } else {
                port += (group - 1) % self.params.intergroup_per_router;
            }
            Ok(port)
        } else {
            Ok(self.port_for_router(target_router))
        }
    }

    /// True when this router owns the fixed global link behind `port`.
    fn global_port_is_wired(&self, port: u32) -> bool {
        for group in 0..self.params.num_groups {
            if group == self.group_id {
                continue;
            }
            match (self.router_to_group(group), self.port_for_group(group)) {
                (Ok(router), Ok(group_port)) if router == self.router_id => {
                    if group_port == port {
                        return true;
                    }
                }
                _ => continue,
            }
        }
        false
    }

    /// The global ports held by this router, for broadcast fan-out.
    fn push_global_broadcast_ports(&self, out_ports: &mut Vec<usize>) -> SimResult {
        for group in 0..self.params.num_groups {
            if group == self.group_id {
                continue;
            }
            if self.router_to_group(group)? == self.router_id {
                out_ports.push(self.port_for_group(group)? as usize);
            }
        }
        Ok(())
    }
}

impl Topology for DragonflyLegacy {
    fn process_input(&self, packet: PacketEvent) -> Result<InternalEvent, SimError> {
        let mut dest = self.id_to_location(packet.request.dest);

        dest.mid_group = match self.algorithm {
            LegacyAlgorithm::Minimal => dest.group,
            LegacyAlgorithm::Valiant => {
                if dest.group == self.group_id {
                    dest.group
                } else {
                    let mut rng = self.rng.borrow_mut();
                    loop {
                        let group = rng.gen_range(0..self.params.num_groups);
                        if group != self.group_id && group != dest.group {
                            break group;
                        }
                    }
                }
            }
        };

        Ok(InternalEvent::new(
            packet,
            RouteState::Dragonfly {
                dest,
                src_group: self.group_id,
                global_slice: 0,
            },
        ))
    }

    fn route(&self, port: usize, _vc: usize, ev: &mut InternalEvent) -> SimResult {
        let mut dest = match &ev.route {
            RouteState::Dragonfly { dest, .. } => *dest,
            _ => {
                return sim_error!("{}: routed event is not a dragonfly event", self.entity);
            }
        };

        // Came in from another group: increment the VC
        if port as u32 >= self.first_global_port() {
            ev.vc += 1;
        }

        if dest.mid_group != dest.group && dest.mid_group == self.group_id {
            dest.mid_group = dest.group;
            if let RouteState::Dragonfly { dest: d, .. } = &mut ev.route {
                d.mid_group = dest.group;
            }
        }

        let next_port = if dest.group != self.group_id {
            if dest.mid_group != dest.group {
                self.port_for_group(dest.mid_group)?
            } else {
                self.port_for_group(dest.group)?
            }
        } else if dest.router != self.router_id {
            self.port_for_router(dest.router)
        } else {
            dest.host
        };

        ev.next_port = next_port as usize;
        Ok(())
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
            for out in 0..self.first_global_port() {
                out_ports.push(out as usize);
            }
        } else if port >= p {
            for out in 0..p {
                out_ports.push(out as usize);
            }
            if src_group == self.group_id {
                self.push_global_broadcast_ports(out_ports)?;
            }
        } else {
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
        } else if port < self.params.radix() && self.global_port_is_wired(port) {
            PortState::RouterToRouter
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
}

#[cfg(test)]
mod tests {
    use brunel_track::entity::toplevel;
    use brunel_track::test_helpers::create_tracker;

    use super::*;
    use crate::request::NetworkRequest;

    fn legacy(top: &Rc<Entity>, router: usize) -> DragonflyLegacy {
        let params = DragonflyLegacyParams {
            hosts_per_router: 2,
            routers_per_group: 4,
            intergroup_per_router: 1,
            num_groups: 5,
            algorithm: LegacyAlgorithm::Minimal,
        };
        DragonflyLegacy::new(top, params, router).unwrap()
    }

    #[test]
    fn fixed_global_wiring() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");

        // Group 2 router 0 holds the single link to groups 0; groups above
        // the own group shift down by one
        let topo = legacy(&top, 8);
        assert_eq!(topo.router_to_group(0).unwrap(), 0);
        assert_eq!(topo.router_to_group(1).unwrap(), 1);
        assert_eq!(topo.router_to_group(3).unwrap(), 2);
        assert_eq!(topo.router_to_group(4).unwrap(), 3);
        assert!(topo.router_to_group(2).is_err());
    }

    #[test]
    fn minimal_route() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");

        // Group 0 router 0: the link to group 1 lives on router 0 itself
        let topo = legacy(&top, 0);
        let request = NetworkRequest::new(&top, 0, 8, 0, 64);
        let mut ev = topo.process_input(PacketEvent::new(request, 1)).unwrap();
        topo.route(0, 0, &mut ev).unwrap();
        assert_eq!(ev.next_port, topo.first_global_port() as usize);

        // Destination in the own group goes through the group ports
        let request = NetworkRequest::new(&top, 0, 2, 0, 64);
        let mut ev = topo.process_input(PacketEvent::new(request, 1)).unwrap();
        topo.route(0, 0, &mut ev).unwrap();
        assert_eq!(ev.next_port, 2);
    }

    #[test]
    fn valiant_degrades_with_two_groups() {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");

        let params = DragonflyLegacyParams {
            hosts_per_router: 2,
            routers_per_group: 2,
            intergroup_per_router: 1,
            num_groups: 2,
            algorithm: LegacyAlgorithm::Valiant,
        };
        let topo = DragonflyLegacy::new(&top, params, 0).unwrap();
        assert_eq!(topo.algorithm, LegacyAlgorithm::Minimal);
    }
}
