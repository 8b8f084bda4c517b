// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A single router with every port attached to an endpoint.
//!
//! The port index is the endpoint id.

use std::rc::Rc;

use brunel_engine::sim_error;
use brunel_engine::types::{SimError, SimResult};
use brunel_track::entity::Entity;

use crate::event::{InternalEvent, PacketEvent, RouteState};
use crate::request::{BROADCAST_ADDR, NodeId};
use crate::topology::{PortState, Topology};

pub struct SingleRouter {
    entity: Rc<Entity>,
    num_ports: usize,
}

impl SingleRouter {
    #[must_use]
    pub fn new(parent: &Rc<Entity>, num_ports: usize) -> Self {
        Self {
            entity: Rc::new(Entity::new(parent, "topo")),
            num_ports,
        }
    }
}

impl Topology for SingleRouter {
    fn process_input(&self, packet: PacketEvent) -> Result<InternalEvent, SimError> {
        Ok(InternalEvent::new(packet, RouteState::Direct))
    }

    fn route(&self, _port: usize, _vc: usize, ev: &mut InternalEvent) -> SimResult {
        let dest = ev.dest();
        if dest < 0 || dest as usize >= self.num_ports {
            return sim_error!("{}: destination {dest} is not a port", self.entity);
        }
        ev.next_port = dest as usize;
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
        if ev.dest() == BROADCAST_ADDR {
            for i in 0..self.num_ports {
                if i != port {
                    out_ports.push(i);
                }
            }
        } else {
            self.route(port, 0, ev)?;
            out_ports.push(ev.next_port);
        }
        Ok(())
    }

    fn port_state(&self, port: usize) -> PortState {
        if port < self.num_ports {
            PortState::RouterToNic
        } else {
            PortState::Unconnected
        }
    }

    fn num_ports(&self) -> usize {
        self.num_ports
    }

    fn endpoint_id(&self, port: usize) -> NodeId {
        port as NodeId
    }
}
