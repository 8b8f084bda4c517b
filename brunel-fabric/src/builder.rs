// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Whole-network construction.
//!
//! These builders create the routers for a topology, wire the
//! router-to-router links, and attach one [`LinkControl`] per endpoint.
//! Endpoint `i` of the returned [`Network`] talks through
//! `network.endpoints[i]`.

use std::rc::Rc;

use brunel_engine::engine::Engine;
use brunel_engine::types::{SimError, SimResult};
use brunel_track::entity::{Entity, GetEntity};

use crate::connect_port;
use crate::link_control::{LinkControl, LinkControlParams};
use crate::router::{Router, RouterParams};
use crate::topology::dragonfly::{Dragonfly, DragonflyParams, RouteToGroup};
use crate::topology::fattree::{FatTree, FatTreeAlgorithm, FatTreeParams};
use crate::topology::hyperx::{HyperX, HyperXParams};
use crate::topology::mesh::{Mesh, MeshParams};
use crate::topology::single_router::SingleRouter;
use crate::topology::{PortState, Topology, decompose};

/// A built network: routers and one link control per endpoint.
pub struct Network {
    pub routers: Vec<Rc<Router>>,
    pub endpoints: Vec<Rc<LinkControl>>,
}

/// Wire an endpoint's link control to a router port, both directions.
pub fn connect_host(link: &LinkControl, router: &Router, port: usize) -> SimResult {
    connect_port!(link, rtr_tx => router, rx, port)?;
    connect_port!(router, tx, port => link, rtr_rx)
}

/// Wire two router ports together, both directions.
pub fn connect_routers(a: &Router, port_a: usize, b: &Router, port_b: usize) -> SimResult {
    connect_port!(a, tx, port_a => b, rx, port_b)?;
    connect_port!(b, tx, port_b => a, rx, port_a)
}

/// Attach a fresh link control to every host port of `router`, in
/// endpoint-id order.
fn attach_endpoints(
    engine: &Engine,
    parent: &Rc<Entity>,
    router: &Rc<Router>,
    topology: &dyn Topology,
    lc_params: &LinkControlParams,
    vns: usize,
    endpoints: &mut Vec<(i64, Rc<LinkControl>)>,
) -> SimResult {
    for port in 0..topology.num_ports() {
        if topology.port_state(port) != PortState::RouterToNic {
            continue;
        }
        let id = topology.endpoint_id(port);
        let link = LinkControl::new_and_register(
            engine,
            parent,
            &format!("nic{id}"),
            lc_params.clone(),
            vns,
        )?;
        connect_host(&link, router, port)?;
        endpoints.push((id, link));
    }
    Ok(())
}

fn into_endpoint_order(
    mut endpoints: Vec<(i64, Rc<LinkControl>)>,
) -> Result<Vec<Rc<LinkControl>>, SimError> {
    endpoints.sort_by_key(|(id, _)| *id);
    for (index, (id, _)) in endpoints.iter().enumerate() {
        if *id != index as i64 {
            return brunel_engine::sim_error!("endpoint ids are not dense: saw {id} at {index}");
        }
    }
    Ok(endpoints.into_iter().map(|(_, link)| link).collect())
}

/// One router with `num_endpoints` endpoints.
pub fn build_single_router(
    engine: &Engine,
    parent: &Rc<Entity>,
    num_endpoints: usize,
    router_params: RouterParams,
    lc_params: &LinkControlParams,
    vns: usize,
) -> Result<Network, SimError> {
    let topology = Rc::new(SingleRouter::new(parent, num_endpoints));
    let router = Router::new_and_register(
        engine,
        parent,
        "rtr",
        router_params,
        topology.clone(),
    )?;

    let mut endpoints = Vec::new();
    attach_endpoints(
        engine,
        parent,
        &router,
        topology.as_ref(),
        lc_params,
        vns,
        &mut endpoints,
    )?;

    Ok(Network {
        routers: vec![router],
        endpoints: into_endpoint_order(endpoints)?,
    })
}

/// A full mesh network of `params.num_routers()` routers.
pub fn build_mesh(
    engine: &Engine,
    parent: &Rc<Entity>,
    params: &MeshParams,
    router_params: &RouterParams,
    lc_params: &LinkControlParams,
    vns: usize,
) -> Result<Network, SimError> {
    let num_routers = params.num_routers();
    let mut routers = Vec::with_capacity(num_routers);
    let mut endpoints = Vec::new();

    for id in 0..num_routers {
        let topology = Rc::new(Mesh::new(parent, params.clone(), id)?);
        let router = Router::new_and_register(
            engine,
            parent,
            &format!("rtr{id}"),
            router_params.clone(),
            topology.clone(),
        )?;
        attach_endpoints(
            engine,
            parent,
            &router,
            topology.as_ref(),
            lc_params,
            vns,
            &mut endpoints,
        )?;
        routers.push(router);
    }

    // Positive-direction ports pair with the neighbour's negative ports
    for id in 0..num_routers {
        let loc = decompose(id, &params.shape);
        for dim in 0..params.shape.len() {
            if loc[dim] + 1 >= params.shape[dim] {
                continue;
            }
            let neighbour = id + stride(&params.shape, dim);
            for link in 0..params.width[dim] as usize {
                connect_routers(
                    &routers[id],
                    params.direction_port(dim, true, link),
                    &routers[neighbour],
                    params.direction_port(dim, false, link),
                )?;
            }
        }
    }

    Ok(Network {
        routers,
        endpoints: into_endpoint_order(endpoints)?,
    })
}

/// Router-index distance of one step in `dim`.
fn stride(shape: &[u32], dim: usize) -> usize {
    shape[..dim].iter().map(|s| *s as usize).product()
}

/// A hyperX network with every pair of routers in a dimension connected.
pub fn build_hyperx(
    engine: &Engine,
    parent: &Rc<Entity>,
    params: &HyperXParams,
    router_params: &RouterParams,
    lc_params: &LinkControlParams,
    vns: usize,
) -> Result<Network, SimError> {
    let num_routers = params.num_routers();
    let mut routers = Vec::with_capacity(num_routers);
    let mut endpoints = Vec::new();

    for id in 0..num_routers {
        let topology = Rc::new(HyperX::new(parent, params.clone(), id)?);
        let router = Router::new_and_register(
            engine,
            parent,
            &format!("rtr{id}"),
            router_params.clone(),
            topology.clone(),
        )?;
        attach_endpoints(
            engine,
            parent,
            &router,
            topology.as_ref(),
            lc_params,
            vns,
            &mut endpoints,
        )?;
        routers.push(router);
    }

    for id in 0..num_routers {
        let loc = decompose(id, &params.shape);
        for dim in 0..params.shape.len() {
            // Connect each router to every later router in the dimension
            for other in loc[dim] + 1..params.shape[dim] {
                let neighbour = id + (other - loc[dim]) as usize * stride(&params.shape, dim);
                for link in 0..params.width[dim] as usize {
                    connect_routers(
                        &routers[id],
                        params.bundle_port(dim, loc[dim], other, link),
                        &routers[neighbour],
                        params.bundle_port(dim, other, loc[dim], link),
                    )?;
                }
            }
        }
    }

    Ok(Network {
        routers,
        endpoints: into_endpoint_order(endpoints)?,
    })
}

/// A fat tree. Routers are returned level-major: all edge routers first.
pub fn build_fattree(
    engine: &Engine,
    parent: &Rc<Entity>,
    params: &FatTreeParams,
    algorithm: FatTreeAlgorithm,
    adaptive_threshold: f64,
    router_params: &RouterParams,
    lc_params: &LinkControlParams,
    vns: usize,
) -> Result<Network, SimError> {
    let routers_per_level = params.routers_per_level();
    let mut levels: Vec<Vec<Rc<Router>>> = Vec::with_capacity(params.num_levels());
    let mut endpoints = Vec::new();

    for (level, count) in routers_per_level.iter().enumerate() {
        let mut level_routers = Vec::with_capacity(*count);
        for level_id in 0..*count {
            let topology = Rc::new(FatTree::new(
                parent,
                params.clone(),
                level,
                level_id,
                algorithm,
                adaptive_threshold,
            )?);
            let router = Router::new_and_register(
                engine,
                parent,
                &format!("rtr_l{level}_{level_id}"),
                router_params.clone(),
                topology.clone(),
            )?;
            attach_endpoints(
                engine,
                parent,
                &router,
                topology.as_ref(),
                lc_params,
                vns,
                &mut endpoints,
            )?;
            level_routers.push(router);
        }
        levels.push(level_routers);
    }

    // Up port u of child j in a level-i group pairs with parent
    // u * group_size + j, whose down port is the child's group index
    // within the pod
    for level in 0..params.num_levels() - 1 {
        let (_, ups) = params.levels[level];
        let (parent_downs, _) = params.levels[level + 1];
        let group_size = routers_per_level[level] * params.subtree_hosts(level)
            / params.total_hosts();
        let parent_group_size = routers_per_level[level + 1] * params.subtree_hosts(level + 1)
            / params.total_hosts();

        for (r, child) in levels[level].iter().enumerate() {
            let group = r / group_size;
            let j = r % group_size;
            let pod = group * params.subtree_hosts(level) / params.subtree_hosts(level + 1);
            let child_index_in_pod = group % parent_downs;

            for u in 0..ups {
                let parent_index = pod * parent_group_size + u * group_size + j;
                let parent_router = &levels[level + 1][parent_index];
                let (downs, _) = params.levels[level];
                connect_routers(
                    child,
                    downs + u,
                    parent_router,
                    child_index_in_pod,
                )?;
            }
        }
    }

    Ok(Network {
        routers: levels.into_iter().flatten().collect(),
        endpoints: into_endpoint_order(endpoints)?,
    })
}

/// A dragonfly network. `global_link_map` defaults to the canonical
/// wiring when not given.
pub fn build_dragonfly(
    engine: &Engine,
    parent: &Rc<Entity>,
    params: &DragonflyParams,
    global_link_map: Option<Vec<i64>>,
    router_params: &RouterParams,
    lc_params: &LinkControlParams,
    vns: usize,
) -> Result<Network, SimError> {
    let map = global_link_map.unwrap_or_else(|| params.default_global_link_map());
    let route_to_group = RouteToGroup::new(params, &map)?;

    let a = params.routers_per_group as usize;
    let g = params.num_groups as usize;
    let p = params.hosts_per_router as usize;
    let num_routers = a * g;

    let mut routers = Vec::with_capacity(num_routers);
    let mut endpoints = Vec::new();
    for id in 0..num_routers {
        let topology = Rc::new(Dragonfly::new(
            parent,
            params.clone(),
            route_to_group.clone(),
            id,
        )?);
        let router = Router::new_and_register(
            engine,
            parent,
            &format!("rtr{id}"),
            router_params.clone(),
            topology.clone(),
        )?;
        attach_endpoints(
            engine,
            parent,
            &router,
            topology.as_ref(),
            lc_params,
            vns,
            &mut endpoints,
        )?;
        routers.push(router);
    }

    // Intra-group all-to-all: group ports skip the own router index
    for group in 0..g {
        for r1 in 0..a {
            for r2 in r1 + 1..a {
                connect_routers(
                    &routers[group * a + r1],
                    p + r2 - 1,
                    &routers[group * a + r2],
                    p + r1,
                )?;
            }
        }
    }

    // Global links, one bundle per group pair and slice
    for g1 in 0..params.num_groups {
        for g2 in g1 + 1..params.num_groups {
            for slice in 0..params.intergroup_links {
                let from = route_to_group.pair(g1, g2, slice)?;
                let to = route_to_group.pair(g2, g1, slice)?;
                connect_routers(
                    &routers[g1 as usize * a + from.router as usize],
                    from.port as usize,
                    &routers[g2 as usize * a + to.router as usize],
                    to.port as usize,
                )?;
            }
        }
    }

    Ok(Network {
        routers,
        endpoints: into_endpoint_order(endpoints)?,
    })
}
