// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A bridge between two independent networks.
//!
//! The bridge owns one [`LinkControl`] per network and a pluggable
//! [`Translator`] that decides, per packet, whether and how to forward it
//! onto the opposite network. Translated packets queue per direction and
//! drain as the opposite link has space, so a congested far side
//! backpressures the bridge rather than dropping traffic.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use async_trait::async_trait;
use brunel_engine::engine::Engine;
use brunel_engine::events::repeated::Repeated;
use brunel_engine::executor::Spawner;
use brunel_engine::port::PortStateResult;
use brunel_engine::sim_error;
use brunel_engine::traits::{Event, Runnable};
use brunel_engine::types::{SimError, SimResult};
use brunel_model_builder::{EntityDisplay, EntityGet};
use brunel_track::entity::Entity;
use brunel_track::trace;

use crate::event::FabricEvent;
use crate::link_control::{LinkControl, LinkControlParams};
use crate::request::{NetworkRequest, NodeId};
use crate::stats::Counter;
use crate::units::{Bandwidth, DataSize};

/// Decides the fate of packets crossing the bridge.
pub trait Translator {
    /// Return the request to send on the opposite network, or `None` to
    /// drop the packet.
    fn translate(&self, request: NetworkRequest, from_network: usize) -> Option<NetworkRequest>;

    /// Init-phase variant of [`translate`](Translator::translate).
    fn init_translate(
        &self,
        request: NetworkRequest,
        from_network: usize,
    ) -> Option<NetworkRequest>;
}

#[derive(Clone, Debug)]
pub struct BridgeParams {
    pub network_bw: Bandwidth,
    pub network_input_buffer_size: DataSize,
    pub network_output_buffer_size: DataSize,
    pub vns: usize,
}

impl Default for BridgeParams {
    fn default() -> Self {
        Self {
            // 80GiB/s and 1KiB buffers unless told otherwise
            network_bw: Bandwidth::from_bits_per_sec(80.0 * 1024.0 * 1024.0 * 1024.0 * 8.0),
            network_input_buffer_size: DataSize::from_bits(8 * 1024),
            network_output_buffer_size: DataSize::from_bits(8 * 1024),
            vns: 1,
        }
    }
}

/// Per-network packet counters.
#[derive(Default)]
pub struct NicStats {
    pub pkts_received: Counter,
    pub pkts_sent: Counter,
}

struct BridgeState {
    entity: Rc<Entity>,
    vns: usize,
    send_queues: [RefCell<VecDeque<NetworkRequest>>; 2],
    stats: [NicStats; 2],
    kick: Repeated<()>,
}

/// Connects two networks as if they were one.
#[derive(EntityGet, EntityDisplay)]
pub struct Bridge {
    entity: Rc<Entity>,
    spawner: Spawner,
    nics: [Rc<LinkControl>; 2],
    translator: Rc<dyn Translator>,
    state: Rc<BridgeState>,
}

impl Bridge {
    pub fn new_and_register(
        engine: &Engine,
        parent: &Rc<Entity>,
        name: &str,
        params: BridgeParams,
        translator: Rc<dyn Translator>,
    ) -> Result<Rc<Self>, SimError> {
        let entity = Rc::new(Entity::new(parent, name));

        let lc_params = LinkControlParams::new(
            params.network_bw,
            params.network_input_buffer_size,
            params.network_output_buffer_size,
        );
        let nic0 =
            LinkControl::new_and_register(engine, &entity, "nic0", lc_params.clone(), params.vns)?;
        let nic1 =
            LinkControl::new_and_register(engine, &entity, "nic1", lc_params, params.vns)?;

        let state = Rc::new(BridgeState {
            entity: entity.clone(),
            vns: params.vns,
            send_queues: [RefCell::new(VecDeque::new()), RefCell::new(VecDeque::new())],
            stats: [NicStats::default(), NicStats::default()],
            kick: Repeated::default(),
        });

        let rc_self = Rc::new(Self {
            entity,
            spawner: engine.spawner(),
            nics: [nic0, nic1],
            translator,
            state,
        });
        engine.register(rc_self.clone());
        Ok(rc_self)
    }

    pub fn connect_port_network0_tx(&self, port_state: PortStateResult<FabricEvent>) -> SimResult {
        self.nics[0].connect_port_rtr_tx(port_state)
    }

    pub fn port_network0_rx(&self) -> PortStateResult<FabricEvent> {
        self.nics[0].port_rtr_rx()
    }

    pub fn connect_port_network1_tx(&self, port_state: PortStateResult<FabricEvent>) -> SimResult {
        self.nics[1].connect_port_rtr_tx(port_state)
    }

    pub fn port_network1_rx(&self) -> PortStateResult<FabricEvent> {
        self.nics[1].port_rtr_rx()
    }

    /// The bridge's endpoint address on the given network.
    pub fn addr_for_network(&self, network: usize) -> NodeId {
        self.nics[network].endpoint_id()
    }

    /// Packet counters for the given network interface.
    pub fn stats(&self, network: usize) -> &NicStats {
        &self.state.stats[network]
    }
}

#[async_trait(?Send)]
impl Runnable for Bridge {
    async fn run(&self) -> SimResult {
        // Both interfaces wake the forwarding task, whether data arrived
        // or space opened up
        for nic in &self.nics {
            let kick = self.state.kick.clone();
            nic.set_notify_on_receive(Box::new(move |_vn| {
                let _ = kick.notify();
                true
            }));
            let kick = self.state.kick.clone();
            nic.set_notify_on_send(Box::new(move |_vn| {
                let _ = kick.notify();
                true
            }));
        }

        let state = self.state.clone();
        let nics = self.nics.clone();
        let translator = self.translator.clone();
        self.spawner.spawn(async move {
            loop {
                for id in 0..2 {
                    let other = 1 - id;

                    // Incoming traffic translates onto the opposite queue
                    for vn in 0..state.vns {
                        while let Some(request) = nics[id].recv(vn) {
                            state.stats[id].pkts_received.increment();
                            match translator.translate(request, id) {
                                Some(request) => {
                                    state.send_queues[other].borrow_mut().push_back(request);
                                }
                                None => {
                                    trace!(state.entity ; "dropped packet from network {id}");
                                }
                            }
                        }
                    }
                    while let Some(request) = nics[id].recv_untimed_data() {
                        if let Some(request) = translator.init_translate(request, id) {
                            nics[other].send_untimed_data(request);
                        }
                    }

                    // Drain this side's queue as capacity allows
                    loop {
                        let (vn, bits) = {
                            let queue = state.send_queues[id].borrow();
                            match queue.front() {
                                Some(request) => (request.vn, request.size_in_bits),
                                None => break,
                            }
                        };
                        if !nics[id].space_to_send(vn, bits) {
                            break;
                        }
                        let request = match state.send_queues[id].borrow_mut().pop_front() {
                            Some(request) => request,
                            None => break,
                        };
                        if !nics[id].send(request, vn) {
                            return sim_error!(
                                "{}: send refused despite available space",
                                state.entity
                            );
                        }
                        state.stats[id].pkts_sent.increment();
                    }
                }

                state.kick.listen().await;
            }
        });
        Ok(())
    }
}
