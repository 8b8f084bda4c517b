// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Bridging two networks through an address-translating gateway.

use std::cell::RefCell;
use std::rc::Rc;

use brunel_engine::run_simulation;
use brunel_engine::test_helpers::start_test;
use brunel_engine::traits::Event;
use brunel_engine::types::{SimError, SimResult};
use brunel_fabric::bridge::{Bridge, BridgeParams, Translator};
use brunel_fabric::builder::connect_host;
use brunel_fabric::event::{InternalEvent, PacketEvent, RouteState};
use brunel_fabric::link_control::{LinkControl, LinkControlParams};
use brunel_fabric::request::{BROADCAST_ADDR, NetworkRequest, NodeId};
use brunel_fabric::router::{Router, RouterParams};
use brunel_fabric::topology::{PortState, Topology};
use brunel_fabric::units::{Bandwidth, DataSize};
use brunel_track::entity::GetEntity;

/// A two-port router: port 0 carries the local endpoint, everything that
/// is not addressed to it leaves through the gateway on port 1.
struct Gateway;

impl Topology for Gateway {
    fn process_input(&self, packet: PacketEvent) -> Result<InternalEvent, SimError> {
        Ok(InternalEvent::new(packet, RouteState::Direct))
    }

    fn route(&self, _port: usize, _vc: usize, ev: &mut InternalEvent) -> SimResult {
        ev.next_port = usize::from(ev.dest() != 0);
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
            for out in 0..2 {
                if out != port {
                    out_ports.push(out);
                }
            }
        } else {
            self.route(port, 0, ev)?;
            out_ports.push(ev.next_port);
        }
        Ok(())
    }

    fn port_state(&self, port: usize) -> PortState {
        if port < 2 {
            PortState::RouterToNic
        } else {
            PortState::Unconnected
        }
    }

    fn num_ports(&self) -> usize {
        2
    }

    fn endpoint_id(&self, port: usize) -> NodeId {
        port as NodeId
    }
}

/// Forwards addresses above 1024 with the offset stripped, drops the
/// rest.
struct OffsetTranslator;

impl Translator for OffsetTranslator {
    fn translate(&self, request: NetworkRequest, _from_network: usize) -> Option<NetworkRequest> {
        if request.dest < 1024 {
            return None;
        }
        let mut translated = request;
        translated.dest -= 1024;
        Some(translated)
    }

    fn init_translate(
        &self,
        request: NetworkRequest,
        from_network: usize,
    ) -> Option<NetworkRequest> {
        self.translate(request, from_network)
    }
}

#[test]
fn translated_packets_cross_dropped_ones_do_not() {
    let mut engine = start_test(file!());
    let top = engine.top().clone();

    let link_bw = Bandwidth::parse("1Gb/s").unwrap();
    let flit = DataSize::parse("64b").unwrap();
    let router_params = RouterParams::new(link_bw, flit)
        .unwrap()
        .with_buffers(DataSize::parse("1KiB").unwrap(), DataSize::parse("1KiB").unwrap());
    let lc_params = LinkControlParams::new(
        link_bw,
        DataSize::parse("1KiB").unwrap(),
        DataSize::parse("1KiB").unwrap(),
    );

    // Two independent single-gateway networks
    let router0 = Router::new_and_register(
        &engine,
        &top,
        "rtr_net0",
        router_params.clone(),
        Rc::new(Gateway),
    )
    .unwrap();
    let router1 = Router::new_and_register(
        &engine,
        &top,
        "rtr_net1",
        router_params,
        Rc::new(Gateway),
    )
    .unwrap();

    let source =
        LinkControl::new_and_register(&engine, &top, "source", lc_params.clone(), 1).unwrap();
    connect_host(&source, &router0, 0).unwrap();

    let sink = LinkControl::new_and_register(&engine, &top, "sink", lc_params.clone(), 1).unwrap();
    connect_host(&sink, &router1, 0).unwrap();

    // The bridge occupies port 1 on both networks
    let bridge_params = BridgeParams {
        network_bw: link_bw,
        network_input_buffer_size: DataSize::parse("1KiB").unwrap(),
        network_output_buffer_size: DataSize::parse("1KiB").unwrap(),
        vns: 1,
    };
    let bridge = Bridge::new_and_register(
        &engine,
        &top,
        "bridge",
        bridge_params,
        Rc::new(OffsetTranslator),
    )
    .unwrap();
    bridge.connect_port_network0_tx(router0.port_rx_i(1)).unwrap();
    router0.connect_port_tx_i(1, bridge.port_network0_rx()).unwrap();
    bridge.connect_port_network1_tx(router1.port_rx_i(1)).unwrap();
    router1.connect_port_tx_i(1, bridge.port_network1_rx()).unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    {
        let received = received.clone();
        let link = sink.clone();
        sink.set_notify_on_receive(Box::new(move |vn| {
            while let Some(request) = link.recv(vn) {
                received.borrow_mut().push((request.dest, request.payload));
            }
            true
        }));
    }

    {
        let source = source.clone();
        engine.spawn(async move {
            source.initialized_event().listen().await;
            for index in 0..10u64 {
                // Even packets carry a translatable address, odd ones are
                // local to network 0 and die at the translator
                let dest = if index % 2 == 0 { 1024 } else { 7 };
                loop {
                    let entity = source.entity().clone();
                    let request =
                        NetworkRequest::new(&entity, 0, dest, 0, 128).set_payload(index);
                    if source.send(request, 0) {
                        break;
                    }
                    let resume = brunel_engine::events::once::Once::default();
                    let notify = resume.clone();
                    source.set_notify_on_send(Box::new(move |_vn| {
                        let _ = notify.notify();
                        false
                    }));
                    resume.listen().await;
                }
            }
            Ok(())
        });
    }

    run_simulation!(engine);

    // The bridge addresses on both networks are port 1
    assert_eq!(bridge.addr_for_network(0), 1);
    assert_eq!(bridge.addr_for_network(1), 1);

    // All ten packets reached the bridge; five survived translation
    assert_eq!(bridge.stats(0).pkts_received.value(), 10);
    assert_eq!(bridge.stats(1).pkts_sent.value(), 5);
    assert_eq!(bridge.stats(1).pkts_received.value(), 0);
    assert_eq!(bridge.stats(0).pkts_sent.value(), 0);

    let received = received.borrow();
    assert_eq!(received.len(), 5);
    for (index, (dest, payload)) in received.iter().enumerate() {
        assert_eq!(*dest, 0);
        assert_eq!(payload.unwrap(), index as u64 * 2);
    }
}
