// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The reorder link control restores send order on top of routes that
//! deliberately reorder packets.

use std::rc::Rc;

use brunel_engine::engine::Engine;
use brunel_engine::run_simulation;
use brunel_engine::test_helpers::start_test;
use brunel_engine::traits::Event;
use brunel_fabric::builder::{Network, build_hyperx, build_single_router};
use brunel_fabric::link_control::{CheckerboardAlg, LinkControlParams};
use brunel_fabric::reorder_link_control::ReorderLinkControl;
use brunel_fabric::request::NetworkRequest;
use brunel_fabric::router::RouterParams;
use brunel_fabric::topology::hyperx::{HyperXAlgorithm, HyperXParams};
use brunel_fabric::units::{Bandwidth, DataSize};
use brunel_track::entity::GetEntity;

fn net_params() -> (RouterParams, LinkControlParams) {
    let link_bw = Bandwidth::parse("1Gb/s").unwrap();
    let flit = DataSize::parse("64b").unwrap();
    let router = RouterParams::new(link_bw, flit)
        .unwrap()
        .with_buffers(DataSize::parse("1KiB").unwrap(), DataSize::parse("1KiB").unwrap());
    let lc = LinkControlParams::new(
        link_bw,
        DataSize::parse("1KiB").unwrap(),
        DataSize::parse("1KiB").unwrap(),
    );
    (router, lc)
}

fn run_ordered_stream(engine: &mut Engine, network: &Network, src: usize, dest: usize) {
    let top = engine.top().clone();
    let sender = ReorderLinkControl::new_and_register(
        engine,
        &top,
        "ro_send",
        network.endpoints[src].clone(),
    )
    .unwrap();
    let receiver = ReorderLinkControl::new_and_register(
        engine,
        &top,
        "ro_recv",
        network.endpoints[dest].clone(),
    )
    .unwrap();

    let num_packets = 100u64;
    {
        let sender = sender.clone();
        let src = src as i64;
        let dest = dest as i64;
        engine.spawn(async move {
            sender.initialized_event().listen().await;
            let mut next = 0u64;
            while next < num_packets {
                let entity = sender.entity().clone();
                let request =
                    NetworkRequest::new(&entity, src, dest, 0, 128).set_payload(next);
                if sender.send(request, 0) {
                    next += 1;
                } else {
                    let resume = brunel_engine::events::once::Once::default();
                    let notify = resume.clone();
                    sender.set_notify_on_send(Box::new(move |_vn| {
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

    // The receiving endpoint observes 0, 1, 2, ... regardless of the
    // order the fabric produced
    let mut expected = 0u64;
    while let Some(request) = receiver.recv(0) {
        assert_eq!(request.payload.unwrap(), expected);
        assert_eq!(request.seq.unwrap() as u64, expected);
        expected += 1;
    }
    assert_eq!(expected, num_packets);
}

/// Valiant routing sprays a flow over random intermediate routers, so
/// packets genuinely race; the receiver still sees them in order.
#[test]
fn valiant_stream_recovers_order() {
    let mut engine = start_test(file!());
    let (router_params, lc_params) = net_params();
    let params = HyperXParams::parse("3x3", "1x1", 1, HyperXAlgorithm::Valiant).unwrap();
    let top = engine.top().clone();
    let network =
        build_hyperx(&mut engine, &top, &params, &router_params, &lc_params, 1).unwrap();

    run_ordered_stream(&mut engine, &network, 0, 8);
}

/// Round-robin checkerboarding spreads one flow over two VCs; with the
/// reorder link control on both ends the stream still arrives in order.
#[test]
fn roundrobin_checkerboard_recovers_order() {
    let mut engine = start_test(file!());
    let (router_params, lc_params) = net_params();
    let lc_params = lc_params.with_checkerboard(2, CheckerboardAlg::RoundRobin);
    let top = engine.top().clone();
    let network =
        build_single_router(&mut engine, &top, 2, router_params, &lc_params, 1).unwrap();

    run_ordered_stream(&mut engine, &network, 0, 1);
}

/// Sequence numbers are assigned per destination.
#[test]
fn per_destination_sequences() {
    let mut engine = start_test(file!());
    let (router_params, lc_params) = net_params();
    let top = engine.top().clone();
    let network =
        build_single_router(&mut engine, &top, 3, router_params, &lc_params, 1).unwrap();

    let sender = ReorderLinkControl::new_and_register(
        &engine,
        &top,
        "ro_send",
        network.endpoints[0].clone(),
    )
    .unwrap();
    let recv1 = ReorderLinkControl::new_and_register(
        &engine,
        &top,
        "ro_recv1",
        network.endpoints[1].clone(),
    )
    .unwrap();
    let recv2 = ReorderLinkControl::new_and_register(
        &engine,
        &top,
        "ro_recv2",
        network.endpoints[2].clone(),
    )
    .unwrap();

    {
        let sender = sender.clone();
        engine.spawn(async move {
            sender.initialized_event().listen().await;
            for index in 0..6u64 {
                let dest = 1 + (index % 2) as i64;
                let entity = sender.entity().clone();
                let request =
                    NetworkRequest::new(&entity, 0, dest, 0, 64).set_payload(index);
                assert!(sender.send(request, 0));
            }
            Ok(())
        });
    }

    run_simulation!(engine);

    // Each destination sees its own dense sequence 0, 1, 2
    for receiver in [&recv1, &recv2] {
        let mut seqs = Vec::new();
        while let Some(request) = receiver.recv(0) {
            seqs.push(request.seq.unwrap());
        }
        assert_eq!(seqs, vec![0, 1, 2]);
    }
}
