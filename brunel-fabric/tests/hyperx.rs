// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! HyperX networks under the minimal and adaptive algorithms.

use std::cell::RefCell;
use std::rc::Rc;

use brunel_engine::engine::Engine;
use brunel_engine::run_simulation;
use brunel_engine::test_helpers::start_test;
use brunel_engine::traits::Event;
use brunel_fabric::builder::{Network, build_hyperx};
use brunel_fabric::link_control::LinkControlParams;
use brunel_fabric::request::NetworkRequest;
use brunel_fabric::router::RouterParams;
use brunel_fabric::topology::hyperx::{HyperXAlgorithm, HyperXParams};
use brunel_fabric::units::{Bandwidth, DataSize};
use brunel_track::entity::GetEntity;

fn build(engine: &mut Engine, algorithm: HyperXAlgorithm) -> Network {
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
    let params = HyperXParams::parse("3x3", "1x1", 1, algorithm).unwrap();
    let top = engine.top().clone();
    build_hyperx(engine, &top, &params, &router_params, &lc_params, 1).unwrap()
}

fn all_pairs(engine: &mut Engine, network: &Network) -> Vec<Rc<RefCell<u64>>> {
    let num_endpoints = network.endpoints.len();
    let received: Vec<Rc<RefCell<u64>>> =
        (0..num_endpoints).map(|_| Rc::new(RefCell::new(0))).collect();
    for (id, endpoint) in network.endpoints.iter().enumerate() {
        let counter = received[id].clone();
        let link = endpoint.clone();
        endpoint.set_notify_on_receive(Box::new(move |vn| {
            while link.recv(vn).is_some() {
                *counter.borrow_mut() += 1;
            }
            true
        }));
    }

    for (id, endpoint) in network.endpoints.iter().enumerate() {
        let endpoint = endpoint.clone();
        engine.spawn(async move {
            endpoint.initialized_event().listen().await;
            for dest in 0..num_endpoints {
                if dest == id {
                    continue;
                }
                loop {
                    let entity = endpoint.entity().clone();
                    let request =
                        NetworkRequest::new(&entity, id as i64, dest as i64, 0, 128);
                    if endpoint.send(request, 0) {
                        break;
                    }
                    let resume = brunel_engine::events::once::Once::default();
                    let notify = resume.clone();
                    endpoint.set_notify_on_send(Box::new(move |_vn| {
                        let _ = notify.notify();
                        false
                    }));
                    resume.listen().await;
                }
            }
            Ok(())
        });
    }

    received
}

/// Any pair of routers is at most two hops apart: a direct-dimension
/// packet takes three serialization stages.
#[test]
fn single_dimension_hop() {
    let mut engine = start_test(file!());
    let network = build(&mut engine, HyperXAlgorithm::Dor);

    let receiver = network.endpoints[2].clone();
    {
        let link = receiver.clone();
        receiver.set_notify_on_receive(Box::new(move |vn| {
            while link.recv(vn).is_some() {}
            true
        }));
    }

    {
        let sender = network.endpoints[0].clone();
        engine.spawn(async move {
            sender.initialized_event().listen().await;
            let entity = sender.entity().clone();
            // Router 0 to router 2: same row, one hop even though the
            // coordinate distance is two
            let request = NetworkRequest::new(&entity, 0, 2, 0, 256);
            assert!(sender.send(request, 0));
            Ok(())
        });
    }

    run_simulation!(engine);

    let latency = &receiver.stats().packet_latency;
    assert_eq!(latency.count(), 1);
    let expected_ns = 3.0 * 4.0 * 64.0;
    assert!(
        (latency.min() - expected_ns).abs() < 1e-6,
        "latency {} != {expected_ns}",
        latency.min()
    );
}

#[test]
fn dor_all_pairs() {
    let mut engine = start_test(file!());
    let network = build(&mut engine, HyperXAlgorithm::Dor);
    let received = all_pairs(&mut engine, &network);

    run_simulation!(engine);

    for (id, counter) in received.iter().enumerate() {
        assert_eq!(*counter.borrow(), 8, "endpoint {id} lost packets");
    }
}

/// Minimal-adaptive picks ports by credit count but still delivers the
/// full pattern.
#[test]
fn mina_all_pairs() {
    let mut engine = start_test(file!());
    let network = build(&mut engine, HyperXAlgorithm::Mina);
    let received = all_pairs(&mut engine, &network);

    run_simulation!(engine);

    for (id, counter) in received.iter().enumerate() {
        assert_eq!(*counter.borrow(), 8, "endpoint {id} lost packets");
    }
}

/// The DOAL variant adapts only within a dimension's parallel links.
#[test]
fn doal_all_pairs() {
    let mut engine = start_test(file!());
    let network = build(&mut engine, HyperXAlgorithm::Doal);
    let received = all_pairs(&mut engine, &network);

    run_simulation!(engine);

    for (id, counter) in received.iter().enumerate() {
        assert_eq!(*counter.borrow(), 8, "endpoint {id} lost packets");
    }
}
