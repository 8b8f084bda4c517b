// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Fat-tree networks: up/down delivery under both routing algorithms.

use std::cell::RefCell;
use std::rc::Rc;

use brunel_engine::engine::Engine;
use brunel_engine::run_simulation;
use brunel_engine::test_helpers::start_test;
use brunel_engine::traits::Event;
use brunel_fabric::builder::{Network, build_fattree};
use brunel_fabric::link_control::LinkControlParams;
use brunel_fabric::request::NetworkRequest;
use brunel_fabric::router::RouterParams;
use brunel_fabric::topology::fattree::{FatTreeAlgorithm, FatTreeParams};
use brunel_fabric::units::{Bandwidth, DataSize};
use brunel_track::entity::GetEntity;

fn build(engine: &mut Engine, shape: &str, algorithm: FatTreeAlgorithm) -> Network {
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
    let params = FatTreeParams::parse(shape).unwrap();
    let top = engine.top().clone();
    build_fattree(
        engine,
        &top,
        &params,
        algorithm,
        1.0,
        &router_params,
        &lc_params,
        1,
    )
    .unwrap()
}

/// Host 0 to host 3 crosses the tree: up to a root and down the other
/// side, four serialization stages.
#[test]
fn up_and_over() {
    let mut engine = start_test(file!());
    let network = build(&mut engine, "2,2:2,2", FatTreeAlgorithm::Deterministic);
    assert_eq!(network.endpoints.len(), 4);

    let receiver = network.endpoints[3].clone();
    let delivered = Rc::new(RefCell::new(0u64));
    {
        let delivered = delivered.clone();
        let link = receiver.clone();
        receiver.set_notify_on_receive(Box::new(move |vn| {
            while link.recv(vn).is_some() {
                *delivered.borrow_mut() += 1;
            }
            true
        }));
    }

    {
        let sender = network.endpoints[0].clone();
        engine.spawn(async move {
            sender.initialized_event().listen().await;
            let entity = sender.entity().clone();
            let request = NetworkRequest::new(&entity, 0, 3, 0, 256);
            assert!(sender.send(request, 0));
            Ok(())
        });
    }

    run_simulation!(engine);

    assert_eq!(*delivered.borrow(), 1);

    // NIC link, edge router up, root router down, edge router down: 4
    // stages of 4 flits at 64ns each
    let latency = &receiver.stats().packet_latency;
    let expected_ns = 4.0 * 4.0 * 64.0;
    assert!(
        (latency.min() - expected_ns).abs() < 1e-6,
        "latency {} != {expected_ns}",
        latency.min()
    );
}

/// Traffic inside one edge router's subtree never climbs: a single
/// serialization stage separates the hosts beyond the NIC link.
#[test]
fn local_traffic_stays_low() {
    let mut engine = start_test(file!());
    let network = build(&mut engine, "2,2:2,2", FatTreeAlgorithm::Deterministic);

    let receiver = network.endpoints[1].clone();
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
            let request = NetworkRequest::new(&entity, 0, 1, 0, 256);
            assert!(sender.send(request, 0));
            Ok(())
        });
    }

    run_simulation!(engine);

    let latency = &receiver.stats().packet_latency;
    assert_eq!(latency.count(), 1);
    let expected_ns = 2.0 * 4.0 * 64.0;
    assert!(
        (latency.min() - expected_ns).abs() < 1e-6,
        "latency {} != {expected_ns}",
        latency.min()
    );
}

/// A bigger three-level tree delivers an all-pairs pattern under
/// adaptive routing.
#[test]
fn adaptive_all_pairs() {
    let mut engine = start_test(file!());
    let network = build(&mut engine, "2,2:2,2:2", FatTreeAlgorithm::Adaptive);
    let num_endpoints = network.endpoints.len();
    assert_eq!(num_endpoints, 8);

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

    run_simulation!(engine);

    for (id, counter) in received.iter().enumerate() {
        assert_eq!(
            *counter.borrow(),
            (num_endpoints - 1) as u64,
            "endpoint {id} lost packets"
        );
    }
}
