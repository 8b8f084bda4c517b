// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Mesh networks: dimension-ordered delivery, hop timing and broadcast
//! coverage.

use std::cell::RefCell;
use std::rc::Rc;

use brunel_engine::engine::Engine;
use brunel_engine::run_simulation;
use brunel_engine::test_helpers::start_test;
use brunel_engine::traits::Event;
use brunel_fabric::builder::{Network, build_mesh};
use brunel_fabric::link_control::LinkControlParams;
use brunel_fabric::request::{BROADCAST_ADDR, NetworkRequest};
use brunel_fabric::router::RouterParams;
use brunel_fabric::topology::mesh::MeshParams;
use brunel_fabric::units::{Bandwidth, DataSize};
use brunel_track::entity::GetEntity;

fn build(engine: &mut Engine, shape: &str, width: &str, local_ports: usize) -> Network {
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
    let mesh_params = MeshParams::parse(shape, width, local_ports).unwrap();
    let top = engine.top().clone();
    build_mesh(engine, &top, &mesh_params, &router_params, &lc_params, 1).unwrap()
}

/// One 256-bit packet crosses a 2x2 mesh corner to corner: four flits,
/// three routers, one serialization per stage.
#[test]
fn corner_to_corner_timing() {
    let mut engine = start_test(file!());
    let network = build(&mut engine, "2x2", "1x1", 1);

    let sender = network.endpoints[0].clone();
    let receiver = network.endpoints[3].clone();

    let arrived = Rc::new(RefCell::new(false));
    {
        let arrived = arrived.clone();
        let receiver_link = receiver.clone();
        receiver.set_notify_on_receive(Box::new(move |vn| {
            if receiver_link.recv(vn).is_some() {
                *arrived.borrow_mut() = true;
            }
            true
        }));
    }

    {
        let sender = sender.clone();
        engine.spawn(async move {
            sender.initialized_event().listen().await;
            let entity = sender.entity().clone();
            let request = NetworkRequest::new(&entity, 0, 3, 0, 256);
            assert!(sender.send(request, 0));
            Ok(())
        });
    }

    run_simulation!(engine);

    assert!(*arrived.borrow());

    // 4 flits through the sender's link and three router outputs: four
    // serialization stages of 4 flit-times each at 64ns per flit
    let latency = &receiver.stats().packet_latency;
    assert_eq!(latency.count(), 1);
    let expected_ns = 4.0 * 4.0 * 64.0;
    assert!(
        (latency.min() - expected_ns).abs() < 1e-6,
        "latency {} != {expected_ns}",
        latency.min()
    );
}

/// All-pairs traffic on a 2x2x2 mesh with two endpoints per router is
/// delivered without loss.
#[test]
fn all_pairs_delivery() {
    let mut engine = start_test(file!());
    let network = build(&mut engine, "2x2x2", "1x1x1", 2);

    let num_endpoints = network.endpoints.len();
    assert_eq!(num_endpoints, 16);

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

/// An untimed broadcast floods a 3x3 mesh and reaches every other
/// endpoint exactly once.
#[test]
fn broadcast_covers_every_endpoint() {
    let mut engine = start_test(file!());
    let network = build(&mut engine, "3x3", "1x1", 1);

    // Broadcast from the centre router's endpoint
    let sender = network.endpoints[4].clone();
    let entity = sender.entity().clone();
    sender.send_untimed_data(NetworkRequest::new(&entity, 4, BROADCAST_ADDR, 0, 64));

    run_simulation!(engine);

    for (id, endpoint) in network.endpoints.iter().enumerate() {
        let mut count = 0;
        while endpoint.recv_untimed_data().is_some() {
            count += 1;
        }
        let expected = usize::from(id != 4);
        assert_eq!(count, expected, "endpoint {id} saw {count} copies");
    }
}

/// Multipath links share a dimension: traffic still arrives with width 2.
#[test]
fn parallel_links_deliver() {
    let mut engine = start_test(file!());
    let network = build(&mut engine, "4", "2", 1);

    let delivered = Rc::new(RefCell::new(0u64));
    {
        let delivered = delivered.clone();
        let link = network.endpoints[3].clone();
        network.endpoints[3].set_notify_on_receive(Box::new(move |vn| {
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
            for _ in 0..10 {
                loop {
                    let entity = sender.entity().clone();
                    let request = NetworkRequest::new(&entity, 0, 3, 0, 64);
                    if sender.send(request, 0) {
                        break;
                    }
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
    assert_eq!(*delivered.borrow(), 10);
}
