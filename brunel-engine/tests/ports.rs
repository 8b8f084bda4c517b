// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::cell::RefCell;
use std::rc::Rc;

use brunel_engine::port::{InPort, OutPort};
use brunel_engine::test_helpers::start_test;
use brunel_track::entity::Entity;

#[test]
fn put_get_pairs() {
    let mut engine = start_test(file!());

    let entity = Rc::new(Entity::new(engine.top(), "pair"));
    let rx = InPort::new(&entity, "rx");
    let mut tx = OutPort::new(&entity, "tx");
    tx.connect(rx.state()).unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));

    {
        let received = received.clone();
        engine.spawn(async move {
            for _ in 0..3 {
                let value: usize = rx.get()?.await;
                received.borrow_mut().push(value);
            }
            Ok(())
        });
    }

    engine.spawn(async move {
        for i in 0..3usize {
            tx.put(i)?.await;
        }
        Ok(())
    });

    engine.run().unwrap();
    assert_eq!(*received.borrow(), vec![0, 1, 2]);
}

#[test]
fn double_connect_is_an_error() {
    let engine = start_test(file!());

    let entity = Rc::new(Entity::new(engine.top(), "dup"));
    let rx: InPort<i32> = InPort::new(&entity, "rx");

    assert!(rx.state().is_ok());
    let second = rx.state();
    assert!(second.is_err());
}

#[test]
fn unconnected_out_port_is_an_error() {
    let engine = start_test(file!());

    let entity = Rc::new(Entity::new(engine.top(), "lonely"));
    let tx: OutPort<i32> = OutPort::new(&entity, "tx");

    assert!(tx.put(5).is_err());
    assert!(tx.try_put().is_err());
}

#[test]
fn unconnected_in_port_is_an_error() {
    let engine = start_test(file!());

    let entity = Rc::new(Entity::new(engine.top(), "lonely_rx"));
    let rx: InPort<i32> = InPort::new(&entity, "rx");

    assert!(rx.get().is_err());
    assert!(rx.start_get().is_err());
}
