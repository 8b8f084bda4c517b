// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::cell::RefCell;
use std::rc::Rc;

use async_trait::async_trait;
use brunel_engine::engine::Engine;
use brunel_engine::port::{InPort, OutPort, PortStateResult};
use brunel_engine::test_helpers::start_test;
use brunel_engine::traits::Runnable;
use brunel_engine::types::{SimError, SimResult};
use brunel_engine::{run_simulation, sim_error};
use brunel_track::entity::Entity;

struct Producer {
    entity: Rc<Entity>,
    tx: RefCell<Option<OutPort<i32>>>,
    count: usize,
}

impl Producer {
    fn new_and_register(engine: &Engine, name: &str, count: usize) -> Rc<Self> {
        let entity = Rc::new(Entity::new(engine.top(), name));
        let tx = OutPort::new(&entity, "tx");
        let rc_self = Rc::new(Self {
            entity,
            tx: RefCell::new(Some(tx)),
            count,
        });
        engine.register(rc_self.clone());
        rc_self
    }

    fn connect_port_tx(&self, port_state: PortStateResult<i32>) -> SimResult {
        self.tx.borrow_mut().as_mut().unwrap().connect(port_state)
    }
}

#[async_trait(?Send)]
impl Runnable for Producer {
    async fn run(&self) -> SimResult {
        let tx = self.tx.borrow_mut().take().unwrap();
        for i in 0..self.count {
            tx.put(i as i32)?.await;
        }
        Ok(())
    }
}

struct Consumer {
    entity: Rc<Entity>,
    rx: RefCell<Option<InPort<i32>>>,
    seen: RefCell<Vec<i32>>,
}

impl Consumer {
    fn new_and_register(engine: &Engine, name: &str) -> Rc<Self> {
        let entity = Rc::new(Entity::new(engine.top(), name));
        let rx = InPort::new(&entity, "rx");
        let rc_self = Rc::new(Self {
            entity,
            rx: RefCell::new(Some(rx)),
            seen: RefCell::new(Vec::new()),
        });
        engine.register(rc_self.clone());
        rc_self
    }

    fn port_rx(&self) -> PortStateResult<i32> {
        self.rx.borrow().as_ref().unwrap().state()
    }
}

#[async_trait(?Send)]
impl Runnable for Consumer {
    async fn run(&self) -> SimResult {
        let rx = self.rx.borrow_mut().take().unwrap();
        loop {
            let value = rx.get()?.await;
            self.seen.borrow_mut().push(value);
        }
    }
}

#[test]
fn registered_components_run() {
    let mut engine = start_test(file!());

    let producer = Producer::new_and_register(&engine, "producer", 10);
    let consumer = Consumer::new_and_register(&engine, "consumer");

    producer.connect_port_tx(consumer.port_rx()).unwrap();

    run_simulation!(engine);

    assert_eq!(*consumer.seen.borrow(), (0..10).collect::<Vec<i32>>());
    assert_eq!(producer.entity.full_name(), "top::producer");
    assert_eq!(consumer.entity.full_name(), "top::consumer");
}

#[test]
fn task_error_stops_simulation() {
    let mut engine = start_test(file!());

    engine.spawn(async move {
        let e: Result<(), SimError> = sim_error!("deliberate failure");
        e
    });

    run_simulation!(engine, "Error: deliberate failure");
}
