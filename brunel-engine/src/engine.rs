// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;

use brunel_track::Tracker;
use brunel_track::entity::{Entity, toplevel};
use brunel_track::tracker::stdout_tracker;

use crate::executor::{self, Executor, Spawner};
use crate::time::clock::Clock;
use crate::types::{Component, SimResult};

/// Use a default clock frequency of 1GHz.
const DEFAULT_CLOCK_MHZ: f64 = 1000.0;

pub struct Engine {
    pub executor: Executor,
    spawner: Spawner,
    toplevel: Rc<Entity>,
    tracker: Tracker,
    components: RefCell<Vec<Component>>,
}

impl Engine {
    /// Create a standalone engine.
    pub fn new(tracker: &Tracker) -> Self {
        let toplevel = toplevel(tracker, "top");
        let (executor, spawner) = executor::new_executor_and_spawner(&toplevel);
        Self {
            executor,
            spawner,
            toplevel,
            tracker: tracker.clone(),
            components: RefCell::new(Vec::new()),
        }
    }

    /// Register a component so that its `run()` is spawned when the
    /// simulation starts.
    pub fn register(&self, component: Component) {
        self.components.borrow_mut().push(component);
    }

    /// Spawn all registered components and run the simulation until no more
    /// progress can be made.
    pub fn run(&mut self) -> SimResult {
        for component in self.components.borrow_mut().drain(..) {
            self.executor
                .spawn(async move { component.run().await });
        }

        // Pass an atomic bool that will never be set to true
        let finished = Rc::new(AtomicBool::new(false));
        self.executor.run(finished)
    }

    pub fn spawn(&self, future: impl Future<Output = SimResult> + 'static) {
        self.executor.spawn(future);
    }

    pub fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }

    pub fn default_clock(&mut self) -> Clock {
        self.executor.get_clock(DEFAULT_CLOCK_MHZ)
    }

    pub fn clock_mhz(&mut self, freq_mhz: f64) -> Clock {
        self.executor.get_clock(freq_mhz)
    }

    pub fn clock_ghz(&mut self, freq_ghz: f64) -> Clock {
        self.executor.get_clock(freq_ghz * 1000.0)
    }

    pub fn time_now_ns(&self) -> f64 {
        self.executor.time_now_ns()
    }

    pub fn top(&self) -> &Rc<Entity> {
        &self.toplevel
    }

    pub fn tracker(&self) -> Tracker {
        self.tracker.clone()
    }
}

/// Create a default engine that sends track events to stdout.
///
/// This is provided to keep documentation examples simple with fewer
/// concepts to have to consider at once.
impl Default for Engine {
    fn default() -> Self {
        let tracker = stdout_tracker(log::Level::Warn);
        Self::new(&tracker)
    }
}
