// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! This module provides helper functions for testing logging output
//!
//! The aim of this module is to provide commonly-used functions that enable
//! the testing of the output that should appear from logging macros.

use std::cell::RefCell;
use std::rc::Rc;

use regex::Regex;

use crate::tracker::{EntityManager, TextTracker, dev_null_tracker};
use crate::{Id, Track, Tracker};

/// A tracker that keeps track events in memory for checking later.
pub struct TestTracker {
    events: RefCell<Vec<String>>,

    unique_id: RefCell<u64>,
}

impl TestTracker {
    /// Create a new [`Tracker`](crate::Tracker) for the tests.
    #[must_use]
    pub fn new(initial_id: u64) -> Self {
        Self {
            events: RefCell::new(Vec::new()),
            unique_id: RefCell::new(initial_id),
        }
    }

    fn add_event(&self, event: String) {
        println!("{event}");
        self.events.borrow_mut().push(event);
    }
}

impl Track for TestTracker {
    fn unique_id(&self) -> Id {
        let mut guard = self.unique_id.borrow_mut();
        let id = *guard;
        *guard += 1;
        Id(id)
    }

    fn is_entity_enabled(&self, _id: Id, _level: log::Level) -> bool {
        true
    }

    fn add_entity(&self, _id: Id, _entity_name: &str) {
        // Do nothing
    }

    fn enter(&self, id: Id, item: Id) {
        self.add_event(format!("{id}: {item} entered"));
    }

    fn exit(&self, id: Id, item: Id) {
        self.add_event(format!("{id}: {item} exited"));
    }

    fn value(&self, id: Id, value: f64) {
        self.add_event(format!("{id}: value {value}"));
    }

    fn create(&self, created_by: Id, id: Id, num_bytes: usize, req_type: i8, name: &str) {
        self.add_event(format!(
            "{created_by}: created {id}, {name}, {req_type}, {num_bytes} bytes"
        ));
    }

    fn destroy(&self, destroyed_by: Id, id: Id) {
        self.add_event(format!("{destroyed_by}: destroyed {id}"));
    }

    fn connect(&self, connect_from: Id, connect_to: Id) {
        self.add_event(format!("{connect_from}: connect to {connect_to}"));
    }

    fn log(&self, id: Id, level: log::Level, msg: std::fmt::Arguments) {
        self.add_event(format!("{id}:{level}: {msg}"));
    }

    fn time(&self, set_by: Id, time_ns: f64) {
        self.add_event(format!("{set_by}: set time {time_ns:.1}ns"));
    }

    fn shutdown(&self) {
        // Do nothing
    }
}

/// Initialise the tracking system for tests
///
/// Returns both the concrete [`TestTracker`] (for checking events) and the
/// type-erased [`Tracker`] to be handed to the simulation.
#[macro_export]
macro_rules! test_init {
    ($start_id:expr) => {{
        let test_tracker = std::rc::Rc::new($crate::test_helpers::TestTracker::new($start_id));
        let tracker: $crate::Tracker = test_tracker.clone();
        (test_tracker, tracker)
    }};
}

/// Check and clear the _trace_ and _log_ output
///
/// This function asserts that the logging output lines seen since the start
/// or the last time this function was called match the expected regular
/// expressions, then clears the recorded output.
pub fn check_and_clear(tracker: &TestTracker, expected: &[&str]) {
    let mut log_contents_ref = tracker.events.borrow_mut();

    println!("Checking {:?} matches {:?}", expected, *log_contents_ref);

    let num_strings = expected.len();
    assert_eq!(num_strings, log_contents_ref.len());

    for i in 0..num_strings {
        let log_expect = expected[i];
        let re = Regex::new(log_expect).unwrap();
        let actual = &(*log_contents_ref[i]);
        println!("Checking {i}: {log_expect:?} matches {actual:?}");
        assert!(re.is_match(actual));
    }

    log_contents_ref.clear();
}

/// Create the [`Tracker`] used by the test infrastructure.
///
/// By default the tests run silently. Setting the `BRUNEL_TEST_LOG`
/// environment variable to a log level ("trace", "info", ...) routes all
/// track events for the named test file to `stdout`.
#[must_use]
pub fn create_tracker(full_filepath: &str) -> Tracker {
    match std::env::var("BRUNEL_TEST_LOG") {
        Ok(level) => {
            let manager = EntityManager::new(crate::tracker::dev_null::str_to_level(&level));
            let writer = Box::new(std::io::BufWriter::new(std::io::stdout()));
            println!("{full_filepath}: tracking enabled at {level}");
            Rc::new(TextTracker::new(manager, writer))
        }
        Err(_) => dev_null_tracker(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, toplevel};

    #[test]
    fn records_create_events() {
        let (test_tracker, tracker) = crate::test_init!(10);
        let top = toplevel(&tracker, "top");
        check_and_clear(&test_tracker, &["0: created 10, top, 0, 0 bytes"]);

        let _node = Entity::new(&top, "node");
        check_and_clear(&test_tracker, &["10: created 11, top::node, 0, 0 bytes"]);
    }

    #[test]
    fn records_log_messages() {
        let (test_tracker, tracker) = crate::test_init!(20);
        let top = toplevel(&tracker, "top");
        crate::info!(top ; "hello {}", 42);
        check_and_clear(
            &test_tracker,
            &["0: created 20, top, 0, 0 bytes", "20:INFO: hello 42"],
        );
    }
}
