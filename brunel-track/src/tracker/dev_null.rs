// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::cell::RefCell;
use std::str::FromStr;

use crate::Id;
use crate::tracker::Track;

/// A tracker that suppresses all output.
///
/// This can be useful for benchmarks that want to have minimum overheads.
/// IDs still have to be allocated so that packets remain distinguishable.
pub struct DevNullTracker {
    unique_id: RefCell<u64>,
}

impl DevNullTracker {
    /// Create a new [`DevNullTracker`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            unique_id: RefCell::new(crate::ROOT.0 + 1),
        }
    }
}

impl Default for DevNullTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Track for DevNullTracker {
    fn unique_id(&self) -> Id {
        let mut guard = self.unique_id.borrow_mut();
        let id = *guard;
        *guard += 1;
        Id(id)
    }
    fn is_entity_enabled(&self, _id: Id, _level: log::Level) -> bool {
        false
    }
    fn add_entity(&self, _id: Id, _entity_name: &str) {}
    fn enter(&self, _id: Id, _obj: Id) {}
    fn exit(&self, _id: Id, _obj: Id) {}
    fn value(&self, _id: Id, _value: f64) {}
    fn create(&self, _id: Id, _obj: Id, _num_bytes: usize, _req_type: i8, _name: &str) {}
    fn destroy(&self, _id: Id, _obj: Id) {}
    fn connect(&self, _connect_from: Id, _connect_to: Id) {}
    fn log(&self, _id: Id, _level: log::Level, _msg: std::fmt::Arguments) {}
    fn time(&self, _set_by: Id, _time_ns: f64) {}
    fn shutdown(&self) {}
}

/// Take the command-line string and convert it to a Level
#[must_use]
pub fn str_to_level(lvl: &str) -> log::Level {
    match log::Level::from_str(lvl) {
        Ok(level) => level,
        Err(_) => panic!("Unable to parse level string '{lvl}'"),
    }
}
