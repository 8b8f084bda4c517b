// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

#![doc(test(attr(warn(unused))))]

//! `BRUNEL` - Bandwidth-Regulated Unified Network Event Library
//!
//! This library provides the core of the BRUNEL engine which executes
//! event driven asynchronous simulation components. The interconnection
//! network models built on top of it live in the `brunel-fabric` crate.
//!
//! Simulations can be run as purely event driven (where one event triggers
//! one or more others) or the use of clocks can be introduced to model
//! time. The combination of both is the most common.
//!
//! # Simple Application
//!
//! A very simple application would look like:
//!
//! ```rust
//! use brunel_engine::engine::Engine;
//! use brunel_engine::run_simulation;
//!
//! let mut engine = Engine::default();
//! let clock = engine.clock_ghz(1.0);
//! let spawner = engine.spawner();
//! spawner.spawn(async move {
//!     clock.wait_ticks(10).await;
//!     Ok(())
//! });
//! run_simulation!(engine);
//! assert_eq!(engine.time_now_ns(), 10.0);
//! ```
//!
//! The [engine](crate::engine::Engine) manages the
//! [clocks](crate::time::clock). Components that model the time taken for
//! data to pass through them hold a clock and `await` ticks on it; a clock
//! of frequency `f` makes one tick last `1/f` seconds of virtual time.

pub mod engine;
pub mod events;
pub mod executor;
pub mod port;
pub mod test_helpers;
pub mod time;
pub mod traits;
pub mod types;

#[macro_export]
/// Spawn all registered component run() functions and then run the
/// simulation.
macro_rules! run_simulation {
    ($engine:ident) => {
        $engine.run().unwrap();
    };
    ($engine:ident, $expect:expr) => {
        match $engine.run() {
            Ok(()) => panic!("Expected an error!"),
            Err(e) => assert_eq!(format!("{e}").as_str(), $expect),
        }
    };
}

