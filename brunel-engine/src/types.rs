// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Shared types.

use std::error::Error;
use std::fmt;
use std::rc::Rc;

use crate::traits::Runnable;

/// The type of a component that can be registered with the `Engine` so that
/// it will automatically be spawned.
pub type Component = Rc<dyn Runnable + 'static>;

// Simulation errors

#[macro_export]
/// Build an `Err(SimError)` from a format string
macro_rules! sim_error {
    ($($arg:tt)+) => {
        Err($crate::types::SimError(format!($($arg)+)))
    };
}

/// The `SimError` is what should be returned in the case of an error
#[derive(Debug)]
pub struct SimError(pub String);

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error: {}", self.0)
    }
}

impl Error for SimError {}

/// The SimResult is the return type for most simulation functions
pub type SimResult = Result<(), SimError>;
