// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Statistics accumulated by the fabric components.
//!
//! Components expose their statistics through accessors so that the
//! simulation driver can read them once the run has finished.

use std::cell::{Cell, RefCell};

/// A monotonically increasing count.
#[derive(Default)]
pub struct Counter {
    value: Cell<u64>,
}

impl Counter {
    pub fn add(&self, amount: u64) {
        self.value.set(self.value.get() + amount);
    }

    pub fn increment(&self) {
        self.add(1);
    }

    #[must_use]
    pub fn value(&self) -> u64 {
        self.value.get()
    }
}

/// Accumulated time in nanoseconds.
#[derive(Default)]
pub struct TimeAccumulator {
    ns: Cell<f64>,
}

impl TimeAccumulator {
    pub fn add_ns(&self, ns: f64) {
        self.ns.set(self.ns.get() + ns);
    }

    #[must_use]
    pub fn total_ns(&self) -> f64 {
        self.ns.get()
    }
}

/// Samples of a value, tracked as count/min/max/sum.
#[derive(Default)]
pub struct Histogram {
    samples: RefCell<Vec<f64>>,
}

impl Histogram {
    pub fn add(&self, sample: f64) {
        self.samples.borrow_mut().push(sample);
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.samples.borrow().len()
    }

    #[must_use]
    pub fn min(&self) -> f64 {
        self.samples
            .borrow()
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }

    #[must_use]
    pub fn max(&self) -> f64 {
        self.samples
            .borrow()
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }

    #[must_use]
    pub fn mean(&self) -> f64 {
        let samples = self.samples.borrow();
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

/// Statistics kept by a [`LinkControl`](crate::link_control::LinkControl).
#[derive(Default)]
pub struct LinkStats {
    /// Number of bits sent on the link.
    pub send_bit_count: Counter,

    /// Time the output port spent stalled waiting for credits.
    pub output_port_stalls: TimeAccumulator,

    /// Time the output port spent with nothing to send.
    pub idle_time: TimeAccumulator,

    /// Latency of received packets in nanoseconds.
    pub packet_latency: Histogram,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram() {
        let hist = Histogram::default();
        hist.add(4.0);
        hist.add(1.0);
        hist.add(7.0);

        assert_eq!(hist.count(), 3);
        assert_eq!(hist.min(), 1.0);
        assert_eq!(hist.max(), 7.0);
        assert_eq!(hist.mean(), 4.0);
    }
}
