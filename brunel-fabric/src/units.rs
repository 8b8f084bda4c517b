// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Parsing of parameter values carrying units.
//!
//! Link bandwidths are given as bit or byte rates ("16Gb/s", "80GiB/s"),
//! buffer and packet sizes as bit or byte counts ("1KiB", "64b"). SI
//! prefixes are powers of ten, the binary prefixes (Ki, Mi, ...) powers of
//! two. Malformed values are configuration errors and fatal at
//! construction time.

use std::fmt;

use brunel_engine::sim_error;
use brunel_engine::types::SimError;

fn split_number(value: &str) -> (&str, &str) {
    let end = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    (&value[..end], &value[end..])
}

fn prefix_multiplier(prefix: &str) -> Option<f64> {
    match prefix {
        "" => Some(1.0),
        "k" | "K" => Some(1e3),
        "M" => Some(1e6),
        "G" => Some(1e9),
        "T" => Some(1e12),
        "Ki" => Some(1024.0),
        "Mi" => Some(1024.0 * 1024.0),
        "Gi" => Some(1024.0 * 1024.0 * 1024.0),
        "Ti" => Some(1024.0 * 1024.0 * 1024.0 * 1024.0),
        _ => None,
    }
}

/// Turn "<number><prefix><b|B>" into a number of bits.
fn parse_bits(value: &str, context: &str) -> Result<f64, SimError> {
    let (number, rest) = split_number(value.trim());
    let number: f64 = match number.parse() {
        Ok(n) => n,
        Err(_) => return sim_error!("{context}: no numeric value in '{value}'"),
    };

    let (prefix, unit) = match rest.strip_suffix('B') {
        Some(prefix) => (prefix, 8.0),
        None => match rest.strip_suffix('b') {
            Some(prefix) => (prefix, 1.0),
            None => {
                return sim_error!("{context}: '{value}' must be specified in units of b or B");
            }
        },
    };

    match prefix_multiplier(prefix) {
        Some(mult) => Ok(number * mult * unit),
        None => sim_error!("{context}: unknown prefix '{prefix}' in '{value}'"),
    }
}

/// A link bandwidth in bits per second.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bandwidth {
    bits_per_sec: f64,
}

impl Bandwidth {
    /// Parse a bandwidth such as "16Gb/s" or "80GiB/s".
    pub fn parse(value: &str) -> Result<Self, SimError> {
        let value = value.trim();
        let rate = match value.strip_suffix("/s") {
            Some(rate) => rate,
            None => {
                return sim_error!("link_bw: '{value}' must be specified in units of b/s or B/s");
            }
        };
        Ok(Self {
            bits_per_sec: parse_bits(rate, "link_bw")?,
        })
    }

    #[must_use]
    pub fn from_bits_per_sec(bits_per_sec: f64) -> Self {
        Self { bits_per_sec }
    }

    #[must_use]
    pub fn bits_per_sec(&self) -> f64 {
        self.bits_per_sec
    }

    /// The frequency, in MHz, of a clock whose tick is the time one flit of
    /// `flit_bits` occupies this link.
    #[must_use]
    pub fn flit_clock_mhz(&self, flit_bits: u64) -> f64 {
        self.bits_per_sec / flit_bits as f64 / 1e6
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}b/s", self.bits_per_sec)
    }
}

/// A data size in bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataSize {
    bits: u64,
}

impl DataSize {
    /// Parse a size such as "1KiB", "8B" or "64b".
    pub fn parse(value: &str) -> Result<Self, SimError> {
        Ok(Self {
            bits: parse_bits(value, "size")?.round() as u64,
        })
    }

    #[must_use]
    pub fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    #[must_use]
    pub fn bits(&self) -> u64 {
        self.bits
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}b", self.bits)
    }
}
