// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Synthetic traffic generation.
//!
//! A [`TrafficGen`] drives a [`LinkControl`] from a message-rate clock.
//! Each tick it either counts down the inter-packet delay or emits one
//! request whose destination, size and follow-on delay are drawn from
//! pluggable [`Generator`]s. When the link has no space the generator
//! parks on the link's send-notify slot instead of burning ticks.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use async_trait::async_trait;
use brunel_engine::engine::Engine;
use brunel_engine::events::once::Once;
use brunel_engine::sim_error;
use brunel_engine::time::clock::Clock;
use brunel_engine::traits::{Event, Runnable};
use brunel_engine::types::{SimError, SimResult};
use brunel_model_builder::{EntityDisplay, EntityGet};
use brunel_track::entity::Entity;
use brunel_track::trace;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::link_control::LinkControl;
use crate::request::{NetworkRequest, NodeId};
use crate::stats::Counter;
use crate::units::DataSize;

/// A source of values for destinations, sizes or delays.
pub trait Generator {
    fn next_value(&mut self) -> i64;
}

/// Uniform over `[min, max]`.
pub struct UniformDist {
    min: i64,
    max: i64,
    rng: Xoshiro256PlusPlus,
}

impl UniformDist {
    #[must_use]
    pub fn new(min: i64, max: i64, seed: u64) -> Self {
        Self {
            min,
            max,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }
}

impl Generator for UniformDist {
    fn next_value(&mut self) -> i64 {
        self.rng.gen_range(self.min..=self.max)
    }
}

/// Point mass at `target` with probability `target_prob`, uniform over
/// `[min, max]` otherwise.
pub struct DiscreteDist {
    uniform: UniformDist,
    target: i64,
    target_prob: f64,
}

impl DiscreteDist {
    #[must_use]
    pub fn new(min: i64, max: i64, target: i64, target_prob: f64, seed: u64) -> Self {
        Self {
            uniform: UniformDist::new(min, max, seed),
            target,
            target_prob,
        }
    }
}

impl Generator for DiscreteDist {
    fn next_value(&mut self) -> i64 {
        if self.uniform.rng.gen_bool(self.target_prob) {
            self.target
        } else {
            self.uniform.next_value()
        }
    }
}

/// Normal with mean and sigma, truncated to `[min, max]`.
pub struct NormalDist {
    min: i64,
    max: i64,
    mean: f64,
    sigma: f64,
    rng: Xoshiro256PlusPlus,
}

impl NormalDist {
    #[must_use]
    pub fn new(min: i64, max: i64, mean: f64, sigma: f64, seed: u64) -> Self {
        Self {
            min,
            max,
            mean,
            sigma,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }
}

impl Generator for NormalDist {
    fn next_value(&mut self) -> i64 {
        loop {
            // Box-Muller transform
            let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
            let u2: f64 = self.rng.gen();
            let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
            let value = (self.mean + z * self.sigma).round() as i64;
            if value >= self.min && value <= self.max {
                return value;
            }
        }
    }
}

/// Exponential with rate `lambda`.
pub struct ExponentialDist {
    lambda: f64,
    rng: Xoshiro256PlusPlus,
}

impl ExponentialDist {
    #[must_use]
    pub fn new(lambda: f64, seed: u64) -> Self {
        Self {
            lambda,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }
}

impl Generator for ExponentialDist {
    fn next_value(&mut self) -> i64 {
        let u: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        (-u.ln() / self.lambda).round() as i64
    }
}

/// `min` plus a binomial count of `trials` at `probability`, capped at
/// `max`.
pub struct BinomialDist {
    min: i64,
    max: i64,
    trials: u32,
    probability: f64,
    rng: Xoshiro256PlusPlus,
}

impl BinomialDist {
    #[must_use]
    pub fn new(min: i64, max: i64, trials: u32, probability: f64, seed: u64) -> Self {
        Self {
            min,
            max,
            trials,
            probability,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }
}

impl Generator for BinomialDist {
    fn next_value(&mut self) -> i64 {
        let successes = (0..self.trials)
            .filter(|_| self.rng.gen_bool(self.probability))
            .count() as i64;
        (self.min + successes).min(self.max)
    }
}

/// One of the six neighbours in a 3D torus.
pub struct NearestNeighbor {
    id: i64,
    max_x: i64,
    max_y: i64,
    max_z: i64,
    rng: Xoshiro256PlusPlus,
}

impl NearestNeighbor {
    #[must_use]
    pub fn new(id: i64, max_x: i64, max_y: i64, max_z: i64, seed: u64) -> Self {
        Self {
            id,
            max_x,
            max_y,
            max_z,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }
}

impl Generator for NearestNeighbor {
    fn next_value(&mut self) -> i64 {
        let mut x = self.id % self.max_x;
        let mut y = (self.id / self.max_x) % self.max_y;
        let mut z = self.id / (self.max_x * self.max_y);

        match self.rng.gen_range(0..6) {
            0 => x = (x + self.max_x - 1) % self.max_x,
            1 => x = (x + 1) % self.max_x,
            2 => y = (y + self.max_y - 1) % self.max_y,
            3 => y = (y + 1) % self.max_y,
            4 => z = (z + self.max_z - 1) % self.max_z,
            _ => z = (z + 1) % self.max_z,
        }

        x + y * self.max_x + z * self.max_x * self.max_y
    }
}

/// How endpoint ids appear in the request's address fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AddressMode {
    #[default]
    Sequential,
    /// Pack (pod, subnet, host) into a 10.x.y.z address.
    FatTreeIp {
        radix: i64,
        loading: i64,
    },
}

impl AddressMode {
    fn encode(&self, id: NodeId) -> NodeId {
        match self {
            AddressMode::Sequential => id,
            AddressMode::FatTreeIp { radix, loading } => {
                fattree_id_to_ip(id, *radix, *loading)
            }
        }
    }
}

/// Encode a fat-tree endpoint id as a 10.pod.subnet.host IP address.
#[must_use]
pub fn fattree_id_to_ip(id: NodeId, radix: i64, loading: i64) -> NodeId {
    let edge_switch = id / loading;
    let pod = edge_switch / (radix / 2);
    let subnet = edge_switch % (radix / 2);
    let host = 2 + id % loading;
    10 | (pod << 8) | (subnet << 16) | (host << 24)
}

/// Inverse of [`fattree_id_to_ip`].
#[must_use]
pub fn ip_to_fattree_id(ip: NodeId, radix: i64, loading: i64) -> NodeId {
    let pod = (ip >> 8) & 0xff;
    let subnet = (ip >> 16) & 0xff;
    let host = (ip >> 24) & 0xff;
    pod * (radix / 2) * loading + subnet * loading + (host - 2)
}

#[derive(Clone, Debug)]
pub struct TrafficGenParams {
    pub id: NodeId,
    pub num_peers: usize,
    pub packets_to_send: u64,
    pub packet_size: DataSize,
    pub delay_between_packets: u64,
    pub message_rate_mhz: f64,
    pub address_mode: AddressMode,
}

/// Endpoint harness that drives a link control with synthetic load.
#[derive(EntityGet, EntityDisplay)]
pub struct TrafficGen {
    entity: Rc<Entity>,
    params: TrafficGenParams,
    link: Rc<LinkControl>,
    clock: Clock,

    dest_gen: RefCell<Box<dyn Generator>>,
    size_gen: RefCell<Option<Box<dyn Generator>>>,
    delay_gen: RefCell<Option<Box<dyn Generator>>>,

    packets_sent: Cell<u64>,
    packets_received: Rc<Counter>,
}

impl TrafficGen {
    pub fn new_and_register(
        engine: &Engine,
        parent: &Rc<Entity>,
        name: &str,
        params: TrafficGenParams,
        link: Rc<LinkControl>,
        dest_gen: Box<dyn Generator>,
    ) -> Result<Rc<Self>, SimError> {
        if params.num_peers == 0 {
            return sim_error!("{name}: num_peers must be set");
        }

        let entity = Rc::new(Entity::new(parent, name));
        let clock = engine.executor.get_clock(params.message_rate_mhz);
        let rc_self = Rc::new(Self {
            entity,
            params,
            link,
            clock,
            dest_gen: RefCell::new(dest_gen),
            size_gen: RefCell::new(None),
            delay_gen: RefCell::new(None),
            packets_sent: Cell::new(0),
            packets_received: Rc::new(Counter::default()),
        });
        engine.register(rc_self.clone());
        Ok(rc_self)
    }

    /// Draw packet sizes from a generator instead of the fixed size.
    pub fn set_size_generator(&self, generator: Box<dyn Generator>) {
        *self.size_gen.borrow_mut() = Some(generator);
    }

    /// Draw inter-packet delays from a generator instead of the fixed
    /// delay.
    pub fn set_delay_generator(&self, generator: Box<dyn Generator>) {
        *self.delay_gen.borrow_mut() = Some(generator);
    }

    pub fn num_sent(&self) -> u64 {
        self.packets_sent.get()
    }

    pub fn num_received(&self) -> u64 {
        self.packets_received.value()
    }

    pub fn link(&self) -> &Rc<LinkControl> {
        &self.link
    }

    fn next_size_bits(&self) -> u64 {
        match self.size_gen.borrow_mut().as_mut() {
            Some(generator) => generator.next_value().max(1) as u64,
            None => self.params.packet_size.bits(),
        }
    }

    fn next_delay(&self) -> u64 {
        match self.delay_gen.borrow_mut().as_mut() {
            Some(generator) => generator.next_value().max(0) as u64,
            None => self.params.delay_between_packets,
        }
    }
}

#[async_trait(?Send)]
impl Runnable for TrafficGen {
    async fn run(&self) -> SimResult {
        // Strip received packets as they arrive
        {
            let link = self.link.clone();
            let received = self.packets_received.clone();
            self.link.set_notify_on_receive(Box::new(move |vn| {
                while link.recv(vn).is_some() {
                    received.increment();
                }
                true
            }));
        }

        self.link.initialized_event().listen().await;
        trace!(self.entity ; "link up, endpoint id {}", self.link.endpoint_id());

        let mut delay = 0u64;
        while self.packets_sent.get() < self.params.packets_to_send {
            self.clock.wait_ticks(1).await;

            if delay > 0 {
                delay -= 1;
                continue;
            }

            let size_bits = self.next_size_bits();
            if !self.link.space_to_send(0, size_bits) {
                // Stop ticking until the link has room again
                let resume = Once::default();
                {
                    let resume = resume.clone();
                    self.link.set_notify_on_send(Box::new(move |_vn| {
                        let _ = resume.notify();
                        false
                    }));
                }
                resume.listen().await;
                continue;
            }

            let target = self.dest_gen.borrow_mut().next_value();
            if target < 0 {
                return sim_error!("{}: destination generator produced {target}", self.entity);
            }

            let request = NetworkRequest::new(
                &self.entity,
                self.params.address_mode.encode(self.params.id),
                self.params.address_mode.encode(target),
                0,
                size_bits,
            );
            if !self.link.send(request, 0) {
                return sim_error!("{}: send refused despite available space", self.entity);
            }

            self.packets_sent.set(self.packets_sent.get() + 1);
            delay = self.next_delay();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_within_bounds() {
        let mut gen = UniformDist::new(3, 7, 1);
        for _ in 0..100 {
            let value = gen.next_value();
            assert!((3..=7).contains(&value));
        }
    }

    #[test]
    fn hotspot_hits_target() {
        let mut gen = DiscreteDist::new(0, 9, 4, 1.0, 1);
        for _ in 0..10 {
            assert_eq!(gen.next_value(), 4);
        }

        let mut gen = DiscreteDist::new(0, 9, 4, 0.5, 1);
        let hits = (0..1000).filter(|_| gen.next_value() == 4).count();
        assert!(hits > 400);
    }

    #[test]
    fn normal_truncates() {
        let mut gen = NormalDist::new(0, 10, 5.0, 100.0, 1);
        for _ in 0..100 {
            let value = gen.next_value();
            assert!((0..=10).contains(&value));
        }
    }

    #[test]
    fn exponential_is_non_negative() {
        let mut gen = ExponentialDist::new(0.5, 1);
        for _ in 0..100 {
            assert!(gen.next_value() >= 0);
        }
    }

    #[test]
    fn binomial_within_bounds() {
        let mut gen = BinomialDist::new(2, 8, 20, 0.5, 1);
        for _ in 0..100 {
            let value = gen.next_value();
            assert!((2..=8).contains(&value));
        }
    }

    #[test]
    fn nearest_neighbor_moves_one_step() {
        // Node (1, 1, 1) in a 3x3x3 torus
        let id = 1 + 3 + 9;
        let mut gen = NearestNeighbor::new(id, 3, 3, 3, 1);
        let neighbours = [id - 1, id + 1, id - 3, id + 3, id - 9, id + 9];
        for _ in 0..100 {
            assert!(neighbours.contains(&gen.next_value()));
        }
    }

    #[test]
    fn fattree_ip_round_trip() {
        let radix = 4;
        let loading = 2;
        for id in 0..16 {
            let ip = fattree_id_to_ip(id, radix, loading);
            assert_eq!(ip & 0xff, 10);
            assert_eq!(ip_to_fattree_id(ip, radix, loading), id);
        }
    }
}
