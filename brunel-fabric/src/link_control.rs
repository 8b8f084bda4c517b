// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The endpoint side of a fabric link.
//!
//! A [`LinkControl`] multiplexes a number of endpoint-visible virtual
//! networks over one physical link to a router, with flit-level bandwidth
//! accounting and credit-based flow control. The endpoint talks to it
//! through plain method calls (`send`, `recv`, ...); the link side runs as
//! engine tasks.
//!
//! # Ports
//!
//! This component has the following ports:
//!  - One [input port](brunel_engine::port::InPort): `rtr_rx`
//!  - One [output port](brunel_engine::port::OutPort): `rtr_tx`
//!
//! Before the simulation starts the link control knows neither the flit
//! size nor the virtual channel count; both are negotiated with the router
//! at time zero. Sends are rejected until the negotiation completes.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use async_trait::async_trait;
use brunel_engine::engine::Engine;
use brunel_engine::events::once::Once;
use brunel_engine::events::repeated::Repeated;
use brunel_engine::executor::{Executor, Spawner};
use brunel_engine::port::{InPort, OutPort, PortStateResult};
use brunel_engine::sim_error;
use brunel_engine::time::clock::Clock;
use brunel_engine::traits::{Event, Runnable};
use brunel_engine::types::{SimError, SimResult};
use brunel_model_builder::{EntityDisplay, EntityGet};
use brunel_track::entity::Entity;
use brunel_track::id::Unique;
use brunel_track::{enter, exit, trace};

use crate::event::{CreditEvent, FabricEvent, InitEvent, PacketEvent};
use crate::request::{NetworkRequest, NodeId};
use crate::{connect_tx, port_rx, take_option};
use crate::stats::LinkStats;
use crate::units::{Bandwidth, DataSize};

/// How a virtual network is spread over its checkerboarded VCs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CheckerboardAlg {
    /// Hash on (source, destination): a flow always uses the same VC, so
    /// delivery stays in order.
    #[default]
    Deterministic,
    /// Round robin over the VCs: spreads load but allows reordering; pair
    /// with the reorder link control.
    RoundRobin,
}

impl CheckerboardAlg {
    pub fn parse(name: &str) -> Result<Self, SimError> {
        match name {
            "deterministic" => Ok(Self::Deterministic),
            "roundrobin" => Ok(Self::RoundRobin),
            _ => sim_error!("unknown checkerboard algorithm '{name}'"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LinkControlParams {
    pub link_bw: Bandwidth,
    /// Input buffer size, per virtual channel.
    pub input_buf_size: DataSize,
    /// Output buffer size, per virtual network.
    pub output_buf_size: DataSize,
    pub checkerboard: usize,
    pub checkerboard_alg: CheckerboardAlg,
}

impl LinkControlParams {
    #[must_use]
    pub fn new(link_bw: Bandwidth, input_buf_size: DataSize, output_buf_size: DataSize) -> Self {
        Self {
            link_bw,
            input_buf_size,
            output_buf_size,
            checkerboard: 1,
            checkerboard_alg: CheckerboardAlg::default(),
        }
    }

    #[must_use]
    pub fn with_checkerboard(mut self, factor: usize, alg: CheckerboardAlg) -> Self {
        self.checkerboard = factor;
        self.checkerboard_alg = alg;
        self
    }
}

/// Callback slot for receive/send notification. The callable gets the
/// virtual network and returns whether it wants to stay registered.
pub type NotifyFn = Box<dyn FnMut(usize) -> bool>;

fn fire_notify(slot: &RefCell<Option<NotifyFn>>, vn: usize) {
    let functor = slot.borrow_mut().take();
    if let Some(mut functor) = functor {
        if functor(vn) {
            let mut guard = slot.borrow_mut();
            // The functor may have registered a replacement already
            if guard.is_none() {
                *guard = Some(functor);
            }
        }
    }
}

pub(crate) struct LcState {
    entity: Rc<Entity>,
    executor: Executor,
    params: LinkControlParams,

    req_vns: usize,
    /// Virtual networks on the wire: `req_vns * checkerboard`.
    wire_vns: usize,
    rr_counter: Cell<usize>,

    // Negotiated with the router
    total_vcs: Cell<usize>,
    vc_mult: Cell<usize>,
    flit_bits: Cell<u64>,
    id: Cell<NodeId>,
    port: Cell<usize>,
    network_initialized: Cell<bool>,
    initialized: Once<()>,
    flit_clock: RefCell<Option<Clock>>,
    in_buf_flits: Cell<u32>,
    out_buf_flits: Cell<u32>,
    grant_pending: Cell<bool>,

    // Buffers
    output_buf: RefCell<Vec<VecDeque<PacketEvent>>>,
    out_occupancy: RefCell<Vec<u32>>,
    curr_out_vn: Cell<usize>,
    input_buf: RefCell<Vec<VecDeque<PacketEvent>>>,
    untimed_tx: RefCell<VecDeque<NetworkRequest>>,
    untimed_rx: RefCell<VecDeque<NetworkRequest>>,

    // Credits: available downstream, and waiting to be returned upstream
    rtr_credits: RefCell<Vec<u32>>,
    in_ret_credits: RefCell<Vec<u32>>,

    output_kick: Repeated<()>,
    recv_notify: RefCell<Option<NotifyFn>>,
    send_notify: RefCell<Option<NotifyFn>>,

    stats: LinkStats,
}

impl LcState {
    fn now_ns(&self) -> f64 {
        self.executor.time_now_ns()
    }

    /// Pick the wire VC for a request: the checkerboard choice within the
    /// VN's group, scaled by the topology multiplier.
    fn select_vc(&self, request: &NetworkRequest) -> usize {
        let factor = self.params.checkerboard;
        let choice = match self.params.checkerboard_alg {
            CheckerboardAlg::Deterministic => {
                ((request.src as u64).wrapping_mul(31).wrapping_add(request.dest as u64)
                    % factor as u64) as usize
            }
            CheckerboardAlg::RoundRobin => {
                let choice = self.rr_counter.get() % factor;
                self.rr_counter.set(self.rr_counter.get() + 1);
                choice
            }
        };
        (request.vn * factor + choice) * self.vc_mult.get()
    }

    fn space_to_send(&self, vn: usize, bits: u64) -> bool {
        if !self.network_initialized.get() || vn >= self.req_vns {
            return false;
        }
        let flits = bits.div_ceil(self.flit_bits.get()).max(1) as u32;
        if self.out_occupancy.borrow()[vn] + flits > self.out_buf_flits.get() {
            return false;
        }
        // At least one VC of the VN's checkerboard group must have room
        // downstream
        let credits = self.rtr_credits.borrow();
        let factor = self.params.checkerboard;
        let mult = self.vc_mult.get();
        (0..factor).any(|choice| credits[(vn * factor + choice) * mult] >= flits)
    }

    fn handle_init(&self, command: InitEvent) -> SimResult {
        match command {
            InitEvent::SetVcs(total) => {
                if total == 0 || total % self.wire_vns != 0 {
                    return sim_error!(
                        "{}: router offered {total} VCs for {} wire VNs",
                        self.entity,
                        self.wire_vns
                    );
                }
                self.total_vcs.set(total);
                self.vc_mult.set(total / self.wire_vns);
            }
            InitEvent::ReportFlitSize(bits) => {
                if bits == 0
                    || self.params.input_buf_size.bits() % bits != 0
                    || self.params.output_buf_size.bits() % bits != 0
                {
                    return sim_error!(
                        "{}: buffer sizes ({}, {}) are not a multiple of the flit size {bits}b",
                        self.entity,
                        self.params.input_buf_size,
                        self.params.output_buf_size
                    );
                }
                self.flit_bits.set(bits);
            }
            InitEvent::ReportId(id) => self.id.set(id),
            InitEvent::ReportPort(port) => self.port.set(port),
            InitEvent::RequestVns(_) | InitEvent::ReportBw(_) => {
                return sim_error!("{}: unexpected init command {command:?}", self.entity);
            }
        }
        self.maybe_finalize()
    }

    fn maybe_finalize(&self) -> SimResult {
        if self.network_initialized.get()
            || self.total_vcs.get() == 0
            || self.flit_bits.get() == 0
        {
            return Ok(());
        }

        let flit_bits = self.flit_bits.get();
        let total = self.total_vcs.get();
        self.in_buf_flits
            .set((self.params.input_buf_size.bits() / flit_bits) as u32);
        self.out_buf_flits
            .set((self.params.output_buf_size.bits() / flit_bits) as u32);
        *self.rtr_credits.borrow_mut() = vec![0; total];
        *self.in_ret_credits.borrow_mut() = vec![0; total];
        *self.flit_clock.borrow_mut() = Some(
            self.executor
                .get_clock(self.params.link_bw.flit_clock_mhz(flit_bits)),
        );

        self.grant_pending.set(true);
        self.network_initialized.set(true);
        trace!(self.entity ; "link initialized: {} VCs, {}b flits", total, flit_bits);
        self.initialized.notify()?;
        self.output_kick.notify()
    }
}

/// Endpoint-facing interface to one fabric link.
#[derive(EntityGet, EntityDisplay)]
pub struct LinkControl {
    entity: Rc<Entity>,
    spawner: Spawner,
    state: Rc<LcState>,

    rtr_rx: RefCell<Option<InPort<FabricEvent>>>,
    rtr_tx: RefCell<Option<OutPort<FabricEvent>>>,
}

impl LinkControl {
    pub fn new_and_register(
        engine: &Engine,
        parent: &Rc<Entity>,
        name: &str,
        params: LinkControlParams,
        req_vns: usize,
    ) -> Result<Rc<Self>, SimError> {
        if req_vns == 0 {
            return sim_error!("{name}: at least one virtual network is required");
        }
        if params.checkerboard == 0 {
            return sim_error!("{name}: checkerboard factor must be at least 1");
        }

        let entity = Rc::new(Entity::new(parent, name));
        let rtr_rx = InPort::new(&entity, "rtr_rx");
        let rtr_tx = OutPort::new(&entity, "rtr_tx");

        let wire_vns = req_vns * params.checkerboard;
        let state = Rc::new(LcState {
            entity: entity.clone(),
            executor: engine.executor.clone(),
            req_vns,
            wire_vns,
            rr_counter: Cell::new(0),
            total_vcs: Cell::new(0),
            vc_mult: Cell::new(1),
            flit_bits: Cell::new(0),
            id: Cell::new(-1),
            port: Cell::new(0),
            network_initialized: Cell::new(false),
            initialized: Once::default(),
            flit_clock: RefCell::new(None),
            in_buf_flits: Cell::new(0),
            out_buf_flits: Cell::new(0),
            grant_pending: Cell::new(false),
            output_buf: RefCell::new((0..req_vns).map(|_| VecDeque::new()).collect()),
            out_occupancy: RefCell::new(vec![0; req_vns]),
            curr_out_vn: Cell::new(0),
            input_buf: RefCell::new((0..req_vns).map(|_| VecDeque::new()).collect()),
            untimed_tx: RefCell::new(VecDeque::new()),
            untimed_rx: RefCell::new(VecDeque::new()),
            rtr_credits: RefCell::new(Vec::new()),
            in_ret_credits: RefCell::new(Vec::new()),
            output_kick: Repeated::default(),
            recv_notify: RefCell::new(None),
            send_notify: RefCell::new(None),
            stats: LinkStats::default(),
            params,
        });

        let rc_self = Rc::new(Self {
            entity,
            spawner: engine.spawner(),
            state,
            rtr_rx: RefCell::new(Some(rtr_rx)),
            rtr_tx: RefCell::new(Some(rtr_tx)),
        });
        engine.register(rc_self.clone());
        Ok(rc_self)
    }

    pub fn connect_port_rtr_tx(&self, port_state: PortStateResult<FabricEvent>) -> SimResult {
        connect_tx!(self.rtr_tx, connect ; port_state)
    }

    pub fn port_rtr_rx(&self) -> PortStateResult<FabricEvent> {
        port_rx!(self.rtr_rx, state)
    }

    /// Queue `request` for transmission on `vn`.
    ///
    /// Returns false, with no state changed, if the virtual network is
    /// unknown or there is no room; the caller retries when notified
    /// through the send-notify slot.
    pub fn send(&self, request: NetworkRequest, vn: usize) -> bool {
        let state = &self.state;
        if vn >= state.req_vns || request.vn != vn {
            return false;
        }
        if !state.space_to_send(vn, request.size_in_bits) {
            return false;
        }

        let flits = match request.size_in_flits(state.flit_bits.get()) {
            Ok(flits) => flits,
            Err(_) => return false,
        };
        let mut packet = PacketEvent::new(request, flits);
        packet.injection_time_ns = state.now_ns();
        packet.vc = state.select_vc(&packet.request);

        enter!(self.entity ; packet.request.id());
        state.out_occupancy.borrow_mut()[vn] += flits;
        state.output_buf.borrow_mut()[vn].push_back(packet);
        let _ = state.output_kick.notify();
        true
    }

    /// True when `send` of a request of `bits` on `vn` would succeed.
    pub fn space_to_send(&self, vn: usize, bits: u64) -> bool {
        self.state.space_to_send(vn, bits)
    }

    /// Take the next delivered request on `vn`, freeing its input buffer
    /// space back to the router.
    pub fn recv(&self, vn: usize) -> Option<NetworkRequest> {
        let state = &self.state;
        if vn >= state.req_vns {
            return None;
        }
        let packet = state.input_buf.borrow_mut()[vn].pop_front()?;
        state.in_ret_credits.borrow_mut()[packet.vc] += packet.size_in_flits;
        let _ = state.output_kick.notify();
        exit!(self.entity ; packet.request.id());
        Some(packet.request)
    }

    pub fn request_to_receive(&self, vn: usize) -> bool {
        vn < self.state.req_vns && !self.state.input_buf.borrow()[vn].is_empty()
    }

    /// Queue untimed data for delivery during initialization. Untimed
    /// traffic bypasses credit and bandwidth accounting.
    pub fn send_untimed_data(&self, request: NetworkRequest) {
        self.state.untimed_tx.borrow_mut().push_back(request);
        let _ = self.state.output_kick.notify();
    }

    pub fn recv_untimed_data(&self) -> Option<NetworkRequest> {
        self.state.untimed_rx.borrow_mut().pop_front()
    }

    /// Register a callback fired when a virtual network goes from empty
    /// to non-empty. The callback returns true to stay registered.
    pub fn set_notify_on_receive(&self, functor: NotifyFn) {
        *self.state.recv_notify.borrow_mut() = Some(functor);
    }

    /// Register a callback fired when output space becomes available.
    /// The callback returns true to stay registered.
    pub fn set_notify_on_send(&self, functor: NotifyFn) {
        *self.state.send_notify.borrow_mut() = Some(functor);
    }

    pub fn is_network_initialized(&self) -> bool {
        self.state.network_initialized.get()
    }

    /// Event fired once the link negotiation has completed.
    #[must_use]
    pub fn initialized_event(&self) -> Once<()> {
        self.state.initialized.clone()
    }

    pub fn endpoint_id(&self) -> NodeId {
        self.state.id.get()
    }

    /// The number of endpoint-visible virtual networks.
    pub fn num_vns(&self) -> usize {
        self.state.req_vns
    }

    pub fn port_index(&self) -> usize {
        self.state.port.get()
    }

    pub fn link_bw(&self) -> Bandwidth {
        self.state.params.link_bw
    }

    pub fn stats(&self) -> &LinkStats {
        &self.state.stats
    }
}

#[async_trait(?Send)]
impl Runnable for LinkControl {
    async fn run(&self) -> SimResult {
        let rx = take_option!(self.rtr_rx);
        let tx = take_option!(self.rtr_tx);

        let state = self.state.clone();
        self.spawner.spawn(async move { run_input(state, rx).await });

        let state = self.state.clone();
        self.spawner.spawn(async move { run_output(state, tx).await });
        Ok(())
    }
}

async fn run_input(state: Rc<LcState>, rx: InPort<FabricEvent>) -> SimResult {
    loop {
        match rx.get()?.await {
            FabricEvent::Packet(packet) => {
                let vn = packet.request.vn;
                if vn >= state.req_vns {
                    return sim_error!(
                        "{}: packet delivered on unknown VN {vn}",
                        state.entity
                    );
                }
                state
                    .stats
                    .packet_latency
                    .add(state.now_ns() - packet.injection_time_ns);
                let was_empty = state.input_buf.borrow()[vn].is_empty();
                state.input_buf.borrow_mut()[vn].push_back(packet);
                if was_empty {
                    fire_notify(&state.recv_notify, vn);
                }
            }
            FabricEvent::Credit(credit) => {
                {
                    let mut credits = state.rtr_credits.borrow_mut();
                    if credit.vc >= credits.len() {
                        return sim_error!(
                            "{}: credit for unknown VC {}",
                            state.entity,
                            credit.vc
                        );
                    }
                    credits[credit.vc] += credit.credits;
                }
                state.output_kick.notify()?;
                let vn = credit.vc / state.vc_mult.get() / state.params.checkerboard;
                fire_notify(&state.send_notify, vn);
            }
            FabricEvent::Init(command) => state.handle_init(command)?,
            FabricEvent::UntimedPacket(packet) => {
                state.untimed_rx.borrow_mut().push_back(packet.request);
            }
            other => {
                return sim_error!("{}: unexpected event {other}", state.entity);
            }
        }
    }
}

async fn run_output(state: Rc<LcState>, tx: OutPort<FabricEvent>) -> SimResult {
    // Ask the router for our virtual networks and report our bandwidth so
    // a mismatched configuration fails loudly
    tx.put(FabricEvent::Init(InitEvent::RequestVns(state.wire_vns)))?
        .await;
    tx.put(FabricEvent::Init(InitEvent::ReportBw(state.params.link_bw)))?
        .await;

    loop {
        // Grant the router our input capacity once negotiation completes
        if state.grant_pending.get() {
            state.grant_pending.set(false);
            let in_buf_flits = state.in_buf_flits.get();
            for vc in 0..state.total_vcs.get() {
                tx.put(FabricEvent::Credit(CreditEvent {
                    vc,
                    credits: in_buf_flits,
                }))?
                .await;
            }
        }

        // Return freed input-buffer space upstream; credits are free
        let total_vcs = state.total_vcs.get();
        for vc in 0..total_vcs {
            let credits = std::mem::take(&mut state.in_ret_credits.borrow_mut()[vc]);
            if credits > 0 {
                tx.put(FabricEvent::Credit(CreditEvent { vc, credits }))?.await;
            }
        }

        // Untimed data bypasses the timed pipeline entirely
        loop {
            if !state.network_initialized.get() {
                break;
            }
            let request = state.untimed_tx.borrow_mut().pop_front();
            match request {
                Some(request) => {
                    let flits = request.size_in_flits(state.flit_bits.get())?;
                    tx.put(FabricEvent::UntimedPacket(PacketEvent::new(request, flits)))?
                        .await;
                }
                None => break,
            }
        }

        if !state.network_initialized.get() {
            state.output_kick.listen().await;
            continue;
        }

        // Round-robin over the virtual networks, skipping heads without
        // downstream credits
        let mut selected = None;
        let mut have_packets = false;
        {
            let output_buf = state.output_buf.borrow();
            let credits = state.rtr_credits.borrow();
            for i in 0..state.req_vns {
                let vn = (state.curr_out_vn.get() + i) % state.req_vns;
                if let Some(head) = output_buf[vn].front() {
                    have_packets = true;
                    if credits[head.vc] >= head.size_in_flits {
                        selected = Some((vn, head.size_in_flits));
                        break;
                    }
                }
            }
        }

        match selected {
            Some((vn, flits)) => {
                state.curr_out_vn.set((vn + 1) % state.req_vns);

                // One tick of the flit clock per flit of the packet
                let clock = match state.flit_clock.borrow().as_ref() {
                    Some(clock) => clock.clone(),
                    None => return sim_error!("{}: no flit clock", state.entity),
                };
                clock.wait_ticks(flits as u64).await;

                let packet = match state.output_buf.borrow_mut()[vn].pop_front() {
                    Some(packet) => packet,
                    None => {
                        return sim_error!("{}: transmitting head vanished", state.entity);
                    }
                };
                state.out_occupancy.borrow_mut()[vn] -= flits;
                state.rtr_credits.borrow_mut()[packet.vc] -= flits;
                state.stats.send_bit_count.add(packet.request.size_in_bits);
                exit!(state.entity ; packet.request.id());
                tx.put(FabricEvent::Packet(packet))?.await;

                fire_notify(&state.send_notify, vn);
            }
            None => {
                // Waiting on credits with packets queued counts as a
                // stall; an empty output buffer counts as idle time
                let start = state.now_ns();
                state.output_kick.listen().await;
                let elapsed = state.now_ns() - start;
                if have_packets {
                    state.stats.output_port_stalls.add_ns(elapsed);
                } else {
                    state.stats.idle_time.add_ns(elapsed);
                }
            }
        }
    }
}
