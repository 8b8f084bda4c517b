// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A many-port virtual-channel router.
//!
//! Every port is a duplex pair of fabric links. The input side classifies
//! arriving events: packets are routed by the [`Topology`] into
//! per-(port, VC) input queues; a crossbar task moves them to bounded
//! output queues, returning a credit upstream the moment an event leaves
//! its input queue; per-port output tasks clock packets out at one flit
//! per tick of the link's flit clock, spending downstream credits.
//!
//! Control traffic (credits, init commands, untimed data) takes a separate
//! per-port control queue and consumes no link bandwidth.
//!
//! # Ports
//!
//! This component has `N` duplex ports for `N = topology.num_ports()`:
//!  - N [input ports](brunel_engine::port::InPort): `rx[i]`
//!  - N [output ports](brunel_engine::port::OutPort): `tx[i]`

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use async_trait::async_trait;
use brunel_engine::engine::Engine;
use brunel_engine::events::repeated::Repeated;
use brunel_engine::executor::Spawner;
use brunel_engine::port::{InPort, OutPort, PortStateResult};
use brunel_engine::sim_error;
use brunel_engine::time::clock::Clock;
use brunel_engine::traits::{Event, Runnable};
use brunel_engine::types::{SimError, SimResult};
use brunel_model_builder::{EntityDisplay, EntityGet};
use brunel_track::entity::Entity;
use brunel_track::id::Unique;
use brunel_track::{enter, exit, trace};

use crate::event::{CreditEvent, FabricEvent, InitEvent, InternalEvent};
use crate::topology::{PortState, SharedCredits, Topology};
use crate::units::{Bandwidth, DataSize};

#[derive(Clone, Debug)]
pub struct RouterParams {
    pub link_bw: Bandwidth,
    /// Flit size used for bandwidth accounting on all of this router's
    /// links, reported to the attached endpoints.
    pub flit_size: DataSize,
    /// Input buffer size, per port and VC.
    pub input_buf_size: DataSize,
    /// Output buffer size, per port and VC.
    pub output_buf_size: DataSize,
}

impl RouterParams {
    pub fn new(link_bw: Bandwidth, flit_size: DataSize) -> Result<Self, SimError> {
        if flit_size.bits() == 0 {
            return sim_error!("flit size must be non-zero");
        }
        Ok(Self {
            link_bw,
            flit_size,
            input_buf_size: DataSize::from_bits(flit_size.bits() * 16),
            output_buf_size: DataSize::from_bits(flit_size.bits() * 16),
        })
    }

    #[must_use]
    pub fn with_buffers(mut self, input: DataSize, output: DataSize) -> Self {
        self.input_buf_size = input;
        self.output_buf_size = output;
        self
    }

    fn validate(&self) -> SimResult {
        let flit = self.flit_size.bits();
        if self.input_buf_size.bits() % flit != 0 || self.output_buf_size.bits() % flit != 0 {
            return sim_error!(
                "router buffer sizes ({}, {}) are not a multiple of the flit size {}",
                self.input_buf_size,
                self.output_buf_size,
                self.flit_size
            );
        }
        Ok(())
    }
}

struct RouterState {
    entity: Rc<Entity>,
    topology: Rc<dyn Topology>,
    num_ports: usize,

    link_bw: Bandwidth,
    flit_bits: u64,
    in_buf_flits: u32,
    out_buf_flits: u32,

    // Negotiated when the first endpoint or neighbour speaks
    num_vcs: Cell<usize>,
    initialized: Cell<bool>,

    // [port][vc] event queues with flit occupancy alongside
    input_queues: RefCell<Vec<Vec<VecDeque<InternalEvent>>>>,
    input_occupancy: RefCell<Vec<Vec<u32>>>,
    output_queues: RefCell<Vec<Vec<VecDeque<InternalEvent>>>>,

    /// Credits available towards each downstream input buffer, indexed by
    /// `port * num_vcs + vc`. Written here, read by adaptive topologies.
    out_credits: SharedCredits,

    /// Output queue occupancy in flits, same indexing. Written here, read
    /// by adaptive topologies.
    queue_lengths: SharedCredits,

    /// Zero-cost control events (credits, init, untimed data) per port.
    ctrl_queues: RefCell<Vec<VecDeque<FabricEvent>>>,

    curr_out_vc: Vec<Cell<usize>>,
    xbar_kick: Repeated<()>,
    out_kicks: Vec<Repeated<()>>,
}

impl RouterState {
    fn credit_index(&self, port: usize, vc: usize) -> usize {
        port * self.num_vcs.get() + vc
    }

    fn push_ctrl(&self, port: usize, ev: FabricEvent) -> SimResult {
        self.ctrl_queues.borrow_mut()[port].push_back(ev);
        self.out_kicks[port].notify()
    }

    /// Complete VC negotiation: size the queues and tell every peer what
    /// was decided.
    fn finalize(&self, total_vcs: usize) -> SimResult {
        if self.initialized.get() {
            if total_vcs != self.num_vcs.get() {
                return sim_error!(
                    "{}: VC count renegotiated from {} to {total_vcs}",
                    self.entity,
                    self.num_vcs.get()
                );
            }
            return Ok(());
        }

        self.num_vcs.set(total_vcs);
        let empty_queues = || {
            (0..self.num_ports)
                .map(|_| (0..total_vcs).map(|_| VecDeque::new()).collect())
                .collect::<Vec<Vec<VecDeque<InternalEvent>>>>()
        };
        *self.input_queues.borrow_mut() = empty_queues();
        *self.output_queues.borrow_mut() = empty_queues();
        *self.input_occupancy.borrow_mut() = vec![vec![0; total_vcs]; self.num_ports];
        *self.out_credits.borrow_mut() = vec![0; self.num_ports * total_vcs];
        *self.queue_lengths.borrow_mut() = vec![0; self.num_ports * total_vcs];

        self.topology
            .set_output_buffer_credits(self.out_credits.clone(), total_vcs);
        self.topology
            .set_output_queue_lengths(self.queue_lengths.clone(), total_vcs);

        trace!(self.entity ; "router initialized with {total_vcs} VCs");

        // Tell every peer, then grant our input capacity as credits. The
        // control queue keeps this ordering on the wire.
        for port in 0..self.num_ports {
            match self.topology.port_state(port) {
                PortState::RouterToNic => {
                    // Identity first: the endpoint treats the flit-size
                    // report as the end of the handshake
                    self.push_ctrl(
                        port,
                        FabricEvent::Init(InitEvent::ReportId(self.topology.endpoint_id(port))),
                    )?;
                    self.push_ctrl(port, FabricEvent::Init(InitEvent::ReportPort(port)))?;
                    self.push_ctrl(port, FabricEvent::Init(InitEvent::SetVcs(total_vcs)))?;
                    self.push_ctrl(
                        port,
                        FabricEvent::Init(InitEvent::ReportFlitSize(self.flit_bits)),
                    )?;
                }
                PortState::RouterToRouter => {
                    self.push_ctrl(port, FabricEvent::Init(InitEvent::SetVcs(total_vcs)))?;
                }
                PortState::Unconnected => continue,
            }
            for vc in 0..total_vcs {
                self.push_ctrl(
                    port,
                    FabricEvent::Credit(CreditEvent {
                        vc,
                        credits: self.in_buf_flits,
                    }),
                )?;
            }
        }

        self.initialized.set(true);
        self.xbar_kick.notify()
    }

    /// Accept a routed event into the input queue it arrived on.
    fn accept(&self, port: usize, arrival_vc: usize, ev: InternalEvent) -> SimResult {
        if !self.initialized.get() {
            return sim_error!("{}: packet arrived before VC negotiation", self.entity);
        }
        if arrival_vc >= self.num_vcs.get() {
            return sim_error!("{}: packet arrived on unknown VC {arrival_vc}", self.entity);
        }

        let flits = ev.flit_count();
        {
            let mut occupancy = self.input_occupancy.borrow_mut();
            if occupancy[port][arrival_vc] + flits > self.in_buf_flits {
                return sim_error!(
                    "{}: input buffer overrun on port {port} VC {arrival_vc}",
                    self.entity
                );
            }
            occupancy[port][arrival_vc] += flits;
        }
        self.input_queues.borrow_mut()[port][arrival_vc].push_back(ev);
        self.xbar_kick.notify()
    }

    /// Flood untimed init-phase data out of the ports the topology names.
    fn fan_out_untimed(&self, port: usize, mut ev: InternalEvent) -> SimResult {
        let mut out_ports = Vec::new();
        self.topology
            .route_init_data(port, &mut ev, &mut out_ports)?;

        for out in out_ports {
            if out >= self.num_ports {
                return sim_error!("{}: init data routed to port {out}", self.entity);
            }
            match self.topology.port_state(out) {
                PortState::RouterToNic => {
                    self.push_ctrl(out, FabricEvent::UntimedPacket(ev.packet.clone()))?;
                }
                PortState::RouterToRouter => {
                    self.push_ctrl(out, FabricEvent::UntimedInternal(ev.clone()))?;
                }
                PortState::Unconnected => {
                    return sim_error!(
                        "{}: init data routed to unconnected port {out}",
                        self.entity
                    );
                }
            }
        }
        Ok(())
    }
}

/// A many-port switch using a [`Topology`] to pick the output port per
/// packet.
#[derive(EntityGet, EntityDisplay)]
pub struct Router {
    entity: Rc<Entity>,
    spawner: Spawner,
    clock: Clock,
    state: Rc<RouterState>,

    rx: RefCell<Vec<Option<InPort<FabricEvent>>>>,
    tx: RefCell<Vec<Option<OutPort<FabricEvent>>>>,
}

impl Router {
    pub fn new_and_register(
        engine: &Engine,
        parent: &Rc<Entity>,
        name: &str,
        params: RouterParams,
        topology: Rc<dyn Topology>,
    ) -> Result<Rc<Self>, SimError> {
        params.validate()?;

        let entity = Rc::new(Entity::new(parent, name));
        let num_ports = topology.num_ports();
        let clock = engine
            .executor
            .get_clock(params.link_bw.flit_clock_mhz(params.flit_size.bits()));

        let rx = (0..num_ports)
            .map(|i| Some(InPort::new(&entity, &format!("rx{i}"))))
            .collect();
        let tx = (0..num_ports)
            .map(|i| Some(OutPort::new(&entity, &format!("tx{i}"))))
            .collect();

        let state = Rc::new(RouterState {
            entity: entity.clone(),
            topology,
            num_ports,
            link_bw: params.link_bw,
            flit_bits: params.flit_size.bits(),
            in_buf_flits: (params.input_buf_size.bits() / params.flit_size.bits()) as u32,
            out_buf_flits: (params.output_buf_size.bits() / params.flit_size.bits()) as u32,
            num_vcs: Cell::new(0),
            initialized: Cell::new(false),
            input_queues: RefCell::new(Vec::new()),
            input_occupancy: RefCell::new(Vec::new()),
            output_queues: RefCell::new(Vec::new()),
            out_credits: Rc::new(RefCell::new(Vec::new())),
            queue_lengths: Rc::new(RefCell::new(Vec::new())),
            ctrl_queues: RefCell::new((0..num_ports).map(|_| VecDeque::new()).collect()),
            curr_out_vc: (0..num_ports).map(|_| Cell::new(0)).collect(),
            xbar_kick: Repeated::default(),
            out_kicks: (0..num_ports).map(|_| Repeated::default()).collect(),
        });

        let rc_self = Rc::new(Self {
            entity,
            spawner: engine.spawner(),
            clock,
            state,
            rx: RefCell::new(rx),
            tx: RefCell::new(tx),
        });
        engine.register(rc_self.clone());
        Ok(rc_self)
    }

    pub fn connect_port_tx_i(&self, i: usize, port_state: PortStateResult<FabricEvent>) -> SimResult {
        match self.tx.borrow_mut().get_mut(i) {
            Some(Some(tx)) => tx.connect(port_state),
            _ => sim_error!("{}: no tx port {}", self.entity, i),
        }
    }

    pub fn port_rx_i(&self, i: usize) -> PortStateResult<FabricEvent> {
        match self.rx.borrow().get(i) {
            Some(Some(rx)) => rx.state(),
            _ => sim_error!("{}: no rx port {}", self.entity, i),
        }
    }

    /// Shared read access to the per-(port, VC) output credits, as handed
    /// to adaptive topologies.
    #[must_use]
    pub fn output_credits(&self) -> SharedCredits {
        self.state.out_credits.clone()
    }
}

#[async_trait(?Send)]
impl Runnable for Router {
    async fn run(&self) -> SimResult {
        for (port, (rx, tx)) in self
            .rx
            .borrow_mut()
            .drain(..)
            .zip(self.tx.borrow_mut().drain(..))
            .enumerate()
        {
            // Ports the topology declares unconnected have no peer and no
            // tasks
            if self.state.topology.port_state(port) == PortState::Unconnected {
                continue;
            }
            let (rx, tx) = match (rx, tx) {
                (Some(rx), Some(tx)) => (rx, tx),
                _ => return sim_error!("{}: port {port} taken twice", self.entity),
            };

            let state = self.state.clone();
            self.spawner
                .spawn(async move { run_input(state, rx, port).await });

            let state = self.state.clone();
            let clock = self.clock.clone();
            self.spawner
                .spawn(async move { run_output(state, clock, tx, port).await });
        }

        let state = self.state.clone();
        self.spawner.spawn(async move { run_crossbar(state).await });
        Ok(())
    }
}

async fn run_input(state: Rc<RouterState>, rx: InPort<FabricEvent>, port: usize) -> SimResult {
    let topology = state.topology.clone();
    let is_host = topology.is_host_port(port);

    loop {
        match rx.get()?.await {
            FabricEvent::Packet(packet) => {
                if !is_host {
                    return sim_error!(
                        "{}: bare packet arrived on router-to-router port {port}",
                        state.entity
                    );
                }
                if packet.request.dest < 0 {
                    // The broadcast address is only valid for untimed
                    // init-phase traffic
                    return sim_error!(
                        "{}: timed packet addressed to {} on port {port}",
                        state.entity,
                        packet.request.dest
                    );
                }
                let arrival_vc = packet.vc;
                enter!(state.entity ; packet.request.id());
                let mut ev = topology.process_input(packet)?;
                ev.credit_return_vc = arrival_vc;
                topology.route(port, arrival_vc, &mut ev)?;
                state.accept(port, arrival_vc, ev)?;
            }
            FabricEvent::Internal(mut ev) => {
                if is_host {
                    return sim_error!(
                        "{}: internal event arrived on endpoint port {port}",
                        state.entity
                    );
                }
                let arrival_vc = ev.vc;
                enter!(state.entity ; ev.packet.request.id());
                ev.credit_return_vc = arrival_vc;
                topology.route(port, arrival_vc, &mut ev)?;
                state.accept(port, arrival_vc, ev)?;
            }
            FabricEvent::Credit(credit) => {
                if !state.initialized.get() || credit.vc >= state.num_vcs.get() {
                    return sim_error!(
                        "{}: unexpected credit on port {port} VC {}",
                        state.entity,
                        credit.vc
                    );
                }
                let index = state.credit_index(port, credit.vc);
                state.out_credits.borrow_mut()[index] += credit.credits;
                state.out_kicks[port].notify()?;
                // A credit update can change an adaptive routing decision
                state.xbar_kick.notify()?;
            }
            FabricEvent::Init(InitEvent::RequestVns(vns)) => {
                if !is_host {
                    return sim_error!(
                        "{}: VN request on router-to-router port {port}",
                        state.entity
                    );
                }
                let total = topology.num_vcs(vns);
                state.finalize(total)?;
            }
            FabricEvent::Init(InitEvent::SetVcs(total)) => {
                if is_host {
                    return sim_error!("{}: SetVcs from an endpoint on port {port}", state.entity);
                }
                state.finalize(total)?;
            }
            FabricEvent::Init(InitEvent::ReportBw(bw)) => {
                if bw.bits_per_sec() != state.link_bw.bits_per_sec() {
                    return sim_error!(
                        "{}: endpoint on port {port} runs at {bw}, router at {}",
                        state.entity,
                        state.link_bw
                    );
                }
            }
            FabricEvent::Init(command) => {
                return sim_error!(
                    "{}: unexpected init command {command:?} on port {port}",
                    state.entity
                );
            }
            FabricEvent::UntimedPacket(packet) => {
                if !is_host {
                    return sim_error!(
                        "{}: untimed packet on router-to-router port {port}",
                        state.entity
                    );
                }
                let ev = topology.process_init_data_input(packet)?;
                state.fan_out_untimed(port, ev)?;
            }
            FabricEvent::UntimedInternal(ev) => {
                if is_host {
                    return sim_error!(
                        "{}: untimed internal event on endpoint port {port}",
                        state.entity
                    );
                }
                state.fan_out_untimed(port, ev)?;
            }
            FabricEvent::Topology(ev) => {
                topology.recv_topology_event(port, ev);
            }
        }
    }
}

/// Move events from input queues to output queues, zero time, as space
/// allows. Credits return upstream as events leave their input queue.
async fn run_crossbar(state: Rc<RouterState>) -> SimResult {
    loop {
        let mut progressed = false;

        if state.initialized.get() {
            let num_vcs = state.num_vcs.get();
            for port in 0..state.num_ports {
                for vc in 0..num_vcs {
                    loop {
                        // Head-of-line event for this input queue
                        let (dest_port, dest_vc, flits, credit_vc) = {
                            let queues = state.input_queues.borrow();
                            match queues[port][vc].front() {
                                Some(ev) => {
                                    (ev.next_port, ev.vc, ev.flit_count(), ev.credit_return_vc)
                                }
                                None => break,
                            }
                        };

                        if dest_port >= state.num_ports
                            || state.topology.port_state(dest_port) == PortState::Unconnected
                        {
                            return sim_error!(
                                "{}: routed to invalid port {dest_port}",
                                state.entity
                            );
                        }
                        if dest_vc >= num_vcs {
                            return sim_error!(
                                "{}: routed to invalid VC {dest_vc}",
                                state.entity
                            );
                        }

                        let dest_index = state.credit_index(dest_port, dest_vc);
                        let space = {
                            let lengths = state.queue_lengths.borrow();
                            lengths[dest_index] + flits <= state.out_buf_flits
                        };

                        if !space {
                            // Held back: give adaptive topologies a chance
                            // to revise the decision, then wait
                            let mut queues = state.input_queues.borrow_mut();
                            if let Some(ev) = queues[port][vc].front_mut() {
                                state.topology.reroute(port, vc, ev)?;
                            }
                            break;
                        }

                        let ev = match state.input_queues.borrow_mut()[port][vc].pop_front() {
                            Some(ev) => ev,
                            None => break,
                        };
                        state.input_occupancy.borrow_mut()[port][vc] -= flits;
                        state.queue_lengths.borrow_mut()[dest_index] += flits;
                        state.output_queues.borrow_mut()[dest_port][dest_vc].push_back(ev);

                        state.push_ctrl(
                            port,
                            FabricEvent::Credit(CreditEvent {
                                vc: credit_vc,
                                credits: flits,
                            }),
                        )?;
                        state.out_kicks[dest_port].notify()?;
                        progressed = true;
                    }
                }
            }
        }

        if !progressed {
            state.xbar_kick.listen().await;
        }
    }
}

async fn run_output(
    state: Rc<RouterState>,
    clock: Clock,
    tx: OutPort<FabricEvent>,
    port: usize,
) -> SimResult {
    let is_host = state.topology.is_host_port(port);

    loop {
        // Control traffic first, free of charge
        loop {
            let ev = state.ctrl_queues.borrow_mut()[port].pop_front();
            match ev {
                Some(ev) => tx.put(ev)?.await,
                None => break,
            }
        }

        if !state.initialized.get() {
            state.out_kicks[port].listen().await;
            continue;
        }

        // Round-robin over VCs whose head has downstream credits
        let num_vcs = state.num_vcs.get();
        let mut selected = None;
        {
            let queues = state.output_queues.borrow();
            let credits = state.out_credits.borrow();
            for i in 0..num_vcs {
                let vc = (state.curr_out_vc[port].get() + i) % num_vcs;
                if let Some(head) = queues[port][vc].front() {
                    if credits[state.credit_index(port, vc)] >= head.flit_count() {
                        selected = Some((vc, head.flit_count()));
                        break;
                    }
                }
            }
        }

        match selected {
            Some((vc, flits)) => {
                state.curr_out_vc[port].set((vc + 1) % num_vcs);
                clock.wait_ticks(flits as u64).await;

                let ev = match state.output_queues.borrow_mut()[port][vc].pop_front() {
                    Some(ev) => ev,
                    None => {
                        return sim_error!("{}: transmitting head vanished", state.entity);
                    }
                };
                let index = state.credit_index(port, vc);
                state.queue_lengths.borrow_mut()[index] -= flits;
                state.out_credits.borrow_mut()[index] -= flits;
                state.xbar_kick.notify()?;

                exit!(state.entity ; ev.packet.request.id());
                if is_host {
                    let mut packet = ev.packet;
                    packet.vc = ev.vc;
                    tx.put(FabricEvent::Packet(packet))?.await;
                } else {
                    tx.put(FabricEvent::Internal(ev))?.await;
                }
            }
            None => {
                state.out_kicks[port].listen().await;
            }
        }
    }
}
