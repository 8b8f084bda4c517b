// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The endpoint-visible unit of network traffic.

use std::fmt;
use std::rc::Rc;

use brunel_engine::traits::{SimObject, TotalBytes};
use brunel_engine::types::SimError;
use brunel_engine::sim_error;
use brunel_track::entity::Entity;
use brunel_track::id::Unique;
use brunel_track::{Id, create, create_id};

/// Identifier of a network endpoint.
pub type NodeId = i64;

/// Destination id used by untimed init-phase traffic to reach every
/// endpoint.
pub const BROADCAST_ADDR: NodeId = -1;

/// How much of a request's journey should be traced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TraceType {
    #[default]
    None,
    Route,
    Full,
}

impl fmt::Display for TraceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceType::None => write!(f, "none"),
            TraceType::Route => write!(f, "route"),
            TraceType::Full => write!(f, "full"),
        }
    }
}

/// A request to move `size_in_bits` of data from `src` to `dest`.
///
/// Created by an endpoint and handed to a link control; owned by the
/// fabric until it is delivered to the destination endpoint. The optional
/// sequence number is stamped and consumed by the reorder link control and
/// ignored everywhere else.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkRequest {
    pub src: NodeId,
    pub dest: NodeId,
    pub vn: usize,
    pub size_in_bits: u64,
    pub head: bool,
    pub tail: bool,
    pub payload: Option<u64>,
    pub trace: TraceType,
    pub trace_id: i64,
    pub seq: Option<u32>,

    id: Id,
}

impl NetworkRequest {
    #[must_use]
    pub fn new(
        created_by: &Rc<Entity>,
        src: NodeId,
        dest: NodeId,
        vn: usize,
        size_in_bits: u64,
    ) -> Self {
        let request = Self {
            src,
            dest,
            vn,
            size_in_bits,
            head: true,
            tail: true,
            payload: None,
            trace: TraceType::None,
            trace_id: 0,
            seq: None,
            id: create_id!(created_by),
        };
        create!(created_by ; request, request.total_bytes());
        request
    }

    #[must_use]
    pub fn set_payload(mut self, payload: u64) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn set_trace(mut self, trace: TraceType, trace_id: i64) -> Self {
        self.trace = trace;
        self.trace_id = trace_id;
        self
    }

    /// The number of flits this request occupies on a link with
    /// `flit_bits` per flit. Always at least one.
    pub fn size_in_flits(&self, flit_bits: u64) -> Result<u32, SimError> {
        if flit_bits == 0 {
            return sim_error!("flit size has not been negotiated");
        }
        Ok(self.size_in_bits.div_ceil(flit_bits).max(1) as u32)
    }
}

impl fmt::Display for NetworkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request {}: {} -> {} vn {} ({}b)",
            self.id, self.src, self.dest, self.vn, self.size_in_bits
        )
    }
}

impl TotalBytes for NetworkRequest {
    fn total_bytes(&self) -> usize {
        self.size_in_bits.div_ceil(8) as usize
    }
}

impl Unique for NetworkRequest {
    fn id(&self) -> Id {
        self.id
    }
}

impl SimObject for NetworkRequest {}
