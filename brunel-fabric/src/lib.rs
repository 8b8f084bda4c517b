// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

#![doc(test(attr(warn(unused))))]

//! Interconnection network models for the BRUNEL engine.
//!
//! This crate provides the building blocks of a packet-switched network
//! simulation: the [link control](crate::link_control) endpoints use to
//! reach a router, the [router](crate::router) itself, the
//! [topology](crate::topology) policies that pick output ports, a
//! [bridge](crate::bridge) stitching two networks together, and a
//! [traffic generator](crate::traffic_gen) for synthetic load. The
//! [builder](crate::builder) wires complete networks from these parts.
//!
//! All links carry virtual-channel flow-controlled traffic: a sender only
//! transmits when it holds credits for the receiving buffer, and credits
//! return as the receiver drains. Bandwidth is accounted in flits; a
//! packet of `n` flits occupies its link for `n` ticks of the link's flit
//! clock.

pub mod bridge;
pub mod builder;
pub mod event;
pub mod link_control;
pub mod reorder_link_control;
pub mod request;
pub mod router;
pub mod stats;
pub mod topology;
pub mod traffic_gen;
pub mod units;

/// Re-exported for the connection macros.
pub use paste::paste;

#[macro_export]
/// Connect an [OutPort](brunel_engine::port::OutPort) port to an
/// [InPort](brunel_engine::port::InPort)
macro_rules! connect_port {
    ($from:expr, $from_port_name:ident => $to:expr, $to_port_name:ident) => {{
        brunel_track::debug!($from.entity() ; "Connect {}.{} => {}.{}", $from, stringify!($from_port_name), $to, stringify!($to_port_name));
        $crate::paste! {
            $from.[< connect_port_ $from_port_name >]($to.[< port_ $to_port_name >]())
        }
    }};
    ($from:expr, $from_port_name:ident, $from_index:expr => $to:expr, $to_port_name:ident) => {{
        let from_index: usize = $from_index;
        brunel_track::debug!($from.entity() ; "Connect {}.{}[{}] => {}.{}", $from, stringify!($from_port_name), from_index, $to, stringify!($to_port_name));
        $crate::paste! {
            $from.[< connect_port_ $from_port_name _i >](from_index, $to.[< port_ $to_port_name >]())
        }
    }};
    ($from:expr, $from_port_name:ident => $to:expr, $to_port_name:ident, $to_index:expr) => {{
        let to_index: usize = $to_index;
        brunel_track::debug!($from.entity() ; "Connect {}.{} => {}.{}[{}]", $from, stringify!($from_port_name), $to, stringify!($to_port_name), to_index);
        $crate::paste! {
            $from.[< connect_port_ $from_port_name >]($to.[< port_ $to_port_name _i >](to_index))
        }
    }};
    ($from:expr, $from_port_name:ident, $from_index:expr => $to:expr, $to_port_name:ident, $to_index:expr) => {{
        let from_index: usize = $from_index;
        let to_index: usize = $to_index;
        brunel_track::debug!($from.entity() ; "Connect {}.{}[{}] => {}.{}[{}]", $from, stringify!($from_port_name), from_index, $to, stringify!($to_port_name), to_index);
        $crate::paste! {
            $from.[< connect_port_ $from_port_name _i >](from_index, $to.[< port_ $to_port_name _i >](to_index))
        }
    }};
}

#[macro_export]
/// Connect a tx port stored in a `RefCell<Option<>>`
macro_rules! connect_tx {
    ($component:expr, $fn:ident ; $port_state:ident) => {
        $component
            .borrow_mut()
            .as_mut()
            .unwrap()
            .$fn($port_state)
    };
}

#[macro_export]
/// Access an rx port stored in a `RefCell<Option<>>`
macro_rules! port_rx {
    ($component:expr, $fn:ident) => {
        $component.borrow().as_ref().unwrap().$fn()
    };
}

#[macro_export]
/// Take a variable out of a `RefCell<Option<>>`.
macro_rules! take_option {
    ($var:expr) => {
        $var.borrow_mut().take().unwrap()
    };
}
