// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Socket construction/option plumbing and readiness multiplexing.
//!
//! Grounded in `original_source/src/socket.c` for the option surface and
//! in the teacher's `transport/udp.rs` (`socket2` for setup,
//! `mio` for polling) for the idiom.

pub mod poller;
pub mod socket;

pub use poller::{Poller, Readiness};
