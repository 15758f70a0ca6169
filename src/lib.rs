// SPDX-License-Identifier: Apache-2.0 OR MIT

//! # Lancaster
//!
//! A low-latency market-data distribution substrate: a memory-mapped
//! shared record store plus a reliable multicast/TCP protocol engine for
//! mirroring that store across a network.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use lancaster::storage::{CreateSpec, Storage};
//!
//! fn main() -> lancaster::Result<()> {
//!     let spec = CreateSpec {
//!         base_id: 0,
//!         max_id: 1_000,
//!         value_size: 8,
//!         property_size: 0,
//!         queue_capacity: 1024,
//!         description: "example feed".to_string(),
//!         data_version: 1,
//!         persist: true,
//!     };
//!     let storage = Storage::create("/tmp/lancaster-example", spec)?;
//!     storage.write_record(0, &42i64.to_ne_bytes(), None)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------------------------------+
//! |  writer process            storage (mmap)            readers     |
//! |  write_record() --------->  [revision|ts|value]  <--- get_record |
//! +------------------------------------------------------------------+
//!                                     |
//!                              Sender (this host)
//!                        multicast datagrams + TCP gap repair
//!                                     v
//!                              Receiver (remote host)
//!                                     |
//!                              mirrored storage (mmap)
//! +------------------------------------------------------------------+
//! ```
//!
//! ## Modules
//!
//! | Module | Responsibility |
//! |---|---|
//! | [`storage`] | Memory-mapped record segment and change queue |
//! | [`sender`] | Multicast+TCP protocol engine, publishing side |
//! | [`receiver`] | Multicast+TCP protocol engine, mirroring side |
//! | [`batch`] | Bulk read/write and change-queue polling over a [`storage::Storage`] |
//! | [`toucher`] | Background thread that refreshes a storage's liveness timestamp |
//! | [`config`] | Layered runtime tunables (`LANCASTER_*` environment overrides) |
//! | [`wire`] | On-the-wire formats: greeting, datagram header, gap reply, control frame |
//! | [`latency`] | Welford rolling mean/stddev, used for send-to-receive latency |
//! | [`net`] | Socket construction and readiness polling (`socket2` + `mio`) |
//! | [`spin`] | The 64-bit revision spin lock underlying every record |
//! | [`clock`] | Microsecond wall-clock time and interruption-safe sleep |
//! | [`error`] | Crate-wide [`Error`]/[`Result`] |
//! | [`accum`] | Bounded, staleness-tracked byte buffer (the sender's packet scratch area) |
//! | [`logging`] | `log`-facade initialization helper |
//!
//! The core of the crate is the coupled pair `storage` + `sender`/
//! `receiver`: everything else exists to support that pair. CLI
//! wrapping, a JSON discovery advertiser, and statistics reporting over
//! UDP are left to binaries built against this library; see
//! [`sender::Sender`] and [`receiver::Receiver`] for the pieces such a
//! binary would drive.

pub mod accum;
pub mod batch;
pub mod clock;
pub mod config;
pub mod error;
pub mod latency;
pub mod logging;
pub mod net;
pub mod receiver;
pub mod sender;
pub mod spin;
pub mod storage;
pub mod toucher;
pub mod wire;

pub use error::{Error, Result};
pub use receiver::{Receiver, ReceiverConfig};
pub use sender::{Sender, SenderConfig};
pub use storage::{CreateSpec, Storage};
