// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns [`Result<T>`], a thin
//! alias over `std::result::Result<T, Error>`. There is no process-wide
//! "last error" slot; the error value itself carries everything a caller
//! needs to decide whether to retry, drop a connection, or abort.

use std::fmt;
use std::io;

/// Errors produced by storage, protocol and concurrency primitives.
#[derive(Debug)]
pub enum Error {
    // ===== Caller contract violations =====
    /// An argument violated a documented precondition.
    InvalidArg(&'static str),

    // ===== Concurrency =====
    /// A spin lock was held (or contended) for longer than the configured
    /// deadlock timeout.
    DeadlockDetected,

    // ===== Storage =====
    /// `queue_capacity` was neither zero nor a power of two.
    InvalidCapacity(usize),
    /// A storage file already exists at the given path with different
    /// header dimensions.
    StorageUnequal,
    /// The segment's magic word did not match on open.
    StorageCorrupted,
    /// The segment's file-major version did not match this build.
    WrongFileVersion { found: u16, expected: u16 },
    /// A mutating operation was attempted on a read-only storage.
    StorageReadOnly,
    /// A storage's creation timestamp changed since it was opened.
    StorageRecreated,
    /// A storage's touched timestamp has not advanced within the orphan
    /// timeout.
    StorageOrphaned,
    /// An identifier fell outside `[base_id, max_id)`.
    OutOfRange(i64),
    /// A value or property was written whose size exceeds the slot's
    /// configured size.
    ValueTooLarge { given: usize, max: usize },
    /// A consumer's change-queue cursor fell more than the queue's
    /// capacity behind `head`.
    ChangeQueueOverrun,
    /// An operation requiring a change queue was attempted on a storage
    /// created with `queue_capacity == 0`.
    NoChangeQueue,

    // ===== Protocol =====
    /// A multicast or TCP frame was truncated or otherwise malformed.
    ProtocolError(&'static str),
    /// The greeting's wire-protocol major version did not match.
    WrongWireVersion { found: u16, expected: u16 },
    /// A multicast datagram arrived from an address other than the one
    /// advertised in the sender's greeting.
    UnexpectedSource,
    /// The greeting was not fully read within the connect deadline.
    ProtocolTimeout,
    /// No heartbeat (multicast or TCP) was observed within the configured
    /// deadline.
    NoHeartbeat,
    /// The sender's 63-bit sequence space was exhausted.
    SequenceOverflow,

    // ===== I/O =====
    /// The peer closed its half of the connection.
    Eof,
    /// An underlying OS call failed in a way not covered by a more
    /// specific variant above.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArg(what) => write!(f, "invalid argument: {what}"),
            Self::DeadlockDetected => write!(f, "spin lock deadlock detected"),
            Self::InvalidCapacity(cap) => {
                write!(f, "invalid queue capacity {cap}: must be zero or a power of two")
            }
            Self::StorageUnequal => {
                write!(f, "existing storage file has different dimensions")
            }
            Self::StorageCorrupted => write!(f, "storage segment magic word mismatch"),
            Self::WrongFileVersion { found, expected } => write!(
                f,
                "storage file version {found} incompatible with {expected}"
            ),
            Self::StorageReadOnly => write!(f, "storage is read-only"),
            Self::StorageRecreated => write!(f, "storage was recreated since open"),
            Self::StorageOrphaned => write!(f, "storage producer has gone quiet"),
            Self::OutOfRange(id) => write!(f, "identifier {id} out of range"),
            Self::ValueTooLarge { given, max } => {
                write!(f, "value of {given} bytes exceeds slot size {max}")
            }
            Self::ChangeQueueOverrun => write!(f, "change queue overrun"),
            Self::NoChangeQueue => write!(f, "storage has no change queue"),
            Self::ProtocolError(what) => write!(f, "protocol error: {what}"),
            Self::WrongWireVersion { found, expected } => write!(
                f,
                "wire version {found} incompatible with {expected}"
            ),
            Self::UnexpectedSource => write!(f, "datagram from unexpected source address"),
            Self::ProtocolTimeout => write!(f, "timed out waiting for greeting"),
            Self::NoHeartbeat => write!(f, "peer heartbeat deadline exceeded"),
            Self::SequenceOverflow => write!(f, "sequence number space exhausted"),
            Self::Eof => write!(f, "peer closed connection"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
