// SPDX-License-Identifier: Apache-2.0 OR MIT

//! On-the-wire formats: the TCP greeting, UDP multicast datagrams, and
//! the TCP gap-repair/heartbeat frames exchanged between [`crate::sender`]
//! and [`crate::receiver`].
//!
//! Every numeric field on the wire is big-endian, independent of the
//! host's native endianness; this module is the only place that cares.

use crate::clock::Microsec;
use crate::error::{Error, Result};

/// This build's wire-protocol version: high byte major, low byte minor.
pub const WIRE_MAJOR: u8 = 1;
pub const WIRE_MINOR: u8 = 0;
pub const WIRE_VERSION: u16 = ((WIRE_MAJOR as u16) << 8) | WIRE_MINOR as u16;

/// Sequence number reserved for a pure heartbeat TCP control frame.
pub const HEARTBEAT_SEQ: i64 = -1;
/// Sequence number reserved for the sender's graceful-shutdown frame.
pub const WILL_QUIT_SEQ: i64 = -2;
/// The sender's 63-bit-effective sequence ceiling; reaching it is fatal.
pub const SEQUENCE_MAX: i64 = i64::MAX;

pub fn wire_major(version: u16) -> u8 {
    (version >> 8) as u8
}

/// The sender's self-description, sent once per accepted TCP client
/// (`SPEC_FULL.md` §6.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Greeting {
    pub wire_version: u16,
    pub data_version: u16,
    pub mcast_addr: String,
    pub mcast_port: u16,
    pub mcast_mtu: usize,
    pub base_id: i64,
    pub max_id: i64,
    pub value_size: usize,
    pub queue_capacity: u64,
    pub max_pkt_age_usec: Microsec,
    pub heartbeat_usec: Microsec,
    pub description: String,
}

impl Greeting {
    /// CRLF-delimited ASCII, field order per `SPEC_FULL.md` §6.1.
    pub fn encode(&self) -> Vec<u8> {
        let lines = [
            self.wire_version.to_string(),
            self.data_version.to_string(),
            self.mcast_addr.clone(),
            self.mcast_port.to_string(),
            self.mcast_mtu.to_string(),
            self.base_id.to_string(),
            self.max_id.to_string(),
            self.value_size.to_string(),
            self.queue_capacity.to_string(),
            self.max_pkt_age_usec.to_string(),
            self.heartbeat_usec.to_string(),
            self.description.clone(),
        ];
        let mut out = String::new();
        for line in lines {
            out.push_str(&line);
            out.push_str("\r\n");
        }
        out.into_bytes()
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(buf)
            .map_err(|_| Error::ProtocolError("greeting: not valid ascii/utf-8"))?;
        let mut fields = text.split("\r\n").filter(|l| !l.is_empty());
        let mut next = || fields.next().ok_or(Error::ProtocolError("greeting: truncated"));
        let parse_field = |s: &str| s.parse().map_err(|_| Error::ProtocolError("greeting: malformed field"));

        let wire_version: u16 = parse_field(next()?)?;
        if wire_major(wire_version) != WIRE_MAJOR {
            return Err(Error::WrongWireVersion {
                found: wire_version,
                expected: WIRE_VERSION,
            });
        }
        let greeting = Self {
            wire_version,
            data_version: parse_field(next()?)?,
            mcast_addr: next()?.to_string(),
            mcast_port: parse_field(next()?)?,
            mcast_mtu: parse_field(next()?)?,
            base_id: parse_field(next()?)?,
            max_id: parse_field(next()?)?,
            value_size: parse_field(next()?)?,
            queue_capacity: parse_field(next()?)?,
            max_pkt_age_usec: parse_field(next()?)?,
            heartbeat_usec: parse_field(next()?)?,
            description: next()?.to_string(),
        };
        Ok(greeting)
    }
}

/// The fixed 16-byte prefix of every multicast datagram: a signed
/// sequence number followed by the send-time placeholder/value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatagramHeader {
    pub seq: i64,
    pub send_usec: u64,
}

pub const DATAGRAM_HEADER_LEN: usize = 16;

impl DatagramHeader {
    pub fn is_heartbeat(&self) -> bool {
        self.seq < 0
    }

    /// The positive sequence this heartbeat announces, or the sequence
    /// itself for a data packet.
    pub fn data_seq(&self) -> i64 {
        if self.seq < 0 {
            -self.seq
        } else {
            self.seq
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.send_usec.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DATAGRAM_HEADER_LEN {
            return Err(Error::ProtocolError("datagram shorter than its header"));
        }
        let seq = i64::from_be_bytes(buf[0..8].try_into().unwrap());
        let send_usec = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        Ok(Self { seq, send_usec })
    }
}

/// Appends one `(identifier, value)` record entry to a multicast packet
/// under construction.
pub fn encode_entry(buf: &mut Vec<u8>, id: i64, value: &[u8]) {
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(value);
}

/// Iterates the `(identifier, value)` entries following a decoded
/// [`DatagramHeader`], for a datagram of known per-slot `value_size`.
pub struct EntryIter<'a> {
    rest: &'a [u8],
    value_size: usize,
}

impl<'a> EntryIter<'a> {
    pub fn new(datagram: &'a [u8], value_size: usize) -> Self {
        Self {
            rest: &datagram[DATAGRAM_HEADER_LEN.min(datagram.len())..],
            value_size,
        }
    }
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = Result<(i64, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let entry_len = 8 + self.value_size;
        if self.rest.len() < entry_len {
            self.rest = &[];
            return Some(Err(Error::ProtocolError("truncated record entry")));
        }
        let id = i64::from_be_bytes(self.rest[0..8].try_into().unwrap());
        let value = &self.rest[8..entry_len];
        self.rest = &self.rest[entry_len..];
        Some(Ok((id, value)))
    }
}

/// A half-open sequence interval `[low, high)`, per `SPEC_FULL.md` §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceRange {
    pub low: i64,
    pub high: i64,
}

impl SequenceRange {
    pub const EMPTY: Self = Self {
        low: i64::MAX,
        high: i64::MIN,
    };

    pub fn new(low: i64, high: i64) -> Self {
        if low < high {
            Self { low, high }
        } else {
            Self::EMPTY
        }
    }

    pub fn is_empty(&self) -> bool {
        self.low >= self.high
    }

    pub fn contains(&self, seq: i64) -> bool {
        seq >= self.low && seq < self.high
    }

    /// The smallest range covering both `self` and `other`; either side
    /// may be [`Self::EMPTY`].
    pub fn union(&self, other: Self) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return *self;
        }
        Self::new(self.low.min(other.low), self.high.max(other.high))
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.low as u64).to_be_bytes());
        buf.extend_from_slice(&(self.high as u64).to_be_bytes());
    }

    pub const ENCODED_LEN: usize = 16;

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(Error::ProtocolError("truncated sequence range"));
        }
        let low = u64::from_be_bytes(buf[0..8].try_into().unwrap()) as i64;
        let high = u64::from_be_bytes(buf[8..16].try_into().unwrap()) as i64;
        Ok(Self::new(low, high))
    }
}

/// One TCP gap-repair reply: `seq | id | value`.
pub const fn gap_reply_len(value_size: usize) -> usize {
    8 + 8 + value_size
}

pub fn encode_gap_reply(buf: &mut Vec<u8>, seq: i64, id: i64, value: &[u8]) {
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(value);
}

pub fn decode_gap_reply(buf: &[u8], value_size: usize) -> Result<(i64, i64, &[u8])> {
    let needed = gap_reply_len(value_size);
    if buf.len() < needed {
        return Err(Error::ProtocolError("truncated gap reply"));
    }
    let seq = i64::from_be_bytes(buf[0..8].try_into().unwrap());
    let id = i64::from_be_bytes(buf[8..16].try_into().unwrap());
    Ok((seq, id, &buf[16..needed]))
}

/// A bare control frame: just a sequence number (heartbeat or will-quit).
pub fn encode_control(buf: &mut Vec<u8>, seq: i64) {
    buf.extend_from_slice(&seq.to_be_bytes());
}

pub fn decode_control(buf: &[u8]) -> Result<i64> {
    if buf.len() < 8 {
        return Err(Error::ProtocolError("truncated control frame"));
    }
    Ok(i64::from_be_bytes(buf[0..8].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_greeting() -> Greeting {
        Greeting {
            wire_version: WIRE_VERSION,
            data_version: 7,
            mcast_addr: "239.1.2.3".to_string(),
            mcast_port: 9000,
            mcast_mtu: 1472,
            base_id: 0,
            max_id: 100,
            value_size: 8,
            queue_capacity: 64,
            max_pkt_age_usec: 1_000,
            heartbeat_usec: 1_000_000,
            description: "test feed".to_string(),
        }
    }

    #[test]
    fn greeting_round_trips() {
        let g = sample_greeting();
        let parsed = Greeting::parse(&g.encode()).unwrap();
        assert_eq!(g, parsed);
    }

    #[test]
    fn greeting_rejects_wire_major_mismatch() {
        let mut g = sample_greeting();
        g.wire_version = 0x0200;
        let err = Greeting::parse(&g.encode()).unwrap_err();
        assert!(matches!(err, Error::WrongWireVersion { found: 0x0200, .. }));
    }

    #[test]
    fn greeting_rejects_truncation() {
        let g = sample_greeting();
        let mut bytes = g.encode();
        bytes.truncate(bytes.len() / 2);
        assert!(matches!(
            Greeting::parse(&bytes),
            Err(Error::ProtocolError(_))
        ));
    }

    #[test]
    fn datagram_header_round_trips_and_detects_heartbeat() {
        let mut buf = Vec::new();
        let hdr = DatagramHeader {
            seq: -5,
            send_usec: 123,
        };
        hdr.encode_into(&mut buf);
        let decoded = DatagramHeader::decode(&buf).unwrap();
        assert_eq!(decoded, hdr);
        assert!(decoded.is_heartbeat());
        assert_eq!(decoded.data_seq(), 5);
    }

    #[test]
    fn entry_iter_walks_fixed_width_entries() {
        let mut buf = Vec::new();
        DatagramHeader {
            seq: 1,
            send_usec: 0,
        }
        .encode_into(&mut buf);
        encode_entry(&mut buf, 10, &[1, 2, 3, 4]);
        encode_entry(&mut buf, 11, &[5, 6, 7, 8]);

        let entries: Result<Vec<_>> = EntryIter::new(&buf, 4).collect();
        let entries = entries.unwrap();
        assert_eq!(entries, vec![(10, &[1, 2, 3, 4][..]), (11, &[5, 6, 7, 8][..])]);
    }

    #[test]
    fn entry_iter_errors_on_truncated_trailing_entry() {
        let mut buf = Vec::new();
        DatagramHeader {
            seq: 1,
            send_usec: 0,
        }
        .encode_into(&mut buf);
        buf.extend_from_slice(&10i64.to_be_bytes());
        buf.extend_from_slice(&[1, 2]); // short two bytes of a 4-byte value

        let mut it = EntryIter::new(&buf, 4);
        assert!(matches!(it.next(), Some(Err(Error::ProtocolError(_)))));
        assert!(it.next().is_none());
    }

    #[test]
    fn sequence_range_degenerate_is_empty() {
        assert!(SequenceRange::new(5, 5).is_empty());
        assert!(SequenceRange::new(5, 3).is_empty());
        assert!(SequenceRange::EMPTY.is_empty());
    }

    #[test]
    fn sequence_range_union_widens_to_cover_both() {
        let a = SequenceRange::new(5, 10);
        let b = SequenceRange::new(8, 20);
        assert_eq!(a.union(b), SequenceRange::new(5, 20));
        assert_eq!(SequenceRange::EMPTY.union(a), a);
    }

    #[test]
    fn sequence_range_round_trips_on_wire() {
        let r = SequenceRange::new(5, 20);
        let mut buf = Vec::new();
        r.encode_into(&mut buf);
        assert_eq!(SequenceRange::decode(&buf).unwrap(), r);
    }

    #[test]
    fn gap_reply_round_trips() {
        let mut buf = Vec::new();
        encode_gap_reply(&mut buf, 42, 7, &[9, 9, 9, 9]);
        let (seq, id, value) = decode_gap_reply(&buf, 4).unwrap();
        assert_eq!((seq, id, value), (42, 7, &[9, 9, 9, 9][..]));
    }

    #[test]
    fn control_frame_round_trips() {
        let mut buf = Vec::new();
        encode_control(&mut buf, WILL_QUIT_SEQ);
        assert_eq!(decode_control(&buf).unwrap(), WILL_QUIT_SEQ);
    }
}
