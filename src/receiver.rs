// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The multicast+TCP receiver: connects to a sender's TCP port for the
//! greeting, mirrors its storage locally, ingests the multicast feed,
//! and repairs gaps over the same TCP connection.
//!
//! Grounded in `original_source/src/receiver.c` for the state machine
//! (greeting → local storage creation → multicast join → gap tracking)
//! and in the teacher's `transport/udp.rs`/`transport/tcp/io_thread.rs`
//! for the `socket2`-then-`mio` construction idiom.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use mio::net::{TcpStream, UdpSocket};
use mio::Interest;

use crate::clock::{self, Microsec};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::latency::{Latency, LatencySnapshot};
use crate::net::poller::{Poller, Token};
use crate::net::socket;
use crate::storage::{CreateSpec, Storage, StoragePath};
use crate::wire::{self, DatagramHeader, EntryIter, Greeting, SequenceRange, WILL_QUIT_SEQ};

const TCP_TOKEN: Token = Token(0);
const MCAST_TOKEN: Token = Token(1);

/// How the receiver should bind its local storage mirror and where to
/// reach the sender.
#[derive(Clone, Debug)]
pub struct ReceiverConfig {
    pub sender_addr: SocketAddr,
    pub local_storage_path: String,
    pub mcast_interface: Ipv4Addr,
    pub persist: bool,
    pub runtime: RuntimeConfig,
}

/// Per-slot bookkeeping the receiver keeps outside the shared segment:
/// the sequence number that last updated each identifier, used to
/// reject a gap-repair reply that has already been superseded by a
/// later multicast datagram.
struct SlotState {
    base_id: i64,
    last_seq: Vec<i64>,
}

impl SlotState {
    fn new(base_id: i64, count: usize) -> Self {
        Self {
            base_id,
            last_seq: vec![0; count],
        }
    }

    fn idx(&self, id: i64) -> usize {
        (id - self.base_id) as usize
    }

    fn last_seq(&self, id: i64) -> i64 {
        self.last_seq[self.idx(id)]
    }

    fn set_last_seq(&mut self, id: i64, seq: i64) {
        let idx = self.idx(id);
        self.last_seq[idx] = seq;
    }
}

/// Why [`Receiver::connect`] or [`Receiver::run`] stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    SenderQuit,
}

/// Connects to a sender, mirrors its storage locally, and keeps that
/// mirror in sync via multicast ingest plus TCP gap repair.
pub struct Receiver {
    storage: Storage,
    cfg: ReceiverConfig,
    poller: Poller,
    tcp: TcpStream,
    mcast_socket: UdpSocket,
    greeting: Greeting,
    slots: SlotState,
    next_expected_seq: i64,
    outstanding_gap: Option<SequenceRange>,
    tcp_in_buf: Vec<u8>,
    mcast_recv_time: Microsec,
    tcp_recv_time: Microsec,
    seen_first_mcast: bool,
    mcast_latency: Latency,
    expected_source: Ipv4Addr,
    stopping: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Receiver {
    /// Connects to `cfg.sender_addr`, reads the greeting (bounded by
    /// `cfg.runtime.connect_read_timeout_usec`), creates (or reopens) the
    /// local mirror storage it describes, and joins the multicast group
    /// it advertises. Does not yet read any data — call [`Self::run`]
    /// for that.
    pub fn connect(cfg: ReceiverConfig) -> Result<Self> {
        let raw_tcp = socket::new_tcp()?;
        socket::set_tcp_nodelay(&raw_tcp, true)?;
        raw_tcp.connect(&cfg.sender_addr.into())?;
        let timeout = Duration::from_micros(cfg.runtime.connect_read_timeout_usec.max(0) as u64);
        raw_tcp.set_read_timeout(Some(timeout))?;
        let greeting = read_greeting_blocking(&raw_tcp)?;
        raw_tcp.set_nonblocking(true)?;
        let mut tcp = TcpStream::from_std(raw_tcp.into());

        let storage = open_or_create_mirror(&cfg, &greeting)?;

        let mcast_interface = if cfg.mcast_interface.is_unspecified() {
            socket::local_ipv4()?
        } else {
            cfg.mcast_interface
        };

        let raw_udp = socket::new_udp()?;
        socket::set_reuse_addr(&raw_udp, true)?;
        raw_udp.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, greeting.mcast_port)).into())?;
        let group: Ipv4Addr = greeting
            .mcast_addr
            .parse()
            .map_err(|_| Error::ProtocolError("greeting: malformed multicast address"))?;
        socket::join_multicast(&raw_udp, group, mcast_interface)?;
        raw_udp.set_nonblocking(true)?;
        let mut mcast_socket = UdpSocket::from_std(raw_udp.into());

        let mut poller = Poller::new(8)?;
        poller.register(&mut tcp, Interest::READABLE | Interest::WRITABLE)?;
        poller.register(&mut mcast_socket, Interest::READABLE)?;

        let now = clock::time()?;
        let base_id = storage.base_id();
        let count = (storage.max_id() - storage.base_id()) as usize;
        let expected_source = match cfg.sender_addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => {
                return Err(Error::InvalidArg("connect: sender_addr must be IPv4"))
            }
        };

        Ok(Self {
            storage,
            slots: SlotState::new(base_id, count),
            cfg,
            poller,
            tcp,
            mcast_socket,
            greeting,
            next_expected_seq: 1,
            outstanding_gap: None,
            tcp_in_buf: Vec::new(),
            mcast_recv_time: now,
            tcp_recv_time: now,
            seen_first_mcast: false,
            mcast_latency: Latency::new(),
            expected_source,
            stopping: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn stop_handle(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        std::sync::Arc::clone(&self.stopping)
    }

    /// A snapshot of the rolling multicast send-to-receive latency
    /// statistics, rolled from the last completed window.
    pub fn latency(&self) -> LatencySnapshot {
        self.mcast_latency.snapshot()
    }

    fn heartbeat_deadline(&self) -> Microsec {
        if self.seen_first_mcast {
            self.cfg.runtime.heartbeat_deadline_usec()
        } else {
            self.cfg.runtime.initial_mc_heartbeat_usec
        }
    }

    fn request_gap(&mut self, range: SequenceRange) -> Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        let merged = match self.outstanding_gap.take() {
            Some(existing) => existing.union(range),
            None => range,
        };
        let mut buf = Vec::with_capacity(SequenceRange::ENCODED_LEN);
        merged.encode_into(&mut buf);
        match self.tcp.write(&buf) {
            Ok(n) if n == buf.len() => {}
            Ok(_) => return Err(Error::ProtocolError("partial gap request write")),
            Err(e) if socket::is_blocked(&e) => {
                self.outstanding_gap = Some(merged);
                return Ok(());
            }
            Err(e) => return Err(Error::Io(e)),
        }
        self.outstanding_gap = None;
        Ok(())
    }

    fn apply_entry(&mut self, seq: i64, id: i64, value: &[u8]) -> Result<()> {
        if id < self.storage.base_id() || id >= self.storage.max_id() {
            return Err(Error::OutOfRange(id));
        }
        if seq <= self.slots.last_seq(id) {
            return Ok(());
        }
        self.storage.write_record(id, value, None)?;
        self.slots.set_last_seq(id, seq);
        Ok(())
    }

    fn on_mcast_readable(&mut self) -> Result<()> {
        // A UDP datagram can never exceed 65,507 bytes of payload; this
        // is large enough regardless of the sender's advertised MTU.
        let mut buf = vec![0u8; 65_536];
        loop {
            match self.mcast_socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let from_ip = match from.ip() {
                        std::net::IpAddr::V4(v4) => v4,
                        std::net::IpAddr::V6(_) => return Err(Error::UnexpectedSource),
                    };
                    if from_ip != self.expected_source {
                        return Err(Error::UnexpectedSource);
                    }
                    let now = clock::time()?;
                    self.mcast_recv_time = now;
                    self.seen_first_mcast = true;
                    let datagram = &buf[..n];
                    let header = DatagramHeader::decode(datagram)?;
                    if header.send_usec > 0 {
                        self.mcast_latency
                            .on_sample((now - header.send_usec as Microsec) as f64);
                    }
                    if header.is_heartbeat() {
                        let announced = header.data_seq();
                        if announced > self.next_expected_seq {
                            let gap = SequenceRange::new(self.next_expected_seq, announced);
                            self.request_gap(gap)?;
                            self.next_expected_seq = announced;
                        }
                        continue;
                    }
                    if header.seq > self.next_expected_seq {
                        let gap = SequenceRange::new(self.next_expected_seq, header.seq);
                        self.request_gap(gap)?;
                    }
                    if header.seq >= self.next_expected_seq {
                        for entry in EntryIter::new(datagram, self.greeting.value_size) {
                            let (id, value) = entry?;
                            self.apply_entry(header.seq, id, value)?;
                        }
                        self.next_expected_seq = header.seq + 1;
                    }
                }
                Err(e) if socket::is_blocked(&e) => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn on_tcp_readable(&mut self) -> Result<bool> {
        let mut tmp = [0u8; 4096];
        loop {
            match self.tcp.read(&mut tmp) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.tcp_recv_time = clock::time()?;
                    self.tcp_in_buf.extend_from_slice(&tmp[..n]);
                }
                Err(e) if socket::is_blocked(&e) => break,
                Err(e) if socket::is_peer_closed(&e) => return Ok(true),
                Err(e) => return Err(Error::Io(e)),
            }
        }
        self.drain_tcp_frames()?;
        Ok(false)
    }

    /// A control frame's leading `i64` is always one of the negative
    /// sentinels ([`wire::HEARTBEAT_SEQ`]/[`WILL_QUIT_SEQ`]); a gap
    /// reply's leading `i64` is always a real (positive) multicast
    /// sequence number. Peeking that field is enough to tell the two
    /// frame kinds apart without a length prefix.
    fn drain_tcp_frames(&mut self) -> Result<()> {
        let reply_len = wire::gap_reply_len(self.greeting.value_size);
        loop {
            if self.tcp_in_buf.len() < 8 {
                break;
            }
            let leading = i64::from_be_bytes(self.tcp_in_buf[0..8].try_into().unwrap());
            if leading < 0 {
                let seq = wire::decode_control(&self.tcp_in_buf)?;
                self.tcp_in_buf.drain(0..8);
                if seq == WILL_QUIT_SEQ {
                    self.stopping
                        .store(true, std::sync::atomic::Ordering::Relaxed);
                }
                continue;
            }
            if self.tcp_in_buf.len() < reply_len {
                break;
            }
            let (seq, id, value) =
                wire::decode_gap_reply(&self.tcp_in_buf, self.greeting.value_size)?;
            let value = value.to_vec();
            self.apply_entry(seq, id, &value)?;
            self.tcp_in_buf.drain(0..reply_len);
        }
        Ok(())
    }

    fn check_liveness(&self) -> Result<()> {
        let now = clock::time()?;
        if now - self.mcast_recv_time >= self.heartbeat_deadline() {
            return Err(Error::NoHeartbeat);
        }
        if now - self.tcp_recv_time >= self.cfg.runtime.heartbeat_deadline_usec() {
            return Err(Error::NoHeartbeat);
        }
        Ok(())
    }

    /// Runs the receiver's main loop: ingests multicast data, repairs
    /// gaps over TCP, and periodically touches the local mirror's
    /// liveness timestamp, until [`Self::stop_handle`] is set, the
    /// sender sends its will-quit frame, or a fatal error occurs
    /// ([`Error::NoHeartbeat`] most notably).
    pub fn run(&mut self) -> Result<StopReason> {
        use std::sync::atomic::Ordering;
        let mut last_touch = clock::time()?;
        loop {
            if self.stopping.load(Ordering::Relaxed) {
                return Ok(StopReason::SenderQuit);
            }
            if let Some(reason) = self.tick(&mut last_touch, Duration::from_millis(50))? {
                return Ok(reason);
            }
            if self.stopping.load(Ordering::Relaxed) {
                return Ok(StopReason::Requested);
            }
        }
    }

    /// Runs exactly one pass of the main loop's body: a liveness check, one
    /// bounded poll, and handling of whatever became ready. Returns
    /// `Some(reason)` if the sender's will-quit frame was observed during
    /// this tick. Exposed for callers (benchmarks, tests) that want to
    /// drive the receiver's event loop one step at a time instead of
    /// blocking in [`Self::run`]. Unlike `run`, each call starts its own
    /// touch-period window, so the periodic storage touch fires at most
    /// once per call rather than once per `touch_period_usec`.
    pub fn run_one_tick(&mut self) -> Result<Option<StopReason>> {
        let mut last_touch = clock::time()?;
        self.tick(&mut last_touch, Duration::from_millis(0))
    }

    fn tick(&mut self, last_touch: &mut Microsec, poll_timeout: Duration) -> Result<Option<StopReason>> {
        self.check_liveness()?;

        self.poller.events(Some(poll_timeout))?;
        let mut mcast_ready = false;
        let mut tcp_ready = false;
        let mut tcp_writable = false;
        self.poller.process_events(|token, readiness| {
            if token == MCAST_TOKEN && readiness.readable {
                mcast_ready = true;
            }
            if token == TCP_TOKEN {
                if readiness.readable {
                    tcp_ready = true;
                }
                if readiness.writable {
                    tcp_writable = true;
                }
            }
            Ok(())
        })?;

        if mcast_ready {
            self.on_mcast_readable()?;
        }
        if tcp_ready && self.on_tcp_readable()? {
            return Ok(Some(StopReason::SenderQuit));
        }
        if tcp_writable {
            if let Some(gap) = self.outstanding_gap.take() {
                self.request_gap(gap)?;
            }
        }

        let now = clock::time()?;
        if now - *last_touch >= self.cfg.runtime.touch_period_usec {
            self.storage.touch(now)?;
            *last_touch = now;
            self.mcast_latency.roll();
        }
        Ok(None)
    }
}

/// Blocking read of the greeting from a (still-blocking,
/// read-timeout-bounded) socket2 TCP stream: one read per call, growing
/// the buffer until every CRLF-delimited field described in
/// `SPEC_FULL.md` §6.1 has arrived.
fn read_greeting_blocking(sock: &socket2::Socket) -> Result<Greeting> {
    let mut raw = std::net::TcpStream::from(sock.try_clone()?);
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        match raw.read(&mut chunk) {
            Ok(0) => return Err(Error::Eof),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if let Ok(greeting) = Greeting::parse(&buf) {
                    return Ok(greeting);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(Error::ProtocolTimeout)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(Error::ProtocolTimeout)
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

fn open_or_create_mirror(cfg: &ReceiverConfig, greeting: &Greeting) -> Result<Storage> {
    let spec = CreateSpec {
        base_id: greeting.base_id,
        max_id: greeting.max_id,
        value_size: greeting.value_size,
        property_size: 0,
        queue_capacity: greeting.queue_capacity,
        description: greeting.description.clone(),
        data_version: greeting.data_version,
        persist: cfg.persist,
    };
    match Storage::open(&cfg.local_storage_path, false) {
        Ok(existing) => {
            if existing.base_id() == spec.base_id
                && existing.max_id() == spec.max_id
                && existing.value_size() == spec.value_size
            {
                Ok(existing)
            } else {
                drop(existing);
                let _ = Storage::delete(&cfg.local_storage_path, true);
                Storage::create(&cfg.local_storage_path, spec)
            }
        }
        Err(_) => {
            if matches!(StoragePath::parse(&cfg.local_storage_path), StoragePath::File(_)) {
                if let Some(parent) = std::path::Path::new(&cfg.local_storage_path).parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }
            Storage::create(&cfg.local_storage_path, spec)
        }
    }
}
