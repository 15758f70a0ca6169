// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The multicast+TCP sender: publishes a [`Storage`]'s change queue over
//! UDP multicast and answers TCP gap-repair requests from connected
//! receivers.
//!
//! Grounded in `original_source/src/sender.c` for the state machine and
//! in the teacher's `transport/tcp/io_thread.rs` for the
//! `mio`-registry-plus-per-client-state shape, adapted from an I/O
//! thread with an mpsc command channel down to a single-threaded main
//! loop (`SPEC_FULL.md` §4.4 calls for one thread, not a thread pool).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::Interest;

use crate::accum::Accumulator;
use crate::clock::{self, Microsec};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::net::poller::{Poller, Readiness, Token};
use crate::net::socket;
use crate::storage::Storage;
use crate::wire::{
    self, DatagramHeader, Greeting, SequenceRange, DATAGRAM_HEADER_LEN, HEARTBEAT_SEQ,
    SEQUENCE_MAX, WILL_QUIT_SEQ,
};

const LISTENER_TOKEN: Token = Token(0);
const CLIENT_TOKEN_START: usize = 2;

/// Where the sender publishes and how its multicast datagrams are paced.
#[derive(Clone, Debug)]
pub struct SenderConfig {
    pub mcast_group: Ipv4Addr,
    pub mcast_port: u16,
    pub mcast_interface: Ipv4Addr,
    pub mcast_ttl: u32,
    pub tcp_bind: SocketAddr,
    pub mcast_device: String,
    pub runtime: RuntimeConfig,
}

/// Per-record-slot bookkeeping the sender keeps in plain process memory
/// (never in the shared segment): the revision and outbound sequence of
/// the last transmission of that slot, used to skip unchanged records
/// and to answer gap-repair requests without re-reading storage.
struct SlotState {
    base_id: i64,
    last_tx_revision: Vec<i64>,
    last_tx_seq: Vec<i64>,
}

impl SlotState {
    fn new(base_id: i64, count: usize) -> Self {
        Self {
            base_id,
            last_tx_revision: vec![0; count],
            last_tx_seq: vec![0; count],
        }
    }

    fn idx(&self, id: i64) -> usize {
        (id - self.base_id) as usize
    }

    fn last_tx_revision(&self, id: i64) -> i64 {
        self.last_tx_revision[self.idx(id)]
    }

    fn last_tx_seq(&self, id: i64) -> i64 {
        self.last_tx_seq[self.idx(id)]
    }

    fn record_tx(&mut self, id: i64, revision: i64, seq: i64) {
        let idx = self.idx(id);
        self.last_tx_revision[idx] = revision;
        self.last_tx_seq[idx] = seq;
    }
}

/// The multicast packet currently being assembled, backed by the same
/// [`Accumulator`] the batch layer and receiver use for bounded,
/// staleness-tracked byte buffers.
struct PacketBuilder {
    acc: Accumulator,
    entries: usize,
}

impl PacketBuilder {
    fn new(capacity: usize, max_age_usec: Microsec) -> Self {
        Self {
            acc: Accumulator::new(capacity, max_age_usec),
            entries: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.entries == 0
    }

    fn begin(&mut self, seq: i64) -> Result<()> {
        self.acc.clear();
        let mut header = Vec::with_capacity(DATAGRAM_HEADER_LEN);
        DatagramHeader { seq, send_usec: 0 }.encode_into(&mut header);
        self.acc.store(&header)?;
        self.entries = 0;
        Ok(())
    }

    /// Appends one entry if it fits within capacity. Returns `false`
    /// (and leaves the buffer untouched) if it does not.
    fn try_add_entry(&mut self, id: i64, value: &[u8]) -> Result<bool> {
        let mut entry = Vec::with_capacity(8 + value.len());
        wire::encode_entry(&mut entry, id, value);
        let stored = self.acc.store(&entry)?;
        if stored {
            self.entries += 1;
        }
        Ok(stored)
    }

    fn is_stale(&self, now: Microsec) -> bool {
        self.acc.is_stale(now)
    }

    fn finalize(&mut self, send_usec: Microsec) -> Vec<u8> {
        let mut bytes = self.acc.take();
        bytes[8..16].copy_from_slice(&(send_usec as u64).to_be_bytes());
        // `take` empties the buffer but leaves the staleness clock
        // latched; clear it too so a flushed-while-idle builder doesn't
        // read as both stale and non-empty on the next loop iteration.
        self.acc.clear();
        self.entries = 0;
        bytes
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClientState {
    Idle,
    Replying,
}

struct Client {
    stream: TcpStream,
    addr: SocketAddr,
    state: ClientState,
    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
    union_range: SequenceRange,
    reply_range: SequenceRange,
    reply_id: i64,
    min_seq_found: i64,
    last_heartbeat_sent: Microsec,
}

impl Client {
    fn new(stream: TcpStream, addr: SocketAddr, base_id: i64, now: Microsec) -> Self {
        Self {
            stream,
            addr,
            state: ClientState::Idle,
            in_buf: Vec::with_capacity(64),
            out_buf: Vec::new(),
            union_range: SequenceRange::EMPTY,
            reply_range: SequenceRange::EMPTY,
            reply_id: base_id,
            min_seq_found: i64::MAX,
            last_heartbeat_sent: now,
        }
    }

    fn queue_write(&mut self, bytes: &[u8]) {
        self.out_buf.extend_from_slice(bytes);
    }

    /// Flushes as much of `out_buf` as the socket accepts right now.
    fn try_flush(&mut self) -> Result<()> {
        while !self.out_buf.is_empty() {
            match self.stream.write(&self.out_buf) {
                Ok(0) => return Err(Error::Eof),
                Ok(n) => {
                    self.out_buf.drain(0..n);
                }
                Err(e) if socket::is_blocked(&e) => return Ok(()),
                Err(e) if socket::is_peer_closed(&e) => return Err(Error::Eof),
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Drains whatever is available on the socket into `in_buf`, folding
    /// complete sequence-range requests into `union_range` as they
    /// arrive. Returns `true` if the peer closed the connection.
    fn on_readable(&mut self) -> Result<bool> {
        let mut tmp = [0u8; 512];
        loop {
            match self.stream.read(&mut tmp) {
                Ok(0) => return Ok(true),
                Ok(n) => self.in_buf.extend_from_slice(&tmp[..n]),
                Err(e) if socket::is_blocked(&e) => break,
                Err(e) if socket::is_peer_closed(&e) => return Ok(true),
                Err(e) => return Err(Error::Io(e)),
            }
        }
        while self.in_buf.len() >= SequenceRange::ENCODED_LEN {
            let range = SequenceRange::decode(&self.in_buf)?;
            self.in_buf.drain(0..SequenceRange::ENCODED_LEN);
            self.union_range = self.union_range.union(range);
        }
        Ok(false)
    }

    /// Advances the gap-reply state machine by one step: transitions
    /// `Idle` into `Replying` when a requestable gap is pending (or
    /// emits a per-client heartbeat when idle and due), or sends one
    /// more gap-repair record while `Replying`.
    fn on_writable(
        &mut self,
        storage: &Storage,
        slots: &SlotState,
        min_seq: &mut i64,
        heartbeat_usec: Microsec,
        now: Microsec,
    ) -> Result<()> {
        self.try_flush()?;
        if !self.out_buf.is_empty() {
            return Ok(());
        }
        match self.state {
            ClientState::Idle => {
                if !self.union_range.is_empty() && self.union_range.high > *min_seq {
                    self.reply_range = self.union_range;
                    self.union_range = SequenceRange::EMPTY;
                    self.reply_id = storage.base_id();
                    self.min_seq_found = i64::MAX;
                    self.state = ClientState::Replying;
                } else if now - self.last_heartbeat_sent >= heartbeat_usec {
                    let mut buf = Vec::with_capacity(8);
                    wire::encode_control(&mut buf, HEARTBEAT_SEQ);
                    self.queue_write(&buf);
                    self.last_heartbeat_sent = now;
                    self.try_flush()?;
                }
            }
            ClientState::Replying => {
                while self.reply_id < storage.max_id() {
                    let id = self.reply_id;
                    let slot_seq = slots.last_tx_seq(id);
                    self.reply_id += 1;
                    if !self.reply_range.contains(slot_seq) {
                        continue;
                    }
                    let rec = storage.get_record(id)?;
                    if rec.revision() == 0 {
                        continue;
                    }
                    let value = rec.value().to_vec();
                    let mut buf = Vec::with_capacity(wire::gap_reply_len(value.len()));
                    wire::encode_gap_reply(&mut buf, slot_seq, id, &value);
                    self.queue_write(&buf);
                    self.min_seq_found = self.min_seq_found.min(slot_seq);
                    self.try_flush()?;
                    return Ok(());
                }
                *min_seq = self.min_seq_found;
                self.reply_range = SequenceRange::EMPTY;
                self.state = ClientState::Idle;
            }
        }
        Ok(())
    }
}

/// Owns a storage's multicast publication and answers every connected
/// receiver's gap-repair requests. One `Sender` runs one storage; its
/// `run` method blocks the calling thread until `stop` is called from
/// another thread or a fatal liveness error occurs.
pub struct Sender {
    storage: Storage,
    cfg: SenderConfig,
    poller: Poller,
    listener: TcpListener,
    mcast_socket: UdpSocket,
    /// The poller token the multicast socket is currently registered
    /// under, if any. `None` whenever `clients` is empty — per
    /// `SPEC_FULL.md` §4.3 the multicast socket is only added to the
    /// poller while at least one client is connected.
    mcast_token: Option<Token>,
    mcast_group: SocketAddrV4,
    mcast_mtu: usize,
    clients: HashMap<Token, Client>,
    next_token: usize,
    next_seq: i64,
    min_seq: i64,
    queue_cursor: u64,
    slots: SlotState,
    pkt: PacketBuilder,
    pending_send: Option<Vec<u8>>,
    last_send_time: Microsec,
    created_at_open: Microsec,
    idle_since: Option<Microsec>,
    stopping: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Sender {
    pub fn new(storage: Storage, cfg: SenderConfig) -> Result<Self> {
        let raw_tcp = socket::new_tcp()?;
        socket::set_reuse_addr(&raw_tcp, true)?;
        raw_tcp.bind(&cfg.tcp_bind.into())?;
        raw_tcp.listen(128)?;
        raw_tcp.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(raw_tcp.into());

        let mcast_interface = if cfg.mcast_interface.is_unspecified() {
            socket::local_ipv4()?
        } else {
            cfg.mcast_interface
        };

        let raw_udp = socket::new_udp()?;
        socket::set_mcast_ttl(&raw_udp, cfg.mcast_ttl)?;
        socket::set_mcast_loopback(&raw_udp, true)?;
        socket::set_mcast_interface(&raw_udp, mcast_interface)?;
        raw_udp.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
        use std::os::unix::io::AsRawFd;
        // IPv4 + UDP header overhead is not available to a multicast
        // payload; subtract it from the raw interface MTU discovered via
        // `SIOCGIFMTU`.
        let mtu = socket::interface_mtu(raw_udp.as_raw_fd(), &cfg.mcast_device)
            .unwrap_or(1500)
            .saturating_sub(28)
            .max(DATAGRAM_HEADER_LEN + 64);
        raw_udp.connect(&SocketAddr::from((cfg.mcast_group, cfg.mcast_port)).into())?;
        raw_udp.set_nonblocking(true)?;
        let mut mcast_socket = UdpSocket::from_std(raw_udp.into());

        let mut poller = Poller::new(64)?;
        poller.register(&mut listener, Interest::READABLE)?;
        // The multicast socket is only registered with the poller once a
        // client has connected (`accept_clients`) and deregistered again
        // once the last one disconnects.

        let now = clock::time()?;
        let count = (storage.max_id() - storage.base_id()) as usize;
        let created_at_open = storage.created_time();

        let base_id = storage.base_id();
        let max_pkt_age_usec = cfg.runtime.max_pkt_age_usec;
        Ok(Self {
            mcast_group: SocketAddrV4::new(cfg.mcast_group, cfg.mcast_port),
            mcast_mtu: mtu,
            storage,
            slots: SlotState::new(base_id, count),
            cfg,
            poller,
            listener,
            mcast_socket,
            mcast_token: None,
            clients: HashMap::new(),
            next_token: CLIENT_TOKEN_START,
            next_seq: 1,
            min_seq: 0,
            queue_cursor: 0,
            pkt: PacketBuilder::new(mtu, max_pkt_age_usec),
            pending_send: None,
            last_send_time: now,
            created_at_open,
            idle_since: None,
            stopping: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    /// A clone-able handle to request a graceful shutdown of [`Self::run`]
    /// from another thread.
    pub fn stop_handle(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        std::sync::Arc::clone(&self.stopping)
    }

    fn greeting(&self) -> Greeting {
        Greeting {
            wire_version: wire::WIRE_VERSION,
            data_version: self.storage.data_version(),
            mcast_addr: self.mcast_group.ip().to_string(),
            mcast_port: self.mcast_group.port(),
            mcast_mtu: self.mcast_mtu,
            base_id: self.storage.base_id(),
            max_id: self.storage.max_id(),
            value_size: self.storage.value_size(),
            queue_capacity: self.storage.queue_capacity(),
            max_pkt_age_usec: self.cfg.runtime.max_pkt_age_usec,
            heartbeat_usec: self.cfg.runtime.heartbeat_usec,
            description: self.storage.description(),
        }
    }

    fn accept_clients(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let now = clock::time()?;
                    let greeting = self.greeting().encode();
                    // Best-effort: a fresh loopback/LAN socket accepts a
                    // small greeting into its send buffer in one write.
                    let _ = stream.write_all(&greeting);
                    let token = self
                        .poller
                        .register(&mut stream, Interest::READABLE | Interest::WRITABLE)?;
                    self.clients
                        .insert(token, Client::new(stream, addr, self.storage.base_id(), now));
                    if self.mcast_token.is_none() {
                        let mcast_token = self
                            .poller
                            .register(&mut self.mcast_socket, Interest::WRITABLE)?;
                        self.mcast_token = Some(mcast_token);
                    }
                    log::info!("lancaster::sender: accepted client {addr}");
                }
                Err(e) if socket::is_blocked(&e) => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn send_datagram(&mut self, bytes: Vec<u8>) -> Result<()> {
        match self.mcast_socket.send(&bytes) {
            Ok(_) => Ok(()),
            Err(e) if socket::is_blocked(&e) => {
                if let Some(token) = self.mcast_token {
                    self.pending_send = Some(bytes);
                    self.poller
                        .reregister(&mut self.mcast_socket, token, Interest::WRITABLE)?;
                }
                // With no client connected the multicast socket isn't
                // registered with the poller at all; nobody is waiting
                // on this datagram, so it's dropped rather than buffered
                // with no way to be notified when the socket drains.
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn flush_pending_send(&mut self) -> Result<()> {
        if let Some(bytes) = self.pending_send.take() {
            self.send_datagram(bytes)?;
        }
        Ok(())
    }

    fn flush_packet(&mut self) -> Result<()> {
        if self.pkt.is_empty() {
            return Ok(());
        }
        if self.next_seq == SEQUENCE_MAX {
            return Err(Error::SequenceOverflow);
        }
        let now = clock::time()?;
        let bytes = self.pkt.finalize(now);
        self.send_datagram(bytes)?;
        self.next_seq += 1;
        self.last_send_time = now;
        Ok(())
    }

    fn send_heartbeat(&mut self, now: Microsec) -> Result<()> {
        let mut buf = Vec::with_capacity(DATAGRAM_HEADER_LEN);
        DatagramHeader {
            seq: -self.next_seq,
            send_usec: now as u64,
        }
        .encode_into(&mut buf);
        self.send_datagram(buf)?;
        self.last_send_time = now;
        Ok(())
    }

    fn try_send_slot(&mut self, id: i64) -> Result<()> {
        let rec = self.storage.get_record(id)?;
        let (revision, value) = loop {
            let before = rec.read_lock()?;
            let value = rec.value().to_vec();
            if before == rec.revision() {
                break (before, value);
            }
        };
        if self.slots.last_tx_revision(id) == revision {
            return Ok(());
        }
        if self.pkt.is_empty() {
            self.pkt.begin(self.next_seq)?;
        }
        if !self.pkt.try_add_entry(id, &value)? {
            self.flush_packet()?;
            self.pkt.begin(self.next_seq)?;
            if !self.pkt.try_add_entry(id, &value)? {
                return Err(Error::ValueTooLarge {
                    given: value.len(),
                    max: self.mcast_mtu,
                });
            }
        }
        self.slots.record_tx(id, revision, self.next_seq);
        Ok(())
    }

    fn drain_change_queue(&mut self) -> Result<()> {
        let head = self.storage.queue_head();
        if head == self.queue_cursor {
            return Ok(());
        }
        if head < self.queue_cursor {
            // Producer recreated the change queue; snap forward rather
            // than replaying stale positions.
            self.queue_cursor = head;
            return Ok(());
        }
        let delta = head - self.queue_cursor;
        let capacity = self.storage.queue_capacity();
        if delta > capacity {
            if !self.cfg.runtime.ignore_overrun {
                return Err(Error::ChangeQueueOverrun);
            }
            self.queue_cursor = head - capacity;
        }
        while self.queue_cursor != head {
            let id = self.storage.read_queue(self.queue_cursor)?;
            self.queue_cursor += 1;
            self.try_send_slot(id)?;
        }
        Ok(())
    }

    fn check_liveness(&self) -> Result<()> {
        let now = clock::time()?;
        if !self.cfg.runtime.ignore_orphan {
            let touched = self.storage.touched_time()?;
            if now - touched >= self.cfg.runtime.orphan_timeout_usec {
                return Err(Error::StorageOrphaned);
            }
        }
        if !self.cfg.runtime.ignore_recreate && self.storage.created_time() != self.created_at_open
        {
            return Err(Error::StorageRecreated);
        }
        Ok(())
    }

    /// Runs the sender's main loop until [`Self::stop_handle`] is set or
    /// a fatal error (liveness failure, sequence overflow, I/O error)
    /// occurs. On return (success or error) a best-effort will-quit
    /// control frame is sent to every connected client.
    pub fn run(&mut self) -> Result<()> {
        let result = self.run_inner();
        self.shutdown();
        result
    }

    fn run_inner(&mut self) -> Result<()> {
        use std::sync::atomic::Ordering;
        while !self.stopping.load(Ordering::Relaxed) {
            self.check_liveness()?;

            let n = self.poller.events(Some(Duration::from_millis(0)))?;
            let mut did_work = n > 0;

            let mut ready: Vec<(Token, Readiness)> = Vec::new();
            self.poller.process_events(|token, readiness| {
                ready.push((token, readiness));
                Ok(())
            })?;

            for (token, readiness) in ready {
                if token == LISTENER_TOKEN {
                    self.accept_clients()?;
                } else if Some(token) == self.mcast_token {
                    if readiness.writable {
                        self.flush_pending_send()?;
                    }
                } else if let Some(mut client) = self.clients.remove(&token) {
                    let mut drop_client = false;
                    if readiness.readable {
                        match client.on_readable() {
                            Ok(true) => drop_client = true,
                            Ok(false) => {}
                            Err(Error::Eof) => drop_client = true,
                            Err(e) => return Err(e),
                        }
                    }
                    if !drop_client && readiness.writable {
                        match client.on_writable(
                            &self.storage,
                            &self.slots,
                            &mut self.min_seq,
                            self.cfg.runtime.heartbeat_usec,
                            clock::time()?,
                        ) {
                            Ok(()) => {}
                            Err(Error::Eof) => drop_client = true,
                            Err(e) => return Err(e),
                        }
                    }
                    if readiness.hup {
                        drop_client = true;
                    }
                    if drop_client {
                        let _ = self.poller.deregister(&mut client.stream);
                        log::info!("lancaster::sender: client {} disconnected", client.addr);
                        if self.clients.is_empty() {
                            if let Some(_mcast_token) = self.mcast_token.take() {
                                let _ = self.poller.deregister(&mut self.mcast_socket);
                                self.pending_send = None;
                            }
                        }
                    } else {
                        self.clients.insert(token, client);
                    }
                }
            }

            self.drain_change_queue()?;

            let now = clock::time()?;
            if self.pkt.is_stale(now) {
                self.flush_packet()?;
                did_work = true;
            }
            if now - self.last_send_time >= self.cfg.runtime.heartbeat_usec {
                self.send_heartbeat(now)?;
                did_work = true;
            }

            if did_work {
                self.idle_since = None;
            } else {
                let since = *self.idle_since.get_or_insert(now);
                if now - since >= self.cfg.runtime.idle_timeout_usec {
                    clock::sleep(self.cfg.runtime.idle_sleep_usec)?;
                }
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        let mut buf = Vec::with_capacity(8);
        wire::encode_control(&mut buf, WILL_QUIT_SEQ);
        for client in self.clients.values_mut() {
            client.queue_write(&buf);
            let _ = client.try_flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CreateSpec;
    use std::net::TcpStream as StdTcpStream;

    fn spec(max_id: i64, queue_capacity: u64) -> CreateSpec {
        CreateSpec {
            base_id: 0,
            max_id,
            value_size: 8,
            property_size: 0,
            queue_capacity,
            description: "sender test".to_string(),
            data_version: 1,
            persist: false,
        }
    }

    static TEST_PORT: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(18_200);

    fn next_test_port() -> u16 {
        TEST_PORT.fetch_add(2, std::sync::atomic::Ordering::Relaxed)
    }

    /// Returns the `Sender` alongside the `TempDir` backing its storage;
    /// the caller must keep the latter alive for as long as the former.
    fn test_sender(max_id: i64) -> (Sender, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a").to_string_lossy().into_owned();
        let storage = Storage::create(&path, spec(max_id, 0)).unwrap();
        let cfg = SenderConfig {
            mcast_group: Ipv4Addr::new(239, 5, 5, 5),
            mcast_port: next_test_port(),
            mcast_interface: Ipv4Addr::LOCALHOST,
            mcast_ttl: 1,
            tcp_bind: SocketAddr::from((Ipv4Addr::LOCALHOST, next_test_port())),
            mcast_device: "lo".to_string(),
            runtime: RuntimeConfig::default(),
        };
        (Sender::new(storage, cfg).unwrap(), tmp)
    }

    /// Per `SPEC_FULL.md` §4.3, the multicast socket is added to the
    /// poller only once a client has connected, and removed again once
    /// the last one disconnects — not registered unconditionally at
    /// construction.
    #[test]
    fn mcast_socket_is_registered_on_first_client_only() {
        let (mut sender, _tmp) = test_sender(4);
        assert!(sender.mcast_token.is_none());

        let client = StdTcpStream::connect(sender.cfg.tcp_bind).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        sender.accept_clients().unwrap();
        assert!(sender.mcast_token.is_some());
        assert_eq!(sender.clients.len(), 1);

        drop(client);
    }

    #[test]
    fn slot_state_tracks_last_transmission_per_id() {
        let mut slots = SlotState::new(0, 4);
        assert_eq!(slots.last_tx_revision(2), 0);
        slots.record_tx(2, 4, 9);
        assert_eq!(slots.last_tx_revision(2), 4);
        assert_eq!(slots.last_tx_seq(2), 9);
        assert_eq!(slots.last_tx_revision(1), 0);
    }

    #[test]
    fn packet_builder_rejects_entries_once_full() {
        let mut pkt = PacketBuilder::new(DATAGRAM_HEADER_LEN + 8 + 4, 1_000_000);
        pkt.begin(1).unwrap();
        assert!(pkt.try_add_entry(1, &[0, 0, 0, 0]).unwrap());
        assert!(!pkt.try_add_entry(2, &[0, 0, 0, 0]).unwrap());
        assert_eq!(pkt.entries, 1);
    }

    #[test]
    fn packet_builder_is_stale_after_max_age() {
        let mut pkt = PacketBuilder::new(128, 1_000);
        pkt.begin(1).unwrap();
        let now = clock::time().unwrap();
        assert!(!pkt.is_stale(now));
        assert!(pkt.is_stale(now + 2_000));
    }

    /// Regression: `finalize` must leave the builder ready for the next
    /// packet (empty and non-stale), not just the accumulator's buffer.
    /// A builder that was flushed while still `is_stale` but never saw
    /// `begin()` called again used to report `is_empty() == false` and
    /// `is_stale() == true` forever after, which made `flush_packet`
    /// call `finalize` a second time against an already-empty buffer.
    #[test]
    fn packet_builder_finalize_resets_for_reuse() {
        let mut pkt = PacketBuilder::new(128, 1_000);
        pkt.begin(1).unwrap();
        pkt.try_add_entry(1, &[0; 8]).unwrap();
        let now = clock::time().unwrap();
        assert!(pkt.is_stale(now + 2_000));

        let bytes = pkt.finalize(now + 2_000);
        assert_eq!(bytes.len(), DATAGRAM_HEADER_LEN + 8 + 8);
        assert!(pkt.is_empty());
        assert!(!pkt.is_stale(now + 2_000));
    }

    /// Drives the TCP gap-repair state machine end to end over a real
    /// loopback socket pair: a client requests a range, the server
    /// replies with every in-range record that was ever transmitted,
    /// and `min_seq` advances once the pass completes.
    #[test]
    fn client_state_machine_answers_gap_request_over_loopback() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a").to_string_lossy().into_owned();
        let storage = Storage::create(&path, spec(4, 0)).unwrap();
        storage.write_record(0, &[1; 8], None).unwrap();
        storage.write_record(1, &[2; 8], None).unwrap();

        let mut slots = SlotState::new(0, 4);
        slots.record_tx(0, storage.get_record(0).unwrap().revision(), 5);
        slots.record_tx(1, storage.get_record(1).unwrap().revision(), 7);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut requester = StdTcpStream::connect(addr).unwrap();
        let (accepted, peer_addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let mut client = Client::new(
            TcpStream::from_std(accepted),
            peer_addr,
            storage.base_id(),
            0,
        );

        let mut range_bytes = Vec::new();
        SequenceRange::new(0, 10).encode_into(&mut range_bytes);
        requester.write_all(&range_bytes).unwrap();
        requester.set_nonblocking(true).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!client.on_readable().unwrap());
        assert_eq!(client.union_range, SequenceRange::new(0, 10));

        let mut min_seq = 0i64;
        client
            .on_writable(&storage, &slots, &mut min_seq, 1_000_000, 0)
            .unwrap();
        assert_eq!(client.state, ClientState::Replying);

        // Drain both gap replies (one per `on_writable` call).
        client
            .on_writable(&storage, &slots, &mut min_seq, 1_000_000, 0)
            .unwrap();
        client
            .on_writable(&storage, &slots, &mut min_seq, 1_000_000, 0)
            .unwrap();
        client
            .on_writable(&storage, &slots, &mut min_seq, 1_000_000, 0)
            .unwrap();

        assert_eq!(client.state, ClientState::Idle);
        assert_eq!(min_seq, 5);

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut received = Vec::new();
        requester.read_to_end(&mut received).ok();
        let value_size = storage.value_size();
        let mut rest = &received[..];
        let mut seen = Vec::new();
        while rest.len() >= wire::gap_reply_len(value_size) {
            let (seq, id, value) = wire::decode_gap_reply(rest, value_size).unwrap();
            seen.push((seq, id, value.to_vec()));
            rest = &rest[wire::gap_reply_len(value_size)..];
        }
        assert_eq!(seen, vec![(5, 0, vec![1; 8]), (7, 1, vec![2; 8])]);
    }

    #[test]
    fn idle_client_sends_heartbeat_when_due_and_no_gap_pending() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a").to_string_lossy().into_owned();
        let storage = Storage::create(&path, spec(2, 0)).unwrap();
        let slots = SlotState::new(0, 2);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut requester = StdTcpStream::connect(addr).unwrap();
        let (accepted, peer_addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let mut client = Client::new(TcpStream::from_std(accepted), peer_addr, 0, 0);

        let mut min_seq = 0i64;
        client
            .on_writable(&storage, &slots, &mut min_seq, 1_000, 2_000)
            .unwrap();
        assert_eq!(client.state, ClientState::Idle);

        std::thread::sleep(std::time::Duration::from_millis(10));
        requester.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 8];
        requester.read_exact(&mut buf).unwrap();
        assert_eq!(i64::from_be_bytes(buf), HEARTBEAT_SEQ);
    }
}
