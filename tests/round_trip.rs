// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end sender/receiver scenarios, driven over real loopback
//! sockets rather than mocked transports — following the teacher's own
//! `tests/reliable_repair.rs` / `tests/stress_reconnection.rs` style of
//! exercising the real state machines instead of unit-testing their
//! pieces in isolation.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use lancaster::config::RuntimeConfig;
use lancaster::error::Error;
use lancaster::receiver::{Receiver, ReceiverConfig, StopReason};
use lancaster::sender::{Sender, SenderConfig};
use lancaster::storage::{CreateSpec, Storage};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(19_000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(2, Ordering::Relaxed)
}

fn mcast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 9, 9, 9)
}

struct Endpoints {
    writer_path: String,
    mirror_path: String,
    tcp_port: u16,
    mcast_port: u16,
    _tmp: tempfile::TempDir,
}

fn spec(max_id: i64, queue_capacity: u64) -> CreateSpec {
    CreateSpec {
        base_id: 0,
        max_id,
        value_size: 8,
        property_size: 0,
        queue_capacity,
        description: "integration feed".to_string(),
        data_version: 1,
        persist: false,
    }
}

fn start_endpoints(max_id: i64, queue_capacity: u64) -> (Endpoints, Storage) {
    let tmp = tempfile::tempdir().unwrap();
    let writer_path = tmp.path().join("writer").to_string_lossy().into_owned();
    let mirror_path = tmp.path().join("mirror").to_string_lossy().into_owned();
    let writer_storage = Storage::create(&writer_path, spec(max_id, queue_capacity)).unwrap();
    (
        Endpoints {
            writer_path,
            mirror_path,
            tcp_port: next_port(),
            mcast_port: next_port(),
            _tmp: tmp,
        },
        writer_storage,
    )
}

fn sender_config(ep: &Endpoints, runtime: RuntimeConfig) -> SenderConfig {
    SenderConfig {
        mcast_group: mcast_group(),
        mcast_port: ep.mcast_port,
        mcast_interface: Ipv4Addr::LOCALHOST,
        mcast_ttl: 1,
        tcp_bind: SocketAddr::from((Ipv4Addr::LOCALHOST, ep.tcp_port)),
        mcast_device: "lo".to_string(),
        runtime,
    }
}

fn receiver_config(ep: &Endpoints, runtime: RuntimeConfig) -> ReceiverConfig {
    ReceiverConfig {
        sender_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, ep.tcp_port)),
        local_storage_path: ep.mirror_path.clone(),
        mcast_interface: Ipv4Addr::LOCALHOST,
        persist: false,
        runtime,
    }
}

/// Scenario 1 (`SPEC_FULL.md` §8): a writer creates a one-record storage,
/// writes a single value, and the receiver's mirror reflects the exact
/// same bytes well within the scenario's 100ms budget.
#[test]
fn round_trip_one_record_matches_spec_scenario() {
    let (ep, writer_storage) = start_endpoints(1, 4);
    let mut runtime = RuntimeConfig::default();
    runtime.heartbeat_usec = 200_000;
    runtime.max_pkt_age_usec = 500;

    let sender_storage = Storage::open(&ep.writer_path, true).unwrap();
    let mut sender = Sender::new(sender_storage, sender_config(&ep, runtime.clone())).unwrap();
    let sender_stop = sender.stop_handle();
    let sender_thread = thread::spawn(move || sender.run());

    thread::sleep(Duration::from_millis(50));
    let mut receiver = Receiver::connect(receiver_config(&ep, runtime)).unwrap();

    let value: u64 = 0x0102030405060708;
    writer_storage.write_record(0, &value.to_be_bytes(), None).unwrap();

    let start = Instant::now();
    loop {
        let _ = receiver.run_one_tick();
        let rec = receiver.storage().get_record(0).unwrap();
        if rec.value() == value.to_be_bytes() {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_millis(500),
            "receiver never mirrored the write"
        );
    }

    sender_stop.store(true, Ordering::Relaxed);
    let _ = sender_thread.join();
}

/// Scenario 4: once the writer stops mutating, the sender emits an empty
/// multicast datagram with a negated sequence at `heartbeat_usec`
/// intervals, and `next_seq` does not advance across it.
#[test]
fn sender_emits_heartbeat_when_producer_idle() {
    let (ep, _writer_storage) = start_endpoints(4, 4);
    let mut runtime = RuntimeConfig::default();
    runtime.heartbeat_usec = 50_000;
    runtime.max_pkt_age_usec = 500;

    // A raw socket standing in for "any receiver", bound to the same
    // multicast port the sender publishes to, listening via loopback
    // unicast delivery rather than real multicast routing.
    let listener = UdpSocket::bind((Ipv4Addr::LOCALHOST, ep.mcast_port)).unwrap();
    listener.set_read_timeout(Some(Duration::from_secs(1))).unwrap();

    let sender_storage = Storage::open(&ep.writer_path, true).unwrap();
    let mut sender = Sender::new(sender_storage, sender_config(&ep, runtime)).unwrap();
    let sender_stop = sender.stop_handle();
    let sender_thread = thread::spawn(move || sender.run());

    let mut buf = [0u8; 64];
    let (n, _) = listener.recv_from(&mut buf).expect("heartbeat datagram");
    let header = lancaster::wire::DatagramHeader::decode(&buf[..n]).unwrap();
    assert!(header.is_heartbeat());
    assert_eq!(header.data_seq(), 1); // next_seq never advanced past 1

    sender_stop.store(true, Ordering::Relaxed);
    let _ = sender_thread.join();
}

/// Scenario 5: a writer that stops touching its storage is declared
/// `STORAGE_ORPHANED` by the sender once `orphan_timeout_usec` elapses.
#[test]
fn sender_reports_storage_orphaned_after_timeout() {
    let (ep, _writer_storage) = start_endpoints(2, 0);
    let mut runtime = RuntimeConfig::default();
    runtime.orphan_timeout_usec = 50_000;
    runtime.heartbeat_usec = 1_000_000_000; // never fires within the test

    let sender_storage = Storage::open(&ep.writer_path, true).unwrap();
    let mut sender = Sender::new(sender_storage, sender_config(&ep, runtime)).unwrap();
    let sender_stop = sender.stop_handle();
    let sender_thread = thread::spawn(move || sender.run());

    thread::sleep(Duration::from_millis(300));
    sender_stop.store(true, Ordering::Relaxed);
    let result = sender_thread.join().unwrap();
    assert!(matches!(result, Err(Error::StorageOrphaned)));
}

/// Scenario 6: a burst of writes larger than the change-queue capacity,
/// consumed only after the burst completes, is a fatal
/// `CHANGE_QUEUE_OVERRUN` unless the sender is configured to ignore it.
#[test]
fn change_queue_overrun_is_fatal_unless_ignored() {
    let (ep, writer_storage) = start_endpoints(32, 4);
    for id in 0..16 {
        writer_storage
            .write_record(id, &(id as u64).to_be_bytes(), None)
            .unwrap();
    }

    let mut runtime = RuntimeConfig::default();
    runtime.heartbeat_usec = 1_000_000_000;
    let sender_storage = Storage::open(&ep.writer_path, true).unwrap();
    let mut sender = Sender::new(sender_storage, sender_config(&ep, runtime)).unwrap();
    let result = sender.run();
    assert!(matches!(result, Err(Error::ChangeQueueOverrun)));
}

#[test]
fn change_queue_overrun_can_be_ignored() {
    let (ep, writer_storage) = start_endpoints(32, 4);
    for id in 0..16 {
        writer_storage
            .write_record(id, &(id as u64).to_be_bytes(), None)
            .unwrap();
    }

    let mut runtime = RuntimeConfig::default();
    runtime.heartbeat_usec = 1_000_000_000;
    runtime.ignore_overrun = true;
    let sender_storage = Storage::open(&ep.writer_path, true).unwrap();
    let mut sender = Sender::new(sender_storage, sender_config(&ep, runtime)).unwrap();
    let sender_stop = sender.stop_handle();
    let sender_thread = thread::spawn(move || sender.run());

    thread::sleep(Duration::from_millis(200));
    sender_stop.store(true, Ordering::Relaxed);
    let result = sender_thread.join().unwrap();
    assert!(result.is_ok());
}

/// The sender's graceful-shutdown control frame (`WILL_QUIT_SEQ`) crosses
/// the real TCP connection and causes the receiver's own loop to stop
/// cooperatively rather than time out waiting for a heartbeat.
#[test]
fn receiver_observes_sender_will_quit_frame() {
    let (ep, _writer_storage) = start_endpoints(2, 0);
    let mut runtime = RuntimeConfig::default();
    runtime.heartbeat_usec = 100_000;
    runtime.max_pkt_age_usec = 500;

    let sender_storage = Storage::open(&ep.writer_path, true).unwrap();
    let mut sender = Sender::new(sender_storage, sender_config(&ep, runtime.clone())).unwrap();
    let sender_stop = sender.stop_handle();
    let sender_thread = thread::spawn(move || sender.run());

    thread::sleep(Duration::from_millis(50));
    let mut receiver = Receiver::connect(receiver_config(&ep, runtime)).unwrap();

    sender_stop.store(true, Ordering::Relaxed);
    let _ = sender_thread.join();

    let start = Instant::now();
    loop {
        if let Some(reason) = receiver.run_one_tick().unwrap() {
            assert_eq!(reason, StopReason::SenderQuit);
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "receiver never observed the will-quit frame"
        );
    }
}
