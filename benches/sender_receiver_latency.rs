// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end sender → multicast → receiver latency benchmark.
//!
//! Spins up one real [`Sender`] and one real [`Receiver`] over loopback
//! multicast, writes records into the sender's storage, and times how
//! long the receiver's mirror takes to reflect each write. This is the
//! one benchmark in this crate that crosses the network stack rather
//! than exercising storage in isolation.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion};
use lancaster::config::RuntimeConfig;
use lancaster::receiver::{Receiver, ReceiverConfig};
use lancaster::sender::{Sender, SenderConfig};
use lancaster::storage::{CreateSpec, Storage};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(17_600);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(2, Ordering::Relaxed)
}

struct Harness {
    writer_storage: Storage,
    receiver: Receiver,
    _tmp: tempfile::TempDir,
    sender_stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
    sender_thread: Option<thread::JoinHandle<()>>,
}

impl Harness {
    fn start() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let writer_path = tmp.path().join("writer").to_string_lossy().into_owned();
        let mirror_path = tmp.path().join("mirror").to_string_lossy().into_owned();

        let writer_storage = Storage::create(
            &writer_path,
            CreateSpec {
                base_id: 0,
                max_id: 64,
                value_size: 8,
                property_size: 0,
                queue_capacity: 1024,
                description: "sender_receiver_latency bench".to_string(),
                data_version: 1,
                persist: false,
            },
        )
        .unwrap();

        let sender_storage = Storage::open(&writer_path, true).unwrap();
        let tcp_port = next_port();
        let mcast_port = next_port();

        let mut runtime = RuntimeConfig::default();
        runtime.heartbeat_usec = 50_000;
        runtime.max_pkt_age_usec = 200;

        let sender_cfg = SenderConfig {
            mcast_group: Ipv4Addr::new(239, 7, 7, 7),
            mcast_port,
            mcast_interface: Ipv4Addr::LOCALHOST,
            mcast_ttl: 1,
            tcp_bind: SocketAddr::from((Ipv4Addr::LOCALHOST, tcp_port)),
            mcast_device: "lo".to_string(),
            runtime: runtime.clone(),
        };
        let mut sender = Sender::new(sender_storage, sender_cfg).unwrap();
        let sender_stop = sender.stop_handle();
        let sender_thread = thread::spawn(move || {
            let _ = sender.run();
        });

        // Give the listener a moment to bind before the receiver connects.
        thread::sleep(Duration::from_millis(50));

        let receiver_cfg = ReceiverConfig {
            sender_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, tcp_port)),
            local_storage_path: mirror_path,
            mcast_interface: Ipv4Addr::LOCALHOST,
            persist: false,
            runtime,
        };
        let receiver = Receiver::connect(receiver_cfg).unwrap();

        Self {
            writer_storage,
            receiver,
            _tmp: tmp,
            sender_stop,
            sender_thread: Some(sender_thread),
        }
    }

    /// Writes one record and polls the mirror until it reflects the new
    /// value (or panics after a generous timeout — this is a benchmark,
    /// not a liveness test).
    fn round_trip(&mut self, id: i64, value: u64) -> Duration {
        let start = Instant::now();
        self.writer_storage
            .write_record(id, &value.to_be_bytes(), None)
            .unwrap();

        let expected = value.to_be_bytes();
        loop {
            let _ = self.receiver.run_one_tick();
            let rec = self.receiver.storage().get_record(id).unwrap();
            if rec.value() == expected.as_slice() {
                return start.elapsed();
            }
            if start.elapsed() > Duration::from_secs(2) {
                panic!("receiver never mirrored the write within the benchmark timeout");
            }
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.sender_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.sender_thread.take() {
            let _ = handle.join();
        }
    }
}

fn bench_round_trip_latency(c: &mut Criterion) {
    let mut harness = Harness::start();
    let mut seq = 0u64;
    c.bench_function("sender_receiver_round_trip", |b| {
        b.iter(|| {
            seq += 1;
            harness.round_trip(0, seq)
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20).measurement_time(Duration::from_secs(15));
    targets = bench_round_trip_latency
}
criterion_main!(benches);
