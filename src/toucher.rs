// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A background thread that periodically refreshes the touched timestamp
//! of every storage registered with it, so local readers and remote
//! senders can tell a writer process is still alive.
//!
//! Grounded in `original_source/src/toucher.c`: add is a no-op if the
//! storage is already registered; remove is a linear search, reporting
//! whether anything was removed; both go through the same lock as the
//! touch pass itself, so a pass never observes a half-mutated list.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::clock::{self, Microsec};
use crate::storage::Storage;

pub struct Toucher {
    stopping: Arc<AtomicBool>,
    storages: Arc<Mutex<Vec<Arc<Storage>>>>,
    handle: Option<JoinHandle<()>>,
}

impl Toucher {
    /// Spawn the background thread, touching every registered storage
    /// once every `period_usec`.
    pub fn start(period_usec: Microsec) -> Self {
        let stopping = Arc::new(AtomicBool::new(false));
        let storages: Arc<Mutex<Vec<Arc<Storage>>>> = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let stopping = Arc::clone(&stopping);
            let storages = Arc::clone(&storages);
            thread::spawn(move || {
                while !stopping.load(Ordering::Relaxed) {
                    if let Ok(now) = clock::time() {
                        let list = storages.lock();
                        for storage in list.iter() {
                            if let Err(e) = storage.touch(now) {
                                log::warn!("toucher: failed to touch storage: {e}");
                            }
                        }
                    }
                    let _ = clock::sleep(period_usec.max(0));
                }
            })
        };

        Self {
            stopping,
            storages,
            handle: Some(handle),
        }
    }

    /// Register `storage`. A no-op if it is already registered.
    pub fn add(&self, storage: Arc<Storage>) {
        let mut list = self.storages.lock();
        if !list.iter().any(|s| Arc::ptr_eq(s, &storage)) {
            list.push(storage);
        }
    }

    /// Unregister `storage`. Returns `true` if it was present.
    pub fn remove(&self, storage: &Arc<Storage>) -> bool {
        let mut list = self.storages.lock();
        match list.iter().position(|s| Arc::ptr_eq(s, storage)) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.storages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the background thread and join it.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.stopping.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Toucher {
    fn drop(&mut self) {
        self.stop_inner();
    }
}
