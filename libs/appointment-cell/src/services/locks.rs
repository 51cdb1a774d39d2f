// libs/appointment-cell/src/services/locks.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

const PRUNE_THRESHOLD: usize = 1024;

/// Per-key async mutexes guarding read-check-write sequences.
///
/// Two requests contend only when they share a key, so bookings for unrelated
/// patients and doctor-days proceed in parallel.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Guards held for the duration of one commit. Dropping releases every key.
#[derive(Debug)]
pub struct LockSet {
    keys: Vec<String>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl LockSet {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn appointment_key(appointment_id: Uuid) -> String {
        format!("appointment:{}", appointment_id)
    }

    pub fn patient_key(patient_id: Uuid) -> String {
        format!("patient:{}", patient_id)
    }

    pub fn doctor_day_key(doctor_id: Uuid, day: NaiveDate) -> String {
        format!("doctor:{}:{}", doctor_id, day)
    }

    /// Acquire every key. Keys are taken in sorted order so concurrent callers cannot deadlock.
    pub async fn acquire(&self, mut keys: Vec<String>) -> LockSet {
        keys.sort();
        keys.dedup();

        let mutexes: Vec<Arc<AsyncMutex<()>>> = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

            if locks.len() > PRUNE_THRESHOLD {
                // Entries nobody holds or waits on can be dropped.
                locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
            }

            keys.iter()
                .map(|key| Arc::clone(locks.entry(key.clone()).or_default()))
                .collect()
        };

        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }

        debug!("Acquired scheduling locks {:?}", keys);
        LockSet {
            keys,
            _guards: guards,
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}
