//! Key Lock Table
//!
//! Per-key exclusive locks that serialize "populate the front from the back"
//! against writes and invalidations of the same key.
//!
//! # Design
//!
//! - The control map is split into power-of-two stripes, each a
//!   `parking_lot::Mutex<HashMap>`, so unrelated keys only share a short
//!   critical section. Nothing is held across a back-store round trip.
//! - Each lock records its owner as a thread id plus a `Weak` to a
//!   thread-local liveness token. When the owner thread exits the token is
//!   dropped, and the next `lock` attempt reclaims the lock instead of
//!   waiting forever. There is no watchdog thread.
//! - Every stripe carries an epoch. `clear_all` bumps it, drains the map and
//!   wakes every waiter, which then returns `LockInterrupted`.
//! - Locks are reentrant for the owning thread.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::domain::CacheKey;
use crate::error::{Error, Result};

thread_local! {
    static LIVENESS: Arc<()> = Arc::new(());
}

/// Identity of the thread holding a lock.
#[derive(Debug, Clone)]
struct OwnerToken {
    thread: ThreadId,
    alive: Weak<()>,
}

impl OwnerToken {
    fn current() -> Self {
        LIVENESS.with(|token| Self {
            thread: thread::current().id(),
            alive: Arc::downgrade(token),
        })
    }

    fn is_current(&self) -> bool {
        self.thread == thread::current().id()
    }

    fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

/// Result of the invalidation path's non-blocking lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller now holds the lock and must unlock it
    Acquired,
    /// Another live thread holds the lock; its invalidated flag was set
    MarkedInvalid,
}

/// Diagnostic view of one held lock.
#[derive(Debug, Clone)]
pub struct KeyLockInfo<K> {
    pub key: K,
    pub owner: Option<ThreadId>,
    pub owner_alive: bool,
    pub acquired_at: DateTime<Utc>,
    pub held_for: Duration,
    pub holds: u32,
    pub waiters: usize,
    pub invalidated: bool,
}

struct KeyLock {
    /// `None` while ownership is being handed to a waiter
    owner: Option<OwnerToken>,
    holds: u32,
    acquired_at: Instant,
    acquired_wall: DateTime<Utc>,
    waiters: usize,
    invalidated: bool,
    released: Arc<Condvar>,
}

impl KeyLock {
    fn owned_by(owner: OwnerToken) -> Self {
        Self {
            owner: Some(owner),
            holds: 1,
            acquired_at: Instant::now(),
            acquired_wall: Utc::now(),
            waiters: 0,
            invalidated: false,
            released: Arc::new(Condvar::new()),
        }
    }

    fn grant(&mut self, owner: OwnerToken) {
        self.owner = Some(owner);
        self.holds = 1;
        self.acquired_at = Instant::now();
        self.acquired_wall = Utc::now();
        self.invalidated = false;
    }

    fn is_owned_by_current(&self) -> bool {
        self.owner.as_ref().is_some_and(OwnerToken::is_current)
    }
}

struct StripeState<K> {
    locks: HashMap<K, KeyLock>,
    epoch: u64,
}

/// Per-key lock registry (the control map).
pub struct KeyLockTable<K> {
    stripes: Box<[Mutex<StripeState<K>>]>,
    hasher: RandomState,
    probe_interval: Duration,
    reclaimed: AtomicU64,
}

impl<K: CacheKey> KeyLockTable<K> {
    /// Create a table with `stripes` stripes (rounded up to a power of two).
    pub fn new(stripes: usize, probe_interval: Duration) -> Self {
        let count = stripes.max(1).next_power_of_two();
        let stripes = (0..count)
            .map(|_| {
                Mutex::new(StripeState {
                    locks: HashMap::new(),
                    epoch: 0,
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            stripes,
            hasher: RandomState::new(),
            probe_interval: probe_interval.max(Duration::from_millis(1)),
            reclaimed: AtomicU64::new(0),
        }
    }

    #[inline]
    fn stripe(&self, key: &K) -> MutexGuard<'_, StripeState<K>> {
        let idx = (self.hasher.hash_one(key) as usize) & (self.stripes.len() - 1);
        self.stripes[idx].lock()
    }

    fn reclaim(&self, key: &K, lock: &mut KeyLock, me: OwnerToken) {
        warn!(
            key = ?key,
            held_ms = lock.acquired_at.elapsed().as_millis() as u64,
            "Reclaiming lock abandoned by a terminated thread"
        );
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        lock.grant(me);
    }

    /// Acquire the lock for `key`.
    ///
    /// `timeout_millis`: 0 tries once, negative waits forever, positive waits
    /// at most that long. Returns `Ok(false)` if the lock stayed busy.
    pub fn lock(&self, key: &K, timeout_millis: i64) -> Result<bool> {
        let me = OwnerToken::current();
        let started = Instant::now();
        let deadline = (timeout_millis > 0)
            .then(|| started + Duration::from_millis(timeout_millis as u64));

        let mut state = self.stripe(key);
        let epoch = state.epoch;

        loop {
            if state.epoch != epoch {
                return Err(Error::lock_interrupted(key));
            }

            let Some(lock) = state.locks.get_mut(key) else {
                state.locks.insert(key.clone(), KeyLock::owned_by(me));
                return Ok(true);
            };

            match &lock.owner {
                // Mid-handoff: the woken waiter or a newcomer takes it.
                None => {
                    lock.grant(me);
                    return Ok(true);
                }
                Some(owner) if owner.is_current() => {
                    lock.holds += 1;
                    return Ok(true);
                }
                Some(owner) if !owner.is_alive() => {
                    self.reclaim(key, lock, me);
                    return Ok(true);
                }
                Some(_) => {}
            }

            if timeout_millis == 0 {
                return Ok(false);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        debug!(key = ?key, "Lock wait timed out");
                        return Ok(false);
                    }
                    remaining.min(self.probe_interval)
                }
                None => self.probe_interval,
            };

            lock.waiters += 1;
            let released = Arc::clone(&lock.released);
            released.wait_for(&mut state, wait);

            if state.epoch != epoch {
                return Err(Error::lock_interrupted(key));
            }
            if let Some(lock) = state.locks.get_mut(key) {
                lock.waiters = lock.waiters.saturating_sub(1);
            }
        }
    }

    /// Release one hold on `key`. Returns false if the caller is not the owner.
    pub fn unlock(&self, key: &K) -> bool {
        self.unlock_reporting(key).is_some()
    }

    /// Release one hold on `key`.
    ///
    /// Returns `None` if the caller is not the owner, otherwise whether an
    /// invalidation was recorded against the lock while it was held. The
    /// flag is only reported (and cleared) by the release of the last hold.
    pub fn unlock_reporting(&self, key: &K) -> Option<bool> {
        let mut state = self.stripe(key);
        let lock = state.locks.get_mut(key)?;
        if !lock.is_owned_by_current() {
            return None;
        }

        lock.holds -= 1;
        if lock.holds > 0 {
            return Some(false);
        }

        let invalidated = lock.invalidated;
        if lock.waiters == 0 {
            state.locks.remove(key);
        } else {
            lock.owner = None;
            lock.invalidated = false;
            lock.released.notify_one();
        }
        Some(invalidated)
    }

    /// Non-blocking attempt used before applying an invalidation.
    ///
    /// Acquires the lock when it is free, abandoned, mid-handoff, or already
    /// held by the caller. If another live thread holds it, flags the lock as
    /// invalidated so the owner discards what it is about to write.
    pub fn lock_or_mark(&self, key: &K) -> Result<LockOutcome> {
        let me = OwnerToken::current();
        let mut state = self.stripe(key);

        let Some(lock) = state.locks.get_mut(key) else {
            state.locks.insert(key.clone(), KeyLock::owned_by(me));
            return Ok(LockOutcome::Acquired);
        };

        // A waiter re-takes a handed-off lock without releasing the stripe,
        // so an ownerless entry always has a waiter.
        if lock.owner.is_none() && lock.waiters == 0 {
            state.locks.remove(key);
            error!(key = ?key, "Dropped ownerless lock entry with no waiters");
            return Err(Error::corrupt_lock(key, "lock entry has no owner and no waiters"));
        }

        match &lock.owner {
            None => {
                lock.grant(me);
                Ok(LockOutcome::Acquired)
            }
            Some(owner) if owner.is_current() => {
                lock.holds += 1;
                Ok(LockOutcome::Acquired)
            }
            Some(owner) if !owner.is_alive() => {
                self.reclaim(key, lock, me);
                Ok(LockOutcome::Acquired)
            }
            Some(_) => {
                lock.invalidated = true;
                Ok(LockOutcome::MarkedInvalid)
            }
        }
    }

    /// Run `f` under the stripe lock if the caller still owns `key`.
    ///
    /// `f` receives the lock's invalidated flag. Returns `None` when the lock
    /// was revoked (e.g. by `clear_all`) or is held by someone else.
    pub fn with_owned<R>(&self, key: &K, f: impl FnOnce(bool) -> R) -> Option<R> {
        let state = self.stripe(key);
        let lock = state.locks.get(key)?;
        if !lock.is_owned_by_current() {
            return None;
        }
        Some(f(lock.invalidated))
    }

    /// Drop every lock and interrupt every waiter.
    pub fn clear_all(&self) {
        self.clear_all_with(|| ());
    }

    /// Drop every lock and interrupt every waiter, running `f` while every
    /// stripe is held so no lock can be taken until it returns.
    pub fn clear_all_with<R>(&self, f: impl FnOnce() -> R) -> R {
        let mut guards: Vec<_> = self.stripes.iter().map(|s| s.lock()).collect();

        let mut dropped = 0usize;
        for state in guards.iter_mut() {
            state.epoch = state.epoch.wrapping_add(1);
            for (_, lock) in state.locks.drain() {
                lock.released.notify_all();
                dropped += 1;
            }
        }

        if dropped > 0 {
            debug!(dropped, "Cleared key lock table");
        }

        f()
    }

    /// Whether any thread currently holds or is being handed `key`'s lock.
    pub fn is_locked(&self, key: &K) -> bool {
        self.stripe(key).locks.contains_key(key)
    }

    /// Whether the calling thread owns `key`'s lock.
    pub fn is_held_by_current_thread(&self, key: &K) -> bool {
        self.stripe(key)
            .locks
            .get(key)
            .is_some_and(KeyLock::is_owned_by_current)
    }

    /// Number of entries in the control map.
    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.lock().locks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.iter().all(|s| s.lock().locks.is_empty())
    }

    /// Keys currently in the control map.
    pub fn keys(&self) -> Vec<K> {
        self.stripes
            .iter()
            .flat_map(|s| s.lock().locks.keys().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Snapshot of every held lock.
    pub fn locks(&self) -> Vec<KeyLockInfo<K>> {
        let mut out = Vec::new();
        for stripe in self.stripes.iter() {
            let state = stripe.lock();
            for (key, lock) in state.locks.iter() {
                out.push(KeyLockInfo {
                    key: key.clone(),
                    owner: lock.owner.as_ref().map(|o| o.thread),
                    owner_alive: lock.owner.as_ref().is_some_and(OwnerToken::is_alive),
                    acquired_at: lock.acquired_wall,
                    held_for: lock.acquired_at.elapsed(),
                    holds: lock.holds,
                    waiters: lock.waiters,
                    invalidated: lock.invalidated,
                });
            }
        }
        out
    }

    /// Number of locks reclaimed from terminated owners.
    pub fn abandoned_reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
