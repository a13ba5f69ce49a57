//! Correlation Table - maps correlation IDs to waiting callers.
//!
//! Flow:
//! 1. Caller calls `register()` and gets a [`Waiter`]
//! 2. Caller publishes the request
//! 3. Response listener decodes a reply and calls `resolve()`
//! 4. Caller awaits the waiter's slot, or times out and calls `expire()`
//!
//! Every entry leaves the table exactly once: through `resolve`, `remove`,
//! `expire`/`cancel`, or `shutdown_all`. All of them go through a single
//! `DashMap` removal, so two paths can never both claim the same entry.

use crate::domain::correlation::CorrelationId;
use crate::domain::error::RegisterError;
use crate::domain::outcome::Resolution;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A registered entry, owned by the table until one path removes it
struct PendingEntry {
    /// Channel to deliver the resolution
    sender: oneshot::Sender<Resolution>,
    /// When the waiter was registered
    created_at: Instant,
    /// Distinguishes this registration from a later reuse of the same id
    token: u64,
}

/// Caller's half of a registration.
#[derive(Debug)]
pub struct Waiter {
    id: CorrelationId,
    token: u64,
    created_at: Instant,
    slot: oneshot::Receiver<Resolution>,
}

impl Waiter {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Time since registration
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// The one-shot slot the resolution arrives on
    pub fn slot(&mut self) -> &mut oneshot::Receiver<Resolution> {
        &mut self.slot
    }
}

/// Statistics for the correlation table
#[derive(Debug, Default)]
pub struct CorrelationStats {
    /// Waiters registered
    pub registered: AtomicU64,
    /// Waiters resolved with a reply
    pub resolved: AtomicU64,
    /// Waiters removed by their deadline
    pub timed_out: AtomicU64,
    /// Waiters removed without a reply (cancelled, publish failed)
    pub removed: AtomicU64,
    /// Waiters released by shutdown
    pub shutdown: AtomicU64,
    /// Replies with no waiter
    pub unmatched: AtomicU64,
    /// Registrations refused because the id was pending
    pub duplicates: AtomicU64,
    /// Inbound messages that failed to decode
    pub decode_failures: AtomicU64,
}

/// Plain copy of [`CorrelationStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub registered: u64,
    pub resolved: u64,
    pub timed_out: u64,
    pub removed: u64,
    pub shutdown: u64,
    pub unmatched: u64,
    pub duplicates: u64,
    pub decode_failures: u64,
}

impl CorrelationStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            registered: self.registered.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            shutdown: self.shutdown.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

/// Concurrency-safe map from correlation id to one-shot result slot.
pub struct CorrelationTable {
    /// Map of correlation ID to pending entry
    pending: DashMap<CorrelationId, PendingEntry>,
    /// Registration tokens
    next_token: AtomicU64,
    /// `false` once `shutdown_all` ran; guards registration
    open: RwLock<bool>,
    /// Statistics
    stats: CorrelationStats,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_token: AtomicU64::new(1),
            open: RwLock::new(true),
            stats: CorrelationStats::default(),
        }
    }

    /// Register a waiter for `id`.
    ///
    /// Fails if `id` is empty, if it is already pending (the existing waiter
    /// is untouched) or if the table has been shut down.
    pub fn register(&self, id: CorrelationId) -> Result<Waiter, RegisterError> {
        // Replies with an empty id are rejected by the decoder
        if id.is_empty() {
            return Err(RegisterError::EmptyId);
        }

        let open = self.open.read();
        if !*open {
            return Err(RegisterError::Closed);
        }

        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                warn!(correlation_id = %id, "Rejected duplicate correlation ID");
                Err(RegisterError::Duplicate(id))
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                let created_at = Instant::now();

                vacant.insert(PendingEntry {
                    sender: tx,
                    created_at,
                    token,
                });
                self.stats.registered.fetch_add(1, Ordering::Relaxed);
                relay_telemetry::PENDING_REQUESTS.inc();

                debug!(correlation_id = %id, token, "Registered waiter");

                Ok(Waiter {
                    id,
                    token,
                    created_at,
                    slot: rx,
                })
            }
        }
    }

    /// Deliver a reply to the waiter registered for `id`.
    ///
    /// Returns false (and records an unmatched reply) if nobody is waiting.
    pub fn resolve(&self, id: &CorrelationId, payload: Value) -> bool {
        let Some((_, entry)) = self.pending.remove(id) else {
            self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
            relay_telemetry::RESPONSES_UNMATCHED.inc();
            warn!(correlation_id = %id, "Response for unknown or expired correlation ID");
            return false;
        };
        relay_telemetry::PENDING_REQUESTS.dec();

        let elapsed = entry.created_at.elapsed();
        if entry.sender.send(Resolution::Response(payload)).is_err() {
            // Caller went away between removal and delivery
            self.stats.removed.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %id, "Waiter dropped before delivery");
            return true;
        }

        self.stats.resolved.fetch_add(1, Ordering::Relaxed);
        relay_telemetry::REQUESTS_RESOLVED.inc();
        relay_telemetry::ROUND_TRIP_SECONDS.observe(elapsed.as_secs_f64());
        debug!(
            correlation_id = %id,
            elapsed_ms = elapsed.as_millis() as u64,
            "Resolved waiter"
        );
        true
    }

    /// Remove the waiter for `id` without resolving it.
    ///
    /// The caller blocked on it observes its slot closing.
    pub fn remove(&self, id: &CorrelationId) -> bool {
        if self.pending.remove(id).is_none() {
            return false;
        }
        relay_telemetry::PENDING_REQUESTS.dec();
        self.stats.removed.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id = %id, "Removed waiter");
        true
    }

    /// Remove a waiter whose deadline elapsed.
    ///
    /// Only removes the registration identified by `token`; returns false if
    /// it already left the table (a reply raced in, or it was removed).
    pub fn expire(&self, id: &CorrelationId, token: u64) -> bool {
        if !self.remove_registration(id, token) {
            return false;
        }
        self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
        relay_telemetry::REQUESTS_TIMED_OUT.inc();
        true
    }

    /// Remove a waiter whose caller gave up (future dropped, publish failed).
    pub fn cancel(&self, id: &CorrelationId, token: u64) -> bool {
        if !self.remove_registration(id, token) {
            return false;
        }
        self.stats.removed.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id = %id, token, "Cancelled waiter");
        true
    }

    fn remove_registration(&self, id: &CorrelationId, token: u64) -> bool {
        let removed = self
            .pending
            .remove_if(id, |_, entry| entry.token == token)
            .is_some();
        if removed {
            relay_telemetry::PENDING_REQUESTS.dec();
        }
        removed
    }

    /// Close the table and release every waiter with a shutdown resolution.
    ///
    /// No registration can succeed once this returns. Returns the number of
    /// waiters released.
    pub fn shutdown_all(&self) -> usize {
        let mut open = self.open.write();
        *open = false;

        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut released = 0;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                relay_telemetry::PENDING_REQUESTS.dec();
                // A dropped receiver still counts: the entry is gone
                let _ = entry.sender.send(Resolution::Shutdown);
                released += 1;
            }
        }
        drop(open);

        self.stats
            .shutdown
            .fetch_add(released as u64, Ordering::Relaxed);
        relay_telemetry::REQUESTS_SHUTDOWN.inc_by(released as u64);
        if released > 0 {
            warn!(released, "Released pending waiters on shutdown");
        }
        released
    }

    /// Record an inbound message that failed to decode
    pub fn record_decode_failure(&self) {
        self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
        relay_telemetry::RESPONSES_MALFORMED.inc();
    }

    /// Whether new registrations are accepted
    pub fn is_open(&self) -> bool {
        *self.open.read()
    }

    /// Get number of currently pending waiters
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if a correlation ID is pending
    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    /// Get statistics
    pub fn stats(&self) -> &CorrelationStats {
        &self.stats
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}
