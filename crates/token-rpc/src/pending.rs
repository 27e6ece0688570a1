//! # Pending-Call Registry
//!
//! The bookkeeping at the heart of the RPC layer: a concurrency-safe map
//! from correlation id to an in-flight call's one-shot result slot.
//!
//! Two actors mutate it. The caller registers an id before publishing and
//! expires or cancels it on its exit paths; the reply listener resolves ids
//! as replies arrive. For any id, exactly one of resolve / expire / cancel
//! wins; the losers are no-ops returning `false`. Every registered id is
//! eventually removed, so the registry cannot leak.
//!
//! Map mutations are per-entry and never span a suspension point.

use crate::correlation::CorrelationId;
use crate::error::RpcError;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Result delivered into a call's slot.
pub type CallResult = Result<Bytes, RpcError>;

/// An in-flight call awaiting its reply.
struct PendingCall {
    /// Write-once slot the reply (or failure) is delivered through.
    slot: oneshot::Sender<CallResult>,
    /// When the call was registered.
    created_at: Instant,
    /// Deadline offset for this call.
    timeout: Duration,
}

/// Counters over the registry's lifetime.
#[derive(Debug, Default)]
pub struct CallStats {
    registered: AtomicU64,
    resolved: AtomicU64,
    expired: AtomicU64,
    cancelled: AtomicU64,
}

impl CallStats {
    /// Total calls registered.
    pub fn registered(&self) -> u64 {
        self.registered.load(Ordering::Relaxed)
    }

    /// Calls resolved by a reply.
    pub fn resolved(&self) -> u64 {
        self.resolved.load(Ordering::Relaxed)
    }

    /// Calls that hit their deadline.
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Calls cancelled before a reply or deadline.
    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Concurrency-safe map of correlation id to in-flight call.
pub struct PendingCallRegistry {
    calls: DashMap<CorrelationId, PendingCall>,
    stats: CallStats,
}

impl PendingCallRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
            stats: CallStats::default(),
        }
    }

    /// Register an in-flight call under a caller-generated id.
    ///
    /// Fails with [`RpcError::DuplicateCorrelation`] if the id is already
    /// outstanding. Ids are fresh per call, so a collision means the
    /// generator is broken; it is reported loudly instead of silently
    /// replacing the in-flight call.
    ///
    /// # Returns
    ///
    /// The receiving half of the call's result slot.
    pub fn register(
        &self,
        id: CorrelationId,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<CallResult>, RpcError> {
        let (tx, rx) = oneshot::channel();

        match self.calls.entry(id) {
            Entry::Occupied(_) => {
                error!(correlation_id = %id, "Correlation id already registered");
                Err(RpcError::DuplicateCorrelation(id))
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingCall {
                    slot: tx,
                    created_at: Instant::now(),
                    timeout,
                });
                self.stats.registered.fetch_add(1, Ordering::Relaxed);

                debug!(
                    correlation_id = %id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Registered pending call"
                );

                Ok(rx)
            }
        }
    }

    /// Resolve a call with its reply payload.
    ///
    /// Removes the entry and writes the payload into its slot. Returns
    /// `false` with no other effect if the id is unknown, already resolved,
    /// or expired, which makes late and duplicate replies safe to discard.
    pub fn resolve(&self, id: CorrelationId, payload: Bytes) -> bool {
        let Some((_, call)) = self.calls.remove(&id) else {
            return false;
        };

        let elapsed = call.created_at.elapsed();
        if call.slot.send(Ok(payload)).is_err() {
            // The caller dropped its receiver without expiring; the entry
            // is gone either way.
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %id, "Reply arrived after caller went away");
            return false;
        }

        self.stats.resolved.fetch_add(1, Ordering::Relaxed);
        debug!(
            correlation_id = %id,
            elapsed_ms = elapsed.as_millis() as u64,
            "Resolved pending call"
        );
        true
    }

    /// Expire a call whose deadline elapsed.
    ///
    /// Returns `false` if the entry is already gone because a concurrent
    /// resolution won the race; the caller should then read the resolved
    /// payload from its receiver instead.
    pub fn expire(&self, id: CorrelationId) -> bool {
        let Some((_, call)) = self.calls.remove(&id) else {
            return false;
        };

        self.stats.expired.fetch_add(1, Ordering::Relaxed);
        let _ = call.slot.send(Err(RpcError::Timeout(call.timeout)));

        debug!(correlation_id = %id, "Expired pending call");
        true
    }

    /// Remove a call without signalling its slot.
    ///
    /// Used by the caller itself when publish fails after registration; the
    /// caller already has its own error to return.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        if self.calls.remove(&id).is_some() {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %id, "Cancelled pending call");
            true
        } else {
            false
        }
    }

    /// Fail every outstanding call with the given error.
    ///
    /// Called on connection loss and shutdown so no caller hangs forever.
    pub fn fail_all(&self, error: &RpcError) -> usize {
        let ids: Vec<CorrelationId> = self.calls.iter().map(|entry| *entry.key()).collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                let _ = call.slot.send(Err(error.clone()));
                failed += 1;
            }
        }

        if failed > 0 {
            self.stats
                .cancelled
                .fetch_add(failed as u64, Ordering::Relaxed);
            warn!(failed, error = %error, "Failed all pending calls");
        }

        failed
    }

    /// Expire entries whose deadline has passed.
    ///
    /// Backstop for callers that vanished between registering and awaiting;
    /// the normal path is each caller expiring its own call.
    ///
    /// # Returns
    ///
    /// The number of entries removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<CorrelationId> = self
            .calls
            .iter()
            .filter(|entry| now.duration_since(entry.value().created_at) > entry.value().timeout)
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for id in stale {
            if let Some((_, call)) = self.calls.remove(&id) {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                let _ = call.slot.send(Err(RpcError::Timeout(call.timeout)));
                warn!(correlation_id = %id, "Swept abandoned pending call");
                removed += 1;
            }
        }

        removed
    }

    /// Number of calls currently outstanding.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no calls are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Lifetime counters.
    #[must_use]
    pub fn stats(&self) -> &CallStats {
        &self.stats
    }
}

impl Default for PendingCallRegistry {
    fn default() -> Self {
        Self::new()
    }
}
