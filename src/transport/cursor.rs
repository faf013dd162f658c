//! Per-scope event cursors and the dedup filter.
//!
//! A cursor is the highest event timestamp delivered for a scope. It only
//! ever moves forward, and both transports read and advance the same value,
//! so switching transport needs no translation: the incoming transport
//! replays from the cursor and the filter drops everything at or below it.

use std::collections::HashMap;

use crate::core::{InboundEvent, ScopeKey, WireEvent};

/// Last-seen timestamp per subscription scope.
#[derive(Debug, Clone, Default)]
pub struct EventCursor {
    positions: HashMap<ScopeKey, i64>,
}

impl EventCursor {
    /// Create an empty cursor set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `scope` at timestamp 0.
    ///
    /// Returns `true` if the scope was not tracked before; an existing
    /// position is left untouched.
    pub fn track(&mut self, scope: ScopeKey) -> bool {
        let mut created = false;
        self.positions.entry(scope).or_insert_with(|| {
            created = true;
            0
        });
        created
    }

    /// Stop tracking `scope`, returning its last position.
    pub fn forget(&mut self, scope: &ScopeKey) -> Option<i64> {
        self.positions.remove(scope)
    }

    /// Whether `scope` is tracked.
    pub fn is_tracked(&self, scope: &ScopeKey) -> bool {
        self.positions.contains_key(scope)
    }

    /// Current position of `scope`; 0 (the epoch) if unseen.
    pub fn get(&self, scope: &ScopeKey) -> i64 {
        self.positions.get(scope).copied().unwrap_or(0)
    }

    /// Move `scope` forward to `timestamp`; never moves backwards.
    ///
    /// Returns the resulting position.
    pub fn advance(&mut self, scope: &ScopeKey, timestamp: i64) -> i64 {
        let position = self.positions.entry(scope.clone()).or_insert(0);
        *position = (*position).max(timestamp);
        *position
    }

    /// Tracked scopes, in no particular order.
    pub fn scopes(&self) -> impl Iterator<Item = &ScopeKey> {
        self.positions.keys()
    }

    /// The single tracked scope, if exactly one is tracked.
    pub fn sole_scope(&self) -> Option<&ScopeKey> {
        let mut scopes = self.positions.keys();
        match (scopes.next(), scopes.next()) {
            (Some(scope), None) => Some(scope),
            _ => None,
        }
    }

    /// Number of tracked scopes.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether no scope is tracked.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Run a batch of envelopes for `scope` through the dedup filter.
    ///
    /// Events at or below the cursor value at the start of the batch are
    /// dropped; the rest are returned in non-decreasing timestamp order
    /// (stable for equal timestamps) and the cursor advances to the newest
    /// one. A batch for an untracked scope yields nothing.
    pub fn admit(&mut self, scope: &ScopeKey, batch: Vec<WireEvent>) -> Vec<InboundEvent> {
        let Some(&watermark) = self.positions.get(scope) else {
            return Vec::new();
        };

        let mut fresh: Vec<WireEvent> = batch
            .into_iter()
            .filter(|event| event.timestamp > watermark)
            .collect();
        fresh.sort_by_key(|event| event.timestamp);

        if let Some(newest) = fresh.last() {
            self.advance(scope, newest.timestamp);
        }

        fresh
            .into_iter()
            .map(|event| event.into_inbound(scope.clone()))
            .collect()
    }
}
