//! Statement cache.
//!
//! Query text maps to the statement prepared for it, in LRU order. Entries hold
//! only a weak reference to the handle callers share, so the cache can tell
//! whether anyone outside still uses a statement:
//!
//! - an entry evicted with no live handle is closed right away;
//! - an entry evicted while a handle is alive moves to the pending-close set
//!   and is closed when the last handle drops (see [`StatementCache::release`]).
//!
//! Closing marks the statement closed and queues its server-side name; the
//! connection sends the queued `Close` messages ahead of its next request.
//!
//! The cache lives behind a synchronous mutex and never drops a
//! [`StatementHandle`] while that mutex is held, since a handle's `Drop`
//! re-enters the cache.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use lru::LruCache;
use tracing::{debug, trace};

use super::connection::Inner;
use super::error::{PgError, PgResult};
use super::statement::{PreparedStatement, StatementHandle, StatementState};

/// Point-in-time counters for a connection's statement cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Maximum number of cached statements
    pub capacity: usize,
    /// Statements currently cached
    pub cached: usize,
    /// Evicted statements still referenced by callers
    pub pending_close: usize,
    /// Closed statements whose server-side close has not been sent yet
    pub queued_close: usize,
}

struct Entry {
    state: Arc<StatementState>,
    holders: Weak<StatementHandle>,
}

pub(crate) struct StatementCache {
    /// Query text → statement. Capacity is enforced by hand so that 0 works.
    entries: LruCache<String, Entry>,
    capacity: usize,
    /// Statement name → evicted statement still referenced by a caller
    pending_close: HashMap<String, Entry>,
    /// Names of closed statements not yet closed on the server
    close_queue: Vec<String>,
    /// Set once the connection has gone away
    drained: bool,
}

impl StatementCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity,
            pending_close: HashMap::new(),
            close_queue: Vec::new(),
            drained: false,
        }
    }

    /// Cached statement for `query`, promoted to most recently used.
    ///
    /// Returns the live handle if callers still hold one, otherwise a new
    /// handle for the same server-side statement.
    pub(crate) fn lookup(&mut self, query: &str, conn: &Weak<Inner>) -> Option<PreparedStatement> {
        let entry = self.entries.get_mut(query)?;
        if entry.state.is_closed() {
            return None;
        }

        let handle = match entry.holders.upgrade() {
            Some(handle) => handle,
            None => {
                let handle = Arc::new(StatementHandle {
                    state: Arc::clone(&entry.state),
                    conn: Weak::clone(conn),
                });
                entry.holders = Arc::downgrade(&handle);
                handle
            }
        };
        trace!(statement = %entry.state.name, "statement cache hit");
        Some(PreparedStatement::from_handle(handle))
    }

    /// Cache a freshly prepared statement and hand out its first handle,
    /// evicting least recently used entries beyond capacity.
    pub(crate) fn insert(
        &mut self,
        state: Arc<StatementState>,
        conn: &Weak<Inner>,
    ) -> PgResult<PreparedStatement> {
        if self.drained {
            state.mark_closed();
            return Err(PgError::ClosedMidOperation);
        }

        let handle = Arc::new(StatementHandle {
            state: Arc::clone(&state),
            conn: Weak::clone(conn),
        });
        let entry = Entry {
            state: Arc::clone(&state),
            holders: Arc::downgrade(&handle),
        };

        // Two callers may have prepared the same text concurrently
        if let Some(replaced) = self.entries.put(state.query.clone(), entry) {
            self.retire(replaced);
        }

        while self.entries.len() > self.capacity {
            let Some((query, evicted)) = self.entries.pop_lru() else {
                break;
            };
            debug!(statement = %evicted.state.name, %query, "evicting statement");
            self.retire(evicted);
        }

        Ok(PreparedStatement::from_handle(handle))
    }

    /// Close a statement that has left the cache, or park it until its last
    /// handle drops.
    fn retire(&mut self, entry: Entry) {
        // strong_count never creates a handle, so no Drop can run under the lock
        if entry.holders.strong_count() > 0 {
            trace!(statement = %entry.state.name, "statement still referenced, closing later");
            self.pending_close.insert(entry.state.name.clone(), entry);
        } else {
            self.close(&entry.state);
        }
    }

    /// A handle to `state` was dropped for the last time.
    ///
    /// A parked statement closes only once no handle to it is alive. A lookup
    /// can hand out a newer handle between a drop and its release.
    pub(crate) fn release(&mut self, state: &Arc<StatementState>) {
        let parked = self.pending_close.get(&state.name).is_some_and(|pending| {
            Arc::ptr_eq(&pending.state, state) && pending.holders.strong_count() == 0
        });
        if parked {
            self.pending_close.remove(&state.name);
            self.close(state);
        }
    }

    /// Explicitly close `state`, wherever it is.
    pub(crate) fn remove(&mut self, state: &Arc<StatementState>) {
        let cached = self
            .entries
            .peek(&state.query)
            .is_some_and(|entry| Arc::ptr_eq(&entry.state, state));
        if cached {
            self.entries.pop(&state.query);
        } else if self
            .pending_close
            .get(&state.name)
            .is_some_and(|pending| Arc::ptr_eq(&pending.state, state))
        {
            self.pending_close.remove(&state.name);
        }
        self.close(state);
    }

    fn close(&mut self, state: &StatementState) {
        if state.mark_closed() && !self.drained {
            trace!(statement = %state.name, "queueing statement close");
            self.close_queue.push(state.name.clone());
        }
    }

    /// Take the names whose server-side close is due.
    pub(crate) fn take_close_queue(&mut self) -> Vec<String> {
        std::mem::take(&mut self.close_queue)
    }

    /// Close everything for good. Returns every server-side name that is
    /// still allocated, for a best-effort farewell.
    pub(crate) fn drain(&mut self) -> Vec<String> {
        let mut names = std::mem::take(&mut self.close_queue);

        for (_, entry) in self.entries.iter() {
            if entry.state.mark_closed() {
                names.push(entry.state.name.clone());
            }
        }
        for (name, entry) in self.pending_close.drain() {
            if entry.state.mark_closed() {
                names.push(name);
            }
        }
        self.entries.clear();
        self.drained = true;

        debug!(statements = names.len(), "statement cache drained");
        names
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.capacity,
            cached: self.entries.len(),
            pending_close: self.pending_close.len(),
            queued_close: self.close_queue.len(),
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, query: &str) -> bool {
        self.entries.contains(query)
    }
}
