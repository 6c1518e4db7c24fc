// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Process-wide session tracking and the abandoned-session queue

use std::collections::VecDeque;

use tracing::debug;

use crate::connection::ConnectionId;

/// Upper bound on sessions held in the abandoned queue
pub const MAX_ABANDONED: usize = 4;

/// Lifecycle of a tracked session.
///
/// A session's saved context bytes are present exactly in the three saved
/// states; entering `Loaded` drops them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Resident in the device
    Loaded,
    /// Context saved by the resource manager between commands
    SavedRm,
    /// Context saved on explicit client request (ContextSave)
    SavedClient,
    /// Saved by the client, then the client's connection closed
    SavedClientClosed,
}

/// One TPM session. The handle is stable across save/load cycles.
#[derive(Debug)]
pub struct SessionEntry {
    handle: u32,
    connection: ConnectionId,
    context: Vec<u8>,
    state: SessionState,
}

impl SessionEntry {
    pub fn new(connection: ConnectionId, handle: u32) -> Self {
        Self {
            handle,
            connection,
            context: Vec::new(),
            state: SessionState::Loaded,
        }
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        debug!(
            "session 0x{:08x}: {:?} -> {:?}",
            self.handle, self.state, state
        );
        if state == SessionState::Loaded {
            self.context.clear();
        }
        self.state = state;
    }

    pub fn context(&self) -> &[u8] {
        &self.context
    }

    pub fn set_context(&mut self, context: Vec<u8>) {
        self.context = context;
    }
}

/// Registry of all sessions across connections plus the FIFO of sessions
/// abandoned by closed connections.
///
/// Iteration is exposed as snapshots (`loaded_handles`,
/// `handles_for_connection`) so callers mutate the list only between walks.
#[derive(Debug)]
pub struct SessionList {
    entries: Vec<SessionEntry>,
    abandoned: VecDeque<SessionEntry>,
    per_connection_max: usize,
}

impl SessionList {
    pub fn new(per_connection_max: usize) -> Self {
        Self {
            entries: Vec::new(),
            abandoned: VecDeque::new(),
            per_connection_max,
        }
    }

    pub fn insert(&mut self, entry: SessionEntry) {
        self.entries.push(entry);
    }

    pub fn lookup_handle(&self, handle: u32) -> Option<&SessionEntry> {
        self.entries.iter().find(|e| e.handle() == handle)
    }

    pub fn lookup_handle_mut(&mut self, handle: u32) -> Option<&mut SessionEntry> {
        self.entries.iter_mut().find(|e| e.handle() == handle)
    }

    pub fn remove_handle(&mut self, handle: u32) -> Option<SessionEntry> {
        let index = self.entries.iter().position(|e| e.handle() == handle)?;
        Some(self.entries.remove(index))
    }

    /// Find a session whose saved context matches the given bytes, among
    /// both live and abandoned sessions. Returns (handle, owner).
    pub fn lookup_context(&self, context: &[u8]) -> Option<(u32, ConnectionId)> {
        self.entries
            .iter()
            .chain(self.abandoned.iter())
            .find(|e| !e.context().is_empty() && e.context() == context)
            .map(|e| (e.handle(), e.connection()))
    }

    /// Move a client-saved session of a closing connection into the
    /// abandoned queue. Returns false if no such session is tracked.
    pub fn abandon_handle(&mut self, connection: ConnectionId, handle: u32) -> bool {
        let Some(index) = self
            .entries
            .iter()
            .position(|e| e.handle() == handle && e.connection() == connection)
        else {
            return false;
        };
        let mut entry = self.entries.remove(index);
        entry.set_state(SessionState::SavedClientClosed);
        self.abandoned.push_back(entry);
        true
    }

    /// Transfer an abandoned session to a new owner. Fails unless the
    /// session is currently in the abandoned queue.
    pub fn claim(&mut self, handle: u32, new_owner: ConnectionId) -> bool {
        let Some(index) = self.abandoned.iter().position(|e| e.handle() == handle) else {
            return false;
        };
        let Some(mut entry) = self.abandoned.remove(index) else {
            return false;
        };
        debug!(
            "session 0x{:08x} claimed by connection {:?}",
            handle, new_owner
        );
        entry.connection = new_owner;
        self.entries.push(entry);
        true
    }

    /// Flush and drop the oldest abandoned sessions until the queue is back
    /// within bounds. `flush` receives each stale handle; its result is
    /// reported by the caller, the entry is dropped either way.
    pub fn prune_abandoned(&mut self, mut flush: impl FnMut(u32) -> bool) {
        while self.abandoned.len() > MAX_ABANDONED {
            if let Some(entry) = self.abandoned.pop_front() {
                debug!("pruning stale abandoned session 0x{:08x}", entry.handle());
                flush(entry.handle());
            }
        }
    }

    /// Whether the given connection is at its session quota
    pub fn is_full(&self, connection: ConnectionId) -> bool {
        let count = self
            .entries
            .iter()
            .filter(|e| e.connection() == connection)
            .count();
        count >= self.per_connection_max
    }

    /// Handles of all sessions currently resident in the device
    pub fn loaded_handles(&self) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|e| e.state() == SessionState::Loaded)
            .map(|e| e.handle())
            .collect()
    }

    /// Snapshot of (handle, state) for every session owned by a connection
    pub fn handles_for_connection(&self, connection: ConnectionId) -> Vec<(u32, SessionState)> {
        self.entries
            .iter()
            .filter(|e| e.connection() == connection)
            .map(|e| (e.handle(), e.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn abandoned_len(&self) -> usize {
        self.abandoned.len()
    }
}
