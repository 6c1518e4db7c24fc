// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Client connection identity and its transient handle map

use std::sync::{Mutex, MutexGuard};

use crate::handle_map::HandleMap;

/// Stable identity of one client connection.
///
/// Sessions refer to their owning connection by id rather than by reference,
/// so a `SessionEntry` never keeps a `Connection` alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// One client connection.
///
/// The transient handle map is embedded here and discarded with the
/// connection; only the worker thread mutates it.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    trans_map: Mutex<HandleMap>,
}

impl Connection {
    pub fn new(id: u64, transient_max: usize) -> Self {
        Self {
            id: ConnectionId(id),
            trans_map: Mutex::new(HandleMap::new(transient_max)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn trans_map(&self) -> MutexGuard<'_, HandleMap> {
        self.trans_map.lock().unwrap_or_else(|e| e.into_inner())
    }
}
