// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Resource manager limits

use serde::Deserialize;

/// Default per-connection limit on tracked transient objects
pub const TRANSIENT_MAX_DEFAULT: usize = 27;

/// Default per-connection limit on tracked sessions
pub const SESSION_MAX_DEFAULT: usize = 4;

/// Tunable per-connection quotas
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResmgrOptions {
    /// Transient objects a single connection may hold
    pub transient_max: usize,
    /// Sessions a single connection may hold
    pub session_max: usize,
}

impl Default for ResmgrOptions {
    fn default() -> Self {
        Self {
            transient_max: TRANSIENT_MAX_DEFAULT,
            session_max: SESSION_MAX_DEFAULT,
        }
    }
}
