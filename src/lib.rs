// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 resource manager core
//!
//! A serializing multiplexer between many client connections and a single
//! TPM device. The device holds only a handful of transient objects and
//! sessions at once; this crate virtualizes its handle space so that every
//! client sees a private, long-lived pool of objects. Around each command
//! the worker loads exactly the contexts the command needs, rewrites the
//! handles on the wire, forwards to the device, maps new handles in the
//! response and saves everything back out.
//!
//! ## Structure
//!
//! - Commands and control messages arrive on a [`MessageQueue`]; responses
//!   leave through a [`Sink`].
//! - [`ResourceManager`] owns the one worker thread; all bookkeeping is
//!   single-writer.
//! - The device is reached through the [`AccessBroker`] trait, implemented
//!   for `/dev/tpmrm0` by [`TpmDevice`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tpm2_resmgr::{MessageQueue, ResmgrOptions, ResourceManager, TpmDevice};
//!
//! let device = TpmDevice::detect()?;
//! let in_queue = Arc::new(MessageQueue::new());
//! let out_queue = Arc::new(MessageQueue::new());
//! let resmgr = ResourceManager::new(
//!     Box::new(device),
//!     &ResmgrOptions::default(),
//!     Arc::clone(&in_queue),
//!     out_queue,
//! );
//! let worker = resmgr.start();
//! # Ok::<(), anyhow::Error>(())
//! ```

mod broker;
mod command;
mod config;
mod connection;
mod constants;
mod handle_map;
mod queue;
mod resource_manager;
mod response;
mod session_list;
mod wire;

pub use broker::{AccessBroker, BrokerError, TpmDevice};
pub use command::{CommandAuth, Tpm2Command};
pub use config::{ResmgrOptions, SESSION_MAX_DEFAULT, TRANSIENT_MAX_DEFAULT};
pub use connection::{Connection, ConnectionId};
pub use constants::*;
pub use handle_map::{HandleMap, HandleMapEntry};
pub use queue::{ControlMessage, Message, MessageQueue, Sink};
pub use resource_manager::ResourceManager;
pub use response::Tpm2Response;
pub use session_list::{SessionEntry, SessionList, SessionState, MAX_ABANDONED};
pub use wire::{frame, Decoder, Encoder, TpmsContext};
