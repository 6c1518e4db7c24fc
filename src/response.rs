// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 response buffers, both device-produced and synthesized

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::connection::Connection;
use crate::constants::{rc, TpmCap, TpmSt, TpmaCc, TPM_HEADER_SIZE};
use crate::wire::{frame, Encoder};

/// A TPM 2.0 response on its way back to a client connection.
///
/// Either the device's own bytes (trimmed to the size field) or a buffer
/// synthesized by the resource manager for a virtualized command.
#[derive(Debug)]
pub struct Tpm2Response {
    buf: Vec<u8>,
    connection: Arc<Connection>,
    attrs: TpmaCc,
}

impl Tpm2Response {
    /// Wrap a device response. `attrs` are the attributes of the command
    /// that produced it.
    pub fn from_bytes(connection: Arc<Connection>, attrs: TpmaCc, mut buf: Vec<u8>) -> Result<Self> {
        if buf.len() < TPM_HEADER_SIZE {
            bail!("response too short: {} bytes", buf.len());
        }
        let size = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        if size < TPM_HEADER_SIZE || size > buf.len() {
            bail!(
                "response size field {} out of range for {}-byte buffer",
                size,
                buf.len()
            );
        }
        buf.truncate(size);
        Ok(Self {
            buf,
            connection,
            attrs,
        })
    }

    /// A synthesized response with default (handle-free) attributes
    fn synthesized(connection: &Arc<Connection>, code: u32, body: &[u8]) -> Self {
        Self {
            buf: frame(TpmSt::NoSessions, code, body),
            connection: Arc::clone(connection),
            attrs: TpmaCc::default(),
        }
    }

    /// A bare header-only response carrying a response code
    pub fn new_rc(connection: &Arc<Connection>, code: u32) -> Self {
        Self::synthesized(connection, code, &[])
    }

    /// Response to a virtualized ContextSave: the session's device-format
    /// context as the body.
    pub fn new_context_save(connection: &Arc<Connection>, context: &[u8]) -> Self {
        Self::synthesized(connection, rc::SUCCESS, context)
    }

    /// Response to a virtualized ContextLoad: the session handle in the
    /// handle area.
    pub fn new_context_load(connection: &Arc<Connection>, handle: u32) -> Self {
        Self::synthesized(connection, rc::SUCCESS, &handle.to_be_bytes())
    }

    /// Response to a virtualized GetCapability(TPM2_CAP_HANDLES) over the
    /// connection's virtual transient handles.
    pub fn new_cap_handles(connection: &Arc<Connection>, more_data: bool, handles: &[u32]) -> Self {
        let mut body = Encoder::new()
            .u8(more_data as u8)
            .u32(TpmCap::Handles.to_u32())
            .u32(handles.len() as u32);
        for &handle in handles {
            body = body.u32(handle);
        }
        Self::synthesized(connection, rc::SUCCESS, &body.build())
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn tag(&self) -> u16 {
        u16::from_be_bytes([self.buf[0], self.buf[1]])
    }

    pub fn rc(&self) -> u32 {
        u32::from_be_bytes([self.buf[6], self.buf[7], self.buf[8], self.buf[9]])
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Whether this response carries a handle in its handle area. Only
    /// successful responses to commands with a response handle do.
    pub fn has_handle(&self) -> bool {
        self.rc() == rc::SUCCESS
            && self.attrs.has_response_handle()
            && self.buf.len() >= TPM_HEADER_SIZE + 4
    }

    pub fn handle(&self) -> Option<u32> {
        if !self.has_handle() {
            return None;
        }
        Some(u32::from_be_bytes([
            self.buf[TPM_HEADER_SIZE],
            self.buf[TPM_HEADER_SIZE + 1],
            self.buf[TPM_HEADER_SIZE + 2],
            self.buf[TPM_HEADER_SIZE + 3],
        ]))
    }

    pub fn set_handle(&mut self, handle: u32) {
        self.buf[TPM_HEADER_SIZE..TPM_HEADER_SIZE + 4].copy_from_slice(&handle.to_be_bytes());
    }
}
