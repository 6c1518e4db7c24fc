// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command buffers as received from clients

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::connection::Connection;
use crate::constants::{command_attrs, TpmaCc, TPM_HEADER_SIZE};
use crate::wire::Decoder;

/// One authorization from a command's auth area
#[derive(Debug, Clone, Copy)]
pub struct CommandAuth {
    pub handle: u32,
    pub attributes: u8,
}

/// A TPM 2.0 command received from a client connection.
///
/// The buffer is owned and mutated in place when virtual handles are
/// rewritten to physical ones.
#[derive(Debug)]
pub struct Tpm2Command {
    buf: Vec<u8>,
    connection: Arc<Connection>,
    attrs: TpmaCc,
}

impl Tpm2Command {
    pub fn new(connection: Arc<Connection>, buf: Vec<u8>) -> Result<Self> {
        if buf.len() < TPM_HEADER_SIZE {
            bail!("command too short: {} bytes", buf.len());
        }
        let size = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        if size != buf.len() {
            bail!(
                "command size field {} does not match buffer length {}",
                size,
                buf.len()
            );
        }
        let code = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        let attrs = command_attrs(code);
        let command = Self {
            buf,
            connection,
            attrs,
        };
        if command.buf.len() < TPM_HEADER_SIZE + 4 * command.handle_count() {
            bail!("command truncated before the end of its handle area");
        }
        Ok(command)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn attributes(&self) -> TpmaCc {
        self.attrs
    }

    pub fn tag(&self) -> u16 {
        u16::from_be_bytes([self.buf[0], self.buf[1]])
    }

    pub fn code(&self) -> u32 {
        u32::from_be_bytes([self.buf[6], self.buf[7], self.buf[8], self.buf[9]])
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Everything after the header
    pub fn body(&self) -> &[u8] {
        &self.buf[TPM_HEADER_SIZE..]
    }

    /// Number of handles in the handle area, per the command's attributes
    pub fn handle_count(&self) -> usize {
        self.attrs.command_handles()
    }

    pub fn handle(&self, index: usize) -> Result<u32> {
        if index >= self.handle_count() {
            bail!("handle index {} out of range", index);
        }
        let pos = TPM_HEADER_SIZE + 4 * index;
        Ok(u32::from_be_bytes([
            self.buf[pos],
            self.buf[pos + 1],
            self.buf[pos + 2],
            self.buf[pos + 3],
        ]))
    }

    pub fn set_handle(&mut self, index: usize, handle: u32) -> Result<()> {
        if index >= self.handle_count() {
            bail!("handle index {} out of range", index);
        }
        let pos = TPM_HEADER_SIZE + 4 * index;
        self.buf[pos..pos + 4].copy_from_slice(&handle.to_be_bytes());
        Ok(())
    }

    pub fn handles(&self) -> Result<Vec<u32>> {
        (0..self.handle_count()).map(|i| self.handle(i)).collect()
    }

    pub fn has_auths(&self) -> bool {
        self.tag() == crate::constants::TpmSt::Sessions.to_u16()
    }

    /// Walk the auth area, returning each session's handle and attributes
    pub fn auths(&self) -> Result<Vec<CommandAuth>> {
        if !self.has_auths() {
            return Ok(Vec::new());
        }
        let mut d = Decoder::new(&self.buf[TPM_HEADER_SIZE + 4 * self.handle_count()..]);
        let auth_size = d.u32().context("auth area size")? as usize;
        if auth_size > d.remaining() {
            bail!("auth area size {} exceeds command buffer", auth_size);
        }

        let mut auths = Vec::new();
        let total = d.remaining();
        while total - d.remaining() < auth_size {
            let handle = d.u32().context("auth session handle")?;
            d.sized().context("auth nonce")?;
            let attributes = d.u8().context("auth session attributes")?;
            d.sized().context("auth value")?;
            auths.push(CommandAuth { handle, attributes });
        }
        if total - d.remaining() != auth_size {
            bail!(
                "auth area is {} bytes, expected {}",
                total - d.remaining(),
                auth_size
            );
        }
        Ok(auths)
    }

    /// The flushHandle parameter of a FlushContext command
    pub fn flush_handle(&self) -> Result<u32> {
        Decoder::new(self.body()).u32().context("flushHandle")
    }

    /// The (capability, property, propertyCount) parameters of GetCapability
    pub fn capability_args(&self) -> Result<(u32, u32, u32)> {
        let mut d = Decoder::new(self.body());
        let cap = d.u32().context("capability")?;
        let prop = d.u32().context("property")?;
        let count = d.u32().context("propertyCount")?;
        Ok((cap, prop, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{TpmCc, TpmSt, TpmaSa};
    use crate::wire::{frame, Encoder};

    fn conn() -> Arc<Connection> {
        Arc::new(Connection::new(1, 4))
    }

    fn build(tag: TpmSt, cc: TpmCc, body: Encoder) -> Vec<u8> {
        frame(tag, cc.to_u32(), &body.build())
    }

    #[test]
    fn test_rejects_malformed_header() {
        assert!(Tpm2Command::new(conn(), vec![0x80, 0x01]).is_err());

        let mut buf = build(TpmSt::NoSessions, TpmCc::GetRandom, Encoder::new().u16(16));
        buf[5] = 0xFF; // corrupt the size field
        assert!(Tpm2Command::new(conn(), buf).is_err());

        // ReadPublic needs one handle, give it none
        let buf = build(TpmSt::NoSessions, TpmCc::ReadPublic, Encoder::new());
        assert!(Tpm2Command::new(conn(), buf).is_err());
    }

    #[test]
    fn test_handle_access() {
        let buf = build(
            TpmSt::NoSessions,
            TpmCc::StartAuthSession,
            Encoder::new()
                .u32(0x40000007)
                .u32(0x40000007)
                .sized(&[0u8; 16]),
        );
        let mut cmd = Tpm2Command::new(conn(), buf).unwrap();
        assert_eq!(cmd.handle_count(), 2);
        assert_eq!(cmd.handles().unwrap(), vec![0x40000007, 0x40000007]);

        cmd.set_handle(1, 0x80000003).unwrap();
        assert_eq!(cmd.handle(1).unwrap(), 0x80000003);
        assert!(cmd.handle(2).is_err());
    }

    #[test]
    fn test_auth_area_walk() {
        let auth = Encoder::new()
            .u32(0x02000001)
            .sized(&[]) // nonce
            .u8(TpmaSa::CONTINUE_SESSION)
            .sized(&[]) // auth value
            .build();
        let buf = build(
            TpmSt::Sessions,
            TpmCc::Unseal,
            Encoder::new()
                .u32(0x80000001) // itemHandle
                .u32(auth.len() as u32)
                .bytes(&auth),
        );
        let cmd = Tpm2Command::new(conn(), buf).unwrap();
        assert!(cmd.has_auths());
        let auths = cmd.auths().unwrap();
        assert_eq!(auths.len(), 1);
        assert_eq!(auths[0].handle, 0x02000001);
        assert_eq!(auths[0].attributes & TpmaSa::CONTINUE_SESSION, 1);
    }

    #[test]
    fn test_flush_and_capability_params() {
        let buf = build(
            TpmSt::NoSessions,
            TpmCc::FlushContext,
            Encoder::new().u32(0x80000002),
        );
        let cmd = Tpm2Command::new(conn(), buf).unwrap();
        assert_eq!(cmd.handle_count(), 0);
        assert_eq!(cmd.flush_handle().unwrap(), 0x80000002);

        let buf = build(
            TpmSt::NoSessions,
            TpmCc::GetCapability,
            Encoder::new().u32(0x00000001).u32(0x80000000).u32(20),
        );
        let cmd = Tpm2Command::new(conn(), buf).unwrap();
        assert_eq!(cmd.capability_args().unwrap(), (1, 0x80000000, 20));
    }
}
