// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 wire encoding and decoding
//!
//! Frames are assembled body-first: [`frame`] computes the header size from
//! the finished body, so no field is ever patched after the fact. Decoding
//! borrows from the input instead of copying.

use anyhow::{ensure, Context, Result};

use crate::constants::{TpmSt, TPM_HEADER_SIZE};

/// Assemble one TPM frame: header (tag, size, code) followed by `body`.
///
/// `code` is the command code of a command frame or the response code of a
/// response frame; the two headers share a layout.
pub fn frame(tag: TpmSt, code: u32, body: &[u8]) -> Vec<u8> {
    Encoder::new()
        .u16(tag.to_u16())
        .u32((TPM_HEADER_SIZE + body.len()) as u32)
        .u32(code)
        .bytes(body)
        .build()
}

/// Chaining builder for big-endian TPM byte strings
#[derive(Debug, Default)]
pub struct Encoder {
    data: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(mut self, bytes: &[u8]) -> Self {
        self.data.extend_from_slice(bytes);
        self
    }

    pub fn u8(self, v: u8) -> Self {
        self.put(&[v])
    }

    pub fn u16(self, v: u16) -> Self {
        self.put(&v.to_be_bytes())
    }

    pub fn u32(self, v: u32) -> Self {
        self.put(&v.to_be_bytes())
    }

    pub fn u64(self, v: u64) -> Self {
        self.put(&v.to_be_bytes())
    }

    pub fn bytes(self, bytes: &[u8]) -> Self {
        self.put(bytes)
    }

    /// A TPM2B field: 2-byte length prefix, then the payload
    pub fn sized(self, bytes: &[u8]) -> Self {
        self.u16(bytes.len() as u16).put(bytes)
    }

    pub fn build(self) -> Vec<u8> {
        self.data
    }
}

/// Cursor over received TPM bytes. Fields are split off the front of the
/// input and borrowed, not copied.
#[derive(Debug)]
pub struct Decoder<'a> {
    rest: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }

    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    /// Split off the next `n` bytes
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            n <= self.rest.len(),
            "TPM buffer underflow: wanted {} bytes, {} left",
            n,
            self.rest.len()
        );
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into()?))
    }

    /// A TPM2B field: 2-byte length prefix, then the payload
    pub fn sized(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}

/// TPMS_CONTEXT as carried in the body of a ContextLoad command
#[derive(Debug, Clone)]
pub struct TpmsContext {
    pub sequence: u64,
    pub saved_handle: u32,
    pub hierarchy: u32,
    pub context_blob: Vec<u8>,
}

impl TpmsContext {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(body);
        Ok(Self {
            sequence: d.u64().context("TPMS_CONTEXT sequence")?,
            saved_handle: d.u32().context("TPMS_CONTEXT savedHandle")?,
            hierarchy: d.u32().context("TPMS_CONTEXT hierarchy")?,
            context_blob: d.sized().context("TPMS_CONTEXT contextBlob")?.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let body = Encoder::new().u16(32).build();
        let cmd = frame(TpmSt::NoSessions, 0x17B, &body);
        assert_eq!(&cmd[0..2], &[0x80, 0x01]);
        assert_eq!(&cmd[2..6], &[0, 0, 0, 12]); // header + u16 body
        assert_eq!(&cmd[6..10], &[0, 0, 0x01, 0x7B]);
        assert_eq!(&cmd[10..12], &[0, 32]);

        // empty body: a bare header
        assert_eq!(frame(TpmSt::NoSessions, 0, &[]).len(), TPM_HEADER_SIZE);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let bytes = Encoder::new()
            .u8(0xAB)
            .u16(0x1234)
            .u32(0xDEADBEEF)
            .u64(42)
            .sized(&[1, 2, 3])
            .build();

        let mut d = Decoder::new(&bytes);
        assert_eq!(d.u8().unwrap(), 0xAB);
        assert_eq!(d.u16().unwrap(), 0x1234);
        assert_eq!(d.u32().unwrap(), 0xDEADBEEF);
        assert_eq!(d.u64().unwrap(), 42);
        assert_eq!(d.sized().unwrap(), &[1, 2, 3]);
        assert_eq!(d.remaining(), 0);
    }

    #[test]
    fn test_decoder_underflow() {
        let mut d = Decoder::new(&[0x00, 0x01]);
        assert!(d.u32().is_err());
        assert_eq!(d.u16().unwrap(), 1);
        assert!(d.u8().is_err());

        // TPM2B length prefix larger than the remaining bytes
        let mut d = Decoder::new(&[0x00, 0x10, 0xFF]);
        assert!(d.sized().is_err());
    }

    #[test]
    fn test_tpms_context_parse() {
        let body = Encoder::new()
            .u64(42)
            .u32(0x02000001)
            .u32(0x40000007)
            .sized(&[0xAA; 32])
            .build();
        let ctx = TpmsContext::parse(&body).unwrap();
        assert_eq!(ctx.sequence, 42);
        assert_eq!(ctx.saved_handle, 0x02000001);
        assert_eq!(ctx.hierarchy, 0x40000007);
        assert_eq!(ctx.context_blob.len(), 32);

        assert!(TpmsContext::parse(&[0u8; 4]).is_err());
    }
}
