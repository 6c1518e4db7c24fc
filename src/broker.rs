// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Blocking access to the TPM device
//!
//! The resource manager drives the device through the [`AccessBroker`]
//! trait. [`TpmDevice`] implements it over `/dev/tpmrm0` or `/dev/tpm0`;
//! tests substitute an in-memory device.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write as _};
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::debug;

use crate::constants::{rc, TpmCc, TpmSt, TPM_HEADER_SIZE};
use crate::wire::frame;

/// Maximum TPM command/response size
const TPM_MAX_RESPONSE_SIZE: usize = 4096;

/// Device nodes probed by [`TpmDevice::detect`], in preference order. The
/// in-kernel resource manager node comes first so stacking on top of it
/// still works.
const DEVICE_CANDIDATES: [&str; 2] = ["/dev/tpmrm0", "/dev/tpm0"];

/// Failures on the device path.
///
/// [`BrokerError::rc`] maps each variant onto a TSS2-layer response code so
/// the pipeline can synthesize an error response for the client.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("TPM device I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed TPM response: {0}")]
    Malformed(String),
    #[error("TPM returned response code 0x{0:08x}")]
    Tpm(u32),
}

impl BrokerError {
    /// Response code equivalent for synthesized error responses
    pub fn rc(&self) -> u32 {
        match self {
            BrokerError::Io(_) => rc::LAYER_TCTI | rc::IO_ERROR,
            BrokerError::Malformed(_) => rc::LAYER_TCTI | rc::GENERAL_FAILURE,
            BrokerError::Tpm(code) => *code,
        }
    }
}

/// Validate a response header and return the body of a successful response
pub(crate) fn success_body(response: &[u8]) -> Result<Vec<u8>, BrokerError> {
    if response.len() < TPM_HEADER_SIZE {
        return Err(BrokerError::Malformed(format!(
            "short response: {} bytes",
            response.len()
        )));
    }
    let size = u32::from_be_bytes([response[2], response[3], response[4], response[5]]) as usize;
    if size < TPM_HEADER_SIZE || size > response.len() {
        return Err(BrokerError::Malformed(format!(
            "response size field {} out of range",
            size
        )));
    }
    let code = u32::from_be_bytes([response[6], response[7], response[8], response[9]]);
    if code != rc::SUCCESS {
        return Err(BrokerError::Tpm(code));
    }
    Ok(response[TPM_HEADER_SIZE..size].to_vec())
}

/// Blocking operations against a single TPM device.
///
/// The context operations have default implementations in terms of
/// `send_command`, so an implementor only has to move bytes.
pub trait AccessBroker: Send {
    /// Send a raw command buffer and return the raw response buffer
    fn send_command(&mut self, command: &[u8]) -> Result<Vec<u8>, BrokerError>;

    /// Load a saved context, returning the handle the device assigned
    fn context_load(&mut self, context: &[u8]) -> Result<u32, BrokerError> {
        let cmd = frame(TpmSt::NoSessions, TpmCc::ContextLoad.to_u32(), context);
        let body = success_body(&self.send_command(&cmd)?)?;
        if body.len() < 4 {
            return Err(BrokerError::Malformed(
                "ContextLoad response missing handle".into(),
            ));
        }
        Ok(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
    }

    /// Save the context of a loaded object, then flush it from the device
    fn context_saveflush(&mut self, phandle: u32) -> Result<Vec<u8>, BrokerError> {
        let cmd = frame(
            TpmSt::NoSessions,
            TpmCc::ContextSave.to_u32(),
            &phandle.to_be_bytes(),
        );
        let context = success_body(&self.send_command(&cmd)?)?;
        self.context_flush(phandle)?;
        Ok(context)
    }

    /// Flush a handle from the device
    fn context_flush(&mut self, handle: u32) -> Result<(), BrokerError> {
        let cmd = frame(
            TpmSt::NoSessions,
            TpmCc::FlushContext.to_u32(),
            &handle.to_be_bytes(),
        );
        success_body(&self.send_command(&cmd)?)?;
        Ok(())
    }
}

/// TPM character device
#[derive(Debug)]
pub struct TpmDevice {
    file: File,
    path: String,
}

impl TpmDevice {
    /// Open a specific TPM device node
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open TPM device {}", path.display()))?;
        debug!("using TPM device {}", path.display());
        Ok(Self {
            file,
            path: path.display().to_string(),
        })
    }

    /// Probe [`DEVICE_CANDIDATES`] and open the first node that exists
    pub fn detect() -> Result<Self> {
        let path = DEVICE_CANDIDATES
            .iter()
            .find(|candidate| Path::new(candidate).exists())
            .with_context(|| {
                format!("no TPM device node found (tried {:?})", DEVICE_CANDIDATES)
            })?;
        Self::open(path)
    }
}

impl AccessBroker for TpmDevice {
    fn send_command(&mut self, command: &[u8]) -> Result<Vec<u8>, BrokerError> {
        self.file.write_all(command)?;

        let mut response = vec![0u8; TPM_MAX_RESPONSE_SIZE];
        let n = self.file.read(&mut response)?;
        response.truncate(n);
        debug!(
            "{}: {} byte command, {} byte response",
            self.path,
            command.len(),
            response.len()
        );
        if response.len() < TPM_HEADER_SIZE {
            return Err(BrokerError::Malformed(format!(
                "{} returned {} bytes",
                self.path,
                response.len()
            )));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records commands and replays a scripted response
    struct Scripted {
        sent: Vec<Vec<u8>>,
        response: Vec<u8>,
    }

    impl AccessBroker for Scripted {
        fn send_command(&mut self, command: &[u8]) -> Result<Vec<u8>, BrokerError> {
            self.sent.push(command.to_vec());
            Ok(self.response.clone())
        }
    }

    fn success_response(body: &[u8]) -> Vec<u8> {
        frame(TpmSt::NoSessions, rc::SUCCESS, body)
    }

    #[test]
    fn test_error_rc_mapping() {
        let err = BrokerError::Tpm(0x922);
        assert_eq!(err.rc(), 0x922);

        let err = BrokerError::Io(std::io::Error::other("nope"));
        assert_eq!(err.rc(), 0x000A000A);

        let err = BrokerError::Malformed("bad".into());
        assert_eq!(err.rc(), 0x000A0001);
    }

    #[test]
    fn test_success_body() {
        assert_eq!(success_body(&success_response(&[1, 2])).unwrap(), vec![1, 2]);

        let mut failed = success_response(&[]);
        failed[6..10].copy_from_slice(&0x100u32.to_be_bytes());
        assert!(matches!(
            success_body(&failed),
            Err(BrokerError::Tpm(0x100))
        ));

        assert!(matches!(
            success_body(&[0x80, 0x01]),
            Err(BrokerError::Malformed(_))
        ));
    }

    #[test]
    fn test_context_load_wire_format() {
        let mut broker = Scripted {
            sent: Vec::new(),
            response: success_response(&0x80000001u32.to_be_bytes()),
        };
        let context = [0xAB; 16];
        let phandle = broker.context_load(&context).unwrap();
        assert_eq!(phandle, 0x80000001);

        let cmd = &broker.sent[0];
        assert_eq!(&cmd[0..2], &[0x80, 0x01]);
        assert_eq!(&cmd[2..6], &(10u32 + 16).to_be_bytes());
        assert_eq!(&cmd[6..10], &TpmCc::ContextLoad.to_u32().to_be_bytes());
        assert_eq!(&cmd[10..], &context);
    }

    #[test]
    fn test_context_saveflush_is_save_then_flush() {
        let mut broker = Scripted {
            sent: Vec::new(),
            response: success_response(&[0xCC; 8]),
        };
        let context = broker.context_saveflush(0x80000003).unwrap();
        assert_eq!(context, vec![0xCC; 8]);
        assert_eq!(broker.sent.len(), 2);
        assert_eq!(
            &broker.sent[0][6..10],
            &TpmCc::ContextSave.to_u32().to_be_bytes()
        );
        assert_eq!(
            &broker.sent[1][6..10],
            &TpmCc::FlushContext.to_u32().to_be_bytes()
        );
        // both carry the physical handle
        assert_eq!(&broker.sent[0][10..14], &0x80000003u32.to_be_bytes());
        assert_eq!(&broker.sent[1][10..14], &0x80000003u32.to_be_bytes());
    }
}
