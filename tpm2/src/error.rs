// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the TPM client

use thiserror::Error;

use crate::constants::{TpmCc, TpmRc};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Local template validation failed; nothing was sent to the TPM.
    #[error("invalid template: {0}")]
    InvalidTemplate(String),
    /// Local argument validation failed; nothing was sent to the TPM.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("malformed TPM response: {0}")]
    MalformedResponse(String),
    #[error("{command:?} failed: {code}")]
    Tpm { command: TpmCc, code: TpmRc },
    #[error("session 0x{handle:08x} desynchronized: {reason}")]
    SessionDesynchronized { handle: u32, reason: String },
    #[error("timed out waiting for the TPM")]
    Timeout,
    #[error("handle 0x{0:08x} used after release")]
    UseAfterRelease(u32),
    #[error("{command:?} still busy after {attempts} attempts: {code}")]
    RetryExhausted {
        command: TpmCc,
        code: TpmRc,
        attempts: u32,
    },
    #[error("transport failure: {0}")]
    Transport(#[source] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("not supported: {0}")]
    Unsupported(String),
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedResponse(msg.into())
    }

    /// The TPM response code, if the TPM itself reported the failure.
    pub fn tpm_code(&self) -> Option<TpmRc> {
        match self {
            Error::Tpm { code, .. } | Error::RetryExhausted { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Errors after which the connection state is unknown.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Error::Timeout | Error::Transport(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Transport(e),
        }
    }
}
