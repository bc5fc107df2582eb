// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Client configuration
//!
//! The transport is chosen by a TCTI string:
//!
//! - `device` / `device:/dev/tpmrm0` - kernel character device
//! - `mssim` / `mssim:host=127.0.0.1,port=2321` - TPM simulator over TCP
//!
//! When no TCTI is configured, `TPM2_CLIENT_TCTI` and then `TCTI` are
//! consulted before falling back to the first kernel device found.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::constants::TpmAlgId;
use crate::device::{DeviceTransport, SimulatorTransport, Transport};
use crate::error::{Error, Result};

/// Environment variables consulted for the TCTI, in order
pub const TCTI_ENV: [&str; 2] = ["TPM2_CLIENT_TCTI", "TCTI"];

/// Backoff applied when the TPM answers with a retry-class warning
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: u32,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 20,
            multiplier: 2,
            max_backoff_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Send each command exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier).saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Parsed TCTI selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tcti {
    /// Kernel device; `None` picks `/dev/tpmrm0` or `/dev/tpm0`
    Device(Option<PathBuf>),
    Simulator { host: String, port: u16 },
}

impl FromStr for Tcti {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, args) = match s.split_once(':') {
            Some((kind, args)) => (kind, Some(args)),
            None => (s, None),
        };
        match (kind, args) {
            ("device", None) => Ok(Tcti::Device(None)),
            ("device", Some(path)) if !path.is_empty() => Ok(Tcti::Device(Some(path.into()))),
            ("mssim", args) => {
                let mut host = SimulatorTransport::DEFAULT_HOST.to_string();
                let mut port = SimulatorTransport::DEFAULT_PORT;
                for pair in args.unwrap_or("").split(',').filter(|p| !p.is_empty()) {
                    match pair.split_once('=') {
                        Some(("host", v)) => host = v.to_string(),
                        Some(("port", v)) => {
                            port = v
                                .parse()
                                .map_err(|_| Error::Config(format!("invalid port: {v}")))?
                        }
                        _ => return Err(Error::Config(format!("invalid mssim option: {pair}"))),
                    }
                }
                Ok(Tcti::Simulator { host, port })
            }
            _ => Err(Error::Config(format!("unrecognized TCTI: {s}"))),
        }
    }
}

impl fmt::Display for Tcti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tcti::Device(None) => write!(f, "device"),
            Tcti::Device(Some(path)) => write!(f, "device:{}", path.display()),
            Tcti::Simulator { host, port } => write!(f, "mssim:host={host},port={port}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub tcti: Option<String>,
    /// Per-response read timeout
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
    /// Entries requested per GetCapability call when paging
    pub capability_page_size: u32,
    /// Hash used for HMAC sessions started without an explicit algorithm
    pub session_hash: TpmAlgId,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tcti: None,
            timeout_ms: 30_000,
            retry: RetryPolicy::default(),
            capability_page_size: 10,
            session_hash: TpmAlgId::Sha256,
        }
    }
}

impl ClientConfig {
    pub fn with_tcti(mut self, tcti: impl Into<String>) -> Self {
        self.tcti = Some(tcti.into());
        self
    }

    /// Load a JSON configuration file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.capability_page_size == 0 {
            return Err(Error::Config("capability_page_size must be at least 1".into()));
        }
        if !self.session_hash.is_hash() {
            return Err(Error::Config(format!(
                "session_hash {:?} is not a hash algorithm",
                self.session_hash
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resolve the TCTI from the config, then the environment.
    pub fn resolve_tcti(&self) -> Result<Tcti> {
        if let Some(tcti) = &self.tcti {
            return tcti.parse();
        }
        for var in TCTI_ENV {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    debug!("using TCTI from {var}: {value}");
                    return value.parse();
                }
            }
        }
        Ok(Tcti::Device(None))
    }

    /// Open the configured transport
    pub fn open_transport(&self) -> Result<Box<dyn Transport>> {
        let timeout = self.timeout();
        Ok(match self.resolve_tcti()? {
            Tcti::Device(None) => Box::new(DeviceTransport::detect(timeout)?),
            Tcti::Device(Some(path)) => Box::new(DeviceTransport::open(path, timeout)?),
            Tcti::Simulator { host, port } => {
                let mut sim = SimulatorTransport::new(host, port, timeout);
                sim.connect()?;
                Box::new(sim)
            }
        })
    }
}
