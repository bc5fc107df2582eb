// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 client
//!
//! This crate marshals TPM 2.0 commands, authorizes them with password,
//! HMAC or policy sessions, and talks directly to the TPM without C library
//! dependencies.
//!
//! ## Features
//!
//! - **Transports**: kernel device (`/dev/tpmrm0` or `/dev/tpm0`) and the
//!   TPM simulator's TCP protocol, selected by a TCTI string
//! - **Sessions**: unbound, unsalted HMAC, policy and trial sessions with
//!   nonce rotation and response HMAC checks
//! - **Handle tracking**: every object, session and NV index created through
//!   a client is released when the client is shut down or dropped
//! - **Retry**: commands answered with `TPM_RC_RETRY`, `TPM_RC_YIELDED` or
//!   `TPM_RC_TESTING` are resent with exponential backoff
//!
//! ## Supported Commands
//!
//! - Lifecycle: `Startup`, `Shutdown`, `SelfTest`, `GetCapability`
//! - NV operations: `NV_DefineSpace`, `NV_UndefineSpace`, `NV_ReadPublic`,
//!   `NV_Read`, `NV_Write`, `NV_Increment`
//! - PCR operations: `PCR_Read`, `PCR_Extend`, `PCR_Event`
//! - Key operations: `CreatePrimary`, `Create`, `Load`, `Import`,
//!   `LoadExternal`, `ReadPublic`, `EvictControl`, `FlushContext`
//! - Asymmetric: `RSA_Encrypt`, `RSA_Decrypt`, `Sign`, `VerifySignature`, `Hash`
//! - Symmetric: `EncryptDecrypt2`, falling back to `EncryptDecrypt`
//! - Sessions: `StartAuthSession`, `PolicyPCR`, `PolicyGetDigest`
//! - Random: `GetRandom`
//!
//! ## Example
//!
//! ```no_run
//! use tpm2_client::{TpmClient, TpmSu};
//!
//! let client = TpmClient::open(Some("mssim"))?;
//! client.startup(TpmSu::Clear)?;
//! let random_bytes = client.get_random(32)?;
//! # Ok::<(), tpm2_client::Error>(())
//! ```

mod command;
mod commands;
mod config;
mod constants;
mod crypto;
mod device;
mod error;
mod marshal;
mod registry;
mod session;
mod types;

pub use commands::{CapabilityIter, CapabilityPage, TpmClient, NV_MAX_CHUNK};
pub use config::{ClientConfig, RetryPolicy, Tcti, TCTI_ENV};
pub use constants::*;
pub use error::{Error, Result};
pub use registry::{HandleKind, HandleRegistry, ReleaseFailure, ReleaseReport, TrackedHandle};
pub use session::{cp_hash, rp_hash, Auth, AuthSession, CommandDigestInput, SessionManager, SessionState};
pub use types::*;

// Lower layers for callers that build their own commands
pub use command::{
    CreatePrimaryResponse, CreateResponse, PcrReadResponse, ReadPublicResponse, ResponseBody,
    ResponseParts, TpmCommand, TpmResponse,
};
pub use crypto::{compute_name, KeyedHash, SoftwareCrypto};
pub use device::{DeviceTransport, SimulatorTransport, Transport};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
