// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 session management
//!
//! Sessions are started unbound and unsalted, so the session key is empty
//! and an HMAC session is keyed by the entity's auth value alone (trailing
//! zero octets removed). Every command draws a fresh caller nonce; every
//! response must carry a new TPM nonce and, for HMAC sessions, a valid
//! response HMAC. Anything else desynchronizes the session.

use std::collections::HashMap;

use tracing::debug;

use crate::command::TpmCommand;
use crate::constants::*;
use crate::crypto::{random_bytes, KeyedHash};
use crate::error::{Error, Result};
use crate::types::*;

/// How a verb authorizes each handle that needs authorization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Auth {
    /// Password session carrying the auth value registered for the handle
    #[default]
    Password,
    /// Password session carrying an explicit auth value
    Value(AuthValue),
    /// HMAC or policy session started through this client
    Session(u32),
}

impl Auth {
    pub fn value(value: impl Into<Vec<u8>>) -> Result<Self> {
        Ok(Auth::Value(AuthValue::new(value)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    /// Nonces or response HMAC no longer line up with the TPM
    Desynchronized,
}

/// Authorization session handle
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub handle: u32,
    pub session_type: TpmSe,
    pub hash_alg: TpmAlgId,
    attributes: TpmaSa,
    nonce_caller: Vec<u8>,
    nonce_tpm: Vec<u8>,
    state: SessionState,
}

impl AuthSession {
    pub(crate) fn new(
        handle: u32,
        session_type: TpmSe,
        hash_alg: TpmAlgId,
        nonce_caller: Vec<u8>,
        nonce_tpm: Vec<u8>,
    ) -> Self {
        Self {
            handle,
            session_type,
            hash_alg,
            attributes: TpmaSa::new().with_continue_session(),
            nonce_caller,
            nonce_tpm,
            state: SessionState::Active,
        }
    }

    /// Build TPM2_StartAuthSession for an unbound, unsalted session.
    pub(crate) fn start_command(
        session_type: TpmSe,
        hash_alg: TpmAlgId,
        nonce_caller: &[u8],
    ) -> TpmCommand {
        let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
        // tpmKey (TPM_RH_NULL for unsalted session)
        cmd.add_handle(tpm_rh::NULL);
        // bind (TPM_RH_NULL for unbound session)
        cmd.add_handle(tpm_rh::NULL);
        cmd.add_tpm2b(nonce_caller);
        // encryptedSalt (empty - no salt)
        cmd.add_tpm2b_empty();
        cmd.add_u8(session_type as u8);
        // symmetric (AES-128-CFB, matches TPM default expectation)
        cmd.add(&TpmtSymDef::aes_128_cfb());
        cmd.add_u16(hash_alg.to_u16());
        cmd
    }

    /// Nonces are as long as the session digest
    pub fn nonce_size(&self) -> usize {
        self.hash_alg.digest_size()
    }

    pub fn nonce_tpm(&self) -> &[u8] {
        &self.nonce_tpm
    }

    pub fn nonce_caller(&self) -> &[u8] {
        &self.nonce_caller
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attributes(&self) -> TpmaSa {
        self.attributes
    }

    pub fn is_continue(&self) -> bool {
        self.attributes.continue_session()
    }

    pub(crate) fn set_continue(&mut self, keep: bool) {
        if keep {
            self.attributes.0 |= TpmaSa::CONTINUE_SESSION;
        } else {
            self.attributes.0 &= !TpmaSa::CONTINUE_SESSION;
        }
    }

    fn desync(&mut self, reason: impl Into<String>) -> Error {
        self.state = SessionState::Desynchronized;
        Error::SessionDesynchronized {
            handle: self.handle,
            reason: reason.into(),
        }
    }
}

/// What a command contributes to cpHash
#[derive(Debug, Clone, Copy)]
pub struct CommandDigestInput<'a> {
    pub command: TpmCc,
    pub names: &'a [Vec<u8>],
    pub parameters: &'a [u8],
}

/// cpHash = H(commandCode || names || parameters)
pub fn cp_hash(
    crypto: &dyn KeyedHash,
    alg: TpmAlgId,
    input: &CommandDigestInput<'_>,
) -> Result<Vec<u8>> {
    let cc = input.command.to_u32().to_be_bytes();
    let mut parts: Vec<&[u8]> = Vec::with_capacity(2 + input.names.len());
    parts.push(&cc);
    parts.extend(input.names.iter().map(Vec::as_slice));
    parts.push(input.parameters);
    crypto.digest(alg, &parts)
}

/// rpHash = H(responseCode || commandCode || parameters); only successful
/// responses carry an authorization area, so responseCode is always zero.
pub fn rp_hash(
    crypto: &dyn KeyedHash,
    alg: TpmAlgId,
    command: TpmCc,
    parameters: &[u8],
) -> Result<Vec<u8>> {
    let rc = TpmRc::SUCCESS.to_u32().to_be_bytes();
    let cc = command.to_u32().to_be_bytes();
    crypto.digest(alg, &[&rc, &cc, parameters])
}

/// Live-session table of one client
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<u32, AuthSession>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: AuthSession) {
        debug!(
            "session 0x{:08x} opened ({:?}, {:?})",
            session.handle, session.session_type, session.hash_alg
        );
        self.sessions.insert(session.handle, session);
    }

    pub fn get(&self, handle: u32) -> Option<&AuthSession> {
        self.sessions.get(&handle)
    }

    pub fn contains(&self, handle: u32) -> bool {
        self.sessions.contains_key(&handle)
    }

    pub fn remove(&mut self, handle: u32) -> Option<AuthSession> {
        self.sessions.remove(&handle)
    }

    pub fn handles(&self) -> Vec<u32> {
        let mut handles: Vec<u32> = self.sessions.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn live_mut(&mut self, handle: u32) -> Result<&mut AuthSession> {
        self.sessions
            .get_mut(&handle)
            .ok_or(Error::UseAfterRelease(handle))
    }

    /// Keep or end the session after its next use
    pub fn set_continue(&mut self, handle: u32, keep: bool) -> Result<()> {
        self.live_mut(handle)?.set_continue(keep);
        Ok(())
    }

    /// Produce the authorization entry for one session slot.
    ///
    /// A fresh caller nonce is drawn on every call, so retries re-authorize.
    pub fn authorize(
        &mut self,
        crypto: &dyn KeyedHash,
        handle: u32,
        input: &CommandDigestInput<'_>,
        auth: &AuthValue,
    ) -> Result<TpmsAuthCommand> {
        let session = self.live_mut(handle)?;
        if session.state != SessionState::Active {
            return Err(Error::SessionDesynchronized {
                handle,
                reason: "session is no longer usable".to_string(),
            });
        }
        let hmac = match session.session_type {
            TpmSe::Trial => {
                return Err(Error::InvalidParameter(format!(
                    "trial session 0x{:08x} cannot authorize {:?}",
                    handle, input.command
                )))
            }
            TpmSe::Policy => {
                session.nonce_caller = random_bytes(session.nonce_size())?;
                Vec::new()
            }
            TpmSe::Hmac => {
                session.nonce_caller = random_bytes(session.nonce_size())?;
                let cp = cp_hash(crypto, session.hash_alg, input)?;
                crypto.hmac(
                    session.hash_alg,
                    auth.trimmed(),
                    &[
                        &cp,
                        &session.nonce_caller,
                        &session.nonce_tpm,
                        &[session.attributes.0],
                    ],
                )?
            }
        };
        Ok(TpmsAuthCommand {
            session_handle: handle,
            nonce: Tpm2bNonce::new(session.nonce_caller.clone()),
            attributes: session.attributes,
            hmac: Tpm2bDigest::new(hmac),
        })
    }

    /// Check one response authorization entry and rotate the TPM nonce.
    ///
    /// On failure the session is marked desynchronized; the caller removes
    /// and flushes it.
    pub fn verify_response(
        &mut self,
        crypto: &dyn KeyedHash,
        handle: u32,
        command: TpmCc,
        parameters: &[u8],
        auth: &AuthValue,
        response: &TpmsAuthResponse,
    ) -> Result<()> {
        let session = self.live_mut(handle)?;
        let new_nonce = &response.nonce.buffer;
        if new_nonce.len() != session.nonce_size() {
            return Err(session.desync(format!(
                "TPM nonce is {} bytes, expected {}",
                new_nonce.len(),
                session.nonce_size()
            )));
        }
        if *new_nonce == session.nonce_tpm {
            return Err(session.desync("TPM nonce was not rotated"));
        }

        if session.session_type == TpmSe::Hmac {
            let rp = rp_hash(crypto, session.hash_alg, command, parameters)?;
            let valid = crypto.hmac_verify(
                session.hash_alg,
                auth.trimmed(),
                &[
                    &rp,
                    new_nonce,
                    &session.nonce_caller,
                    &[response.attributes.0],
                ],
                &response.hmac.buffer,
            )?;
            if !valid {
                return Err(session.desync("response HMAC mismatch"));
            }
        }

        session.nonce_tpm = new_nonce.clone();
        Ok(())
    }
}
