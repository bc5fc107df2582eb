// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command implementations
//!
//! [`TpmClient`] owns one transport, the live session table and the handle
//! registry. Every verb builds a command, authorizes it, sends it through the
//! retrying dispatcher and decodes the typed response. Verbs take `&self`;
//! a client may be shared between threads and serializes its commands.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::thread;

use tracing::{debug, info, warn};

use crate::command::*;
use crate::config::ClientConfig;
use crate::constants::*;
use crate::crypto::{compute_name, random_bytes, KeyedHash, SoftwareCrypto};
use crate::device::Transport;
use crate::error::{Error, Result};
use crate::marshal::Marshal;
use crate::registry::*;
use crate::session::*;
use crate::types::*;

/// Largest NV_Read/NV_Write transfer issued in one command
pub const NV_MAX_CHUNK: usize = 1024;

/// Largest GetRandom request issued in one command
const RANDOM_MAX_CHUNK: usize = 48;

/// Largest buffer accepted by TPM2_Hash
const HASH_MAX_INPUT: usize = 1024;

/// Largest RSA message, ciphertext or label
const RSA_MAX_BUFFER: usize = 512;

/// Largest EncryptDecrypt input and PCR_Event payload
const DIGEST_MAX_BUFFER: usize = 1024;

/// Largest private or duplicate blob accepted by Load and Import
const PRIVATE_MAX_BUFFER: usize = 2048;

/// Largest symmetric IV
const SYM_BLOCK_MAX: usize = 16;

macro_rules! expect_body {
    ($body:expr, $cc:expr, $pat:pat => $out:expr) => {
        match $body {
            $pat => $out,
            other => return Err(unexpected_body($cc, &other)),
        }
    };
}

fn check_size(what: &str, len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(Error::InvalidParameter(format!(
            "{} is {} bytes, at most {} allowed",
            what, len, max
        )));
    }
    Ok(())
}

/// One page of GetCapability output
#[derive(Debug, Clone)]
pub struct CapabilityPage {
    pub more: bool,
    pub data: TpmsCapabilityData,
}

struct ClientState {
    channel: Box<dyn Transport>,
    crypto: Box<dyn KeyedHash>,
    config: ClientConfig,
    sessions: SessionManager,
    registry: HandleRegistry,
    cleanup_report: Option<ReleaseReport>,
    needs_reconnect: bool,
    /// Set once the TPM rejected EncryptDecrypt2
    legacy_encrypt_decrypt: bool,
}

/// Synchronous TPM client
pub struct TpmClient {
    state: Mutex<ClientState>,
}

impl TpmClient {
    /// Connect using `config`, resolving the TCTI from the environment when
    /// the config does not name one.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let channel = config.open_transport()?;
        Ok(Self::with_transport(channel, config))
    }

    /// Connect to the TPM named by a TCTI string, or the default device.
    pub fn open(tcti: Option<&str>) -> Result<Self> {
        let mut config = ClientConfig::default();
        config.tcti = tcti.map(str::to_string);
        Self::new(config)
    }

    /// Use an already connected transport
    pub fn with_transport(channel: Box<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            state: Mutex::new(ClientState {
                channel,
                crypto: Box::new(SoftwareCrypto),
                config,
                sessions: SessionManager::new(),
                registry: HandleRegistry::new(),
                cleanup_report: None,
                needs_reconnect: false,
                legacy_encrypt_decrypt: false,
            }),
        }
    }

    /// Replace the hash/HMAC provider
    pub fn with_crypto(self, crypto: impl KeyedHash + 'static) -> Self {
        self.lock().crypto = Box::new(crypto);
        self
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        // A verb that panicked leaves no partial command on the wire.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ==================== Lifecycle ====================

    /// TPM2_Startup. A TPM that is already started is not an error.
    pub fn startup(&self, startup_type: TpmSu) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::Startup);
        cmd.add_u16(startup_type as u16);
        match self.lock().execute(&cmd, &[]) {
            Err(Error::Tpm { code, .. }) if code.base() == TpmRc::INITIALIZE => {
                debug!("TPM already started");
                Ok(())
            }
            other => other.map(drop),
        }
    }

    /// TPM2_Shutdown, preparing the TPM for power loss
    pub fn shutdown_tpm(&self, shutdown_type: TpmSu) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::Shutdown);
        cmd.add_u16(shutdown_type as u16);
        self.lock().execute(&cmd, &[])?;
        Ok(())
    }

    pub fn self_test(&self, full_test: bool) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::SelfTest);
        cmd.add_u8(full_test as u8);
        self.lock().execute(&cmd, &[])?;
        Ok(())
    }

    /// Power cycle a simulator. Every handle and session is gone afterwards.
    pub fn power_cycle(&self) -> Result<()> {
        let mut state = self.lock();
        state.channel.power_cycle()?;
        state.registry.clear();
        for handle in state.sessions.handles() {
            state.sessions.remove(handle);
        }
        info!("TPM power cycled");
        Ok(())
    }

    // ==================== Capabilities ====================

    /// One TPM2_GetCapability call
    pub fn get_capability(
        &self,
        capability: TpmCap,
        property: u32,
        count: u32,
    ) -> Result<CapabilityPage> {
        let mut cmd = TpmCommand::new(TpmCc::GetCapability);
        cmd.add_u32(capability.to_u32());
        cmd.add_u32(property);
        cmd.add_u32(count);
        let body = self.lock().execute(&cmd, &[])?;
        let (more, data) = expect_body!(body, TpmCc::GetCapability,
            ResponseBody::GetCapability { more, data } => (more, data));
        if data.capability() != capability {
            return Err(Error::malformed(format!(
                "asked for {:?}, got {:?}",
                capability,
                data.capability()
            )));
        }
        Ok(CapabilityPage { more, data })
    }

    /// Iterate over a capability starting at `start`, paging by the
    /// configured page size.
    pub fn capabilities(&self, capability: TpmCap, start: u32) -> CapabilityIter<'_> {
        let step = self.lock().config.capability_page_size;
        self.capabilities_by(capability, start, step)
    }

    pub fn capabilities_by(&self, capability: TpmCap, start: u32, step: u32) -> CapabilityIter<'_> {
        CapabilityIter {
            client: self,
            capability,
            cursor: Some(start),
            step: step.max(1),
            buffered: VecDeque::new(),
        }
    }

    /// Read a single TPM property
    pub fn tpm_property(&self, property: u32) -> Result<Option<u32>> {
        let page = self.get_capability(TpmCap::TpmProperties, property, 1)?;
        Ok(page.data.into_entries().into_iter().find_map(|e| match e {
            CapabilityEntry::TpmProperty(p) if p.property == property => Some(p.value),
            _ => None,
        }))
    }

    // ==================== Random Number Generation ====================

    /// Generate random bytes using the TPM's RNG
    pub fn get_random(&self, num_bytes: usize) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(num_bytes);
        let mut state = self.lock();

        // The TPM may return fewer bytes than requested
        while result.len() < num_bytes {
            let request_size = (num_bytes - result.len()).min(RANDOM_MAX_CHUNK) as u16;
            let mut cmd = TpmCommand::new(TpmCc::GetRandom);
            cmd.add_u16(request_size);
            let bytes = expect_body!(state.execute(&cmd, &[])?, TpmCc::GetRandom,
                ResponseBody::GetRandom(bytes) => bytes);
            if bytes.is_empty() {
                return Err(Error::malformed("GetRandom returned no bytes"));
            }
            result.extend_from_slice(&bytes);
        }

        result.truncate(num_bytes);
        Ok(result)
    }

    pub fn get_random_array<const N: usize>(&self) -> Result<[u8; N]> {
        let bytes = self.get_random(N)?;
        bytes
            .try_into()
            .map_err(|_| Error::malformed("unexpected random bytes length"))
    }

    // ==================== Keys ====================

    /// Create a primary object under `hierarchy` and track its handle.
    ///
    /// The template is validated locally first; a rejected template never
    /// reaches the TPM.
    pub fn create_primary(
        &self,
        hierarchy: u32,
        sensitive: &TpmsSensitiveCreate,
        template: &TpmtPublic,
        outside_info: &[u8],
        creation_pcr: &TpmlPcrSelection,
        auth: Auth,
    ) -> Result<CreatePrimaryResponse> {
        template.validate()?;
        if !tpm_rh::is_hierarchy(hierarchy) {
            return Err(Error::InvalidParameter(format!(
                "0x{:08x} is not a hierarchy",
                hierarchy
            )));
        }
        check_size("outside info", outside_info.len(), 64)?;

        let mut cmd = TpmCommand::new(TpmCc::CreatePrimary);
        cmd.add_handle(hierarchy);
        cmd.add_sized(sensitive);
        cmd.add(&Tpm2bPublic::from_template(template));
        cmd.add_tpm2b(outside_info);
        cmd.add(creation_pcr);

        let mut state = self.lock();
        let body = state.execute(&cmd, &[(hierarchy, auth)])?;
        let response = expect_body!(body, TpmCc::CreatePrimary,
            ResponseBody::CreatePrimary(response) => *response);
        state.registry.track(
            response.handle,
            HandleKind::Transient,
            sensitive.user_auth.clone(),
            response.name.clone(),
        );
        debug!("created primary key with handle 0x{:08x}", response.handle);
        Ok(response)
    }

    /// Create an ordinary object under `parent`.
    ///
    /// The object is not loaded; hand the returned private and public areas
    /// to [`TpmClient::load`].
    pub fn create(
        &self,
        parent: u32,
        sensitive: &TpmsSensitiveCreate,
        template: &TpmtPublic,
        outside_info: &[u8],
        creation_pcr: &TpmlPcrSelection,
        auth: Auth,
    ) -> Result<CreateResponse> {
        template.validate()?;
        check_size("outside info", outside_info.len(), 64)?;

        let mut cmd = TpmCommand::new(TpmCc::Create);
        cmd.add_handle(parent);
        cmd.add_sized(sensitive);
        cmd.add(&Tpm2bPublic::from_template(template));
        cmd.add_tpm2b(outside_info);
        cmd.add(creation_pcr);

        let body = self.lock().execute(&cmd, &[(parent, auth)])?;
        let response = expect_body!(body, TpmCc::Create, ResponseBody::Create(r) => *r);
        debug!("created {:?} object under 0x{:08x}", template.type_alg, parent);
        Ok(response)
    }

    /// Load a created or imported object under `parent` and track its
    /// handle. `object_auth` authorizes later uses of the loaded object.
    pub fn load(
        &self,
        parent: u32,
        private: &[u8],
        public: &TpmtPublic,
        object_auth: AuthValue,
        auth: Auth,
    ) -> Result<(u32, Vec<u8>)> {
        public.validate()?;
        check_size("private area", private.len(), PRIVATE_MAX_BUFFER)?;
        let mut cmd = TpmCommand::new(TpmCc::Load);
        cmd.add_handle(parent);
        cmd.add_tpm2b(private);
        cmd.add(&Tpm2bPublic::from_template(public));

        let mut state = self.lock();
        let (handle, name) = expect_body!(state.execute(&cmd, &[(parent, auth)])?, TpmCc::Load,
            ResponseBody::Load { handle, name } => (handle, name));
        state
            .registry
            .track(handle, HandleKind::Transient, object_auth, name.clone());
        debug!("loaded object with handle 0x{:08x}", handle);
        Ok((handle, name))
    }

    /// Re-wrap a duplicated object for `parent`, returning the private area
    /// to pass to [`TpmClient::load`].
    #[allow(clippy::too_many_arguments)]
    pub fn import(
        &self,
        parent: u32,
        encryption_key: &[u8],
        object_public: &TpmtPublic,
        duplicate: &[u8],
        in_sym_seed: &[u8],
        symmetric_alg: &TpmtSymDefObject,
        auth: Auth,
    ) -> Result<Vec<u8>> {
        object_public.validate()?;
        check_size("encryption key", encryption_key.len(), 64)?;
        check_size("duplicate", duplicate.len(), PRIVATE_MAX_BUFFER)?;
        check_size("symmetric seed", in_sym_seed.len(), RSA_MAX_BUFFER)?;

        let mut cmd = TpmCommand::new(TpmCc::Import);
        cmd.add_handle(parent);
        cmd.add_tpm2b(encryption_key);
        cmd.add(&Tpm2bPublic::from_template(object_public));
        cmd.add_tpm2b(duplicate);
        cmd.add_tpm2b(in_sym_seed);
        cmd.add(symmetric_alg);

        let body = self.lock().execute(&cmd, &[(parent, auth)])?;
        Ok(expect_body!(body, TpmCc::Import, ResponseBody::Import(private) => private))
    }

    pub fn read_public(&self, handle: u32) -> Result<ReadPublicResponse> {
        self.lock().read_public(handle)
    }

    /// Load a public key into the TPM and track the resulting handle.
    pub fn load_external(&self, public: &TpmtPublic, hierarchy: u32) -> Result<(u32, Vec<u8>)> {
        public.validate()?;
        let mut cmd = TpmCommand::new(TpmCc::LoadExternal);
        // inPrivate (public part only)
        cmd.add_tpm2b_empty();
        cmd.add(&Tpm2bPublic::from_template(public));
        cmd.add_u32(hierarchy);

        let mut state = self.lock();
        let (handle, name) = expect_body!(state.execute(&cmd, &[])?, TpmCc::LoadExternal,
            ResponseBody::LoadExternal { handle, name } => (handle, name));
        state
            .registry
            .track(handle, HandleKind::Transient, AuthValue::empty(), name.clone());
        debug!("loaded external key with handle 0x{:08x}", handle);
        Ok((handle, name))
    }

    /// Make a transient object persistent at `persistent_handle`, or evict
    /// a persistent object when both handles are the same.
    pub fn evict_control(
        &self,
        hierarchy: u32,
        object_handle: u32,
        persistent_handle: u32,
        auth: Auth,
    ) -> Result<()> {
        if TpmHt::of(persistent_handle) != Some(TpmHt::Persistent) {
            return Err(Error::InvalidParameter(format!(
                "0x{:08x} is not a persistent handle",
                persistent_handle
            )));
        }
        let mut cmd = TpmCommand::new(TpmCc::EvictControl);
        cmd.add_handle(hierarchy);
        cmd.add_handle(object_handle);
        cmd.add_u32(persistent_handle);
        self.lock().execute(&cmd, &[(hierarchy, auth)])?;
        debug!("made key persistent at 0x{:08x}", persistent_handle);
        Ok(())
    }

    /// Flush a transient object or session and stop tracking it
    pub fn flush_context(&self, handle: u32) -> Result<()> {
        let mut state = self.lock();
        state.registry.check(handle)?;
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_u32(handle);
        state.execute(&cmd, &[])?;
        state.sessions.remove(handle);
        state.registry.forget(handle);
        Ok(())
    }

    // ==================== Asymmetric ====================

    pub fn rsa_encrypt(
        &self,
        key: u32,
        message: &[u8],
        scheme: &TpmtRsaDecrypt,
        label: &[u8],
    ) -> Result<Vec<u8>> {
        check_size("message", message.len(), RSA_MAX_BUFFER)?;
        check_size("label", label.len(), RSA_MAX_BUFFER)?;
        let mut cmd = TpmCommand::new(TpmCc::RsaEncrypt);
        cmd.add_handle(key);
        cmd.add_tpm2b(message);
        cmd.add(scheme);
        cmd.add_tpm2b(label);
        let body = self.lock().execute(&cmd, &[])?;
        Ok(expect_body!(body, TpmCc::RsaEncrypt, ResponseBody::RsaEncrypt(out) => out))
    }

    pub fn rsa_decrypt(
        &self,
        key: u32,
        ciphertext: &[u8],
        scheme: &TpmtRsaDecrypt,
        label: &[u8],
        auth: Auth,
    ) -> Result<Vec<u8>> {
        check_size("ciphertext", ciphertext.len(), RSA_MAX_BUFFER)?;
        check_size("label", label.len(), RSA_MAX_BUFFER)?;
        let mut cmd = TpmCommand::new(TpmCc::RsaDecrypt);
        cmd.add_handle(key);
        cmd.add_tpm2b(ciphertext);
        cmd.add(scheme);
        cmd.add_tpm2b(label);
        let body = self.lock().execute(&cmd, &[(key, auth)])?;
        Ok(expect_body!(body, TpmCc::RsaDecrypt, ResponseBody::RsaDecrypt(out) => out))
    }

    /// Sign a digest. Unrestricted keys accept a null hashcheck ticket.
    pub fn sign(
        &self,
        key: u32,
        digest: &[u8],
        scheme: &TpmtSigScheme,
        validation: &TpmtTkHashcheck,
        auth: Auth,
    ) -> Result<TpmtSignature> {
        check_size("digest", digest.len(), 64)?;
        let mut cmd = TpmCommand::new(TpmCc::Sign);
        cmd.add_handle(key);
        cmd.add_tpm2b(digest);
        cmd.add(scheme);
        cmd.add(validation);
        let body = self.lock().execute(&cmd, &[(key, auth)])?;
        Ok(expect_body!(body, TpmCc::Sign, ResponseBody::Sign(sig) => sig))
    }

    pub fn verify_signature(
        &self,
        key: u32,
        digest: &[u8],
        signature: &TpmtSignature,
    ) -> Result<TpmtTkVerified> {
        check_size("digest", digest.len(), 64)?;
        let mut cmd = TpmCommand::new(TpmCc::VerifySignature);
        cmd.add_handle(key);
        cmd.add_tpm2b(digest);
        cmd.add(signature);
        let body = self.lock().execute(&cmd, &[])?;
        Ok(expect_body!(body, TpmCc::VerifySignature,
            ResponseBody::VerifySignature(ticket) => ticket))
    }

    /// Hash `data` in the TPM, returning the digest and its hashcheck ticket
    pub fn hash(
        &self,
        data: &[u8],
        hash_alg: TpmAlgId,
        hierarchy: u32,
    ) -> Result<(Vec<u8>, TpmtTkHashcheck)> {
        check_size("hash input", data.len(), HASH_MAX_INPUT)?;
        if !hash_alg.is_hash() {
            return Err(Error::InvalidParameter(format!(
                "{:?} is not a hash algorithm",
                hash_alg
            )));
        }
        let mut cmd = TpmCommand::new(TpmCc::Hash);
        cmd.add_tpm2b(data);
        cmd.add_u16(hash_alg.to_u16());
        cmd.add_u32(hierarchy);
        let body = self.lock().execute(&cmd, &[])?;
        Ok(expect_body!(body, TpmCc::Hash,
            ResponseBody::Hash { digest, validation } => (digest, validation)))
    }

    // ==================== Symmetric ====================

    /// Encrypt or decrypt `data` with a symmetric cipher key.
    ///
    /// Uses TPM2_EncryptDecrypt2 and falls back to TPM2_EncryptDecrypt on
    /// TPMs that do not implement it; the choice sticks for the client's
    /// lifetime. Returns the output and the chaining value for the next call.
    pub fn encrypt_decrypt(
        &self,
        key: u32,
        data: &[u8],
        decrypt: bool,
        mode: TpmAlgId,
        iv: &[u8],
        auth: Auth,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        check_size("cipher input", data.len(), DIGEST_MAX_BUFFER)?;
        check_size("IV", iv.len(), SYM_BLOCK_MAX)?;
        if !matches!(
            mode,
            TpmAlgId::Null
                | TpmAlgId::Ctr
                | TpmAlgId::Ofb
                | TpmAlgId::Cbc
                | TpmAlgId::Cfb
                | TpmAlgId::Ecb
        ) {
            return Err(Error::InvalidParameter(format!(
                "{:?} is not a block cipher mode",
                mode
            )));
        }

        let mut state = self.lock();
        if !state.legacy_encrypt_decrypt {
            let mut cmd = TpmCommand::new(TpmCc::EncryptDecrypt2);
            cmd.add_handle(key);
            cmd.add_tpm2b(data);
            cmd.add_u8(decrypt as u8);
            cmd.add_u16(mode.to_u16());
            cmd.add_tpm2b(iv);
            match state.execute(&cmd, &[(key, auth.clone())]) {
                Err(Error::Tpm { code, .. }) if code.base() == TpmRc::COMMAND_CODE => {
                    info!("EncryptDecrypt2 not supported, using EncryptDecrypt");
                    state.legacy_encrypt_decrypt = true;
                }
                other => {
                    return Ok(expect_body!(other?, TpmCc::EncryptDecrypt2,
                        ResponseBody::EncryptDecrypt { out_data, iv_out } => (out_data, iv_out)))
                }
            }
        }

        let mut cmd = TpmCommand::new(TpmCc::EncryptDecrypt);
        cmd.add_handle(key);
        cmd.add_u8(decrypt as u8);
        cmd.add_u16(mode.to_u16());
        cmd.add_tpm2b(iv);
        cmd.add_tpm2b(data);
        let body = state.execute(&cmd, &[(key, auth)])?;
        Ok(expect_body!(body, TpmCc::EncryptDecrypt,
            ResponseBody::EncryptDecrypt { out_data, iv_out } => (out_data, iv_out)))
    }

    // ==================== NV Operations ====================

    /// Define an NV index and track it for release.
    pub fn nv_define_space(
        &self,
        hierarchy: u32,
        index_auth: AuthValue,
        public: &TpmsNvPublic,
        auth: Auth,
    ) -> Result<()> {
        public.validate()?;
        let mut cmd = TpmCommand::new(TpmCc::NvDefineSpace);
        cmd.add_handle(hierarchy);
        cmd.add(&index_auth);
        cmd.add(&Tpm2bNvPublic {
            nv_public: public.clone(),
        });

        let mut state = self.lock();
        state.execute(&cmd, &[(hierarchy, auth)])?;
        let name = compute_name(&*state.crypto, public.name_alg, &public.to_bytes())?;
        state
            .registry
            .track_nv(public.clone(), hierarchy, index_auth, name);
        debug!(
            "defined NV index 0x{:08x} with size {}",
            public.nv_index, public.data_size
        );
        Ok(())
    }

    pub fn nv_undefine_space(&self, hierarchy: u32, index: u32, auth: Auth) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::NvUndefineSpace);
        cmd.add_handle(hierarchy);
        cmd.add_handle(index);
        let mut state = self.lock();
        state.execute(&cmd, &[(hierarchy, auth)])?;
        state.registry.forget(index);
        debug!("undefined NV index 0x{:08x}", index);
        Ok(())
    }

    /// Public area and name of an NV index
    pub fn nv_read_public(&self, index: u32) -> Result<(TpmsNvPublic, Vec<u8>)> {
        self.lock().nv_read_public(index)
    }

    /// Write `data` at `offset`, split into chunks the TPM accepts.
    pub fn nv_write(&self, index: u32, data: &[u8], offset: u16, auth: Auth) -> Result<()> {
        let mut state = self.lock();
        let public = state.nv_public_for(index)?;
        if public.attributes.is_counter() {
            return Err(Error::InvalidParameter(format!(
                "NV index 0x{:08x} is a counter; use nv_increment",
                index
            )));
        }
        check_nv_range(&public, offset, data.len())?;
        let auth_handle = nv_auth_handle(&public, true);

        for (i, chunk) in data.chunks(NV_MAX_CHUNK).enumerate() {
            let mut cmd = TpmCommand::new(TpmCc::NvWrite);
            cmd.add_handle(auth_handle);
            cmd.add_handle(index);
            cmd.add_tpm2b(chunk);
            cmd.add_u16(offset + (i * NV_MAX_CHUNK) as u16);
            state.execute(&cmd, &[(auth_handle, auth.clone())])?;
        }

        debug!("wrote {} bytes to NV index 0x{:08x}", data.len(), index);
        Ok(())
    }

    /// Read `size` bytes at `offset`, split into chunks the TPM accepts.
    pub fn nv_read(&self, index: u32, size: u16, offset: u16, auth: Auth) -> Result<Vec<u8>> {
        let mut state = self.lock();
        let public = state.nv_public_for(index)?;
        check_nv_range(&public, offset, size as usize)?;
        let auth_handle = nv_auth_handle(&public, false);

        let mut result = Vec::with_capacity(size as usize);
        while result.len() < size as usize {
            let chunk = (size as usize - result.len()).min(NV_MAX_CHUNK) as u16;
            let mut cmd = TpmCommand::new(TpmCc::NvRead);
            cmd.add_handle(auth_handle);
            cmd.add_handle(index);
            cmd.add_u16(chunk);
            cmd.add_u16(offset + result.len() as u16);
            let data = expect_body!(state.execute(&cmd, &[(auth_handle, auth.clone())])?,
                TpmCc::NvRead, ResponseBody::NvRead(data) => data);
            if data.len() != chunk as usize {
                return Err(Error::malformed(format!(
                    "NV_Read returned {} bytes, asked for {}",
                    data.len(),
                    chunk
                )));
            }
            result.extend_from_slice(&data);
        }
        Ok(result)
    }

    pub fn nv_increment(&self, index: u32, auth: Auth) -> Result<()> {
        let mut state = self.lock();
        let public = state.nv_public_for(index)?;
        if !public.attributes.is_counter() {
            return Err(Error::InvalidParameter(format!(
                "NV index 0x{:08x} is not a counter",
                index
            )));
        }
        let auth_handle = nv_auth_handle(&public, true);
        let mut cmd = TpmCommand::new(TpmCc::NvIncrement);
        cmd.add_handle(auth_handle);
        cmd.add_handle(index);
        state.execute(&cmd, &[(auth_handle, auth)])?;
        Ok(())
    }

    /// Current value of an NV counter
    pub fn nv_read_counter(&self, index: u32, auth: Auth) -> Result<u64> {
        let bytes = self.nv_read(index, 8, 0, auth)?;
        let bytes: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Error::malformed("counter is not 8 bytes"))?;
        Ok(u64::from_be_bytes(bytes))
    }

    // ==================== PCR Operations ====================

    /// Read PCR values for the given selection
    pub fn pcr_read(&self, pcr_selection: &TpmlPcrSelection) -> Result<Vec<(u32, Vec<u8>)>> {
        self.lock().pcr_read(pcr_selection)
    }

    /// Read a single PCR value
    pub fn pcr_read_single(&self, pcr_idx: u32, hash_alg: TpmAlgId) -> Result<Vec<u8>> {
        let selection = TpmlPcrSelection::single(hash_alg, &[pcr_idx]);
        self.pcr_read(&selection)?
            .into_iter()
            .find(|(idx, _)| *idx == pcr_idx)
            .map(|(_, v)| v)
            .ok_or_else(|| Error::malformed(format!("PCR {} not found in response", pcr_idx)))
    }

    /// Extend a PCR with a hash value
    pub fn pcr_extend(&self, pcr: u32, hash: &[u8], hash_alg: TpmAlgId, auth: Auth) -> Result<()> {
        if hash.len() != hash_alg.digest_size() {
            return Err(Error::InvalidParameter(format!(
                "{:?} digest must be {} bytes, got {}",
                hash_alg,
                hash_alg.digest_size(),
                hash.len()
            )));
        }
        let digest_values = TpmlDigestValues::single(TpmtHa {
            hash_alg,
            digest: hash.to_vec(),
        });
        let mut cmd = TpmCommand::new(TpmCc::PcrExtend);
        cmd.add_handle(pcr);
        cmd.add(&digest_values);
        self.lock().execute(&cmd, &[(pcr, auth)])?;
        debug!("extended PCR {}", pcr);
        Ok(())
    }

    /// Hash `event_data` with every active bank and extend `pcr` with the
    /// results, which are returned one per bank.
    pub fn pcr_event(&self, pcr: u32, event_data: &[u8], auth: Auth) -> Result<Vec<TpmtHa>> {
        check_size("event data", event_data.len(), DIGEST_MAX_BUFFER)?;
        let mut cmd = TpmCommand::new(TpmCc::PcrEvent);
        cmd.add_handle(pcr);
        cmd.add_tpm2b(event_data);
        let body = self.lock().execute(&cmd, &[(pcr, auth)])?;
        let digests = expect_body!(body, TpmCc::PcrEvent, ResponseBody::PcrEvent(d) => d);
        debug!("recorded event in PCR {}", pcr);
        Ok(digests.digests)
    }

    /// Digest over the current values of the selected PCRs
    pub fn pcr_digest(&self, selection: &TpmlPcrSelection, hash_alg: TpmAlgId) -> Result<Vec<u8>> {
        let mut state = self.lock();
        let values = state.pcr_read(selection)?;
        let parts: Vec<&[u8]> = values.iter().map(|(_, v)| v.as_slice()).collect();
        state.crypto.digest(hash_alg, &parts)
    }

    // ==================== Sessions ====================

    /// Start an unbound, unsalted session and add it to the live table.
    pub fn start_auth_session(&self, session_type: TpmSe, hash_alg: TpmAlgId) -> Result<u32> {
        if !hash_alg.is_hash() {
            return Err(Error::InvalidParameter(format!(
                "{:?} is not a hash algorithm",
                hash_alg
            )));
        }
        let nonce_caller = random_bytes(hash_alg.digest_size())?;
        let cmd = AuthSession::start_command(session_type, hash_alg, &nonce_caller);

        let mut state = self.lock();
        let (handle, nonce_tpm) = expect_body!(state.execute(&cmd, &[])?,
            TpmCc::StartAuthSession,
            ResponseBody::StartAuthSession { handle, nonce_tpm } => (handle, nonce_tpm));
        if nonce_tpm.len() != hash_alg.digest_size() {
            // Not tracked yet, so nothing else would ever flush it
            state.flush_quietly(handle);
            return Err(Error::malformed(format!(
                "session nonce is {} bytes, expected {}",
                nonce_tpm.len(),
                hash_alg.digest_size()
            )));
        }
        state.sessions.insert(AuthSession::new(
            handle,
            session_type,
            hash_alg,
            nonce_caller,
            nonce_tpm,
        ));
        state.registry.track(
            handle,
            HandleKind::Session,
            AuthValue::empty(),
            handle.to_be_bytes().to_vec(),
        );
        debug!("started {:?} session 0x{:08x}", session_type, handle);
        Ok(handle)
    }

    /// HMAC session using the configured session hash
    pub fn start_hmac_session(&self) -> Result<u32> {
        let hash_alg = self.lock().config.session_hash;
        self.start_auth_session(TpmSe::Hmac, hash_alg)
    }

    /// Whether the session survives its next use
    pub fn set_session_continue(&self, handle: u32, keep: bool) -> Result<()> {
        self.lock().sessions.set_continue(handle, keep)
    }

    /// Whether `handle` is in the live session table
    pub fn session_active(&self, handle: u32) -> bool {
        self.lock().sessions.contains(handle)
    }

    pub fn session(&self, handle: u32) -> Option<AuthSession> {
        self.lock().sessions.get(handle).cloned()
    }

    pub fn policy_pcr(
        &self,
        session: u32,
        pcr_digest: &[u8],
        selection: &TpmlPcrSelection,
    ) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::PolicyPcr);
        cmd.add_handle(session);
        cmd.add_tpm2b(pcr_digest);
        cmd.add(selection);
        self.lock().execute(&cmd, &[])?;
        Ok(())
    }

    pub fn policy_get_digest(&self, session: u32) -> Result<Vec<u8>> {
        let mut cmd = TpmCommand::new(TpmCc::PolicyGetDigest);
        cmd.add_handle(session);
        let body = self.lock().execute(&cmd, &[])?;
        Ok(expect_body!(body, TpmCc::PolicyGetDigest,
            ResponseBody::PolicyGetDigest(digest) => digest))
    }

    /// Policy digest binding an object to the current values of `selection`,
    /// computed with a trial session.
    pub fn pcr_policy_digest(
        &self,
        selection: &TpmlPcrSelection,
        hash_alg: TpmAlgId,
    ) -> Result<Vec<u8>> {
        let trial = self.start_auth_session(TpmSe::Trial, hash_alg)?;
        let digest = self
            .pcr_digest(selection, hash_alg)
            .and_then(|pcr_digest| self.policy_pcr(trial, &pcr_digest, selection))
            .and_then(|()| self.policy_get_digest(trial));
        let flushed = self.flush_context(trial);
        let digest = digest?;
        flushed?;
        Ok(digest)
    }

    // ==================== Handles ====================

    /// Register the auth value used for a hierarchy handle
    pub fn set_hierarchy_auth(&self, hierarchy: u32, auth: AuthValue) {
        self.lock().registry.set_hierarchy_auth(hierarchy, auth);
    }

    /// Take ownership of a handle created outside this client
    pub fn track(&self, handle: u32, kind: HandleKind, auth: AuthValue) {
        self.lock().registry.track(handle, kind, auth, Vec::new());
    }

    pub fn tracked_handles(&self) -> Vec<u32> {
        self.lock().registry.handles()
    }

    /// Release one tracked handle the way its kind requires
    pub fn release(&self, handle: u32) -> Result<()> {
        let mut state = self.lock();
        state.registry.check(handle)?;
        let entry = state
            .registry
            .get(handle)
            .cloned()
            .ok_or_else(|| Error::InvalidParameter(format!("0x{:08x} is not tracked", handle)))?;
        let result = state.release_entry(&entry);
        if result.is_ok() {
            state.registry.forget(handle);
        }
        result
    }

    /// Release every tracked handle, best effort
    pub fn release_all(&self) -> ReleaseReport {
        self.lock().release_all()
    }

    /// Report from the cleanup run after the last unrecoverable error
    pub fn take_cleanup_report(&self) -> Option<ReleaseReport> {
        self.lock().cleanup_report.take()
    }

    /// Release everything and close the transport
    pub fn shutdown(self) -> Result<ReleaseReport> {
        let mut state = self.lock();
        let report = state.release_all();
        state.channel.close()?;
        info!("TPM client shut down: {}", report);
        Ok(report)
    }
}

impl Drop for TpmClient {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if state.registry.is_empty() {
            return;
        }
        let report = state.release_all();
        if !report.is_clean() {
            warn!("releasing handles on drop: {}", report);
        }
    }
}

/// Lazy, restartable walk over one capability.
///
/// Each page starts one past the last property returned, so a walk can be
/// resumed from [`CapabilityIter::cursor`] with
/// [`TpmClient::capabilities`].
pub struct CapabilityIter<'a> {
    client: &'a TpmClient,
    capability: TpmCap,
    cursor: Option<u32>,
    step: u32,
    buffered: VecDeque<CapabilityEntry>,
}

impl CapabilityIter<'_> {
    /// Property the next page request would start from
    pub fn cursor(&self) -> Option<u32> {
        self.cursor
    }
}

impl Iterator for CapabilityIter<'_> {
    type Item = Result<CapabilityEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffered.pop_front() {
                return Some(Ok(entry));
            }
            let start = self.cursor?;
            let page = match self.client.get_capability(self.capability, start, self.step) {
                Ok(page) => page,
                Err(e) => {
                    self.cursor = None;
                    return Some(Err(e));
                }
            };
            let entries = page.data.into_entries();
            self.cursor = match entries.last() {
                Some(last) if page.more => last.property().checked_add(1),
                _ => None,
            };
            if entries.is_empty() {
                return None;
            }
            self.buffered.extend(entries);
        }
    }
}

/// Handle that authorizes reads or writes of an NV index
fn nv_auth_handle(public: &TpmsNvPublic, write: bool) -> u32 {
    let (auth, owner, platform) = if write {
        (TpmaNv::AUTH_WRITE | TpmaNv::POLICY_WRITE, TpmaNv::OWNER_WRITE, TpmaNv::PP_WRITE)
    } else {
        (TpmaNv::AUTH_READ | TpmaNv::POLICY_READ, TpmaNv::OWNER_READ, TpmaNv::PP_READ)
    };
    let attrs = public.attributes.0;
    if attrs & auth != 0 {
        public.nv_index
    } else if attrs & owner != 0 {
        tpm_rh::OWNER
    } else if attrs & platform != 0 {
        tpm_rh::PLATFORM
    } else {
        public.nv_index
    }
}

fn check_nv_range(public: &TpmsNvPublic, offset: u16, len: usize) -> Result<()> {
    let end = offset as usize + len;
    if end > public.data_size as usize {
        return Err(Error::InvalidParameter(format!(
            "{} bytes at offset {} exceed NV index 0x{:08x} of {} bytes",
            len, offset, public.nv_index, public.data_size
        )));
    }
    Ok(())
}

impl ClientState {
    /// Send one command on behalf of a verb.
    ///
    /// `auths` lists, in handle order, each handle that needs authorization
    /// and how to authorize it.
    fn execute(&mut self, cmd: &TpmCommand, auths: &[(u32, Auth)]) -> Result<ResponseBody> {
        for &handle in cmd.handles() {
            self.registry.check(handle)?;
        }
        let sessions: Vec<u32> = auths
            .iter()
            .filter_map(|(_, auth)| match auth {
                Auth::Session(handle) => Some(*handle),
                _ => None,
            })
            .collect();
        for &handle in &sessions {
            self.registry.check(handle)?;
            if !self.sessions.contains(handle) {
                return Err(Error::UseAfterRelease(handle));
            }
        }

        if self.needs_reconnect {
            self.reconnect()?;
        }

        let result = self.transact(cmd, auths);
        let unrecoverable = matches!(&result, Err(e) if e.is_unrecoverable());

        if let Err(Error::SessionDesynchronized { handle, reason }) = &result {
            warn!("dropping session 0x{:08x}: {}", handle, reason);
            self.discard_session(*handle);
        }
        for handle in sessions {
            let one_shot = self.sessions.get(handle).map(|s| !s.is_continue());
            if one_shot == Some(true) {
                // The TPM only flushes a one-shot session when the command succeeds
                if unrecoverable {
                    // Nothing may be sent on this channel; the release pass
                    // after reconnecting flushes the still-tracked handle
                    self.sessions.remove(handle);
                } else if result.is_err() {
                    self.discard_session(handle);
                } else {
                    self.sessions.remove(handle);
                    self.registry.forget(handle);
                }
            }
        }

        match result {
            Err(e) if e.is_unrecoverable() => {
                warn!("{:?} failed: {}; releasing tracked handles", cmd.code(), e);
                self.needs_reconnect = true;
                if let Err(err) = self.reconnect() {
                    warn!("failed to reconnect: {}", err);
                }
                let report = self.release_all();
                match &mut self.cleanup_report {
                    Some(pending) => pending.merge(report),
                    None => self.cleanup_report = Some(report),
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Retry loop for one command
    fn transact(&mut self, cmd: &TpmCommand, auths: &[(u32, Auth)]) -> Result<ResponseBody> {
        let command = cmd.code();
        let names = if self.uses_hmac(auths) {
            self.command_names(cmd)?
        } else {
            Vec::new()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let auth_area = self.auth_area(cmd, auths, &names)?;
            let bytes = cmd.finalize(&auth_area);
            debug!("{:?}: sending {} bytes", command, bytes.len());
            let raw = self.channel.transmit(&bytes)?;
            let response = TpmResponse::parse(&raw)?;

            if !response.is_success() {
                let code = response.response_code;
                if !code.is_retry() {
                    debug!("{:?} failed: {}", command, code);
                    return Err(Error::Tpm { command, code });
                }
                if attempt >= self.config.retry.max_attempts {
                    return Err(Error::RetryExhausted {
                        command,
                        code,
                        attempts: attempt,
                    });
                }
                let delay = self.config.retry.backoff(attempt);
                warn!("{:?} returned {}, retrying in {:?}", command, code, delay);
                thread::sleep(delay);
                continue;
            }

            let parts = response.split(command)?;
            self.verify_auth_area(command, auths, &parts)?;
            return ResponseBody::decode(command, &parts);
        }
    }

    fn uses_hmac(&self, auths: &[(u32, Auth)]) -> bool {
        auths.iter().any(|(_, auth)| match auth {
            Auth::Session(handle) => self
                .sessions
                .get(*handle)
                .is_some_and(|s| s.session_type == TpmSe::Hmac),
            _ => false,
        })
    }

    fn auth_area(
        &mut self,
        cmd: &TpmCommand,
        auths: &[(u32, Auth)],
        names: &[Vec<u8>],
    ) -> Result<Vec<TpmsAuthCommand>> {
        let input = CommandDigestInput {
            command: cmd.code(),
            names,
            parameters: cmd.parameters(),
        };
        let mut area = Vec::with_capacity(auths.len());
        for (entity, auth) in auths {
            area.push(match auth {
                Auth::Password => TpmsAuthCommand::password(&self.registry.auth_for(*entity)),
                Auth::Value(value) => TpmsAuthCommand::password(value),
                Auth::Session(session) => {
                    let value = self.registry.auth_for(*entity);
                    self.sessions
                        .authorize(&*self.crypto, *session, &input, &value)?
                }
            });
        }
        Ok(area)
    }

    fn verify_auth_area(
        &mut self,
        command: TpmCc,
        auths: &[(u32, Auth)],
        parts: &ResponseParts,
    ) -> Result<()> {
        if parts.auths.len() != auths.len() {
            return Err(Error::malformed(format!(
                "{:?} response has {} auth entries, expected {}",
                command,
                parts.auths.len(),
                auths.len()
            )));
        }
        for ((entity, auth), response) in auths.iter().zip(&parts.auths) {
            if let Auth::Session(session) = auth {
                let value = self.registry.auth_for(*entity);
                self.sessions.verify_response(
                    &*self.crypto,
                    *session,
                    command,
                    &parts.parameters,
                    &value,
                    response,
                )?;
            }
        }
        Ok(())
    }

    /// Names of every handle in the handle area, for cpHash.
    ///
    /// A handle that appears twice, such as an NV index authorizing its own
    /// write, is looked up once.
    fn command_names(&mut self, cmd: &TpmCommand) -> Result<Vec<Vec<u8>>> {
        let mut named: Vec<(u32, Vec<u8>)> = Vec::with_capacity(cmd.handles().len());
        for &handle in cmd.handles() {
            let name = match named.iter().find(|(seen, _)| *seen == handle) {
                Some((_, name)) => name.clone(),
                None => self.entity_name(handle)?,
            };
            named.push((handle, name));
        }
        Ok(named.into_iter().map(|(_, name)| name).collect())
    }

    fn entity_name(&mut self, handle: u32) -> Result<Vec<u8>> {
        if let Some(name) = handle_name(handle) {
            return Ok(name);
        }
        match TpmHt::of(handle) {
            // NV names change once the index is written, so ask every time
            Some(TpmHt::NvIndex) => Ok(self.nv_read_public(handle)?.1),
            _ => {
                if let Some(name) = self.registry.name_of(handle) {
                    return Ok(name.to_vec());
                }
                Ok(self.read_public(handle)?.name)
            }
        }
    }

    fn read_public(&mut self, handle: u32) -> Result<ReadPublicResponse> {
        let mut cmd = TpmCommand::new(TpmCc::ReadPublic);
        cmd.add_handle(handle);
        let body = self.execute(&cmd, &[])?;
        Ok(expect_body!(body, TpmCc::ReadPublic, ResponseBody::ReadPublic(r) => *r))
    }

    fn nv_read_public(&mut self, index: u32) -> Result<(TpmsNvPublic, Vec<u8>)> {
        let mut cmd = TpmCommand::new(TpmCc::NvReadPublic);
        cmd.add_handle(index);
        let body = self.execute(&cmd, &[])?;
        Ok(expect_body!(body, TpmCc::NvReadPublic,
            ResponseBody::NvReadPublic { nv_public, name } => (nv_public, name)))
    }

    /// Public area of an NV index, from the registry when it was defined here
    fn nv_public_for(&mut self, index: u32) -> Result<TpmsNvPublic> {
        self.registry.check(index)?;
        match self.registry.nv_public(index) {
            Some(public) => Ok(public.clone()),
            None => Ok(self.nv_read_public(index)?.0),
        }
    }

    fn pcr_read(&mut self, pcr_selection: &TpmlPcrSelection) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut cmd = TpmCommand::new(TpmCc::PcrRead);
        cmd.add(pcr_selection);
        let body = self.execute(&cmd, &[])?;
        let response = expect_body!(body, TpmCc::PcrRead, ResponseBody::PcrRead(r) => r);

        // Map digests to PCR indices
        let indices = response
            .selection
            .pcr_selections
            .iter()
            .flat_map(|sel| sel.selected());
        Ok(indices.zip(response.values).collect())
    }

    fn reconnect(&mut self) -> Result<()> {
        // The old channel may already be gone
        let _ = self.channel.close();
        self.channel.connect()?;
        self.needs_reconnect = false;
        info!("reconnected to TPM");
        Ok(())
    }

    /// Drop a session from both tables and flush it, ignoring failures
    fn discard_session(&mut self, handle: u32) {
        self.sessions.remove(handle);
        self.registry.forget(handle);
        self.flush_quietly(handle);
    }

    fn flush_quietly(&mut self, handle: u32) {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_u32(handle);
        if let Err(e) = self.transact(&cmd, &[]) {
            debug!("flushing 0x{:08x} failed: {}", handle, e);
        }
    }

    /// Issue the command that releases one tracked handle
    fn release_entry(&mut self, entry: &TrackedHandle) -> Result<()> {
        let (cmd, auths) = match entry.kind {
            HandleKind::Transient | HandleKind::Session => {
                self.sessions.remove(entry.handle);
                let mut cmd = TpmCommand::new(TpmCc::FlushContext);
                cmd.add_u32(entry.handle);
                (cmd, Vec::new())
            }
            HandleKind::NvIndex { hierarchy } => {
                let mut cmd = TpmCommand::new(TpmCc::NvUndefineSpace);
                cmd.add_handle(hierarchy);
                cmd.add_handle(entry.handle);
                (cmd, vec![(hierarchy, Auth::Value(entry.release_auth.clone()))])
            }
        };
        if self.needs_reconnect {
            self.reconnect()?;
        }
        self.transact(&cmd, &auths).map(drop)
    }

    fn release_all(&mut self) -> ReleaseReport {
        let mut registry = std::mem::take(&mut self.registry);
        let report = registry.release_all(|entry| self.release_entry(entry));
        self.registry = registry;
        for handle in self.sessions.handles() {
            self.sessions.remove(handle);
        }
        if !report.is_clean() {
            warn!("release pass incomplete: {}", report);
        } else if !report.released.is_empty() {
            debug!("released {} handles", report.released.len());
        }
        report
    }
}
