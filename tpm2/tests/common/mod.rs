// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! In-process TPM used by the integration tests.
//!
//! Implements just enough of the command set to drive the client: password
//! and HMAC authorization are checked for real, nonces rotate, and faults
//! can be queued to make the next command misbehave.
//!
//! Key operations are deterministic fakes. Ciphertexts, signatures and
//! private blobs are keystreams derived from object names, public areas and
//! parent names, so round trips hold and mismatches fail.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use tpm2_client::*;

/// Command codes reported by TPM_CAP_COMMANDS, ascending
pub const COMMAND_CODES: [u32; 32] = [
    0x11F, 0x120, 0x121, 0x122, 0x124, 0x125, 0x126, 0x127, 0x128, 0x129, 0x12A, 0x12B, 0x12C,
    0x12D, 0x12E, 0x130, 0x131, 0x132, 0x133, 0x134, 0x135, 0x136, 0x137, 0x138, 0x139, 0x13A,
    0x13B, 0x13C, 0x13D, 0x13E, 0x13F, 0x140,
];

/// Most bytes returned by one GetRandom
pub const RANDOM_LIMIT: u16 = 32;

/// PCRs per bank
pub const PCR_COUNT: usize = 24;

/// Size of a fake RSA-2048 ciphertext or signature
const RSA_BLOCK: usize = 256;

type MockResult<T> = std::result::Result<T, TpmRc>;

fn parse<T>(r: tpm2_client::Result<T>) -> MockResult<T> {
    r.map_err(|_| TpmRc::INSUFFICIENT)
}

#[derive(Debug, Clone)]
pub enum Fault {
    /// Answer the next command with this code without executing it
    Respond(TpmRc),
    /// Drop the connection on the next send
    Disconnect,
    /// Do not rotate the TPM nonce in the next session response
    StaleNonce,
    /// Swallow the next command with this code; its response never arrives
    Timeout(TpmCc),
    /// Cut the next StartAuthSession nonce down to this many bytes
    ShortNonce(usize),
}

/// Traffic seen by the transport, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wire {
    Command(u32),
    Close,
    Connect,
}

struct MockSession {
    session_type: u8,
    hash_alg: TpmAlgId,
    nonce_tpm: Vec<u8>,
    policy_digest: Vec<u8>,
}

#[derive(Clone)]
struct MockObject {
    public: Vec<u8>,
    name: Vec<u8>,
    auth: Vec<u8>,
    /// Stands in for the private key material
    secret: Vec<u8>,
}

struct MockNv {
    public: TpmsNvPublic,
    auth: Vec<u8>,
    data: Vec<u8>,
}

#[derive(Default)]
pub struct MockState {
    /// Raw command codes in arrival order
    pub log: Vec<u32>,
    pub faults: VecDeque<Fault>,
    pub wire: Vec<Wire>,
    /// Commands answered with TPM_RC_COMMAND_CODE
    pub unsupported: Vec<TpmCc>,
    pub connected: bool,
    pub connects: usize,
    pub owner_auth: Vec<u8>,
    objects: HashMap<u32, MockObject>,
    sessions: HashMap<u32, MockSession>,
    nv: HashMap<u32, MockNv>,
    pcrs: HashMap<u16, Vec<Vec<u8>>>,
    pcr_updates: u32,
    next_object: u32,
    next_session: u32,
    nonce_counter: u8,
    created: u32,
}

fn trim(auth: &[u8]) -> &[u8] {
    let end = auth.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &auth[..end]
}

fn digest(alg: TpmAlgId, parts: &[&[u8]]) -> MockResult<Vec<u8>> {
    SoftwareCrypto.digest(alg, parts).map_err(|_| TpmRc::HASH)
}

/// Deterministic byte stream derived from `seed`
fn keystream(seed: &[&[u8]], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter = 0u32;
    while out.len() < len {
        counter += 1;
        let block = counter.to_be_bytes();
        let mut parts = seed.to_vec();
        parts.push(&block);
        out.extend(digest(TpmAlgId::Sha256, &parts).unwrap_or_default());
    }
    out.truncate(len);
    out
}

fn xor(data: &mut [u8], stream: &[u8]) {
    for (b, k) in data.iter_mut().zip(stream) {
        *b ^= k;
    }
}

/// Unwrapped sensitive area: auth value followed by key material
pub fn duplicate_blob(auth: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = CommandBuffer::new();
    out.put_tpm2b(auth);
    out.put_tpm2b(key);
    out.into_vec()
}

/// Private area bound to the parent whose name is `parent`
fn wrap_private(parent: &[u8], sensitive: &[u8]) -> Vec<u8> {
    let mut out = digest(TpmAlgId::Sha256, &[parent, sensitive]).unwrap_or_default();
    out.truncate(8);
    let mut body = sensitive.to_vec();
    let len = body.len();
    xor(&mut body, &keystream(&[parent, b"wrap"], len));
    out.extend(body);
    out
}

fn unwrap_private(parent: &[u8], private: &[u8]) -> MockResult<(Vec<u8>, Vec<u8>)> {
    if private.len() < 8 {
        return Err(TpmRc::SIZE);
    }
    let mut sensitive = private[8..].to_vec();
    let len = sensitive.len();
    xor(&mut sensitive, &keystream(&[parent, b"wrap"], len));
    let check = digest(TpmAlgId::Sha256, &[parent, &sensitive])?;
    if check[..8] != private[..8] {
        return Err(TpmRc::INTEGRITY);
    }
    let mut buf = ResponseBuffer::new(&sensitive);
    let auth = parse(buf.get_tpm2b())?;
    let secret = parse(buf.get_tpm2b())?;
    Ok((auth, secret))
}

/// Stand-in for an RSA signature by the key with this public area
fn fake_signature(public: &[u8], digest: &[u8]) -> Vec<u8> {
    keystream(&[public, digest, b"sign"], RSA_BLOCK)
}

fn key_scheme_hash(template: &TpmtPublic) -> MockResult<TpmAlgId> {
    match &template.parameters {
        TpmtPublicParms::Rsa(parms) => parms.scheme.hash_alg.ok_or(TpmRc::SCHEME),
        _ => Err(TpmRc::KEY),
    }
}

fn error_response(rc: TpmRc) -> Vec<u8> {
    let mut out = CommandBuffer::new();
    out.put_u16(TpmSt::NoSessions.to_u16());
    out.put_u32(10);
    out.put_u32(rc.0);
    out.into_vec()
}

impl MockState {
    pub fn count(&self, cc: TpmCc) -> usize {
        self.log.iter().filter(|&&c| c == cc.to_u32()).count()
    }

    pub fn has_object(&self, handle: u32) -> bool {
        self.objects.contains_key(&handle)
    }

    pub fn has_session(&self, handle: u32) -> bool {
        self.sessions.contains_key(&handle)
    }

    pub fn has_nv(&self, index: u32) -> bool {
        self.nv.contains_key(&index)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pcr_value(&self, alg: TpmAlgId, pcr: usize) -> Vec<u8> {
        self.pcrs
            .get(&alg.to_u16())
            .map(|bank| bank[pcr].clone())
            .unwrap_or_else(|| vec![0; alg.digest_size()])
    }

    fn object(&self, handle: u32) -> MockResult<&MockObject> {
        self.objects.get(&handle).ok_or(TpmRc::HANDLE)
    }

    fn new_object(&mut self, public: Vec<u8>, auth: Vec<u8>, secret: Vec<u8>) -> MockResult<u32> {
        let name_alg = parse(TpmtPublic::from_bytes(&public))?.name_alg;
        let name = parse(compute_name(&SoftwareCrypto, name_alg, &public))?;
        let handle = 0x8000_0000 + self.next_object;
        self.next_object += 1;
        self.objects.insert(
            handle,
            MockObject {
                public,
                name,
                auth,
                secret,
            },
        );
        Ok(handle)
    }

    fn bank(&mut self, alg: TpmAlgId) -> MockResult<&mut Vec<Vec<u8>>> {
        if !matches!(alg, TpmAlgId::Sha1 | TpmAlgId::Sha256) {
            return Err(TpmRc::VALUE);
        }
        Ok(self
            .pcrs
            .entry(alg.to_u16())
            .or_insert_with(|| vec![vec![0; alg.digest_size()]; PCR_COUNT]))
    }

    fn extend(&mut self, pcr: u32, alg: TpmAlgId, value: &[u8]) -> MockResult<()> {
        let index = pcr as usize;
        if index >= PCR_COUNT {
            return Err(TpmRc::VALUE);
        }
        let bank = self.bank(alg)?;
        bank[index] = digest(alg, &[&bank[index], value])?;
        self.pcr_updates += 1;
        Ok(())
    }

    /// Concatenated values of the selected PCRs
    fn selected_values(&mut self, selection: &TpmlPcrSelection) -> MockResult<Vec<Vec<u8>>> {
        let mut values = Vec::new();
        for sel in &selection.pcr_selections {
            let bank = self.bank(sel.hash)?;
            for pcr in sel.selected() {
                values.push(bank.get(pcr as usize).cloned().ok_or(TpmRc::VALUE)?);
            }
        }
        Ok(values)
    }

    fn next_nonce(&mut self, len: usize) -> Vec<u8> {
        self.nonce_counter = self.nonce_counter.wrapping_add(1).max(1);
        vec![self.nonce_counter; len]
    }

    fn auth_value(&self, entity: u32) -> Vec<u8> {
        if entity == tpm_rh::OWNER {
            return self.owner_auth.clone();
        }
        if let Some(nv) = self.nv.get(&entity) {
            return nv.auth.clone();
        }
        if let Some(obj) = self.objects.get(&entity) {
            return obj.auth.clone();
        }
        Vec::new()
    }

    fn name_of(&self, handle: u32) -> Vec<u8> {
        if let Some(nv) = self.nv.get(&handle) {
            return compute_name(&SoftwareCrypto, nv.public.name_alg, &nv.public.to_bytes())
                .unwrap_or_default();
        }
        if let Some(obj) = self.objects.get(&handle) {
            return obj.name.clone();
        }
        handle.to_be_bytes().to_vec()
    }

    fn power_cycle(&mut self) {
        self.objects
            .retain(|&handle, _| TpmHt::of(handle) == Some(TpmHt::Persistent));
        self.sessions.clear();
        self.pcrs.clear();
    }

    fn execute(&mut self, command: &[u8]) -> Vec<u8> {
        match self.dispatch(command) {
            Ok(response) => response,
            Err(rc) => error_response(rc),
        }
    }

    fn dispatch(&mut self, command: &[u8]) -> MockResult<Vec<u8>> {
        let mut buf = ResponseBuffer::new(command);
        let tag = parse(buf.get_u16())?;
        let _size = parse(buf.get_u32())?;
        let raw_cc = parse(buf.get_u32())?;
        self.log.push(raw_cc);

        if matches!(self.faults.front(), Some(Fault::Respond(_))) {
            if let Some(Fault::Respond(rc)) = self.faults.pop_front() {
                return Err(rc);
            }
        }

        let cc = TpmCc::from_u32(raw_cc).ok_or(TpmRc::COMMAND_CODE)?;
        if self.unsupported.contains(&cc) {
            return Err(TpmRc::COMMAND_CODE);
        }
        let mut handles = Vec::new();
        for _ in 0..cc.command_handles() {
            handles.push(parse(buf.get_u32())?);
        }

        let mut auths = Vec::new();
        if tag == TpmSt::Sessions.to_u16() {
            let size = parse(buf.get_u32())? as usize;
            let area = parse(buf.get_bytes(size))?;
            let mut area = ResponseBuffer::new(&area);
            while area.remaining() > 0 {
                auths.push(parse(TpmsAuthCommand::unmarshal(&mut area))?);
            }
        }
        let params = buf.get_remaining();

        let names: Vec<Vec<u8>> = handles.iter().map(|&h| self.name_of(h)).collect();
        let mut keys = Vec::with_capacity(auths.len());
        for (i, auth) in auths.iter().enumerate() {
            let entity = *handles.get(i).ok_or(TpmRc::AUTH_CONTEXT)?;
            let key = self.auth_value(entity);
            self.check_auth(cc, &names, &params, auth, &key, i)?;
            keys.push(key);
        }

        let (out_handles, out_params) = self.run(cc, &handles, &params)?;

        let mut out = CommandBuffer::new();
        let tag = if auths.is_empty() {
            TpmSt::NoSessions
        } else {
            TpmSt::Sessions
        };
        out.put_u16(tag.to_u16());
        out.put_u32(0);
        out.put_u32(0);
        for handle in out_handles {
            out.put_u32(handle);
        }
        if auths.is_empty() {
            out.put_bytes(&out_params);
        } else {
            out.put_u32(out_params.len() as u32);
            out.put_bytes(&out_params);
            for (auth, key) in auths.iter().zip(&keys) {
                self.respond_auth(cc, &out_params, auth, key).marshal(&mut out);
            }
        }
        let len = out.len() as u32;
        out.update_u32(2, len);
        Ok(out.into_vec())
    }

    fn check_auth(
        &self,
        cc: TpmCc,
        names: &[Vec<u8>],
        params: &[u8],
        auth: &TpmsAuthCommand,
        key: &[u8],
        index: usize,
    ) -> MockResult<()> {
        let auth_fail = TpmRc(TpmRc::AUTH_FAIL.0 | ((8 + index as u32 + 1) << 8));
        if auth.session_handle == tpm_rh::PW {
            return if trim(&auth.hmac.buffer) == trim(key) {
                Ok(())
            } else {
                Err(auth_fail)
            };
        }
        let session = self
            .sessions
            .get(&auth.session_handle)
            .ok_or(TpmRc::VALUE)?;
        if session.session_type != TpmSe::Hmac as u8 {
            return Ok(());
        }
        let crypto = SoftwareCrypto;
        let cc_bytes = cc.to_u32().to_be_bytes();
        let mut parts: Vec<&[u8]> = vec![&cc_bytes];
        parts.extend(names.iter().map(Vec::as_slice));
        parts.push(params);
        let cp = crypto.digest(session.hash_alg, &parts).map_err(|_| TpmRc::HASH)?;
        let valid = crypto
            .hmac_verify(
                session.hash_alg,
                trim(key),
                &[
                    &cp,
                    &auth.nonce.buffer,
                    &session.nonce_tpm,
                    &[auth.attributes.0],
                ],
                &auth.hmac.buffer,
            )
            .map_err(|_| TpmRc::HASH)?;
        if valid {
            Ok(())
        } else {
            Err(auth_fail)
        }
    }

    fn respond_auth(
        &mut self,
        cc: TpmCc,
        out_params: &[u8],
        auth: &TpmsAuthCommand,
        key: &[u8],
    ) -> TpmsAuthResponse {
        if auth.session_handle == tpm_rh::PW {
            return TpmsAuthResponse {
                nonce: Tpm2bDigest::empty(),
                attributes: TpmaSa(TpmaSa::CONTINUE_SESSION),
                hmac: Tpm2bDigest::empty(),
            };
        }

        let stale = matches!(self.faults.front(), Some(Fault::StaleNonce));
        if stale {
            self.faults.pop_front();
        }
        let handle = auth.session_handle;
        let Some((session_type, hash_alg, old_nonce)) = self
            .sessions
            .get(&handle)
            .map(|s| (s.session_type, s.hash_alg, s.nonce_tpm.clone()))
        else {
            return TpmsAuthResponse {
                nonce: Tpm2bDigest::empty(),
                attributes: auth.attributes,
                hmac: Tpm2bDigest::empty(),
            };
        };
        let nonce = if stale {
            old_nonce
        } else {
            self.next_nonce(hash_alg.digest_size())
        };

        let hmac = if session_type == TpmSe::Hmac as u8 {
            let crypto = SoftwareCrypto;
            let rp = crypto
                .digest(
                    hash_alg,
                    &[&0u32.to_be_bytes(), &cc.to_u32().to_be_bytes(), out_params],
                )
                .unwrap_or_default();
            crypto
                .hmac(
                    hash_alg,
                    trim(key),
                    &[&rp, &nonce, &auth.nonce.buffer, &[auth.attributes.0]],
                )
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        if auth.attributes.0 & TpmaSa::CONTINUE_SESSION == 0 {
            self.sessions.remove(&handle);
        } else if let Some(session) = self.sessions.get_mut(&handle) {
            session.nonce_tpm = nonce.clone();
        }

        TpmsAuthResponse {
            nonce: Tpm2bDigest::new(nonce),
            attributes: auth.attributes,
            hmac: Tpm2bDigest::new(hmac),
        }
    }

    fn run(&mut self, cc: TpmCc, handles: &[u32], params: &[u8]) -> MockResult<(Vec<u32>, Vec<u8>)> {
        let mut p = ResponseBuffer::new(params);
        let mut out = CommandBuffer::new();
        let mut out_handles = Vec::new();

        match cc {
            TpmCc::Startup | TpmCc::Shutdown | TpmCc::SelfTest => {}
            TpmCc::GetCapability => {
                let cap = parse(p.get_u32())?;
                let property = parse(p.get_u32())?;
                let count = parse(p.get_u32())? as usize;
                let data = match TpmCap::from_u32(cap) {
                    Some(TpmCap::Commands) => {
                        let all: Vec<TpmaCc> = COMMAND_CODES
                            .iter()
                            .filter(|&&c| c >= property)
                            .map(|&c| TpmaCc(c))
                            .collect();
                        let take = count.min(all.len());
                        out.put_u8((all.len() > take) as u8);
                        TpmsCapabilityData::Commands(all[..take].to_vec())
                    }
                    Some(TpmCap::TpmProperties) => {
                        let all: Vec<TpmsTaggedProperty> = [
                            (tpm_pt::TOTAL_COMMANDS, COMMAND_CODES.len() as u32),
                            (tpm_pt::NV_BUFFER_MAX, 1024),
                        ]
                        .into_iter()
                        .filter(|&(tag, _)| tag >= property)
                        .map(|(property, value)| TpmsTaggedProperty { property, value })
                        .collect();
                        let take = count.min(all.len());
                        out.put_u8((all.len() > take) as u8);
                        TpmsCapabilityData::TpmProperties(all[..take].to_vec())
                    }
                    _ => return Err(TpmRc::VALUE),
                };
                data.marshal(&mut out);
            }
            TpmCc::GetRandom => {
                let n = parse(p.get_u16())?.min(RANDOM_LIMIT);
                out.put_tpm2b(&vec![0xA5; n as usize]);
            }
            TpmCc::CreatePrimary => {
                let _sensitive_size = parse(p.get_u16())?;
                let user_auth = parse(p.get_tpm2b())?;
                let _data = parse(p.get_tpm2b())?;
                let public = parse(p.get_tpm2b())?;
                // Primary keys derive from the template alone
                let secret = keystream(&[&public, b"primary"], 16);
                let handle = self.new_object(public.clone(), user_auth, secret)?;
                out.put_tpm2b(&public);
                out.put_tpm2b_empty(); // creationData
                out.put_tpm2b_empty(); // creationHash
                out.put_u16(TpmSt::Creation.to_u16());
                out.put_u32(handles[0]);
                out.put_tpm2b_empty();
                out.put_tpm2b(&self.objects[&handle].name);
                out_handles.push(handle);
            }
            TpmCc::Create => {
                let parent = self.object(handles[0])?.name.clone();
                let _sensitive_size = parse(p.get_u16())?;
                let user_auth = parse(p.get_tpm2b())?;
                let _data = parse(p.get_tpm2b())?;
                let public = parse(p.get_tpm2b())?;
                let _outside_info = parse(p.get_tpm2b())?;
                let _creation_pcr = parse(TpmlPcrSelection::unmarshal(&mut p))?;
                self.created += 1;
                let secret = keystream(&[&public, &self.created.to_be_bytes()], 16);
                out.put_tpm2b(&wrap_private(&parent, &duplicate_blob(&user_auth, &secret)));
                out.put_tpm2b(&public);
                out.put_tpm2b_empty(); // creationData
                out.put_tpm2b_empty(); // creationHash
                out.put_u16(TpmSt::Creation.to_u16());
                out.put_u32(tpm_rh::OWNER);
                out.put_tpm2b_empty();
            }
            TpmCc::Load => {
                let parent = self.object(handles[0])?.name.clone();
                let private = parse(p.get_tpm2b())?;
                let public = parse(p.get_tpm2b())?;
                let (auth, secret) = unwrap_private(&parent, &private)?;
                let handle = self.new_object(public, auth, secret)?;
                out.put_tpm2b(&self.objects[&handle].name);
                out_handles.push(handle);
            }
            TpmCc::Import => {
                let parent = self.object(handles[0])?.name.clone();
                let _encryption_key = parse(p.get_tpm2b())?;
                let public = parse(p.get_tpm2b())?;
                let duplicate = parse(p.get_tpm2b())?;
                let _sym_seed = parse(p.get_tpm2b())?;
                let _symmetric = parse(TpmtSymDef::unmarshal(&mut p))?;
                let template = parse(TpmtPublic::from_bytes(&public))?;
                if template.object_attributes.0 & (TpmaObject::FIXED_TPM | TpmaObject::FIXED_PARENT)
                    != 0
                {
                    return Err(TpmRc::ATTRIBUTES);
                }
                out.put_tpm2b(&wrap_private(&parent, &duplicate));
            }
            TpmCc::LoadExternal => {
                let _private = parse(p.get_tpm2b())?;
                let public = parse(p.get_tpm2b())?;
                let _hierarchy = parse(p.get_u32())?;
                let handle = self.new_object(public, Vec::new(), Vec::new())?;
                out.put_tpm2b(&self.objects[&handle].name);
                out_handles.push(handle);
            }
            TpmCc::EvictControl => {
                let persistent = parse(p.get_u32())?;
                if handles[1] == persistent {
                    self.objects
                        .remove(&persistent)
                        .ok_or(TpmRc(TpmRc::HANDLE.0 | 0x200))?;
                } else {
                    if self.objects.contains_key(&persistent) {
                        return Err(TpmRc::NV_DEFINED);
                    }
                    let object = self.object(handles[1])?.clone();
                    self.objects.insert(persistent, object);
                }
            }
            TpmCc::RsaEncrypt => {
                let object = self.object(handles[0])?;
                let name = object.name.clone();
                let template = parse(TpmtPublic::from_bytes(&object.public))?;
                if !template.is_decrypting() {
                    return Err(TpmRc::ATTRIBUTES);
                }
                let message = parse(p.get_tpm2b())?;
                let _scheme = parse(TpmtScheme::unmarshal(&mut p))?;
                let label = parse(p.get_tpm2b())?;
                if message.len() > RSA_BLOCK - 2 {
                    return Err(TpmRc::VALUE);
                }
                let mut block = vec![0u8; RSA_BLOCK];
                block[..2].copy_from_slice(&(message.len() as u16).to_be_bytes());
                block[2..2 + message.len()].copy_from_slice(&message);
                xor(&mut block, &keystream(&[&name, &label], RSA_BLOCK));
                out.put_tpm2b(&block);
            }
            TpmCc::RsaDecrypt => {
                let object = self.object(handles[0])?;
                let name = object.name.clone();
                let template = parse(TpmtPublic::from_bytes(&object.public))?;
                if !template.is_decrypting() {
                    return Err(TpmRc::ATTRIBUTES);
                }
                let mut block = parse(p.get_tpm2b())?;
                let _scheme = parse(TpmtScheme::unmarshal(&mut p))?;
                let label = parse(p.get_tpm2b())?;
                if block.len() != RSA_BLOCK {
                    return Err(TpmRc::SIZE);
                }
                xor(&mut block, &keystream(&[&name, &label], RSA_BLOCK));
                let len = u16::from_be_bytes([block[0], block[1]]) as usize;
                if len > RSA_BLOCK - 2 || block[2 + len..].iter().any(|&b| b != 0) {
                    return Err(TpmRc::VALUE);
                }
                out.put_tpm2b(&block[2..2 + len]);
            }
            TpmCc::Sign => {
                let public = self.object(handles[0])?.public.clone();
                let template = parse(TpmtPublic::from_bytes(&public))?;
                if !template.is_signing() {
                    return Err(TpmRc::KEY);
                }
                let signed = parse(p.get_tpm2b())?;
                let scheme = parse(TpmtScheme::unmarshal(&mut p))?;
                let _validation = parse(TpmtTicket::unmarshal(&mut p))?;
                let hash = match (scheme.scheme, scheme.hash_alg) {
                    (TpmAlgId::Null, _) => key_scheme_hash(&template)?,
                    (_, Some(hash)) => hash,
                    _ => return Err(TpmRc::SCHEME),
                };
                if signed.len() != hash.digest_size() {
                    return Err(TpmRc::SIZE);
                }
                TpmtSignature::RsaSsa {
                    hash,
                    sig: fake_signature(&public, &signed),
                }
                .marshal(&mut out);
            }
            TpmCc::VerifySignature => {
                let public = self.object(handles[0])?.public.clone();
                let signed = parse(p.get_tpm2b())?;
                let signature = parse(TpmtSignature::unmarshal(&mut p))?;
                match signature {
                    TpmtSignature::RsaSsa { sig, .. } if sig == fake_signature(&public, &signed) => {}
                    _ => return Err(TpmRc::SIGNATURE),
                }
                TpmtTicket {
                    tag: TpmSt::Verified,
                    hierarchy: tpm_rh::OWNER,
                    digest: Tpm2bDigest::new(signed),
                }
                .marshal(&mut out);
            }
            TpmCc::Hash => {
                let data = parse(p.get_tpm2b())?;
                let alg = TpmAlgId::from_u16(parse(p.get_u16())?)
                    .filter(|alg| alg.is_hash())
                    .ok_or(TpmRc::HASH)?;
                let hierarchy = parse(p.get_u32())?;
                let value = digest(alg, &[&data])?;
                out.put_tpm2b(&value);
                let ticket = if hierarchy == tpm_rh::NULL {
                    TpmtTicket::null_hashcheck()
                } else {
                    TpmtTicket {
                        tag: TpmSt::HashCheck,
                        hierarchy,
                        digest: Tpm2bDigest::new(value),
                    }
                };
                ticket.marshal(&mut out);
            }
            TpmCc::EncryptDecrypt | TpmCc::EncryptDecrypt2 => {
                let (data, _decrypt, mode, iv) = if cc == TpmCc::EncryptDecrypt2 {
                    let data = parse(p.get_tpm2b())?;
                    let decrypt = parse(p.get_u8())?;
                    let mode = parse(p.get_u16())?;
                    (data, decrypt, mode, parse(p.get_tpm2b())?)
                } else {
                    let decrypt = parse(p.get_u8())?;
                    let mode = parse(p.get_u16())?;
                    let iv = parse(p.get_tpm2b())?;
                    (parse(p.get_tpm2b())?, decrypt, mode, iv)
                };
                let object = self.object(handles[0])?;
                let template = parse(TpmtPublic::from_bytes(&object.public))?;
                if template.type_alg != TpmAlgId::SymCipher {
                    return Err(TpmRc::KEY);
                }
                let _mode = TpmAlgId::from_u16(mode).ok_or(TpmRc::MODE)?;
                if !iv.is_empty() && iv.len() != 16 {
                    return Err(TpmRc::SIZE);
                }
                let mut out_data = data;
                let len = out_data.len();
                xor(&mut out_data, &keystream(&[&object.secret, &iv], len));
                out.put_tpm2b(&out_data);
                out.put_tpm2b(&iv);
            }
            TpmCc::ReadPublic => {
                let obj = self.objects.get(&handles[0]).ok_or(TpmRc::HANDLE)?;
                out.put_tpm2b(&obj.public);
                out.put_tpm2b(&obj.name);
                out.put_tpm2b(&obj.name);
            }
            TpmCc::FlushContext => {
                let handle = parse(p.get_u32())?;
                if self.sessions.remove(&handle).is_none() && self.objects.remove(&handle).is_none()
                {
                    return Err(TpmRc(TpmRc::HANDLE.0 | 0x100));
                }
            }
            TpmCc::StartAuthSession => {
                let _nonce_caller = parse(p.get_tpm2b())?;
                let _salt = parse(p.get_tpm2b())?;
                let session_type = parse(p.get_u8())?;
                let _symmetric = parse(TpmtSymDef::unmarshal(&mut p))?;
                let hash_alg = TpmAlgId::from_u16(parse(p.get_u16())?).ok_or(TpmRc::HASH)?;
                let base = if session_type == TpmSe::Hmac as u8 {
                    0x0200_0000
                } else {
                    0x0300_0000
                };
                let handle = base + self.next_session;
                self.next_session += 1;
                let nonce_tpm = self.next_nonce(hash_alg.digest_size());
                let mut reply = nonce_tpm.clone();
                if let Some(&Fault::ShortNonce(len)) = self.faults.front() {
                    self.faults.pop_front();
                    reply.truncate(len);
                }
                out.put_tpm2b(&reply);
                self.sessions.insert(
                    handle,
                    MockSession {
                        session_type,
                        hash_alg,
                        nonce_tpm,
                        policy_digest: vec![0; hash_alg.digest_size()],
                    },
                );
                out_handles.push(handle);
            }
            TpmCc::PolicyPcr => {
                let pcr_digest = parse(p.get_tpm2b())?;
                let selection = parse(TpmlPcrSelection::unmarshal(&mut p))?;
                let (session_type, hash_alg) = self
                    .sessions
                    .get(&handles[0])
                    .map(|s| (s.session_type, s.hash_alg))
                    .ok_or(TpmRc::HANDLE)?;
                if session_type == TpmSe::Hmac as u8 {
                    return Err(TpmRc::AUTH_TYPE);
                }
                let values = self.selected_values(&selection)?;
                let parts: Vec<&[u8]> = values.iter().map(Vec::as_slice).collect();
                let current = digest(hash_alg, &parts)?;
                let pcr_digest = if pcr_digest.is_empty() {
                    current
                } else if session_type == TpmSe::Trial as u8 || pcr_digest == current {
                    pcr_digest
                } else {
                    return Err(TpmRc::VALUE);
                };
                let session = self.sessions.get_mut(&handles[0]).ok_or(TpmRc::HANDLE)?;
                session.policy_digest = digest(
                    hash_alg,
                    &[
                        &session.policy_digest,
                        &TpmCc::PolicyPcr.to_u32().to_be_bytes(),
                        &selection.to_bytes(),
                        &pcr_digest,
                    ],
                )?;
            }
            TpmCc::PolicyGetDigest => {
                let session = self.sessions.get(&handles[0]).ok_or(TpmRc::HANDLE)?;
                out.put_tpm2b(&session.policy_digest);
            }
            TpmCc::PcrRead => {
                let selection = parse(TpmlPcrSelection::unmarshal(&mut p))?;
                let values = self.selected_values(&selection)?;
                out.put_u32(self.pcr_updates);
                selection.marshal(&mut out);
                TpmlDigest {
                    digests: values.into_iter().map(Tpm2bDigest::new).collect(),
                }
                .marshal(&mut out);
            }
            TpmCc::PcrExtend => {
                let values = parse(TpmlDigestValues::unmarshal(&mut p))?;
                for value in values.digests {
                    self.extend(handles[0], value.hash_alg, &value.digest)?;
                }
            }
            TpmCc::PcrEvent => {
                let data = parse(p.get_tpm2b())?;
                let mut digests = Vec::new();
                for alg in [TpmAlgId::Sha1, TpmAlgId::Sha256] {
                    let value = digest(alg, &[&data])?;
                    self.extend(handles[0], alg, &value)?;
                    digests.push(TpmtHa {
                        hash_alg: alg,
                        digest: value,
                    });
                }
                TpmlDigestValues { digests }.marshal(&mut out);
            }
            TpmCc::NvDefineSpace => {
                let auth = parse(p.get_tpm2b())?;
                let public = parse(Tpm2bNvPublic::unmarshal(&mut p))?.nv_public;
                if self.nv.contains_key(&public.nv_index) {
                    return Err(TpmRc::NV_DEFINED);
                }
                let data = vec![0; public.data_size as usize];
                self.nv
                    .insert(public.nv_index, MockNv { public, auth, data });
            }
            TpmCc::NvUndefineSpace => {
                self.nv
                    .remove(&handles[1])
                    .ok_or(TpmRc(TpmRc::HANDLE.0 | 0x200))?;
            }
            TpmCc::NvReadPublic => {
                let nv = self.nv.get(&handles[0]).ok_or(TpmRc::HANDLE)?;
                Tpm2bNvPublic {
                    nv_public: nv.public.clone(),
                }
                .marshal(&mut out);
                out.put_tpm2b(&self.name_of(handles[0]));
            }
            TpmCc::NvWrite => {
                let data = parse(p.get_tpm2b())?;
                let offset = parse(p.get_u16())? as usize;
                let nv = self.nv.get_mut(&handles[1]).ok_or(TpmRc::HANDLE)?;
                if offset + data.len() > nv.data.len() {
                    return Err(TpmRc::NV_RANGE);
                }
                nv.data[offset..offset + data.len()].copy_from_slice(&data);
                nv.public.attributes.0 |= TpmaNv::WRITTEN;
            }
            TpmCc::NvRead => {
                let size = parse(p.get_u16())? as usize;
                let offset = parse(p.get_u16())? as usize;
                let nv = self.nv.get(&handles[1]).ok_or(TpmRc::HANDLE)?;
                if !nv.public.attributes.contains(TpmaNv::WRITTEN) {
                    return Err(TpmRc::NV_UNINITIALIZED);
                }
                if offset + size > nv.data.len() {
                    return Err(TpmRc::NV_RANGE);
                }
                out.put_tpm2b(&nv.data[offset..offset + size]);
            }
            TpmCc::NvIncrement => {
                let nv = self.nv.get_mut(&handles[1]).ok_or(TpmRc::HANDLE)?;
                if !nv.public.attributes.is_counter() {
                    return Err(TpmRc::ATTRIBUTES);
                }
                let mut value = [0u8; 8];
                value.copy_from_slice(&nv.data);
                let next = u64::from_be_bytes(value) + 1;
                nv.data = next.to_be_bytes().to_vec();
                nv.public.attributes.0 |= TpmaNv::WRITTEN;
            }
            _ => return Err(TpmRc::COMMAND_CODE),
        }

        Ok((out_handles, out.into_vec()))
    }
}

/// Shared handle on the mock; clones see the same TPM
#[derive(Clone)]
pub struct MockTpm {
    state: Arc<Mutex<MockState>>,
}

impl MockTpm {
    pub fn new() -> Self {
        let state = MockState {
            connected: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn inject(&self, fault: Fault) {
        self.state().faults.push_back(fault);
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(MockTransport {
            tpm: self.clone(),
            pending: None,
        })
    }

    pub fn client(&self) -> TpmClient {
        TpmClient::with_transport(self.transport(), test_config())
    }
}

/// Fast retries so tests do not sleep long
pub fn test_config() -> ClientConfig {
    ClientConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            multiplier: 2,
            max_backoff_ms: 4,
        },
        ..Default::default()
    }
}

fn broken_pipe() -> Error {
    Error::Transport(io::Error::new(io::ErrorKind::BrokenPipe, "mock TPM disconnected"))
}

struct MockTransport {
    tpm: MockTpm,
    pending: Option<Result<Vec<u8>>>,
}

impl Transport for MockTransport {
    fn connect(&mut self) -> Result<()> {
        let mut state = self.tpm.state();
        state.connected = true;
        state.connects += 1;
        state.wire.push(Wire::Connect);
        Ok(())
    }

    fn send(&mut self, command: &[u8]) -> Result<()> {
        let mut state = self.tpm.state();
        if !state.connected {
            return Err(broken_pipe());
        }
        if matches!(state.faults.front(), Some(Fault::Disconnect)) {
            state.faults.pop_front();
            state.connected = false;
            return Err(broken_pipe());
        }
        let code = command
            .get(6..10)
            .map_or(0, |b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));
        state.wire.push(Wire::Command(code));
        if matches!(state.faults.front(), Some(Fault::Timeout(cc)) if cc.to_u32() == code) {
            state.faults.pop_front();
            self.pending = Some(Err(Error::Timeout));
            return Ok(());
        }
        self.pending = Some(Ok(state.execute(command)));
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        self.pending.take().unwrap_or_else(|| {
            Err(Error::Transport(io::Error::new(
                io::ErrorKind::Other,
                "no response pending",
            )))
        })
    }

    fn power_cycle(&mut self) -> Result<()> {
        self.tpm.state().power_cycle();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.tpm.state();
        state.connected = false;
        state.wire.push(Wire::Close);
        Ok(())
    }
}

/// Owner-authorized NV index readable and writable with its own auth
pub fn nv_public(index: u32, size: u16) -> TpmsNvPublic {
    TpmsNvPublic::new(
        index,
        size,
        TpmaNv::new().with_auth_read().with_auth_write().with_no_da(),
    )
}
