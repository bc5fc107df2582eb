// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types

use std::fmt;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;

fn alg_from_u16(v: u16, what: &str) -> Result<TpmAlgId> {
    TpmAlgId::from_u16(v)
        .ok_or_else(|| Error::malformed(format!("unknown {}: 0x{:04x}", what, v)))
}

macro_rules! tpm2b_buffer {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            pub buffer: Vec<u8>,
        }

        impl $name {
            pub fn new(data: Vec<u8>) -> Self {
                Self { buffer: data }
            }

            pub fn empty() -> Self {
                Self { buffer: Vec::new() }
            }
        }

        impl Marshal for $name {
            fn marshal(&self, buf: &mut CommandBuffer) {
                buf.put_tpm2b(&self.buffer);
            }
        }

        impl Unmarshal for $name {
            fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
                Ok(Self {
                    buffer: buf.get_tpm2b()?,
                })
            }
        }
    };
}

tpm2b_buffer!(
    /// TPM2B_DIGEST - Variable length digest
    Tpm2bDigest
);
tpm2b_buffer!(
    /// TPM2B_DATA - Variable length data
    Tpm2bData
);
tpm2b_buffer!(
    /// TPM2B_SENSITIVE_DATA - Sensitive data for object creation
    Tpm2bSensitiveData
);
tpm2b_buffer!(
    /// TPM2B_MAX_NV_BUFFER - NV buffer
    Tpm2bMaxNvBuffer
);
tpm2b_buffer!(
    /// TPM2B_MAX_BUFFER - Input to Hash
    Tpm2bMaxBuffer
);
tpm2b_buffer!(
    /// TPM2B_PUBLIC_KEY_RSA - RSA modulus, ciphertext or plaintext
    Tpm2bPublicKeyRsa
);
tpm2b_buffer!(
    /// TPM2B_NAME - Entity name (nameAlg || digest, or a handle)
    Tpm2bName
);
tpm2b_buffer!(
    /// TPM2B_CREATION_DATA - kept opaque
    Tpm2bCreationData
);

/// TPM2B_NONCE - Nonce value
pub type Tpm2bNonce = Tpm2bDigest;

/// TPM2B_AUTH - Authorization value bound to an entity.
///
/// At most 64 bytes. The contents are never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthValue(Vec<u8>);

impl AuthValue {
    pub const MAX_SIZE: usize = 64;

    pub fn new(value: impl Into<Vec<u8>>) -> Result<Self> {
        let value = value.into();
        if value.len() > Self::MAX_SIZE {
            return Err(Error::InvalidParameter(format!(
                "auth value of {} bytes exceeds {} bytes",
                value.len(),
                Self::MAX_SIZE
            )));
        }
        Ok(Self(value))
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// HMAC key material: the TPM drops trailing zero octets.
    pub fn trimmed(&self) -> &[u8] {
        let end = self
            .0
            .iter()
            .rposition(|&b| b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        &self.0[..end]
    }
}

impl fmt::Debug for AuthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthValue(<{} bytes>)", self.0.len())
    }
}

impl Marshal for AuthValue {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.0);
    }
}

impl Unmarshal for AuthValue {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let value = buf.get_tpm2b()?;
        if value.len() > Self::MAX_SIZE {
            return Err(Error::malformed("auth value exceeds 64 bytes"));
        }
        Ok(Self(value))
    }
}

pub type Tpm2bAuth = AuthValue;

/// TPMS_PCR_SELECTION - PCR selection for a single hash algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    pub pcr_select: Vec<u8>, // Bitmap of selected PCRs
}

impl TpmsPcrSelection {
    pub fn new(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        // Calculate required size (at least 3 bytes for PCR 0-23)
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        let mut pcr_select = vec![0u8; size];

        for &pcr in pcrs {
            let byte_idx = (pcr / 8) as usize;
            let bit_idx = pcr % 8;
            if byte_idx < pcr_select.len() {
                pcr_select[byte_idx] |= 1 << bit_idx;
            }
        }

        Self { hash, pcr_select }
    }

    pub fn sha256(pcrs: &[u32]) -> Self {
        Self::new(TpmAlgId::Sha256, pcrs)
    }

    /// Indices of the selected PCRs in ascending order
    pub fn selected(&self) -> Vec<u32> {
        select_bits(&self.pcr_select)
    }
}

fn select_bits(bitmap: &[u8]) -> Vec<u32> {
    let mut pcrs = Vec::new();
    for (byte_idx, &byte) in bitmap.iter().enumerate() {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                pcrs.push((byte_idx * 8 + bit) as u32);
            }
        }
    }
    pcrs
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash.to_u16());
        buf.put_u8(self.pcr_select.len() as u8);
        buf.put_bytes(&self.pcr_select);
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash = alg_from_u16(buf.get_u16()?, "hash algorithm")?;
        let size = buf.get_u8()? as usize;
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION - List of PCR selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn new(selections: Vec<TpmsPcrSelection>) -> Self {
        Self {
            pcr_selections: selections,
        }
    }

    pub fn single(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        Self {
            pcr_selections: vec![TpmsPcrSelection::new(hash, pcrs)],
        }
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_list(&self.pcr_selections);
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            pcr_selections: buf.get_list()?,
        })
    }
}

/// TPML_DIGEST - List of digests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlDigest {
    pub digests: Vec<Tpm2bDigest>,
}

impl Marshal for TpmlDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_list(&self.digests);
    }
}

impl Unmarshal for TpmlDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            digests: buf.get_list()?,
        })
    }
}

/// TPMS_NV_PUBLIC - NV index public area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsNvPublic {
    pub nv_index: u32,
    pub name_alg: TpmAlgId,
    pub attributes: TpmaNv,
    pub auth_policy: Tpm2bDigest,
    pub data_size: u16,
}

impl TpmsNvPublic {
    pub fn new(nv_index: u32, data_size: u16, attributes: TpmaNv) -> Self {
        Self {
            nv_index,
            name_alg: TpmAlgId::Sha256,
            attributes,
            auth_policy: Tpm2bDigest::empty(),
            data_size,
        }
    }

    /// A counter index: 8 bytes, incremented only through NV_Increment
    pub fn counter(nv_index: u32, attributes: TpmaNv) -> Self {
        Self::new(nv_index, 8, attributes.with_counter())
    }

    pub fn with_name_alg(mut self, name_alg: TpmAlgId) -> Self {
        self.name_alg = name_alg;
        self
    }

    /// Check the definition before it is sent to the TPM
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidParameter(msg));
        if TpmHt::of(self.nv_index) != Some(TpmHt::NvIndex) {
            return invalid(format!("0x{:08x} is not an NV index handle", self.nv_index));
        }
        if !self.name_alg.is_hash() {
            return invalid(format!("NV name algorithm {:?} is not a hash", self.name_alg));
        }
        match self.attributes.nv_type() {
            Some(TpmNt::Ordinary) if self.data_size == 0 => {
                invalid("ordinary NV index must have a non-zero size".to_string())
            }
            Some(TpmNt::Counter) | Some(TpmNt::Bits) if self.data_size != 8 => invalid(format!(
                "counter/bits NV index must be 8 bytes, got {}",
                self.data_size
            )),
            None => invalid(format!("unknown NV type in 0x{:08x}", self.attributes.0)),
            _ => Ok(()),
        }
    }
}

impl Marshal for TpmsNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.nv_index);
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.attributes.0);
        self.auth_policy.marshal(buf);
        buf.put_u16(self.data_size);
    }
}

impl Unmarshal for TpmsNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let nv_index = buf.get_u32()?;
        let name_alg = alg_from_u16(buf.get_u16()?, "algorithm")?;
        let attributes = TpmaNv(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let data_size = buf.get_u16()?;
        Ok(Self {
            nv_index,
            name_alg,
            attributes,
            auth_policy,
            data_size,
        })
    }
}

/// TPM2B_NV_PUBLIC - NV public with size prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2bNvPublic {
    pub nv_public: TpmsNvPublic,
}

impl Marshal for Tpm2bNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_sized(&self.nv_public);
    }
}

impl Unmarshal for Tpm2bNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nv_public: buf.get_sized()?,
        })
    }
}

/// TPMT_SYM_DEF - Symmetric algorithm definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }

    pub fn is_null(&self) -> bool {
        self.algorithm == TpmAlgId::Null
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm = alg_from_u16(buf.get_u16()?, "algorithm")?;
        if algorithm == TpmAlgId::Null {
            Ok(Self::null())
        } else {
            let key_bits = buf.get_u16()?;
            let mode = alg_from_u16(buf.get_u16()?, "mode")?;
            Ok(Self {
                algorithm,
                key_bits,
                mode,
            })
        }
    }
}

/// TPMT_SYM_DEF_OBJECT - Symmetric definition for objects
pub type TpmtSymDefObject = TpmtSymDef;

/// A scheme selector whose details are at most one hash algorithm.
///
/// Covers TPMT_RSA_SCHEME, TPMT_RSA_DECRYPT, TPMT_ECC_SCHEME,
/// TPMT_SIG_SCHEME, TPMT_KDF_SCHEME and TPMT_KEYEDHASH_SCHEME (HMAC only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtScheme {
    pub scheme: TpmAlgId,
    pub hash_alg: Option<TpmAlgId>,
}

pub type TpmtRsaScheme = TpmtScheme;
pub type TpmtRsaDecrypt = TpmtScheme;
pub type TpmtEccScheme = TpmtScheme;
pub type TpmtSigScheme = TpmtScheme;
pub type TpmtKdfScheme = TpmtScheme;
pub type TpmtKeyedHashScheme = TpmtScheme;

impl TpmtScheme {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: None,
        }
    }

    fn with_hash(scheme: TpmAlgId, hash: TpmAlgId) -> Self {
        Self {
            scheme,
            hash_alg: Some(hash),
        }
    }

    pub fn rsassa(hash: TpmAlgId) -> Self {
        Self::with_hash(TpmAlgId::RsaSsa, hash)
    }

    pub fn rsapss(hash: TpmAlgId) -> Self {
        Self::with_hash(TpmAlgId::RsaPss, hash)
    }

    pub fn oaep(hash: TpmAlgId) -> Self {
        Self::with_hash(TpmAlgId::Oaep, hash)
    }

    pub fn rsaes() -> Self {
        Self {
            scheme: TpmAlgId::RsaEs,
            hash_alg: None,
        }
    }

    pub fn ecdsa(hash: TpmAlgId) -> Self {
        Self::with_hash(TpmAlgId::EcDsa, hash)
    }

    pub fn hmac(hash: TpmAlgId) -> Self {
        Self::with_hash(TpmAlgId::Hmac, hash)
    }

    pub fn is_null(&self) -> bool {
        self.scheme == TpmAlgId::Null
    }

    pub fn is_signing(&self) -> bool {
        matches!(
            self.scheme,
            TpmAlgId::RsaSsa | TpmAlgId::RsaPss | TpmAlgId::EcDsa | TpmAlgId::Hmac
        )
    }

    pub fn is_decrypting(&self) -> bool {
        matches!(self.scheme, TpmAlgId::Oaep | TpmAlgId::RsaEs | TpmAlgId::Ecdh)
    }

    /// The hash detail is present exactly when the scheme calls for one.
    fn check(&self) -> std::result::Result<(), String> {
        match (self.scheme.scheme_has_hash(), self.hash_alg) {
            (true, Some(h)) if h.is_hash() => Ok(()),
            (true, Some(h)) => Err(format!("{:?} is not a hash for {:?}", h, self.scheme)),
            (true, None) => Err(format!("scheme {:?} requires a hash", self.scheme)),
            (false, Some(_)) => Err(format!("scheme {:?} takes no hash", self.scheme)),
            (false, None) => Ok(()),
        }
    }
}

impl Marshal for TpmtScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.scheme.to_u16());
        if let Some(hash) = self.hash_alg {
            buf.put_u16(hash.to_u16());
        }
    }
}

impl Unmarshal for TpmtScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = alg_from_u16(buf.get_u16()?, "scheme")?;
        if scheme.scheme_has_hash() {
            let hash = alg_from_u16(buf.get_u16()?, "scheme hash")?;
            Ok(Self::with_hash(scheme, hash))
        } else if matches!(scheme, TpmAlgId::Null | TpmAlgId::RsaEs) {
            Ok(Self {
                scheme,
                hash_alg: None,
            })
        } else {
            Err(Error::malformed(format!("unsupported scheme {:?}", scheme)))
        }
    }
}

/// TPMS_RSA_PARMS - RSA key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsRsaParms {
    pub symmetric: TpmtSymDefObject,
    pub scheme: TpmtRsaScheme,
    pub key_bits: u16,
    pub exponent: u32,
}

impl TpmsRsaParms {
    pub fn storage_key() -> Self {
        Self {
            symmetric: TpmtSymDef::aes_128_cfb(),
            scheme: TpmtScheme::null(),
            key_bits: 2048,
            exponent: 0, // Default exponent (65537)
        }
    }

    /// An unrestricted key with the given scheme
    pub fn with_scheme(scheme: TpmtRsaScheme, key_bits: RsaKeyBits) -> Self {
        Self {
            symmetric: TpmtSymDef::null(),
            scheme,
            key_bits: key_bits.to_u16(),
            exponent: 0,
        }
    }
}

impl Marshal for TpmsRsaParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.key_bits);
        buf.put_u32(self.exponent);
    }
}

impl Unmarshal for TpmsRsaParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            symmetric: TpmtSymDef::unmarshal(buf)?,
            scheme: TpmtScheme::unmarshal(buf)?,
            key_bits: buf.get_u16()?,
            exponent: buf.get_u32()?,
        })
    }
}

/// TPMS_ECC_PARMS - ECC key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsEccParms {
    pub symmetric: TpmtSymDefObject,
    pub scheme: TpmtEccScheme,
    pub curve_id: TpmEccCurve,
    pub kdf: TpmtKdfScheme,
}

impl Marshal for TpmsEccParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.curve_id.to_u16());
        self.kdf.marshal(buf);
    }
}

impl Unmarshal for TpmsEccParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let symmetric = TpmtSymDef::unmarshal(buf)?;
        let scheme = TpmtScheme::unmarshal(buf)?;
        let curve = buf.get_u16()?;
        let curve_id = TpmEccCurve::from_u16(curve)
            .ok_or_else(|| Error::malformed(format!("unknown ECC curve 0x{:04x}", curve)))?;
        let kdf = TpmtScheme::unmarshal(buf)?;
        Ok(Self {
            symmetric,
            scheme,
            curve_id,
            kdf,
        })
    }
}

/// TPMS_KEYEDHASH_PARMS - Keyed hash parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmsKeyedHashParms {
    pub scheme: TpmtKeyedHashScheme,
}

impl TpmsKeyedHashParms {
    pub fn null() -> Self {
        Self {
            scheme: TpmtScheme::null(),
        }
    }
}

impl Marshal for TpmsKeyedHashParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.scheme.marshal(buf);
    }
}

/// TPMU_PUBLIC_PARMS - Public parameters union, tagged by the object type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicParms {
    Rsa(TpmsRsaParms),
    Ecc(TpmsEccParms),
    KeyedHash(TpmsKeyedHashParms),
    SymCipher(TpmtSymDefObject),
}

impl TpmtPublicParms {
    pub fn type_alg(&self) -> TpmAlgId {
        match self {
            TpmtPublicParms::Rsa(_) => TpmAlgId::Rsa,
            TpmtPublicParms::Ecc(_) => TpmAlgId::Ecc,
            TpmtPublicParms::KeyedHash(_) => TpmAlgId::KeyedHash,
            TpmtPublicParms::SymCipher(_) => TpmAlgId::SymCipher,
        }
    }

    fn unmarshal_for(type_alg: TpmAlgId, buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(match type_alg {
            TpmAlgId::Rsa => TpmtPublicParms::Rsa(TpmsRsaParms::unmarshal(buf)?),
            TpmAlgId::Ecc => TpmtPublicParms::Ecc(TpmsEccParms::unmarshal(buf)?),
            TpmAlgId::KeyedHash => TpmtPublicParms::KeyedHash(TpmsKeyedHashParms {
                scheme: TpmtScheme::unmarshal(buf)?,
            }),
            TpmAlgId::SymCipher => TpmtPublicParms::SymCipher(TpmtSymDef::unmarshal(buf)?),
            other => return Err(Error::malformed(format!("unknown object type {:?}", other))),
        })
    }
}

impl Marshal for TpmtPublicParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtPublicParms::Rsa(p) => p.marshal(buf),
            TpmtPublicParms::Ecc(p) => p.marshal(buf),
            TpmtPublicParms::KeyedHash(p) => p.marshal(buf),
            TpmtPublicParms::SymCipher(p) => p.marshal(buf),
        }
    }
}

/// TPMU_PUBLIC_ID - Unique identifier union, tagged by the object type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicUnique {
    Rsa(Vec<u8>),          // TPM2B_PUBLIC_KEY_RSA
    Ecc(Vec<u8>, Vec<u8>), // TPMS_ECC_POINT (x, y)
    KeyedHash(Vec<u8>),    // TPM2B_DIGEST
    SymCipher(Vec<u8>),    // TPM2B_DIGEST
}

impl TpmtPublicUnique {
    pub fn type_alg(&self) -> TpmAlgId {
        match self {
            TpmtPublicUnique::Rsa(_) => TpmAlgId::Rsa,
            TpmtPublicUnique::Ecc(..) => TpmAlgId::Ecc,
            TpmtPublicUnique::KeyedHash(_) => TpmAlgId::KeyedHash,
            TpmtPublicUnique::SymCipher(_) => TpmAlgId::SymCipher,
        }
    }

    fn unmarshal_for(type_alg: TpmAlgId, buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(match type_alg {
            TpmAlgId::Rsa => TpmtPublicUnique::Rsa(buf.get_tpm2b()?),
            TpmAlgId::Ecc => TpmtPublicUnique::Ecc(buf.get_tpm2b()?, buf.get_tpm2b()?),
            TpmAlgId::KeyedHash => TpmtPublicUnique::KeyedHash(buf.get_tpm2b()?),
            TpmAlgId::SymCipher => TpmtPublicUnique::SymCipher(buf.get_tpm2b()?),
            other => return Err(Error::malformed(format!("unknown object type {:?}", other))),
        })
    }
}

impl Marshal for TpmtPublicUnique {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtPublicUnique::Rsa(n) => buf.put_tpm2b(n),
            TpmtPublicUnique::Ecc(x, y) => {
                buf.put_tpm2b(x);
                buf.put_tpm2b(y);
            }
            TpmtPublicUnique::KeyedHash(d) | TpmtPublicUnique::SymCipher(d) => buf.put_tpm2b(d),
        }
    }
}

/// TPMT_PUBLIC - Public area template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub type_alg: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub parameters: TpmtPublicParms,
    pub unique: TpmtPublicUnique,
}

impl TpmtPublic {
    /// Create an RSA storage key template (SRK)
    pub fn rsa_storage_key() -> Self {
        Self {
            type_alg: TpmAlgId::Rsa,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_restricted()
                .with_decrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Rsa(TpmsRsaParms::storage_key()),
            unique: TpmtPublicUnique::Rsa(Vec::new()),
        }
    }

    /// Non-migratable RSA signing key using RSASSA with `hash`
    pub fn rsa_signing_key(hash: TpmAlgId) -> Self {
        Self::rsa_unrestricted(
            TpmaObject::new().with_sign_encrypt(),
            TpmtScheme::rsassa(hash),
        )
    }

    /// Non-migratable RSA decryption key using OAEP with `hash`
    pub fn rsa_decryption_key(hash: TpmAlgId) -> Self {
        Self::rsa_unrestricted(TpmaObject::new().with_decrypt(), TpmtScheme::oaep(hash))
    }

    /// Dual-use RSA key (sign and decrypt); the scheme is chosen per call.
    ///
    /// `unique` is extra entropy mixed into primary key derivation.
    pub fn rsa_general_key(unique: Vec<u8>) -> Self {
        let mut template = Self::rsa_unrestricted(
            TpmaObject::new().with_decrypt().with_sign_encrypt(),
            TpmtScheme::null(),
        );
        template.unique = TpmtPublicUnique::Rsa(unique);
        template
    }

    /// Symmetric block cipher key usable for both EncryptDecrypt directions
    pub fn symmetric_key(cipher: TpmtSymDefObject) -> Self {
        Self {
            type_alg: TpmAlgId::SymCipher,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_decrypt()
                .with_sign_encrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::SymCipher(cipher),
            unique: TpmtPublicUnique::SymCipher(Vec::new()),
        }
    }

    fn rsa_unrestricted(usage: TpmaObject, scheme: TpmtScheme) -> Self {
        Self {
            type_alg: TpmAlgId::Rsa,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject(
                usage.0
                    | TpmaObject::FIXED_TPM
                    | TpmaObject::FIXED_PARENT
                    | TpmaObject::SENSITIVE_DATA_ORIGIN
                    | TpmaObject::USER_WITH_AUTH,
            ),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Rsa(TpmsRsaParms::with_scheme(
                scheme,
                RsaKeyBits::Rsa2048,
            )),
            unique: TpmtPublicUnique::Rsa(Vec::new()),
        }
    }

    pub fn with_name_alg(mut self, name_alg: TpmAlgId) -> Self {
        self.name_alg = name_alg;
        self
    }

    pub fn is_signing(&self) -> bool {
        self.object_attributes.contains(TpmaObject::SIGN_ENCRYPT)
    }

    pub fn is_decrypting(&self) -> bool {
        self.object_attributes.contains(TpmaObject::DECRYPT)
    }

    /// RSA modulus, if this is an RSA key with its unique field populated
    pub fn rsa_modulus(&self) -> Option<&[u8]> {
        match &self.unique {
            TpmtPublicUnique::Rsa(n) if !n.is_empty() => Some(n),
            _ => None,
        }
    }

    /// Check the template's internal consistency before it is encoded.
    pub fn validate(&self) -> Result<()> {
        self.check().map_err(Error::InvalidTemplate)
    }

    fn check(&self) -> std::result::Result<(), String> {
        if self.parameters.type_alg() != self.type_alg {
            return Err(format!(
                "parameters are {:?} but the object type is {:?}",
                self.parameters.type_alg(),
                self.type_alg
            ));
        }
        if self.unique.type_alg() != self.type_alg {
            return Err(format!(
                "unique field is {:?} but the object type is {:?}",
                self.unique.type_alg(),
                self.type_alg
            ));
        }
        if !self.name_alg.is_hash() {
            return Err(format!("name algorithm {:?} is not a hash", self.name_alg));
        }
        let policy_len = self.auth_policy.buffer.len();
        if policy_len != 0 && policy_len != self.name_alg.digest_size() {
            return Err(format!(
                "auth policy of {} bytes does not match {:?}",
                policy_len, self.name_alg
            ));
        }

        let attrs = self.object_attributes;
        if attrs.contains(TpmaObject::FIXED_TPM) && !attrs.contains(TpmaObject::FIXED_PARENT) {
            return Err("fixedTPM requires fixedParent".to_string());
        }
        let restricted = attrs.contains(TpmaObject::RESTRICTED);
        let sign = self.is_signing();
        let decrypt = self.is_decrypting();
        if restricted && sign && decrypt {
            return Err("a restricted key cannot both sign and decrypt".to_string());
        }

        match &self.parameters {
            TpmtPublicParms::Rsa(parms) => {
                if RsaKeyBits::from_u16(parms.key_bits).is_none() {
                    return Err(format!("unsupported RSA key size {}", parms.key_bits));
                }
                Self::check_asymmetric(&parms.symmetric, &parms.scheme, restricted, sign, decrypt)?;
                if !matches!(
                    parms.scheme.scheme,
                    TpmAlgId::Null
                        | TpmAlgId::RsaSsa
                        | TpmAlgId::RsaPss
                        | TpmAlgId::RsaEs
                        | TpmAlgId::Oaep
                ) {
                    return Err(format!("{:?} is not an RSA scheme", parms.scheme.scheme));
                }
            }
            TpmtPublicParms::Ecc(parms) => {
                if parms.curve_id == TpmEccCurve::None {
                    return Err("ECC key requires a curve".to_string());
                }
                Self::check_asymmetric(&parms.symmetric, &parms.scheme, restricted, sign, decrypt)?;
                if !matches!(
                    parms.scheme.scheme,
                    TpmAlgId::Null | TpmAlgId::EcDsa | TpmAlgId::Ecdh
                ) {
                    return Err(format!("{:?} is not an ECC scheme", parms.scheme.scheme));
                }
                parms.kdf.check()?;
            }
            TpmtPublicParms::KeyedHash(parms) => {
                parms.scheme.check()?;
                if !matches!(parms.scheme.scheme, TpmAlgId::Null | TpmAlgId::Hmac) {
                    return Err(format!("{:?} is not a keyed-hash scheme", parms.scheme.scheme));
                }
                if parms.scheme.scheme == TpmAlgId::Hmac && !sign {
                    return Err("HMAC keyed-hash object must have sign set".to_string());
                }
            }
            TpmtPublicParms::SymCipher(sym) => {
                if sym.is_null() {
                    return Err("symmetric cipher key requires an algorithm".to_string());
                }
                if !decrypt {
                    return Err("symmetric cipher key must have decrypt set".to_string());
                }
            }
        }
        Ok(())
    }

    fn check_asymmetric(
        symmetric: &TpmtSymDef,
        scheme: &TpmtScheme,
        restricted: bool,
        sign: bool,
        decrypt: bool,
    ) -> std::result::Result<(), String> {
        scheme.check()?;
        if !sign && !decrypt {
            return Err("asymmetric key must have sign or decrypt set".to_string());
        }
        if restricted && decrypt {
            if symmetric.is_null() {
                return Err("restricted decryption key requires a symmetric algorithm".to_string());
            }
            if !scheme.is_null() {
                return Err("restricted decryption key must use the null scheme".to_string());
            }
        } else if !symmetric.is_null() {
            return Err("only restricted decryption keys carry a symmetric algorithm".to_string());
        }
        if sign && decrypt && !scheme.is_null() {
            return Err("dual-use key must use the null scheme".to_string());
        }
        if scheme.is_signing() && !sign {
            return Err(format!("signing scheme {:?} on a non-signing key", scheme.scheme));
        }
        if scheme.is_decrypting() && !decrypt {
            return Err(format!("decryption scheme {:?} on a non-decrypting key", scheme.scheme));
        }
        Ok(())
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.type_alg.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf);
        self.parameters.marshal(buf);
        self.unique.marshal(buf);
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let type_alg = alg_from_u16(buf.get_u16()?, "object type")?;
        let name_alg = alg_from_u16(buf.get_u16()?, "name algorithm")?;
        let object_attributes = TpmaObject(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let parameters = TpmtPublicParms::unmarshal_for(type_alg, buf)?;
        let unique = TpmtPublicUnique::unmarshal_for(type_alg, buf)?;
        Ok(Self {
            type_alg,
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// TPM2B_PUBLIC - Public area with size prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2bPublic {
    pub public_area: TpmtPublic,
}

impl Tpm2bPublic {
    pub fn from_template(template: &TpmtPublic) -> Self {
        Self {
            public_area: template.clone(),
        }
    }
}

impl Marshal for Tpm2bPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_sized(&self.public_area);
    }
}

impl Unmarshal for Tpm2bPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            public_area: buf.get_sized()?,
        })
    }
}

/// TPMS_SENSITIVE_CREATE - sent wrapped as TPM2B_SENSITIVE_CREATE
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmsSensitiveCreate {
    pub user_auth: AuthValue,
    pub data: Tpm2bSensitiveData,
}

impl TpmsSensitiveCreate {
    pub fn new(user_auth: AuthValue, data: Vec<u8>) -> Self {
        Self {
            user_auth,
            data: Tpm2bSensitiveData::new(data),
        }
    }

    pub fn with_auth(user_auth: AuthValue) -> Self {
        Self {
            user_auth,
            data: Tpm2bSensitiveData::empty(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl Marshal for TpmsSensitiveCreate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.user_auth.marshal(buf);
        self.data.marshal(buf);
    }
}

impl Unmarshal for TpmsSensitiveCreate {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            user_auth: AuthValue::unmarshal(buf)?,
            data: Tpm2bSensitiveData::unmarshal(buf)?,
        })
    }
}

/// TPMT_TK_* - Tickets produced by CreatePrimary, Hash and VerifySignature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtTicket {
    pub tag: TpmSt,
    pub hierarchy: u32,
    pub digest: Tpm2bDigest,
}

pub type TpmtTkCreation = TpmtTicket;
pub type TpmtTkHashcheck = TpmtTicket;
pub type TpmtTkVerified = TpmtTicket;

impl TpmtTicket {
    /// The NULL hashcheck ticket accepted for unrestricted signing keys
    pub fn null_hashcheck() -> Self {
        Self {
            tag: TpmSt::HashCheck,
            hierarchy: tpm_rh::NULL,
            digest: Tpm2bDigest::empty(),
        }
    }
}

impl Marshal for TpmtTicket {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.tag.to_u16());
        buf.put_u32(self.hierarchy);
        self.digest.marshal(buf);
    }
}

impl Unmarshal for TpmtTicket {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .ok_or_else(|| Error::malformed(format!("invalid ticket tag 0x{:04x}", tag_raw)))?;
        let hierarchy = buf.get_u32()?;
        let digest = Tpm2bDigest::unmarshal(buf)?;
        Ok(Self {
            tag,
            hierarchy,
            digest,
        })
    }
}

/// TPMT_SIGNATURE - Signature union, tagged by signature algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtSignature {
    RsaSsa { hash: TpmAlgId, sig: Vec<u8> },
    RsaPss { hash: TpmAlgId, sig: Vec<u8> },
    EcDsa { hash: TpmAlgId, r: Vec<u8>, s: Vec<u8> },
    Null,
}

impl TpmtSignature {
    pub fn sig_alg(&self) -> TpmAlgId {
        match self {
            TpmtSignature::RsaSsa { .. } => TpmAlgId::RsaSsa,
            TpmtSignature::RsaPss { .. } => TpmAlgId::RsaPss,
            TpmtSignature::EcDsa { .. } => TpmAlgId::EcDsa,
            TpmtSignature::Null => TpmAlgId::Null,
        }
    }

    pub fn hash_alg(&self) -> Option<TpmAlgId> {
        match self {
            TpmtSignature::RsaSsa { hash, .. }
            | TpmtSignature::RsaPss { hash, .. }
            | TpmtSignature::EcDsa { hash, .. } => Some(*hash),
            TpmtSignature::Null => None,
        }
    }
}

impl Marshal for TpmtSignature {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.sig_alg().to_u16());
        match self {
            TpmtSignature::RsaSsa { hash, sig } | TpmtSignature::RsaPss { hash, sig } => {
                buf.put_u16(hash.to_u16());
                buf.put_tpm2b(sig);
            }
            TpmtSignature::EcDsa { hash, r, s } => {
                buf.put_u16(hash.to_u16());
                buf.put_tpm2b(r);
                buf.put_tpm2b(s);
            }
            TpmtSignature::Null => {}
        }
    }
}

impl Unmarshal for TpmtSignature {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let sig_alg = alg_from_u16(buf.get_u16()?, "signature algorithm")?;
        Ok(match sig_alg {
            TpmAlgId::RsaSsa => TpmtSignature::RsaSsa {
                hash: alg_from_u16(buf.get_u16()?, "signature hash")?,
                sig: buf.get_tpm2b()?,
            },
            TpmAlgId::RsaPss => TpmtSignature::RsaPss {
                hash: alg_from_u16(buf.get_u16()?, "signature hash")?,
                sig: buf.get_tpm2b()?,
            },
            TpmAlgId::EcDsa => TpmtSignature::EcDsa {
                hash: alg_from_u16(buf.get_u16()?, "signature hash")?,
                r: buf.get_tpm2b()?,
                s: buf.get_tpm2b()?,
            },
            TpmAlgId::Null => TpmtSignature::Null,
            other => {
                return Err(Error::malformed(format!(
                    "unsupported signature algorithm {:?}",
                    other
                )))
            }
        })
    }
}

/// TPMT_HA - Hash value with algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtHa {
    pub hash_alg: TpmAlgId,
    pub digest: Vec<u8>,
}

impl TpmtHa {
    pub fn sha256(digest: Vec<u8>) -> Self {
        Self {
            hash_alg: TpmAlgId::Sha256,
            digest,
        }
    }
}

impl Marshal for TpmtHa {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash_alg.to_u16());
        buf.put_bytes(&self.digest);
    }
}

impl Unmarshal for TpmtHa {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash_alg = alg_from_u16(buf.get_u16()?, "hash algorithm")?;
        if !hash_alg.is_hash() {
            return Err(Error::malformed(format!("{:?} is not a hash", hash_alg)));
        }
        let digest = buf.get_bytes(hash_alg.digest_size())?;
        Ok(Self { hash_alg, digest })
    }
}

/// TPML_DIGEST_VALUES - List of digest values for PCR extend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmlDigestValues {
    pub digests: Vec<TpmtHa>,
}

impl TpmlDigestValues {
    pub fn single(digest: TpmtHa) -> Self {
        Self {
            digests: vec![digest],
        }
    }
}

impl Marshal for TpmlDigestValues {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_list(&self.digests);
    }
}

impl Unmarshal for TpmlDigestValues {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            digests: buf.get_list()?,
        })
    }
}

// ==================== Capability data ====================

/// TPMS_ALG_PROPERTY
///
/// The algorithm stays a raw identifier: TPMs report algorithms this crate
/// has no name for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmsAlgProperty {
    pub alg: u16,
    pub properties: u32,
}

impl Marshal for TpmsAlgProperty {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.alg);
        buf.put_u32(self.properties);
    }
}

impl Unmarshal for TpmsAlgProperty {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            alg: buf.get_u16()?,
            properties: buf.get_u32()?,
        })
    }
}

/// TPMS_TAGGED_PROPERTY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmsTaggedProperty {
    pub property: u32,
    pub value: u32,
}

impl Marshal for TpmsTaggedProperty {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.property);
        buf.put_u32(self.value);
    }
}

impl Unmarshal for TpmsTaggedProperty {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            property: buf.get_u32()?,
            value: buf.get_u32()?,
        })
    }
}

/// TPMS_TAGGED_PCR_SELECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsTaggedPcrSelect {
    pub tag: u32,
    pub pcr_select: Vec<u8>,
}

impl TpmsTaggedPcrSelect {
    pub fn selected(&self) -> Vec<u32> {
        select_bits(&self.pcr_select)
    }
}

impl Marshal for TpmsTaggedPcrSelect {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.tag);
        buf.put_u8(self.pcr_select.len() as u8);
        buf.put_bytes(&self.pcr_select);
    }
}

impl Unmarshal for TpmsTaggedPcrSelect {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag = buf.get_u32()?;
        let size = buf.get_u8()? as usize;
        Ok(Self {
            tag,
            pcr_select: buf.get_bytes(size)?,
        })
    }
}

impl Marshal for TpmaCc {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.0);
    }
}

impl Unmarshal for TpmaCc {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(TpmaCc(buf.get_u32()?))
    }
}

/// TPMS_CAPABILITY_DATA - capability union, tagged by capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmsCapabilityData {
    Algorithms(Vec<TpmsAlgProperty>),
    Handles(Vec<u32>),
    Commands(Vec<TpmaCc>),
    PpCommands(Vec<u32>),
    AuditCommands(Vec<u32>),
    Pcrs(TpmlPcrSelection),
    TpmProperties(Vec<TpmsTaggedProperty>),
    PcrProperties(Vec<TpmsTaggedPcrSelect>),
    EccCurves(Vec<u16>),
}

/// One entry of a capability list, with the property value that addresses it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityEntry {
    Algorithm(TpmsAlgProperty),
    Handle(u32),
    Command(TpmaCc),
    CommandCode(u32),
    PcrSelection(TpmsPcrSelection),
    TpmProperty(TpmsTaggedProperty),
    PcrProperty(TpmsTaggedPcrSelect),
    EccCurve(u16),
}

impl CapabilityEntry {
    /// The `property` value a GetCapability query would use to start at this entry
    pub fn property(&self) -> u32 {
        match self {
            CapabilityEntry::Algorithm(a) => u32::from(a.alg),
            CapabilityEntry::Handle(h) => *h,
            CapabilityEntry::Command(attr) => attr.command_code(),
            CapabilityEntry::CommandCode(cc) => *cc,
            CapabilityEntry::PcrSelection(sel) => u32::from(sel.hash.to_u16()),
            CapabilityEntry::TpmProperty(p) => p.property,
            CapabilityEntry::PcrProperty(p) => p.tag,
            CapabilityEntry::EccCurve(c) => u32::from(*c),
        }
    }
}

impl TpmsCapabilityData {
    pub fn capability(&self) -> TpmCap {
        match self {
            TpmsCapabilityData::Algorithms(_) => TpmCap::Algs,
            TpmsCapabilityData::Handles(_) => TpmCap::Handles,
            TpmsCapabilityData::Commands(_) => TpmCap::Commands,
            TpmsCapabilityData::PpCommands(_) => TpmCap::PpCommands,
            TpmsCapabilityData::AuditCommands(_) => TpmCap::AuditCommands,
            TpmsCapabilityData::Pcrs(_) => TpmCap::Pcrs,
            TpmsCapabilityData::TpmProperties(_) => TpmCap::TpmProperties,
            TpmsCapabilityData::PcrProperties(_) => TpmCap::PcrProperties,
            TpmsCapabilityData::EccCurves(_) => TpmCap::EccCurves,
        }
    }

    pub fn into_entries(self) -> Vec<CapabilityEntry> {
        match self {
            TpmsCapabilityData::Algorithms(v) => {
                v.into_iter().map(CapabilityEntry::Algorithm).collect()
            }
            TpmsCapabilityData::Handles(v) => v.into_iter().map(CapabilityEntry::Handle).collect(),
            TpmsCapabilityData::Commands(v) => {
                v.into_iter().map(CapabilityEntry::Command).collect()
            }
            TpmsCapabilityData::PpCommands(v) | TpmsCapabilityData::AuditCommands(v) => {
                v.into_iter().map(CapabilityEntry::CommandCode).collect()
            }
            TpmsCapabilityData::Pcrs(v) => v
                .pcr_selections
                .into_iter()
                .map(CapabilityEntry::PcrSelection)
                .collect(),
            TpmsCapabilityData::TpmProperties(v) => {
                v.into_iter().map(CapabilityEntry::TpmProperty).collect()
            }
            TpmsCapabilityData::PcrProperties(v) => {
                v.into_iter().map(CapabilityEntry::PcrProperty).collect()
            }
            TpmsCapabilityData::EccCurves(v) => {
                v.into_iter().map(CapabilityEntry::EccCurve).collect()
            }
        }
    }
}

impl Marshal for TpmsCapabilityData {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.capability().to_u32());
        match self {
            TpmsCapabilityData::Algorithms(v) => buf.put_list(v),
            TpmsCapabilityData::Handles(v)
            | TpmsCapabilityData::PpCommands(v)
            | TpmsCapabilityData::AuditCommands(v) => buf.put_list(v),
            TpmsCapabilityData::Commands(v) => buf.put_list(v),
            TpmsCapabilityData::Pcrs(v) => v.marshal(buf),
            TpmsCapabilityData::TpmProperties(v) => buf.put_list(v),
            TpmsCapabilityData::PcrProperties(v) => buf.put_list(v),
            TpmsCapabilityData::EccCurves(v) => buf.put_list(v),
        }
    }
}

impl Unmarshal for TpmsCapabilityData {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let raw = buf.get_u32()?;
        let cap = TpmCap::from_u32(raw)
            .ok_or_else(|| Error::malformed(format!("unknown capability 0x{:08x}", raw)))?;
        Ok(match cap {
            TpmCap::Algs => TpmsCapabilityData::Algorithms(buf.get_list()?),
            TpmCap::Handles => TpmsCapabilityData::Handles(buf.get_list()?),
            TpmCap::Commands => TpmsCapabilityData::Commands(buf.get_list()?),
            TpmCap::PpCommands => TpmsCapabilityData::PpCommands(buf.get_list()?),
            TpmCap::AuditCommands => TpmsCapabilityData::AuditCommands(buf.get_list()?),
            TpmCap::Pcrs => TpmsCapabilityData::Pcrs(TpmlPcrSelection::unmarshal(buf)?),
            TpmCap::TpmProperties => TpmsCapabilityData::TpmProperties(buf.get_list()?),
            TpmCap::PcrProperties => TpmsCapabilityData::PcrProperties(buf.get_list()?),
            TpmCap::EccCurves => TpmsCapabilityData::EccCurves(buf.get_list()?),
            TpmCap::AuthPolicies => {
                return Err(Error::Unsupported("TPM_CAP_AUTH_POLICIES".to_string()))
            }
        })
    }
}

// ==================== Authorization area ====================

/// TPMS_AUTH_COMMAND - one entry of the command authorization area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsAuthCommand {
    pub session_handle: u32,
    pub nonce: Tpm2bNonce,
    pub attributes: TpmaSa,
    pub hmac: Tpm2bDigest,
}

impl TpmsAuthCommand {
    /// Password authorization: the auth value travels in the clear
    pub fn password(auth: &AuthValue) -> Self {
        Self {
            session_handle: tpm_rh::PW,
            nonce: Tpm2bNonce::empty(),
            attributes: TpmaSa::new().with_continue_session(),
            hmac: Tpm2bDigest::new(auth.as_bytes().to_vec()),
        }
    }
}

impl Marshal for TpmsAuthCommand {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.session_handle);
        self.nonce.marshal(buf);
        buf.put_u8(self.attributes.0);
        self.hmac.marshal(buf);
    }
}

impl Unmarshal for TpmsAuthCommand {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            session_handle: buf.get_u32()?,
            nonce: Tpm2bNonce::unmarshal(buf)?,
            attributes: TpmaSa(buf.get_u8()?),
            hmac: Tpm2bDigest::unmarshal(buf)?,
        })
    }
}

/// TPMS_AUTH_RESPONSE - one entry of the response authorization area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsAuthResponse {
    pub nonce: Tpm2bNonce,
    pub attributes: TpmaSa,
    pub hmac: Tpm2bDigest,
}

impl Marshal for TpmsAuthResponse {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.nonce.marshal(buf);
        buf.put_u8(self.attributes.0);
        self.hmac.marshal(buf);
    }
}

impl Unmarshal for TpmsAuthResponse {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nonce: Tpm2bNonce::unmarshal(buf)?,
            attributes: TpmaSa(buf.get_u8()?),
            hmac: Tpm2bDigest::unmarshal(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Marshal + Unmarshal + PartialEq + fmt::Debug>(value: &T) {
        let bytes = value.to_bytes();
        let decoded = T::from_bytes(&bytes).unwrap();
        assert_eq!(&decoded, value);
    }

    #[test]
    fn test_pcr_selection() {
        let sel = TpmsPcrSelection::sha256(&[0, 1, 2, 7]);
        assert_eq!(sel.hash, TpmAlgId::Sha256);
        // PCR 0, 1, 2, 7 = bits 0, 1, 2, 7 = 0b10000111 = 0x87
        assert_eq!(sel.pcr_select[0], 0x87);
        assert_eq!(sel.selected(), vec![0, 1, 2, 7]);

        let list = TpmlPcrSelection::new(vec![
            TpmsPcrSelection::new(TpmAlgId::Sha1, &[1, 2]),
            TpmsPcrSelection::sha256(&[16, 23]),
        ]);
        roundtrip(&list);
    }

    #[test]
    fn test_public_templates_roundtrip() {
        for template in [
            TpmtPublic::rsa_storage_key(),
            TpmtPublic::rsa_signing_key(TpmAlgId::Sha256),
            TpmtPublic::rsa_decryption_key(TpmAlgId::Sha1),
            TpmtPublic::rsa_general_key(vec![1, 2, 3]),
            TpmtPublic::symmetric_key(TpmtSymDef::aes_128_cfb()),
        ] {
            template.validate().unwrap();
            roundtrip(&template);
            roundtrip(&Tpm2bPublic::from_template(&template));
        }

        let ecc = TpmtPublic {
            type_alg: TpmAlgId::Ecc,
            name_alg: TpmAlgId::Sha384,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_sign_encrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Ecc(TpmsEccParms {
                symmetric: TpmtSymDef::null(),
                scheme: TpmtScheme::ecdsa(TpmAlgId::Sha384),
                curve_id: TpmEccCurve::NistP384,
                kdf: TpmtScheme::null(),
            }),
            unique: TpmtPublicUnique::Ecc(vec![1; 48], vec![2; 48]),
        };
        ecc.validate().unwrap();
        roundtrip(&ecc);
    }

    #[test]
    fn test_template_union_mismatch() {
        let mut template = TpmtPublic::rsa_storage_key();
        template.type_alg = TpmAlgId::Ecc;
        assert!(matches!(template.validate(), Err(Error::InvalidTemplate(_))));

        let mut template = TpmtPublic::rsa_signing_key(TpmAlgId::Sha256);
        template.unique = TpmtPublicUnique::KeyedHash(vec![]);
        assert!(matches!(template.validate(), Err(Error::InvalidTemplate(_))));
    }

    #[test]
    fn test_template_scheme_rules() {
        // Signing scheme on a decrypt-only key
        let mut template = TpmtPublic::rsa_decryption_key(TpmAlgId::Sha256);
        if let TpmtPublicParms::Rsa(parms) = &mut template.parameters {
            parms.scheme = TpmtScheme::rsassa(TpmAlgId::Sha256);
        }
        assert!(template.validate().is_err());

        // Scheme hash missing
        let mut template = TpmtPublic::rsa_signing_key(TpmAlgId::Sha256);
        if let TpmtPublicParms::Rsa(parms) = &mut template.parameters {
            parms.scheme.hash_alg = None;
        }
        assert!(template.validate().is_err());

        // Restricted storage key without a symmetric algorithm
        let mut template = TpmtPublic::rsa_storage_key();
        if let TpmtPublicParms::Rsa(parms) = &mut template.parameters {
            parms.symmetric = TpmtSymDef::null();
        }
        assert!(template.validate().is_err());

        // Cipher key that cannot decrypt, or has no cipher
        let mut template = TpmtPublic::symmetric_key(TpmtSymDef::aes_128_cfb());
        template.object_attributes = TpmaObject::new().with_user_with_auth().with_sign_encrypt();
        assert!(template.validate().is_err());
        assert!(TpmtPublic::symmetric_key(TpmtSymDef::null()).validate().is_err());

        // Odd key size
        let mut template = TpmtPublic::rsa_storage_key();
        if let TpmtPublicParms::Rsa(parms) = &mut template.parameters {
            parms.key_bits = 1000;
        }
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_nv_public_roundtrip() {
        let public = TpmsNvPublic::new(
            0x01000BB9,
            32,
            TpmaNv::new().with_auth_read().with_auth_write(),
        )
        .with_name_alg(TpmAlgId::Sha1);
        public.validate().unwrap();
        roundtrip(&Tpm2bNvPublic { nv_public: public });

        let counter = TpmsNvPublic::counter(0x01000BB9, TpmaNv::new().with_auth_write());
        assert_eq!(counter.data_size, 8);
        counter.validate().unwrap();

        let mut bad = counter.clone();
        bad.data_size = 4;
        assert!(matches!(bad.validate(), Err(Error::InvalidParameter(_))));
        assert!(TpmsNvPublic::new(0x81000001, 8, TpmaNv::new()).validate().is_err());
    }

    #[test]
    fn test_signature_roundtrip() {
        roundtrip(&TpmtSignature::RsaSsa {
            hash: TpmAlgId::Sha1,
            sig: vec![0xAB; 256],
        });
        roundtrip(&TpmtSignature::EcDsa {
            hash: TpmAlgId::Sha256,
            r: vec![1; 32],
            s: vec![2; 32],
        });
        roundtrip(&TpmtSignature::Null);
    }

    #[test]
    fn test_capability_roundtrip() {
        roundtrip(&TpmsCapabilityData::Commands(vec![
            TpmaCc(0x0000_011F),
            TpmaCc(0x0400_0120),
        ]));
        roundtrip(&TpmsCapabilityData::Algorithms(vec![TpmsAlgProperty {
            alg: 0x0001,
            properties: 0x9,
        }]));
        roundtrip(&TpmsCapabilityData::TpmProperties(vec![TpmsTaggedProperty {
            property: tpm_pt::MANUFACTURER,
            value: 0x4D534654,
        }]));
        roundtrip(&TpmsCapabilityData::Pcrs(TpmlPcrSelection::single(
            TpmAlgId::Sha256,
            &(0..24).collect::<Vec<_>>(),
        )));
        roundtrip(&TpmsCapabilityData::PcrProperties(vec![TpmsTaggedPcrSelect {
            tag: 0,
            pcr_select: vec![0xFF, 0xFF, 0xFF],
        }]));
        roundtrip(&TpmsCapabilityData::EccCurves(vec![0x0003, 0x0004]));
    }

    #[test]
    fn test_ticket_and_scheme_roundtrip() {
        roundtrip(&TpmtTicket::null_hashcheck());
        roundtrip(&TpmtScheme::oaep(TpmAlgId::Sha256));
        roundtrip(&TpmtScheme::rsaes());
        roundtrip(&TpmtSymDef::aes_128_cfb());
        roundtrip(&TpmtSymDef::null());
    }

    #[test]
    fn test_auth_value_limits() {
        assert!(AuthValue::new(vec![0u8; 64]).is_ok());
        assert!(matches!(
            AuthValue::new(vec![0u8; 65]),
            Err(Error::InvalidParameter(_))
        ));
        let auth = AuthValue::new(vec![1, 2, 0, 0]).unwrap();
        assert_eq!(auth.trimmed(), &[1, 2]);
        assert_eq!(format!("{:?}", auth), "AuthValue(<4 bytes>)");
    }

    #[test]
    fn test_public_rejects_truncated_unique() {
        let mut bytes = TpmtPublic::rsa_storage_key().to_bytes();
        // Claim a 4-byte modulus that is not there
        let len = bytes.len();
        bytes[len - 1] = 4;
        assert!(matches!(
            TpmtPublic::from_bytes(&bytes),
            Err(Error::MalformedResponse(_))
        ));
    }
}
