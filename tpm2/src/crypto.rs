// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Hash and HMAC primitives used by the session layer

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::constants::TpmAlgId;
use crate::error::{Error, Result};

/// Digest and keyed-hash collaborator.
///
/// Inputs are given as parts that are hashed as if concatenated.
pub trait KeyedHash: Send + Sync {
    fn digest(&self, alg: TpmAlgId, data: &[&[u8]]) -> Result<Vec<u8>>;

    fn hmac(&self, alg: TpmAlgId, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>>;

    /// Check an HMAC without leaking where it differs.
    fn hmac_verify(
        &self,
        alg: TpmAlgId,
        key: &[u8],
        data: &[&[u8]],
        expected: &[u8],
    ) -> Result<bool> {
        let actual = self.hmac(alg, key, data)?;
        Ok(actual.len() == expected.len()
            && actual
                .iter()
                .zip(expected)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0)
    }
}

/// [`KeyedHash`] backed by the RustCrypto `sha1`, `sha2` and `hmac` crates
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareCrypto;

fn hash_parts<D: Digest>(data: &[&[u8]]) -> Vec<u8> {
    let mut hasher = D::new();
    for part in data {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

macro_rules! with_hmac {
    ($alg:expr, $key:expr, |$mac:ident| $body:expr) => {
        match $alg {
            TpmAlgId::Sha1 => {
                let mut $mac = Hmac::<Sha1>::new_from_slice($key)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
                $body
            }
            TpmAlgId::Sha256 => {
                let mut $mac = Hmac::<Sha256>::new_from_slice($key)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
                $body
            }
            TpmAlgId::Sha384 => {
                let mut $mac = Hmac::<Sha384>::new_from_slice($key)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
                $body
            }
            TpmAlgId::Sha512 => {
                let mut $mac = Hmac::<Sha512>::new_from_slice($key)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
                $body
            }
            other => return Err(Error::Unsupported(format!("HMAC with {:?}", other))),
        }
    };
}

impl KeyedHash for SoftwareCrypto {
    fn digest(&self, alg: TpmAlgId, data: &[&[u8]]) -> Result<Vec<u8>> {
        Ok(match alg {
            TpmAlgId::Sha1 => hash_parts::<Sha1>(data),
            TpmAlgId::Sha256 => hash_parts::<Sha256>(data),
            TpmAlgId::Sha384 => hash_parts::<Sha384>(data),
            TpmAlgId::Sha512 => hash_parts::<Sha512>(data),
            other => return Err(Error::Unsupported(format!("digest with {:?}", other))),
        })
    }

    fn hmac(&self, alg: TpmAlgId, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>> {
        Ok(with_hmac!(alg, key, |mac| {
            for part in data {
                mac.update(part);
            }
            mac.finalize().into_bytes().to_vec()
        }))
    }

    fn hmac_verify(
        &self,
        alg: TpmAlgId,
        key: &[u8],
        data: &[&[u8]],
        expected: &[u8],
    ) -> Result<bool> {
        Ok(with_hmac!(alg, key, |mac| {
            for part in data {
                mac.update(part);
            }
            mac.verify_slice(expected).is_ok()
        }))
    }
}

/// Object or NV index name: nameAlg followed by H(public area).
pub fn compute_name(
    crypto: &dyn KeyedHash,
    name_alg: TpmAlgId,
    public_area: &[u8],
) -> Result<Vec<u8>> {
    let digest = crypto.digest(name_alg, &[public_area])?;
    let mut name = Vec::with_capacity(2 + digest.len());
    name.extend_from_slice(&name_alg.to_u16().to_be_bytes());
    name.extend_from_slice(&digest);
    Ok(name)
}

/// Fresh random bytes for caller nonces
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    getrandom::getrandom(&mut buf).map_err(|e| Error::Crypto(e.to_string()))?;
    Ok(buf)
}
