// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command framing and response decoding
//!
//! A [`TpmCommand`] collects the handle area and parameter area separately so
//! the session layer can hash them before the authorization area is known.
//! [`TpmResponse`] checks the header, [`ResponseParts`] splits the body into
//! its areas and [`ResponseBody`] gives the parameters their typed shape.

use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::types::*;

/// Size of the command/response header: tag (2) + size (4) + code (4)
pub const HEADER_SIZE: usize = 10;

/// TPM command builder
#[derive(Debug, Clone)]
pub struct TpmCommand {
    code: TpmCc,
    handles: Vec<u32>,
    params: CommandBuffer,
}

impl TpmCommand {
    pub fn new(code: TpmCc) -> Self {
        Self {
            code,
            handles: Vec::with_capacity(2),
            params: CommandBuffer::with_capacity(256),
        }
    }

    pub fn code(&self) -> TpmCc {
        self.code
    }

    /// Add a handle to the handle area
    pub fn add_handle(&mut self, handle: u32) {
        self.handles.push(handle);
    }

    pub fn handles(&self) -> &[u32] {
        &self.handles
    }

    /// Encoded parameter area, as hashed into cpHash
    pub fn parameters(&self) -> &[u8] {
        self.params.as_bytes()
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        self.params.put_bytes(data);
    }

    pub fn add_u8(&mut self, v: u8) {
        self.params.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.params.put_u16(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.params.put_u32(v);
    }

    /// Add a TPM2B structure
    pub fn add_tpm2b(&mut self, data: &[u8]) {
        self.params.put_tpm2b(data);
    }

    pub fn add_tpm2b_empty(&mut self) {
        self.params.put_tpm2b_empty();
    }

    /// Add a marshallable structure
    pub fn add<T: Marshal>(&mut self, value: &T) {
        value.marshal(&mut self.params);
    }

    /// Add a structure wrapped in a TPM2B size prefix
    pub fn add_sized<T: Marshal>(&mut self, value: &T) {
        self.params.put_sized(value);
    }

    /// Encode the full command with the given authorization area.
    ///
    /// An empty authorization area produces a `TPM_ST_NO_SESSIONS` command.
    pub fn finalize(&self, auths: &[TpmsAuthCommand]) -> Vec<u8> {
        let mut buf = CommandBuffer::with_capacity(HEADER_SIZE + 64 + self.params.len());
        let tag = if auths.is_empty() {
            TpmSt::NoSessions
        } else {
            TpmSt::Sessions
        };
        buf.put_u16(tag.to_u16());
        buf.put_u32(0); // Size placeholder
        buf.put_u32(self.code.to_u32());

        for &handle in &self.handles {
            buf.put_u32(handle);
        }

        if !auths.is_empty() {
            let mut area = CommandBuffer::new();
            for auth in auths {
                auth.marshal(&mut area);
            }
            buf.put_u32(area.len() as u32);
            buf.put_bytes(area.as_bytes());
        }

        buf.put_bytes(self.params.as_bytes());

        let size = buf.len() as u32;
        buf.update_u32(2, size);
        buf.into_vec()
    }
}

/// TPM response with a validated header
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: TpmRc,
    pub data: Vec<u8>,
}

impl TpmResponse {
    /// Parse the response header.
    ///
    /// The declared size must equal the received length.
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < HEADER_SIZE {
            return Err(Error::malformed(format!(
                "TPM response too short: {} bytes",
                response.len()
            )));
        }

        let mut buf = ResponseBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .filter(|t| matches!(t, TpmSt::NoSessions | TpmSt::Sessions | TpmSt::RspCommand))
            .ok_or_else(|| Error::malformed(format!("invalid response tag: 0x{:04x}", tag_raw)))?;

        let size = buf.get_u32()? as usize;
        if size != response.len() {
            return Err(Error::malformed(format!(
                "TPM response size mismatch: header says {}, got {}",
                size,
                response.len()
            )));
        }

        let response_code = TpmRc(buf.get_u32()?);
        if tag == TpmSt::RspCommand && response_code.is_success() {
            return Err(Error::malformed("success response with TPM_ST_RSP_COMMAND tag"));
        }

        Ok(Self {
            tag,
            response_code,
            data: response[HEADER_SIZE..].to_vec(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.response_code.is_success()
    }

    /// Turn a non-success code into [`Error::Tpm`]
    pub fn ensure_success(&self, command: TpmCc) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::Tpm {
                command,
                code: self.response_code,
            })
        }
    }

    /// Split a successful response into its handle, parameter and
    /// authorization areas.
    pub fn split(&self, command: TpmCc) -> Result<ResponseParts> {
        self.ensure_success(command)?;
        let mut buf = ResponseBuffer::new(&self.data);

        let mut handles = Vec::with_capacity(command.response_handles());
        for _ in 0..command.response_handles() {
            handles.push(buf.get_u32()?);
        }

        let (parameters, auths) = if self.tag == TpmSt::Sessions {
            let param_size = buf.get_u32()? as usize;
            let parameters = buf.get_bytes(param_size)?;
            let mut auths = Vec::new();
            while buf.remaining() > 0 {
                auths.push(TpmsAuthResponse::unmarshal(&mut buf)?);
            }
            (parameters, auths)
        } else {
            (buf.get_remaining(), Vec::new())
        };

        Ok(ResponseParts {
            handles,
            parameters,
            auths,
        })
    }
}

/// The three areas of a successful response
#[derive(Debug, Clone, Default)]
pub struct ResponseParts {
    pub handles: Vec<u32>,
    /// Parameter area, as hashed into rpHash
    pub parameters: Vec<u8>,
    pub auths: Vec<TpmsAuthResponse>,
}

/// TPM2_CreatePrimary output
#[derive(Debug, Clone)]
pub struct CreatePrimaryResponse {
    pub handle: u32,
    pub out_public: TpmtPublic,
    pub creation_data: Tpm2bCreationData,
    pub creation_hash: Vec<u8>,
    pub creation_ticket: TpmtTkCreation,
    pub name: Vec<u8>,
}

/// TPM2_Create output
#[derive(Debug, Clone)]
pub struct CreateResponse {
    pub out_private: Vec<u8>,
    pub out_public: TpmtPublic,
    pub creation_data: Tpm2bCreationData,
    pub creation_hash: Vec<u8>,
    pub creation_ticket: TpmtTkCreation,
}

/// TPM2_ReadPublic output
#[derive(Debug, Clone)]
pub struct ReadPublicResponse {
    pub out_public: TpmtPublic,
    pub name: Vec<u8>,
    pub qualified_name: Vec<u8>,
}

/// TPM2_PCR_Read output
#[derive(Debug, Clone)]
pub struct PcrReadResponse {
    pub update_counter: u32,
    pub selection: TpmlPcrSelection,
    pub values: Vec<Vec<u8>>,
}

/// Typed response parameters, one shape per command
#[derive(Debug, Clone)]
pub enum ResponseBody {
    /// Commands without response parameters
    Empty,
    GetCapability {
        more: bool,
        data: TpmsCapabilityData,
    },
    GetRandom(Vec<u8>),
    CreatePrimary(Box<CreatePrimaryResponse>),
    Create(Box<CreateResponse>),
    Load {
        handle: u32,
        name: Vec<u8>,
    },
    Import(Vec<u8>),
    ReadPublic(Box<ReadPublicResponse>),
    LoadExternal {
        handle: u32,
        name: Vec<u8>,
    },
    StartAuthSession {
        handle: u32,
        nonce_tpm: Vec<u8>,
    },
    RsaEncrypt(Vec<u8>),
    RsaDecrypt(Vec<u8>),
    Sign(TpmtSignature),
    VerifySignature(TpmtTkVerified),
    Hash {
        digest: Vec<u8>,
        validation: TpmtTkHashcheck,
    },
    /// Shared by EncryptDecrypt and EncryptDecrypt2
    EncryptDecrypt {
        out_data: Vec<u8>,
        iv_out: Vec<u8>,
    },
    NvReadPublic {
        nv_public: TpmsNvPublic,
        name: Vec<u8>,
    },
    NvRead(Vec<u8>),
    PcrRead(PcrReadResponse),
    PcrEvent(TpmlDigestValues),
    PolicyGetDigest(Vec<u8>),
}

impl ResponseBody {
    /// Decode the parameter area of `command`'s response.
    pub fn decode(command: TpmCc, parts: &ResponseParts) -> Result<Self> {
        let mut buf = ResponseBuffer::new(&parts.parameters);
        let handle = || {
            parts
                .handles
                .first()
                .copied()
                .ok_or_else(|| Error::malformed(format!("{:?} response lacks a handle", command)))
        };

        let body = match command {
            TpmCc::Startup
            | TpmCc::Shutdown
            | TpmCc::SelfTest
            | TpmCc::FlushContext
            | TpmCc::EvictControl
            | TpmCc::NvDefineSpace
            | TpmCc::NvUndefineSpace
            | TpmCc::NvWrite
            | TpmCc::NvIncrement
            | TpmCc::PcrExtend
            | TpmCc::PolicyPcr => ResponseBody::Empty,
            TpmCc::GetCapability => {
                let more = buf.get_u8()? != 0;
                let data = TpmsCapabilityData::unmarshal(&mut buf)?;
                ResponseBody::GetCapability { more, data }
            }
            TpmCc::GetRandom => ResponseBody::GetRandom(buf.get_tpm2b()?),
            TpmCc::CreatePrimary => {
                let handle = handle()?;
                let out_public = Tpm2bPublic::unmarshal(&mut buf)?.public_area;
                let creation_data = Tpm2bCreationData::unmarshal(&mut buf)?;
                let creation_hash = buf.get_tpm2b()?;
                let creation_ticket = TpmtTicket::unmarshal(&mut buf)?;
                let name = buf.get_tpm2b()?;
                ResponseBody::CreatePrimary(Box::new(CreatePrimaryResponse {
                    handle,
                    out_public,
                    creation_data,
                    creation_hash,
                    creation_ticket,
                    name,
                }))
            }
            TpmCc::Create => {
                let out_private = buf.get_tpm2b()?;
                let out_public = Tpm2bPublic::unmarshal(&mut buf)?.public_area;
                let creation_data = Tpm2bCreationData::unmarshal(&mut buf)?;
                let creation_hash = buf.get_tpm2b()?;
                let creation_ticket = TpmtTicket::unmarshal(&mut buf)?;
                ResponseBody::Create(Box::new(CreateResponse {
                    out_private,
                    out_public,
                    creation_data,
                    creation_hash,
                    creation_ticket,
                }))
            }
            TpmCc::Load => ResponseBody::Load {
                handle: handle()?,
                name: buf.get_tpm2b()?,
            },
            TpmCc::Import => ResponseBody::Import(buf.get_tpm2b()?),
            TpmCc::ReadPublic => {
                let out_public = Tpm2bPublic::unmarshal(&mut buf)?.public_area;
                let name = buf.get_tpm2b()?;
                let qualified_name = buf.get_tpm2b()?;
                ResponseBody::ReadPublic(Box::new(ReadPublicResponse {
                    out_public,
                    name,
                    qualified_name,
                }))
            }
            TpmCc::LoadExternal => ResponseBody::LoadExternal {
                handle: handle()?,
                name: buf.get_tpm2b()?,
            },
            TpmCc::StartAuthSession => ResponseBody::StartAuthSession {
                handle: handle()?,
                nonce_tpm: buf.get_tpm2b()?,
            },
            TpmCc::RsaEncrypt => ResponseBody::RsaEncrypt(buf.get_tpm2b()?),
            TpmCc::RsaDecrypt => ResponseBody::RsaDecrypt(buf.get_tpm2b()?),
            TpmCc::Sign => ResponseBody::Sign(TpmtSignature::unmarshal(&mut buf)?),
            TpmCc::VerifySignature => {
                ResponseBody::VerifySignature(TpmtTicket::unmarshal(&mut buf)?)
            }
            TpmCc::Hash => ResponseBody::Hash {
                digest: buf.get_tpm2b()?,
                validation: TpmtTicket::unmarshal(&mut buf)?,
            },
            TpmCc::EncryptDecrypt | TpmCc::EncryptDecrypt2 => ResponseBody::EncryptDecrypt {
                out_data: buf.get_tpm2b()?,
                iv_out: buf.get_tpm2b()?,
            },
            TpmCc::NvReadPublic => ResponseBody::NvReadPublic {
                nv_public: Tpm2bNvPublic::unmarshal(&mut buf)?.nv_public,
                name: buf.get_tpm2b()?,
            },
            TpmCc::NvRead => ResponseBody::NvRead(buf.get_tpm2b()?),
            TpmCc::PcrRead => {
                let update_counter = buf.get_u32()?;
                let selection = TpmlPcrSelection::unmarshal(&mut buf)?;
                let values = TpmlDigest::unmarshal(&mut buf)?
                    .digests
                    .into_iter()
                    .map(|d| d.buffer)
                    .collect();
                ResponseBody::PcrRead(PcrReadResponse {
                    update_counter,
                    selection,
                    values,
                })
            }
            TpmCc::PcrEvent => ResponseBody::PcrEvent(TpmlDigestValues::unmarshal(&mut buf)?),
            TpmCc::PolicyGetDigest => ResponseBody::PolicyGetDigest(buf.get_tpm2b()?),
        };
        buf.finish()?;
        Ok(body)
    }
}

/// Error for a decoded body whose shape does not match the verb
pub(crate) fn unexpected_body(command: TpmCc, body: &ResponseBody) -> Error {
    Error::malformed(format!("unexpected response body for {:?}: {:?}", command, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let mut cmd = TpmCommand::new(TpmCc::GetRandom);
        cmd.add_u16(32); // Request 32 random bytes

        let bytes = cmd.finalize(&[]);

        // Check header
        assert_eq!(&bytes[0..2], &[0x80, 0x01]); // TPM_ST_NO_SESSIONS
        assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x01, 0x7B]); // TPM_CC_GetRandom

        // Check size
        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        assert_eq!(size as usize, bytes.len());
    }

    #[test]
    fn test_command_with_password_auth() {
        let mut cmd = TpmCommand::new(TpmCc::NvRead);
        cmd.add_handle(0x01000BB9);
        cmd.add_handle(0x01000BB9);
        cmd.add_u16(8);
        cmd.add_u16(0);

        let auth = AuthValue::new(b"abc".to_vec()).unwrap();
        let bytes = cmd.finalize(&[TpmsAuthCommand::password(&auth)]);

        assert_eq!(&bytes[0..2], &[0x80, 0x02]); // TPM_ST_SESSIONS
        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        assert_eq!(size as usize, bytes.len());
        // Authorization area: handle (4) + nonce (2) + attrs (1) + hmac (2 + 3)
        assert_eq!(&bytes[18..22], &[0, 0, 0, 12]);
        assert_eq!(&bytes[22..26], &tpm_rh::PW.to_be_bytes());
        assert_eq!(&bytes[bytes.len() - 4..], &[0, 8, 0, 0]);
    }

    #[test]
    fn test_response_parse() {
        // Minimal success response
        let response = vec![
            0x80, 0x01, // TPM_ST_NO_SESSIONS
            0x00, 0x00, 0x00, 0x0A, // Size = 10
            0x00, 0x00, 0x00, 0x00, // TPM_RC_SUCCESS
        ];

        let parsed = TpmResponse::parse(&response).unwrap();
        assert!(parsed.is_success());
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn test_response_size_must_match() {
        let response = vec![
            0x80, 0x01, 0x00, 0x00, 0x00, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        assert!(matches!(
            TpmResponse::parse(&response),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_error_response_skips_body() {
        // NV_RANGE with a garbage body that must not be parsed
        let response = vec![
            0x80, 0x01, 0x00, 0x00, 0x00, 0x0C, 0x00, 0x00, 0x01, 0x46, 0xFF, 0xFF,
        ];
        let parsed = TpmResponse::parse(&response).unwrap();
        match parsed.split(TpmCc::NvRead) {
            Err(Error::Tpm { command, code }) => {
                assert_eq!(command, TpmCc::NvRead);
                assert_eq!(code, TpmRc::NV_RANGE);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_split_and_decode_session_response() {
        let mut body = CommandBuffer::new();
        body.put_u32(8); // parameterSize
        body.put_tpm2b(&[1, 2, 3, 4, 5, 6]);
        TpmsAuthResponse {
            nonce: Tpm2bNonce::new(vec![9; 16]),
            attributes: TpmaSa::new().with_continue_session(),
            hmac: Tpm2bDigest::empty(),
        }
        .marshal(&mut body);

        let mut response = CommandBuffer::new();
        response.put_u16(TpmSt::Sessions.to_u16());
        response.put_u32((HEADER_SIZE + body.len()) as u32);
        response.put_u32(0);
        response.put_bytes(body.as_bytes());

        let parsed = TpmResponse::parse(response.as_bytes()).unwrap();
        let parts = parsed.split(TpmCc::NvRead).unwrap();
        assert_eq!(parts.auths.len(), 1);
        assert_eq!(parts.auths[0].nonce.buffer, vec![9; 16]);

        match ResponseBody::decode(TpmCc::NvRead, &parts).unwrap() {
            ResponseBody::NvRead(data) => assert_eq!(data, vec![1, 2, 3, 4, 5, 6]),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_decode_cipher_and_load_bodies() {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(&[1, 2, 3]);
        params.put_tpm2b(&[9; 16]);
        let parts = ResponseParts {
            handles: vec![],
            parameters: params.into_vec(),
            auths: vec![],
        };
        for command in [TpmCc::EncryptDecrypt, TpmCc::EncryptDecrypt2] {
            match ResponseBody::decode(command, &parts).unwrap() {
                ResponseBody::EncryptDecrypt { out_data, iv_out } => {
                    assert_eq!(out_data, vec![1, 2, 3]);
                    assert_eq!(iv_out, vec![9; 16]);
                }
                other => panic!("unexpected body: {:?}", other),
            }
        }

        // Load returns the object handle ahead of its name
        let parts = ResponseParts {
            handles: vec![],
            parameters: vec![0, 2, 0xAB, 0xCD],
            auths: vec![],
        };
        assert!(matches!(
            ResponseBody::decode(TpmCc::Load, &parts),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_parameters() {
        let parts = ResponseParts {
            handles: vec![],
            parameters: vec![0, 1, 0xAA, 0xBB],
            auths: vec![],
        };
        assert!(matches!(
            ResponseBody::decode(TpmCc::GetRandom, &parts),
            Err(Error::MalformedResponse(_))
        ));
    }
}
