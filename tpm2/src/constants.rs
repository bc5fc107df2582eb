// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants and command codes

use std::fmt;

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TpmCc {
    EvictControl = 0x00000120,
    NvUndefineSpace = 0x00000122,
    NvDefineSpace = 0x0000012A,
    CreatePrimary = 0x00000131,
    NvIncrement = 0x00000134,
    NvWrite = 0x00000137,
    PcrEvent = 0x0000013C,
    SelfTest = 0x00000143,
    Startup = 0x00000144,
    Shutdown = 0x00000145,
    NvRead = 0x0000014E,
    Create = 0x00000153,
    Import = 0x00000156,
    Load = 0x00000157,
    RsaDecrypt = 0x00000159,
    Sign = 0x0000015D,
    EncryptDecrypt = 0x00000164,
    FlushContext = 0x00000165,
    LoadExternal = 0x00000167,
    NvReadPublic = 0x00000169,
    ReadPublic = 0x00000173,
    RsaEncrypt = 0x00000174,
    StartAuthSession = 0x00000176,
    VerifySignature = 0x00000177,
    GetCapability = 0x0000017A,
    GetRandom = 0x0000017B,
    Hash = 0x0000017D,
    PcrRead = 0x0000017E,
    PolicyPcr = 0x0000017F,
    PcrExtend = 0x00000182,
    PolicyGetDigest = 0x00000189,
    EncryptDecrypt2 = 0x00000193,
}

impl TpmCc {
    /// Lowest command code defined by the library specification (TPM_CC_FIRST)
    pub const FIRST: u32 = 0x0000011F;
    /// Highest command code defined by the library specification (TPM_CC_LAST)
    pub const LAST: u32 = 0x00000193;

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0x00000120 => TpmCc::EvictControl,
            0x00000122 => TpmCc::NvUndefineSpace,
            0x0000012A => TpmCc::NvDefineSpace,
            0x00000131 => TpmCc::CreatePrimary,
            0x00000134 => TpmCc::NvIncrement,
            0x00000137 => TpmCc::NvWrite,
            0x0000013C => TpmCc::PcrEvent,
            0x00000143 => TpmCc::SelfTest,
            0x00000144 => TpmCc::Startup,
            0x00000145 => TpmCc::Shutdown,
            0x0000014E => TpmCc::NvRead,
            0x00000153 => TpmCc::Create,
            0x00000156 => TpmCc::Import,
            0x00000157 => TpmCc::Load,
            0x00000159 => TpmCc::RsaDecrypt,
            0x0000015D => TpmCc::Sign,
            0x00000164 => TpmCc::EncryptDecrypt,
            0x00000165 => TpmCc::FlushContext,
            0x00000167 => TpmCc::LoadExternal,
            0x00000169 => TpmCc::NvReadPublic,
            0x00000173 => TpmCc::ReadPublic,
            0x00000174 => TpmCc::RsaEncrypt,
            0x00000176 => TpmCc::StartAuthSession,
            0x00000177 => TpmCc::VerifySignature,
            0x0000017A => TpmCc::GetCapability,
            0x0000017B => TpmCc::GetRandom,
            0x0000017D => TpmCc::Hash,
            0x0000017E => TpmCc::PcrRead,
            0x0000017F => TpmCc::PolicyPcr,
            0x00000182 => TpmCc::PcrExtend,
            0x00000189 => TpmCc::PolicyGetDigest,
            0x00000193 => TpmCc::EncryptDecrypt2,
            _ => return None,
        })
    }

    /// Number of handles in the command handle area
    pub fn command_handles(self) -> usize {
        match self {
            TpmCc::EvictControl
            | TpmCc::NvUndefineSpace
            | TpmCc::NvIncrement
            | TpmCc::NvWrite
            | TpmCc::NvRead
            | TpmCc::StartAuthSession => 2,
            TpmCc::NvDefineSpace
            | TpmCc::CreatePrimary
            | TpmCc::Create
            | TpmCc::Load
            | TpmCc::Import
            | TpmCc::EncryptDecrypt
            | TpmCc::EncryptDecrypt2
            | TpmCc::PcrEvent
            | TpmCc::RsaDecrypt
            | TpmCc::Sign
            | TpmCc::NvReadPublic
            | TpmCc::ReadPublic
            | TpmCc::RsaEncrypt
            | TpmCc::VerifySignature
            | TpmCc::PolicyPcr
            | TpmCc::PcrExtend
            | TpmCc::PolicyGetDigest => 1,
            // flushHandle is a parameter
            TpmCc::FlushContext
            | TpmCc::SelfTest
            | TpmCc::Startup
            | TpmCc::Shutdown
            | TpmCc::LoadExternal
            | TpmCc::GetCapability
            | TpmCc::GetRandom
            | TpmCc::Hash
            | TpmCc::PcrRead => 0,
        }
    }

    /// Number of handles in the response handle area
    pub fn response_handles(self) -> usize {
        match self {
            TpmCc::CreatePrimary
            | TpmCc::Load
            | TpmCc::LoadExternal
            | TpmCc::StartAuthSession => 1,
            _ => 0,
        }
    }
}

/// TPM 2.0 Response Code (TPM_RC)
///
/// Kept as the raw 32-bit value so vendor and layered codes survive intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TpmRc(pub u32);

impl TpmRc {
    const RC_VER1: u32 = 0x100;
    const RC_FMT1: u32 = 0x080;
    const RC_WARN: u32 = 0x900;

    pub const SUCCESS: TpmRc = TpmRc(0x000);

    // Format 0 errors
    pub const INITIALIZE: TpmRc = TpmRc(Self::RC_VER1);
    pub const FAILURE: TpmRc = TpmRc(Self::RC_VER1 + 0x001);
    pub const SEQUENCE: TpmRc = TpmRc(Self::RC_VER1 + 0x003);
    pub const DISABLED: TpmRc = TpmRc(Self::RC_VER1 + 0x020);
    pub const EXCLUSIVE: TpmRc = TpmRc(Self::RC_VER1 + 0x021);
    pub const AUTH_TYPE: TpmRc = TpmRc(Self::RC_VER1 + 0x024);
    pub const AUTH_MISSING: TpmRc = TpmRc(Self::RC_VER1 + 0x025);
    pub const POLICY: TpmRc = TpmRc(Self::RC_VER1 + 0x026);
    pub const PCR: TpmRc = TpmRc(Self::RC_VER1 + 0x027);
    pub const PCR_CHANGED: TpmRc = TpmRc(Self::RC_VER1 + 0x028);
    pub const UPGRADE: TpmRc = TpmRc(Self::RC_VER1 + 0x02D);
    pub const TOO_MANY_CONTEXTS: TpmRc = TpmRc(Self::RC_VER1 + 0x02E);
    pub const AUTH_UNAVAILABLE: TpmRc = TpmRc(Self::RC_VER1 + 0x02F);
    pub const REBOOT: TpmRc = TpmRc(Self::RC_VER1 + 0x030);
    pub const UNBALANCED: TpmRc = TpmRc(Self::RC_VER1 + 0x031);
    pub const COMMAND_SIZE: TpmRc = TpmRc(Self::RC_VER1 + 0x042);
    pub const COMMAND_CODE: TpmRc = TpmRc(Self::RC_VER1 + 0x043);
    pub const AUTHSIZE: TpmRc = TpmRc(Self::RC_VER1 + 0x044);
    pub const AUTH_CONTEXT: TpmRc = TpmRc(Self::RC_VER1 + 0x045);
    pub const NV_RANGE: TpmRc = TpmRc(Self::RC_VER1 + 0x046);
    pub const NV_SIZE: TpmRc = TpmRc(Self::RC_VER1 + 0x047);
    pub const NV_LOCKED: TpmRc = TpmRc(Self::RC_VER1 + 0x048);
    pub const NV_AUTHORIZATION: TpmRc = TpmRc(Self::RC_VER1 + 0x049);
    pub const NV_UNINITIALIZED: TpmRc = TpmRc(Self::RC_VER1 + 0x04A);
    pub const NV_SPACE: TpmRc = TpmRc(Self::RC_VER1 + 0x04B);
    pub const NV_DEFINED: TpmRc = TpmRc(Self::RC_VER1 + 0x04C);
    pub const BAD_CONTEXT: TpmRc = TpmRc(Self::RC_VER1 + 0x050);
    pub const CP_HASH: TpmRc = TpmRc(Self::RC_VER1 + 0x051);
    pub const PARENT: TpmRc = TpmRc(Self::RC_VER1 + 0x052);
    pub const NEEDS_TEST: TpmRc = TpmRc(Self::RC_VER1 + 0x053);
    pub const NO_RESULT: TpmRc = TpmRc(Self::RC_VER1 + 0x054);
    pub const SENSITIVE: TpmRc = TpmRc(Self::RC_VER1 + 0x055);

    // Format 1 errors (number carried in the low six bits)
    pub const ASYMMETRIC: TpmRc = TpmRc(Self::RC_FMT1 + 0x001);
    pub const ATTRIBUTES: TpmRc = TpmRc(Self::RC_FMT1 + 0x002);
    pub const HASH: TpmRc = TpmRc(Self::RC_FMT1 + 0x003);
    pub const VALUE: TpmRc = TpmRc(Self::RC_FMT1 + 0x004);
    pub const HIERARCHY: TpmRc = TpmRc(Self::RC_FMT1 + 0x005);
    pub const KEY_SIZE: TpmRc = TpmRc(Self::RC_FMT1 + 0x007);
    pub const MGF: TpmRc = TpmRc(Self::RC_FMT1 + 0x008);
    pub const MODE: TpmRc = TpmRc(Self::RC_FMT1 + 0x009);
    pub const TYPE: TpmRc = TpmRc(Self::RC_FMT1 + 0x00A);
    pub const HANDLE: TpmRc = TpmRc(Self::RC_FMT1 + 0x00B);
    pub const KDF: TpmRc = TpmRc(Self::RC_FMT1 + 0x00C);
    pub const RANGE: TpmRc = TpmRc(Self::RC_FMT1 + 0x00D);
    pub const AUTH_FAIL: TpmRc = TpmRc(Self::RC_FMT1 + 0x00E);
    pub const NONCE: TpmRc = TpmRc(Self::RC_FMT1 + 0x00F);
    pub const PP: TpmRc = TpmRc(Self::RC_FMT1 + 0x010);
    pub const SCHEME: TpmRc = TpmRc(Self::RC_FMT1 + 0x012);
    pub const SIZE: TpmRc = TpmRc(Self::RC_FMT1 + 0x015);
    pub const SYMMETRIC: TpmRc = TpmRc(Self::RC_FMT1 + 0x016);
    pub const TAG: TpmRc = TpmRc(Self::RC_FMT1 + 0x017);
    pub const SELECTOR: TpmRc = TpmRc(Self::RC_FMT1 + 0x018);
    pub const INSUFFICIENT: TpmRc = TpmRc(Self::RC_FMT1 + 0x01A);
    pub const SIGNATURE: TpmRc = TpmRc(Self::RC_FMT1 + 0x01B);
    pub const KEY: TpmRc = TpmRc(Self::RC_FMT1 + 0x01C);
    pub const POLICY_FAIL: TpmRc = TpmRc(Self::RC_FMT1 + 0x01D);
    pub const INTEGRITY: TpmRc = TpmRc(Self::RC_FMT1 + 0x01F);
    pub const TICKET: TpmRc = TpmRc(Self::RC_FMT1 + 0x020);
    pub const BAD_AUTH: TpmRc = TpmRc(Self::RC_FMT1 + 0x022);
    pub const EXPIRED: TpmRc = TpmRc(Self::RC_FMT1 + 0x023);
    pub const POLICY_CC: TpmRc = TpmRc(Self::RC_FMT1 + 0x024);
    pub const BINDING: TpmRc = TpmRc(Self::RC_FMT1 + 0x025);
    pub const CURVE: TpmRc = TpmRc(Self::RC_FMT1 + 0x026);

    // Warnings
    pub const CONTEXT_GAP: TpmRc = TpmRc(Self::RC_WARN + 0x001);
    pub const OBJECT_MEMORY: TpmRc = TpmRc(Self::RC_WARN + 0x002);
    pub const SESSION_MEMORY: TpmRc = TpmRc(Self::RC_WARN + 0x003);
    pub const MEMORY: TpmRc = TpmRc(Self::RC_WARN + 0x004);
    pub const SESSION_HANDLES: TpmRc = TpmRc(Self::RC_WARN + 0x005);
    pub const OBJECT_HANDLES: TpmRc = TpmRc(Self::RC_WARN + 0x006);
    pub const LOCALITY: TpmRc = TpmRc(Self::RC_WARN + 0x007);
    pub const YIELDED: TpmRc = TpmRc(Self::RC_WARN + 0x008);
    pub const CANCELED: TpmRc = TpmRc(Self::RC_WARN + 0x009);
    pub const TESTING: TpmRc = TpmRc(Self::RC_WARN + 0x00A);
    pub const NV_RATE: TpmRc = TpmRc(Self::RC_WARN + 0x020);
    pub const LOCKOUT: TpmRc = TpmRc(Self::RC_WARN + 0x021);
    pub const RETRY: TpmRc = TpmRc(Self::RC_WARN + 0x022);
    pub const NV_UNAVAILABLE: TpmRc = TpmRc(Self::RC_WARN + 0x023);

    pub fn from_u32(code: u32) -> Self {
        TpmRc(code)
    }

    pub fn to_u32(self) -> u32 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Format-one codes carry a parameter, handle or session number.
    pub fn is_format_one(self) -> bool {
        self.0 & Self::RC_FMT1 != 0
    }

    pub fn is_warning(self) -> bool {
        !self.is_format_one() && self.0 & 0x800 != 0
    }

    /// The code with its parameter/handle/session qualifier stripped.
    pub fn base(self) -> TpmRc {
        if self.is_format_one() {
            TpmRc(Self::RC_FMT1 | (self.0 & 0x03F))
        } else {
            TpmRc(self.0 & 0xFFF)
        }
    }

    /// 1-based parameter number the error refers to.
    pub fn parameter(self) -> Option<u8> {
        if self.is_format_one() && self.0 & 0x040 != 0 {
            Some(((self.0 >> 8) & 0xF) as u8)
        } else {
            None
        }
    }

    /// 1-based handle number the error refers to.
    pub fn handle(self) -> Option<u8> {
        let n = ((self.0 >> 8) & 0xF) as u8;
        if self.is_format_one() && self.0 & 0x040 == 0 && (1..8).contains(&n) {
            Some(n)
        } else {
            None
        }
    }

    /// 1-based session number the error refers to.
    pub fn session(self) -> Option<u8> {
        let n = ((self.0 >> 8) & 0xF) as u8;
        if self.is_format_one() && self.0 & 0x040 == 0 && n >= 8 {
            Some(n - 8)
        } else {
            None
        }
    }

    /// Codes after which the same command may simply be sent again.
    pub fn is_retry(self) -> bool {
        matches!(self.base(), TpmRc::RETRY | TpmRc::YIELDED | TpmRc::TESTING)
    }

    fn name(self) -> Option<&'static str> {
        Some(match self.base() {
            TpmRc::SUCCESS => "TPM_RC_SUCCESS",
            TpmRc::INITIALIZE => "TPM_RC_INITIALIZE",
            TpmRc::FAILURE => "TPM_RC_FAILURE",
            TpmRc::SEQUENCE => "TPM_RC_SEQUENCE",
            TpmRc::DISABLED => "TPM_RC_DISABLED",
            TpmRc::AUTH_MISSING => "TPM_RC_AUTH_MISSING",
            TpmRc::POLICY => "TPM_RC_POLICY",
            TpmRc::COMMAND_SIZE => "TPM_RC_COMMAND_SIZE",
            TpmRc::COMMAND_CODE => "TPM_RC_COMMAND_CODE",
            TpmRc::AUTHSIZE => "TPM_RC_AUTHSIZE",
            TpmRc::AUTH_CONTEXT => "TPM_RC_AUTH_CONTEXT",
            TpmRc::NV_RANGE => "TPM_RC_NV_RANGE",
            TpmRc::NV_SIZE => "TPM_RC_NV_SIZE",
            TpmRc::NV_LOCKED => "TPM_RC_NV_LOCKED",
            TpmRc::NV_AUTHORIZATION => "TPM_RC_NV_AUTHORIZATION",
            TpmRc::NV_UNINITIALIZED => "TPM_RC_NV_UNINITIALIZED",
            TpmRc::NV_SPACE => "TPM_RC_NV_SPACE",
            TpmRc::NV_DEFINED => "TPM_RC_NV_DEFINED",
            TpmRc::ATTRIBUTES => "TPM_RC_ATTRIBUTES",
            TpmRc::HASH => "TPM_RC_HASH",
            TpmRc::VALUE => "TPM_RC_VALUE",
            TpmRc::HIERARCHY => "TPM_RC_HIERARCHY",
            TpmRc::KEY_SIZE => "TPM_RC_KEY_SIZE",
            TpmRc::TYPE => "TPM_RC_TYPE",
            TpmRc::HANDLE => "TPM_RC_HANDLE",
            TpmRc::AUTH_FAIL => "TPM_RC_AUTH_FAIL",
            TpmRc::SCHEME => "TPM_RC_SCHEME",
            TpmRc::SIZE => "TPM_RC_SIZE",
            TpmRc::SIGNATURE => "TPM_RC_SIGNATURE",
            TpmRc::KEY => "TPM_RC_KEY",
            TpmRc::POLICY_FAIL => "TPM_RC_POLICY_FAIL",
            TpmRc::BAD_AUTH => "TPM_RC_BAD_AUTH",
            TpmRc::OBJECT_MEMORY => "TPM_RC_OBJECT_MEMORY",
            TpmRc::SESSION_MEMORY => "TPM_RC_SESSION_MEMORY",
            TpmRc::YIELDED => "TPM_RC_YIELDED",
            TpmRc::CANCELED => "TPM_RC_CANCELED",
            TpmRc::TESTING => "TPM_RC_TESTING",
            TpmRc::LOCKOUT => "TPM_RC_LOCKOUT",
            TpmRc::RETRY => "TPM_RC_RETRY",
            TpmRc::NV_UNAVAILABLE => "TPM_RC_NV_UNAVAILABLE",
            _ => return None,
        })
    }
}

impl fmt::Display for TpmRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:08x})", name, self.0)?,
            None => write!(f, "TPM error 0x{:08x}", self.0)?,
        }
        if let Some(n) = self.parameter() {
            write!(f, ", parameter {}", n)?;
        } else if let Some(n) = self.handle() {
            write!(f, ", handle {}", n)?;
        } else if let Some(n) = self.session() {
            write!(f, ", session {}", n)?;
        }
        Ok(())
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
#[repr(u16)]
pub enum TpmAlgId {
    Rsa = 0x0001,
    Sha1 = 0x0004,
    Hmac = 0x0005,
    Aes = 0x0006,
    Mgf1 = 0x0007,
    KeyedHash = 0x0008,
    Xor = 0x000A,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Null = 0x0010,
    RsaSsa = 0x0014,
    RsaEs = 0x0015,
    RsaPss = 0x0016,
    Oaep = 0x0017,
    EcDsa = 0x0018,
    Ecdh = 0x0019,
    Kdf1Sp800_108 = 0x0022,
    Ecc = 0x0023,
    SymCipher = 0x0025,
    Ctr = 0x0040,
    Ofb = 0x0041,
    Cbc = 0x0042,
    Cfb = 0x0043,
    Ecb = 0x0044,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0001 => TpmAlgId::Rsa,
            0x0004 => TpmAlgId::Sha1,
            0x0005 => TpmAlgId::Hmac,
            0x0006 => TpmAlgId::Aes,
            0x0007 => TpmAlgId::Mgf1,
            0x0008 => TpmAlgId::KeyedHash,
            0x000A => TpmAlgId::Xor,
            0x000B => TpmAlgId::Sha256,
            0x000C => TpmAlgId::Sha384,
            0x000D => TpmAlgId::Sha512,
            0x0010 => TpmAlgId::Null,
            0x0014 => TpmAlgId::RsaSsa,
            0x0015 => TpmAlgId::RsaEs,
            0x0016 => TpmAlgId::RsaPss,
            0x0017 => TpmAlgId::Oaep,
            0x0018 => TpmAlgId::EcDsa,
            0x0019 => TpmAlgId::Ecdh,
            0x0022 => TpmAlgId::Kdf1Sp800_108,
            0x0023 => TpmAlgId::Ecc,
            0x0025 => TpmAlgId::SymCipher,
            0x0040 => TpmAlgId::Ctr,
            0x0041 => TpmAlgId::Ofb,
            0x0042 => TpmAlgId::Cbc,
            0x0043 => TpmAlgId::Cfb,
            0x0044 => TpmAlgId::Ecb,
            _ => return None,
        })
    }

    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            TpmAlgId::Sha384 => 48,
            TpmAlgId::Sha512 => 64,
            _ => 0,
        }
    }

    pub fn is_hash(self) -> bool {
        self.digest_size() != 0
    }

    /// Schemes whose details structure is a single hash algorithm
    pub fn scheme_has_hash(self) -> bool {
        matches!(
            self,
            TpmAlgId::RsaSsa
                | TpmAlgId::RsaPss
                | TpmAlgId::Oaep
                | TpmAlgId::EcDsa
                | TpmAlgId::Ecdh
                | TpmAlgId::Hmac
                | TpmAlgId::Mgf1
                | TpmAlgId::Kdf1Sp800_108
        )
    }
}

/// TPM 2.0 Handle Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmHt {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
}

impl TpmHt {
    pub fn of(handle: u32) -> Option<Self> {
        Some(match (handle >> 24) as u8 {
            0x00 => TpmHt::Pcr,
            0x01 => TpmHt::NvIndex,
            0x02 => TpmHt::HmacSession,
            0x03 => TpmHt::PolicySession,
            0x40 => TpmHt::Permanent,
            0x80 => TpmHt::Transient,
            0x81 => TpmHt::Persistent,
            _ => return None,
        })
    }

    /// Entities whose name is the handle value itself
    pub fn name_is_handle(self) -> bool {
        matches!(
            self,
            TpmHt::Pcr | TpmHt::HmacSession | TpmHt::PolicySession | TpmHt::Permanent
        )
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const PW: u32 = 0x40000009; // Password authorization
    pub const LOCKOUT: u32 = 0x4000000A;
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PLATFORM: u32 = 0x4000000C;

    pub fn is_hierarchy(handle: u32) -> bool {
        matches!(handle, OWNER | ENDORSEMENT | PLATFORM | NULL)
    }
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

impl TpmSe {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(TpmSe::Hmac),
            0x01 => Some(TpmSe::Policy),
            0x03 => Some(TpmSe::Trial),
            _ => None,
        }
    }
}

/// TPM 2.0 Startup Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSu {
    Clear = 0x0000,
    State = 0x0001,
}

/// TPM 2.0 Capability Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCap {
    Algs = 0x00000000,
    Handles = 0x00000001,
    Commands = 0x00000002,
    PpCommands = 0x00000003,
    AuditCommands = 0x00000004,
    Pcrs = 0x00000005,
    TpmProperties = 0x00000006,
    PcrProperties = 0x00000007,
    EccCurves = 0x00000008,
    AuthPolicies = 0x00000009,
}

impl TpmCap {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0x00000000 => TpmCap::Algs,
            0x00000001 => TpmCap::Handles,
            0x00000002 => TpmCap::Commands,
            0x00000003 => TpmCap::PpCommands,
            0x00000004 => TpmCap::AuditCommands,
            0x00000005 => TpmCap::Pcrs,
            0x00000006 => TpmCap::TpmProperties,
            0x00000007 => TpmCap::PcrProperties,
            0x00000008 => TpmCap::EccCurves,
            0x00000009 => TpmCap::AuthPolicies,
            _ => return None,
        })
    }
}

/// TPM 2.0 property tags (TPM_PT) for `TpmCap::TpmProperties`
pub mod tpm_pt {
    pub const FIXED: u32 = 0x100;
    pub const FAMILY_INDICATOR: u32 = FIXED;
    pub const REVISION: u32 = FIXED + 2;
    pub const MANUFACTURER: u32 = FIXED + 5;
    pub const VENDOR_STRING_1: u32 = FIXED + 6;
    pub const FIRMWARE_VERSION_1: u32 = FIXED + 11;
    pub const INPUT_BUFFER: u32 = FIXED + 13;
    pub const PCR_COUNT: u32 = FIXED + 18;
    pub const MAX_COMMAND_SIZE: u32 = FIXED + 30;
    pub const MAX_RESPONSE_SIZE: u32 = FIXED + 31;
    pub const MAX_DIGEST: u32 = FIXED + 32;
    pub const TOTAL_COMMANDS: u32 = FIXED + 41;
    pub const NV_BUFFER_MAX: u32 = FIXED + 44;
}

/// TPM 2.0 Object Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const ST_CLEAR: u32 = 1 << 2;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const ADMIN_WITH_POLICY: u32 = 1 << 7;
    pub const NO_DA: u32 = 1 << 10;
    pub const ENCRYPTED_DUPLICATION: u32 = 1 << 11;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN_ENCRYPT: u32 = 1 << 18;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn with_fixed_tpm(mut self) -> Self {
        self.0 |= Self::FIXED_TPM;
        self
    }

    pub fn with_fixed_parent(mut self) -> Self {
        self.0 |= Self::FIXED_PARENT;
        self
    }

    pub fn with_sensitive_data_origin(mut self) -> Self {
        self.0 |= Self::SENSITIVE_DATA_ORIGIN;
        self
    }

    pub fn with_user_with_auth(mut self) -> Self {
        self.0 |= Self::USER_WITH_AUTH;
        self
    }

    pub fn with_restricted(mut self) -> Self {
        self.0 |= Self::RESTRICTED;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    pub fn with_sign_encrypt(mut self) -> Self {
        self.0 |= Self::SIGN_ENCRYPT;
        self
    }
}

/// NV index types carried in bits 4..7 of TPMA_NV (TPM_NT)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmNt {
    Ordinary = 0x0,
    Counter = 0x1,
    Bits = 0x2,
    Extend = 0x4,
    PinFail = 0x8,
    PinPass = 0x9,
}

/// TPM 2.0 NV Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaNv(pub u32);

impl TpmaNv {
    pub const PP_WRITE: u32 = 1 << 0;
    pub const OWNER_WRITE: u32 = 1 << 1;
    pub const AUTH_WRITE: u32 = 1 << 2;
    pub const POLICY_WRITE: u32 = 1 << 3;
    const TYPE_SHIFT: u32 = 4;
    const TYPE_MASK: u32 = 0xF << Self::TYPE_SHIFT;
    pub const PP_READ: u32 = 1 << 16;
    pub const OWNER_READ: u32 = 1 << 17;
    pub const AUTH_READ: u32 = 1 << 18;
    pub const POLICY_READ: u32 = 1 << 19;
    pub const NO_DA: u32 = 1 << 25;
    pub const ORDERLY: u32 = 1 << 26;
    pub const CLEAR_STCLEAR: u32 = 1 << 27;
    pub const READ_LOCKED: u32 = 1 << 28;
    pub const WRITTEN: u32 = 1 << 29;
    pub const PLATFORM_CREATE: u32 = 1 << 30;
    pub const READ_STCLEAR: u32 = 1 << 31;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn with_owner_write(mut self) -> Self {
        self.0 |= Self::OWNER_WRITE;
        self
    }

    pub fn with_owner_read(mut self) -> Self {
        self.0 |= Self::OWNER_READ;
        self
    }

    pub fn with_auth_write(mut self) -> Self {
        self.0 |= Self::AUTH_WRITE;
        self
    }

    pub fn with_auth_read(mut self) -> Self {
        self.0 |= Self::AUTH_READ;
        self
    }

    pub fn with_no_da(mut self) -> Self {
        self.0 |= Self::NO_DA;
        self
    }

    pub fn with_type(mut self, nt: TpmNt) -> Self {
        self.0 = (self.0 & !Self::TYPE_MASK) | ((nt as u32) << Self::TYPE_SHIFT);
        self
    }

    pub fn with_counter(self) -> Self {
        self.with_type(TpmNt::Counter)
    }

    pub fn nv_type(self) -> Option<TpmNt> {
        Some(match (self.0 & Self::TYPE_MASK) >> Self::TYPE_SHIFT {
            0x0 => TpmNt::Ordinary,
            0x1 => TpmNt::Counter,
            0x2 => TpmNt::Bits,
            0x4 => TpmNt::Extend,
            0x8 => TpmNt::PinFail,
            0x9 => TpmNt::PinPass,
            _ => return None,
        })
    }

    pub fn is_counter(self) -> bool {
        self.nv_type() == Some(TpmNt::Counter)
    }
}

/// TPM 2.0 Session Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaSa(pub u8);

impl TpmaSa {
    pub const CONTINUE_SESSION: u8 = 1 << 0;
    pub const AUDIT_EXCLUSIVE: u8 = 1 << 1;
    pub const AUDIT_RESET: u8 = 1 << 2;
    pub const DECRYPT: u8 = 1 << 5;
    pub const ENCRYPT: u8 = 1 << 6;
    pub const AUDIT: u8 = 1 << 7;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_continue_session(mut self) -> Self {
        self.0 |= Self::CONTINUE_SESSION;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    pub fn with_encrypt(mut self) -> Self {
        self.0 |= Self::ENCRYPT;
        self
    }

    pub fn continue_session(self) -> bool {
        self.0 & Self::CONTINUE_SESSION != 0
    }
}

/// TPMA_CC - command attributes reported by `TpmCap::Commands`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmaCc(pub u32);

impl TpmaCc {
    pub const NV: u32 = 1 << 22;
    pub const EXTENSIVE: u32 = 1 << 23;
    pub const FLUSHED: u32 = 1 << 24;
    pub const R_HANDLE: u32 = 1 << 28;
    pub const V: u32 = 1 << 29;

    pub fn command_index(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn c_handles(self) -> u8 {
        ((self.0 >> 25) & 0x7) as u8
    }

    pub fn is_vendor(self) -> bool {
        self.0 & Self::V != 0
    }

    /// The TPM_CC this attribute word describes
    pub fn command_code(self) -> u32 {
        u32::from(self.command_index()) | (self.0 & Self::V)
    }
}

/// TPM command header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    RspCommand = 0x00C4,
    Null = 0x8000,
    NoSessions = 0x8001,
    Sessions = 0x8002,
    Creation = 0x8021,
    Verified = 0x8022,
    AuthSecret = 0x8023,
    HashCheck = 0x8024,
    AuthSigned = 0x8025,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x00C4 => Some(TpmSt::RspCommand),
            0x8000 => Some(TpmSt::Null),
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x8021 => Some(TpmSt::Creation),
            0x8022 => Some(TpmSt::Verified),
            0x8023 => Some(TpmSt::AuthSecret),
            0x8024 => Some(TpmSt::HashCheck),
            0x8025 => Some(TpmSt::AuthSigned),
            _ => None,
        }
    }
}

/// ECC Curve IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmEccCurve {
    None = 0x0000,
    NistP256 = 0x0003,
    NistP384 = 0x0004,
    NistP521 = 0x0005,
}

impl TpmEccCurve {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0000 => Some(TpmEccCurve::None),
            0x0003 => Some(TpmEccCurve::NistP256),
            0x0004 => Some(TpmEccCurve::NistP384),
            0x0005 => Some(TpmEccCurve::NistP521),
            _ => None,
        }
    }
}

/// RSA Key Bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RsaKeyBits {
    Rsa1024 = 1024,
    Rsa2048 = 2048,
    Rsa3072 = 3072,
    Rsa4096 = 4096,
}

impl RsaKeyBits {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1024 => Some(RsaKeyBits::Rsa1024),
            2048 => Some(RsaKeyBits::Rsa2048),
            3072 => Some(RsaKeyBits::Rsa3072),
            4096 => Some(RsaKeyBits::Rsa4096),
            _ => None,
        }
    }
}
