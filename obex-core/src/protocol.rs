//! OBEX wire constants: opcodes, response codes, header IDs, version.

/// OBEX protocol version sent in CONNECT (1.0).
pub const OBEX_VERSION: u8 = 0x10;

/// Default maximum packet size offered at CONNECT.
pub const DEFAULT_MTU: u16 = 0x2000;

/// Smallest maximum packet size a peer may announce.
pub const MIN_MTU: u16 = 255;

/// Size of the `opcode | length` preamble that starts every frame.
pub const PREAMBLE_LEN: usize = 3;

/// Size of the CONNECT prefix (`version | flags | max packet size`).
pub const CONNECT_PREFIX_LEN: usize = 4;

/// Size of the SETPATH prefix (`flags | constants`).
pub const SETPATH_PREFIX_LEN: usize = 2;

/// Bit set on an opcode to mark the final packet of a request.
pub const FINAL_BIT: u8 = 0x80;

/// Request opcodes. The final bit is part of the variant so that
/// "continue" and "final" packets are distinct at the type level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Connect,
    Disconnect,
    Put,
    PutFinal,
    Get,
    GetFinal,
    SetPath,
    Session,
    Abort,
}

impl Opcode {
    pub fn as_byte(self) -> u8 {
        match self {
            Opcode::Connect => 0x80,
            Opcode::Disconnect => 0x81,
            Opcode::Put => 0x02,
            Opcode::PutFinal => 0x82,
            Opcode::Get => 0x03,
            Opcode::GetFinal => 0x83,
            Opcode::SetPath => 0x85,
            Opcode::Session => 0x87,
            Opcode::Abort => 0xFF,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x80 => Opcode::Connect,
            0x81 => Opcode::Disconnect,
            0x02 => Opcode::Put,
            0x82 => Opcode::PutFinal,
            0x03 => Opcode::Get,
            0x83 => Opcode::GetFinal,
            0x85 => Opcode::SetPath,
            0x87 => Opcode::Session,
            0xFF => Opcode::Abort,
            _ => return None,
        })
    }

    pub fn is_final(self) -> bool {
        self.as_byte() & FINAL_BIT != 0
    }
}

/// Response code byte. Servers may answer with any code, so this is an open newtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode(pub u8);

impl ResponseCode {
    pub const CONTINUE: ResponseCode = ResponseCode(0x90);
    pub const SUCCESS: ResponseCode = ResponseCode(0xA0);
    pub const CREATED: ResponseCode = ResponseCode(0xA1);
    pub const ACCEPTED: ResponseCode = ResponseCode(0xA2);
    pub const NO_CONTENT: ResponseCode = ResponseCode(0xA4);
    pub const BAD_REQUEST: ResponseCode = ResponseCode(0xC0);
    pub const UNAUTHORIZED: ResponseCode = ResponseCode(0xC1);
    pub const FORBIDDEN: ResponseCode = ResponseCode(0xC3);
    pub const NOT_FOUND: ResponseCode = ResponseCode(0xC4);
    pub const NOT_ACCEPTABLE: ResponseCode = ResponseCode(0xC6);
    pub const CONFLICT: ResponseCode = ResponseCode(0xC9);
    pub const REQUEST_ENTITY_TOO_LARGE: ResponseCode = ResponseCode(0xCD);
    pub const INTERNAL_ERROR: ResponseCode = ResponseCode(0xD0);
    pub const NOT_IMPLEMENTED: ResponseCode = ResponseCode(0xD1);
    pub const SERVICE_UNAVAILABLE: ResponseCode = ResponseCode(0xD3);

    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// 0xA0..=0xAF with the final bit set.
    pub fn is_success(self) -> bool {
        self.0 & 0xF0 == 0xA0
    }

    pub fn is_continue(self) -> bool {
        self == ResponseCode::CONTINUE
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Well-known header IDs. The two high bits select the wire encoding.
pub mod header_id {
    pub const COUNT: u8 = 0xC0;
    pub const NAME: u8 = 0x01;
    pub const TYPE: u8 = 0x42;
    pub const LENGTH: u8 = 0xC3;
    pub const TIME_ISO8601: u8 = 0x44;
    pub const TIME_4BYTE: u8 = 0xC4;
    pub const DESCRIPTION: u8 = 0x05;
    pub const TARGET: u8 = 0x46;
    pub const HTTP: u8 = 0x47;
    pub const BODY: u8 = 0x48;
    pub const END_OF_BODY: u8 = 0x49;
    pub const WHO: u8 = 0x4A;
    pub const CONNECTION_ID: u8 = 0xCB;
    pub const APP_PARAMETERS: u8 = 0x4C;
    pub const AUTH_CHALLENGE: u8 = 0x4D;
    pub const AUTH_RESPONSE: u8 = 0x4E;
    pub const CREATOR_ID: u8 = 0xCF;
    pub const OBJECT_CLASS: u8 = 0x4F;
    pub const SESSION_PARAMETERS: u8 = 0x52;
    pub const SESSION_SEQUENCE: u8 = 0x93;
    pub const SRM: u8 = 0x97;
}
