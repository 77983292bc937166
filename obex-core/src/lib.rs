//! OBEX session engine core.
//! No I/O: header model, wire codec, authentication and session state; hosts drive the transport.

pub mod auth;
pub mod body;
pub mod error;
pub mod exchange;
pub mod headers;
pub mod protocol;
pub mod session;
pub mod wire;

pub use auth::{CredentialProvider, Credentials, StaticCredentials};
pub use body::BodyBuffer;
pub use error::ObexError;
pub use exchange::Exchange;
pub use headers::{HeaderKind, HeaderSet, HeaderValue};
pub use protocol::{header_id, Opcode, ResponseCode, DEFAULT_MTU, OBEX_VERSION};
pub use session::{ClientState, SessionState};
pub use wire::{
    decode_frame, decode_headers, encode_headers, encode_request, encode_response, ConnectParams,
    FrameDecodeError, FrameEncodeError, RawFrame, SetPathFlags,
};
