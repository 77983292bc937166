//! Framing: `opcode | length (2 bytes BE) | [prefix] | [connection id] | headers`.
//! Header encoding is selected by the header ID (see `HeaderKind`).

use tracing::warn;

use crate::headers::{HeaderKind, HeaderSet, HeaderValue};
use crate::protocol::{
    header_id, Opcode, ResponseCode, CONNECT_PREFIX_LEN, MIN_MTU, OBEX_VERSION, PREAMBLE_LEN,
    SETPATH_PREFIX_LEN,
};

const MAX_FRAME_LEN: usize = 0xFFFF;

/// Size of a 4-byte quantity header on the wire (ID + value).
pub const INT_HEADER_LEN: usize = 5;

/// Size of the `id | length` prefix of variable-length headers.
pub const HEADER_PREFIX_LEN: usize = 3;

fn is_body(id: u8) -> bool {
    id == header_id::BODY || id == header_id::END_OF_BODY
}

/// Serialize headers. BODY and END_OF_BODY always come last, END_OF_BODY after BODY.
/// A header whose encoding would not fit its 16-bit length field is refused.
pub fn encode_headers(headers: &HeaderSet) -> Result<Vec<u8>, FrameEncodeError> {
    if let Some((id, len)) = headers
        .iter()
        .map(|(id, v)| (id, header_len(id, v)))
        .find(|&(_, len)| len > MAX_FRAME_LEN)
    {
        return Err(FrameEncodeError::HeaderTooLarge { id, len });
    }
    let mut out = Vec::with_capacity(encoded_len(headers));
    write_headers(headers, None, &mut out);
    Ok(out)
}

/// Number of bytes `encode_headers` would produce.
pub fn encoded_len(headers: &HeaderSet) -> usize {
    headers.iter().map(|(id, v)| header_len(id, v)).sum()
}

fn write_headers(headers: &HeaderSet, skip: Option<u8>, out: &mut Vec<u8>) {
    for (id, v) in headers.iter() {
        if !is_body(id) && Some(id) != skip {
            write_header(id, v, out);
        }
    }
    for id in [header_id::BODY, header_id::END_OF_BODY] {
        if let Some(v) = headers.get(id) {
            write_header(id, v, out);
        }
    }
}

/// Unicode headers carry the UTF-8 bytes of the string, each widened to a
/// `0x00, byte` pair, then a `00 00` terminator.
fn unicode_payload(s: &str) -> Vec<u8> {
    // Empty names go out as a bare 3-byte header.
    if s.is_empty() {
        return Vec::new();
    }
    let mut payload = Vec::with_capacity(s.len() * 2 + 2);
    for &b in s.as_bytes() {
        payload.extend_from_slice(&[0, b]);
    }
    payload.extend_from_slice(&[0, 0]);
    payload
}

fn latin1_payload(s: &str) -> Vec<u8> {
    let mut payload: Vec<u8> = s.chars().map(|c| c as u8).collect();
    payload.push(0);
    payload
}

fn header_len(id: u8, value: &HeaderValue) -> usize {
    match (HeaderKind::of(id), value) {
        (HeaderKind::Int4, HeaderValue::Int(_)) => INT_HEADER_LEN,
        (HeaderKind::Byte, HeaderValue::Int(_)) => 2,
        (HeaderKind::Unicode, HeaderValue::Text(s)) if s.is_empty() => HEADER_PREFIX_LEN,
        (HeaderKind::Unicode, HeaderValue::Text(s)) => {
            HEADER_PREFIX_LEN + s.len() * 2 + 2
        }
        (HeaderKind::Latin1, HeaderValue::Text(s)) => HEADER_PREFIX_LEN + s.chars().count() + 1,
        (HeaderKind::Bytes, HeaderValue::Bytes(b)) => HEADER_PREFIX_LEN + b.len(),
        _ => 0,
    }
}

/// Callers have checked the length against `MAX_FRAME_LEN`.
fn write_prefixed(out: &mut Vec<u8>, id: u8, payload: &[u8]) {
    let len = (HEADER_PREFIX_LEN + payload.len()) as u16;
    out.push(id);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
}

fn write_header(id: u8, value: &HeaderValue, out: &mut Vec<u8>) {
    match (HeaderKind::of(id), value) {
        (HeaderKind::Int4, HeaderValue::Int(v)) => {
            out.push(id);
            out.extend_from_slice(&v.to_be_bytes());
        }
        (HeaderKind::Byte, HeaderValue::Int(v)) => {
            out.push(id);
            out.push(*v as u8);
        }
        (HeaderKind::Unicode, HeaderValue::Text(s)) => write_prefixed(out, id, &unicode_payload(s)),
        (HeaderKind::Latin1, HeaderValue::Text(s)) => write_prefixed(out, id, &latin1_payload(s)),
        (HeaderKind::Bytes, HeaderValue::Bytes(b)) => write_prefixed(out, id, b),
        (kind, v) => warn!(id, ?kind, ?v, "skipping header with mismatched encoding"),
    }
}

/// Reverse of `unicode_payload`: the low byte of each pair, read as UTF-8.
fn decode_unicode(payload: &[u8]) -> String {
    let mut bytes: Vec<u8> = payload.chunks_exact(2).map(|pair| pair[1]).collect();
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn decode_latin1(payload: &[u8]) -> String {
    // Some peers omit the terminating zero.
    let payload = match payload.last() {
        Some(0) => &payload[..payload.len() - 1],
        _ => payload,
    };
    payload.iter().map(|&b| b as char).collect()
}

/// Parse headers from `data[offset..]`. A header that would run past the end
/// stops decoding; everything decoded before it is returned.
pub fn decode_headers(data: &[u8], offset: usize) -> HeaderSet {
    let mut headers = HeaderSet::new();
    let mut pos = offset;
    while pos < data.len() {
        let id = data[pos];
        let kind = HeaderKind::of(id);
        let (value, consumed) = match kind {
            HeaderKind::Int4 => {
                if pos + INT_HEADER_LEN > data.len() {
                    warn!(id, pos, "truncated 4-byte header, dropping rest of frame");
                    break;
                }
                let v = u32::from_be_bytes([
                    data[pos + 1],
                    data[pos + 2],
                    data[pos + 3],
                    data[pos + 4],
                ]);
                (HeaderValue::Int(v), INT_HEADER_LEN)
            }
            HeaderKind::Byte => {
                if pos + 2 > data.len() {
                    warn!(id, pos, "truncated 1-byte header, dropping rest of frame");
                    break;
                }
                (HeaderValue::Int(data[pos + 1] as u32), 2)
            }
            HeaderKind::Unicode | HeaderKind::Latin1 | HeaderKind::Bytes => {
                if pos + HEADER_PREFIX_LEN > data.len() {
                    warn!(id, pos, "truncated header prefix, dropping rest of frame");
                    break;
                }
                let len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
                if len < HEADER_PREFIX_LEN || pos + len > data.len() {
                    warn!(id, pos, len, "header length out of range, dropping rest of frame");
                    break;
                }
                let payload = &data[pos + HEADER_PREFIX_LEN..pos + len];
                let value = match kind {
                    HeaderKind::Unicode => HeaderValue::Text(decode_unicode(payload)),
                    HeaderKind::Latin1 => HeaderValue::Text(decode_latin1(payload)),
                    _ => HeaderValue::Bytes(payload.to_vec()),
                };
                (value, len)
            }
        };
        headers.insert(id, value);
        pos += consumed;
    }
    headers
}

/// Error building a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
    #[error("header 0x{id:02X} too large ({len} bytes)")]
    HeaderTooLarge { id: u8, len: usize },
}

/// Error decoding a frame (need more bytes or inconsistent length).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("{0}")]
    Malformed(&'static str),
}

fn encode_frame(
    code: u8,
    prefix: &[u8],
    connection_id: Option<u32>,
    headers: &HeaderSet,
) -> Result<Vec<u8>, FrameEncodeError> {
    let conn_len = connection_id.map_or(0, |_| INT_HEADER_LEN);
    let skip = connection_id.map(|_| header_id::CONNECTION_ID);
    let headers_len = encoded_len(headers)
        - skip
            .and_then(|id| headers.get(id).map(|v| header_len(id, v)))
            .unwrap_or(0);
    let len = PREAMBLE_LEN + prefix.len() + conn_len + headers_len;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge(len));
    }
    let mut out = Vec::with_capacity(len);
    out.push(code);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(prefix);
    if let Some(id) = connection_id {
        out.push(header_id::CONNECTION_ID);
        out.extend_from_slice(&id.to_be_bytes());
    }
    write_headers(headers, skip, &mut out);
    Ok(out)
}

/// Build a request frame. The prefix (CONNECT parameters or SETPATH flags)
/// precedes the connection id header.
pub fn encode_request(
    opcode: Opcode,
    prefix: &[u8],
    connection_id: Option<u32>,
    headers: &HeaderSet,
) -> Result<Vec<u8>, FrameEncodeError> {
    encode_frame(opcode.as_byte(), prefix, connection_id, headers)
}

/// Build a response frame.
pub fn encode_response(
    code: ResponseCode,
    prefix: &[u8],
    headers: &HeaderSet,
) -> Result<Vec<u8>, FrameEncodeError> {
    encode_frame(code.as_byte(), prefix, None, headers)
}

/// Read the total frame length from the 3-byte preamble.
pub fn frame_len(preamble: &[u8; PREAMBLE_LEN]) -> Result<usize, FrameDecodeError> {
    let len = u16::from_be_bytes([preamble[1], preamble[2]]) as usize;
    if len < PREAMBLE_LEN {
        return Err(FrameDecodeError::Malformed("length field shorter than preamble"));
    }
    Ok(len)
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes.
pub fn decode_frame(bytes: &[u8]) -> Result<(RawFrame, usize), FrameDecodeError> {
    if bytes.len() < PREAMBLE_LEN {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len(&[bytes[0], bytes[1], bytes[2]])?;
    if bytes.len() < len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((RawFrame::from_bytes(bytes[..len].to_vec()), len))
}

/// CONNECT parameters carried in requests and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams {
    pub version: u8,
    pub flags: u8,
    pub max_packet_size: u16,
}

impl ConnectParams {
    pub fn new(max_packet_size: u16) -> Self {
        Self {
            version: OBEX_VERSION,
            flags: 0,
            max_packet_size,
        }
    }

    pub fn to_bytes(self) -> [u8; CONNECT_PREFIX_LEN] {
        let mtu = self.max_packet_size.to_be_bytes();
        [self.version, self.flags, mtu[0], mtu[1]]
    }

    /// Negotiated packet size: the smaller of ours and the peer's.
    pub fn negotiate(self, local: u16) -> Result<u16, FrameDecodeError> {
        if self.max_packet_size < MIN_MTU {
            return Err(FrameDecodeError::Malformed("peer max packet size below minimum"));
        }
        Ok(self.max_packet_size.min(local))
    }
}

/// SETPATH flags. On the wire bit0 = back up a level, bit1 = don't create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetPathFlags {
    pub backup: bool,
    pub create: bool,
}

impl SetPathFlags {
    pub fn to_bytes(self) -> [u8; SETPATH_PREFIX_LEN] {
        let mut flags = 0u8;
        if self.backup {
            flags |= 0x01;
        }
        if !self.create {
            flags |= 0x02;
        }
        [flags, 0]
    }

    pub fn from_byte(flags: u8) -> Self {
        Self {
            backup: flags & 0x01 != 0,
            create: flags & 0x02 == 0,
        }
    }
}

/// One complete frame as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    bytes: Vec<u8>,
}

impl RawFrame {
    /// `bytes` must hold exactly one frame (the transport guarantees this).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn code(&self) -> u8 {
        self.bytes.first().copied().unwrap_or(0)
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_byte(self.code())
    }

    pub fn response_code(&self) -> ResponseCode {
        ResponseCode(self.code())
    }

    /// Headers of a plain frame (after the preamble).
    pub fn headers(&self) -> HeaderSet {
        decode_headers(&self.bytes, PREAMBLE_LEN)
    }

    /// CONNECT request/response: fixed parameters, then headers.
    pub fn connect_parts(&self) -> Result<(ConnectParams, HeaderSet), FrameDecodeError> {
        let start = PREAMBLE_LEN + CONNECT_PREFIX_LEN;
        if self.bytes.len() < start {
            return Err(FrameDecodeError::Malformed("CONNECT frame shorter than its parameters"));
        }
        let params = ConnectParams {
            version: self.bytes[3],
            flags: self.bytes[4],
            max_packet_size: u16::from_be_bytes([self.bytes[5], self.bytes[6]]),
        };
        Ok((params, decode_headers(&self.bytes, start)))
    }

    /// SETPATH request: flags, then headers.
    pub fn setpath_parts(&self) -> Result<(SetPathFlags, HeaderSet), FrameDecodeError> {
        let start = PREAMBLE_LEN + SETPATH_PREFIX_LEN;
        if self.bytes.len() < start {
            return Err(FrameDecodeError::Malformed("SETPATH frame shorter than its flags"));
        }
        Ok((
            SetPathFlags::from_byte(self.bytes[3]),
            decode_headers(&self.bytes, start),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_headers() -> HeaderSet {
        let mut hs = HeaderSet::new();
        hs.set_name("report.txt");
        hs.set_type("text/plain").unwrap();
        hs.set_length(1234);
        hs.set_description("");
        hs.set_target(vec![0xF9, 0xEC, 0x7B, 0xC4]);
        hs.set(header_id::SRM, HeaderValue::Int(1)).unwrap();
        hs
    }

    #[test]
    fn roundtrip_headers() {
        let hs = sample_headers();
        let bytes = encode_headers(&hs).unwrap();
        assert_eq!(bytes.len(), encoded_len(&hs));
        assert_eq!(decode_headers(&bytes, 0), hs);
    }

    #[test]
    fn name_is_widened_with_terminator() {
        let mut hs = HeaderSet::new();
        hs.set_name("ab");
        let bytes = encode_headers(&hs).unwrap();
        assert_eq!(bytes, vec![0x01, 0x00, 0x09, 0, b'a', 0, b'b', 0, 0]);
    }

    #[test]
    fn non_ascii_name_widens_utf8_bytes() {
        let mut hs = HeaderSet::new();
        hs.set_name("é");
        let bytes = encode_headers(&hs).unwrap();
        assert_eq!(bytes, vec![0x01, 0x00, 0x09, 0x00, 0xC3, 0x00, 0xA9, 0x00, 0x00]);
        assert_eq!(bytes.len(), encoded_len(&hs));
    }

    #[test]
    fn widened_utf8_name_decodes() {
        let bytes = [0x01, 0x00, 0x09, 0x00, 0xC3, 0x00, 0xA9, 0x00, 0x00];
        assert_eq!(decode_headers(&bytes, 0).name(), Some("é"));

        // "€" is E2 82 AC in UTF-8
        let bytes = [0x05, 0x00, 0x0B, 0x00, 0xE2, 0x00, 0x82, 0x00, 0xAC, 0x00, 0x00];
        assert_eq!(decode_headers(&bytes, 0).description(), Some("€"));
    }

    #[test]
    fn oversized_header_refused() {
        let mut hs = HeaderSet::new();
        hs.set_body(vec![0u8; MAX_FRAME_LEN]);
        assert!(matches!(
            encode_headers(&hs),
            Err(FrameEncodeError::HeaderTooLarge {
                id: header_id::BODY,
                ..
            })
        ));
    }

    #[test]
    fn empty_name_is_bare_header() {
        let mut hs = HeaderSet::new();
        hs.set_name("");
        let bytes = encode_headers(&hs).unwrap();
        assert_eq!(bytes, vec![0x01, 0x00, 0x03]);
        assert_eq!(decode_headers(&bytes, 0).name(), Some(""));
    }

    #[test]
    fn type_without_terminator_accepted() {
        let bytes = [0x42, 0x00, 0x07, b'a', b'/', b'b', b'c'];
        assert_eq!(decode_headers(&bytes, 0).content_type(), Some("a/bc"));
    }

    #[test]
    fn end_of_body_serialized_last() {
        let mut hs = HeaderSet::new();
        hs.set_end_of_body(vec![9, 9]);
        hs.set_body(vec![1, 2, 3]);
        hs.set_length(5);
        let bytes = encode_headers(&hs).unwrap();
        // LENGTH (5) | BODY (6) | END_OF_BODY (5)
        assert_eq!(bytes[0], header_id::LENGTH);
        assert_eq!(bytes[5], header_id::BODY);
        assert_eq!(bytes[11], header_id::END_OF_BODY);
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn empty_end_of_body_decodes() {
        let bytes = [0x49, 0x00, 0x03];
        let hs = decode_headers(&bytes, 0);
        assert_eq!(hs.end_of_body(), Some(&[][..]));
    }

    #[test]
    fn partial_decode_keeps_earlier_headers() {
        let mut hs = HeaderSet::new();
        hs.set_length(42);
        hs.set_name("x");
        let mut bytes = encode_headers(&hs).unwrap();
        // BODY header claiming 100 bytes with only 2 present
        bytes.extend_from_slice(&[0x48, 0x00, 0x64, 1, 2]);
        let decoded = decode_headers(&bytes, 0);
        assert_eq!(decoded.length(), Some(42));
        assert_eq!(decoded.name(), Some("x"));
        assert!(decoded.body().is_none());
    }

    #[test]
    fn zero_length_header_stops_decoding() {
        let bytes = [0x48, 0x00, 0x00, 0xC3, 0, 0, 0, 1];
        assert!(decode_headers(&bytes, 0).is_empty());
    }

    #[test]
    fn request_carries_connection_id_after_prefix() {
        let mut hs = HeaderSet::new();
        hs.set_name("dir");
        let flags = SetPathFlags {
            backup: true,
            create: false,
        };
        let frame = encode_request(Opcode::SetPath, &flags.to_bytes(), Some(7), &hs).unwrap();
        assert_eq!(frame[0], 0x85);
        assert_eq!(u16::from_be_bytes([frame[1], frame[2]]) as usize, frame.len());
        assert_eq!(&frame[3..5], &[0x03, 0x00]);
        assert_eq!(&frame[5..10], &[0xCB, 0, 0, 0, 7]);
        let (parsed_flags, parsed) = RawFrame::from_bytes(frame).setpath_parts().unwrap();
        assert_eq!(parsed_flags, flags);
        assert_eq!(parsed.connection_id(), Some(7));
        assert_eq!(parsed.name(), Some("dir"));
    }

    #[test]
    fn explicit_connection_id_not_duplicated() {
        let mut hs = HeaderSet::new();
        hs.set_connection_id(1);
        let frame = encode_request(Opcode::Disconnect, &[], Some(9), &hs).unwrap();
        assert_eq!(frame.len(), 8);
        assert_eq!(RawFrame::from_bytes(frame).headers().connection_id(), Some(9));
    }

    #[test]
    fn connect_parts() {
        let params = ConnectParams::new(0x0400);
        let frame = encode_response(ResponseCode::SUCCESS, &params.to_bytes(), &HeaderSet::new())
            .unwrap();
        let (p, hs) = RawFrame::from_bytes(frame).connect_parts().unwrap();
        assert_eq!(p, params);
        assert!(hs.is_empty());
        assert_eq!(p.negotiate(0x2000).unwrap(), 0x0400);
    }

    #[test]
    fn short_connect_is_malformed() {
        let frame = RawFrame::from_bytes(vec![0xA0, 0x00, 0x03]);
        assert!(matches!(
            frame.connect_parts(),
            Err(FrameDecodeError::Malformed(_))
        ));
    }

    #[test]
    fn tiny_peer_mtu_rejected() {
        assert!(ConnectParams::new(100).negotiate(0x2000).is_err());
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_response(ResponseCode::CONTINUE, &[], &sample_headers()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded.response_code(), ResponseCode::CONTINUE);
        assert_eq!(decoded.headers(), sample_headers());
    }

    #[test]
    fn bad_length_field_is_malformed() {
        assert!(matches!(
            decode_frame(&[0xA0, 0x00, 0x01]),
            Err(FrameDecodeError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut hs = HeaderSet::new();
        hs.set_body(vec![0u8; MAX_FRAME_LEN]);
        assert!(matches!(
            encode_request(Opcode::Put, &[], None, &hs),
            Err(FrameEncodeError::TooLarge(_))
        ));
    }

    #[test]
    fn multiple_frames() {
        let a = encode_response(ResponseCode::CONTINUE, &[], &HeaderSet::new()).unwrap();
        let b = encode_response(ResponseCode::SUCCESS, &[], &sample_headers()).unwrap();
        let mut buf = a.clone();
        buf.extend_from_slice(&b);
        let (f1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, a.len());
        let (f2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, b.len());
        assert_eq!(f1.response_code(), ResponseCode::CONTINUE);
        assert_eq!(f2.response_code(), ResponseCode::SUCCESS);
    }
}
