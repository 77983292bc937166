//! MD5 challenge/response authentication carried in AUTH_CHALLENGE (0x4D) and
//! AUTH_RESPONSE (0x4E) headers. Payloads are tag-length-value triples.

use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use rand::RngCore;

use crate::error::ObexError;
use crate::protocol::header_id;

pub const NONCE_LEN: usize = 16;

const TAG_DIGEST: u8 = 0x00;
const TAG_OPTIONS: u8 = 0x01;
const TAG_REALM: u8 = 0x02;
const TAG_USER: u8 = 0x01;
const TAG_NONCE: u8 = 0x02;

/// TLV lengths are a single byte.
const MAX_TLV_LEN: usize = 0xFF;

/// Challenge option: the responder must send a user id.
pub const OPTION_USER_ID: u8 = 0x01;
/// Challenge option: only read access will be granted.
pub const OPTION_READ_ONLY: u8 = 0x02;

/// User name (optional) and password handed back for a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: Option<Vec<u8>>,
    pub password: Vec<u8>,
}

/// Source of credentials for both sides of the handshake.
pub trait CredentialProvider: Send + Sync {
    /// Asked when the peer challenges us. `None` declines.
    fn on_challenge(
        &self,
        realm: Option<&str>,
        need_user: bool,
        need_full_access: bool,
    ) -> Option<Credentials>;

    /// Asked for the expected password when the peer answers our challenge.
    fn on_response(&self, user: Option<&[u8]>) -> Option<Vec<u8>>;

    fn on_auth_failure(&self, _user: Option<&[u8]>) {}
}

/// Fixed user/password pair.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    user: Option<String>,
    password: String,
}

impl StaticCredentials {
    pub fn new(user: Option<String>, password: impl Into<String>) -> Self {
        Self {
            user,
            password: password.into(),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn on_challenge(
        &self,
        _realm: Option<&str>,
        need_user: bool,
        _need_full_access: bool,
    ) -> Option<Credentials> {
        if need_user && self.user.is_none() {
            return None;
        }
        Some(Credentials {
            user: self.user.as_ref().map(|u| u.as_bytes().to_vec()),
            password: self.password.as_bytes().to_vec(),
        })
    }

    fn on_response(&self, user: Option<&[u8]>) -> Option<Vec<u8>> {
        match (&self.user, user) {
            (Some(expected), Some(got)) if expected.as_bytes() != got => None,
            _ => Some(self.password.as_bytes().to_vec()),
        }
    }

    fn on_auth_failure(&self, user: Option<&[u8]>) {
        tracing::warn!(
            user = %user.map(String::from_utf8_lossy).unwrap_or_default(),
            "authentication failed"
        );
    }
}

/// Character set of realm strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Ascii,
    /// ISO-8859-n, n in 1..=9.
    Iso8859(u8),
    Utf16,
    Utf8,
}

impl Charset {
    /// Unknown ids fall back to ISO-8859-1.
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => Charset::Ascii,
            1..=9 => Charset::Iso8859(id),
            0xFE => Charset::Utf16,
            0xFF => Charset::Utf8,
            _ => Charset::Iso8859(1),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Charset::Ascii => 0,
            Charset::Iso8859(n) => n,
            Charset::Utf16 => 0xFE,
            Charset::Utf8 => 0xFF,
        }
    }

    /// ISO-8859-2..9 are read with the ISO-8859-1 mapping.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::Utf16 => {
                let units = bytes
                    .chunks_exact(2)
                    .map(|p| u16::from_be_bytes([p[0], p[1]]));
                char::decode_utf16(units)
                    .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect()
            }
            Charset::Ascii | Charset::Iso8859(_) => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    fn encode(s: &str) -> (Charset, Vec<u8>) {
        if s.is_ascii() {
            (Charset::Ascii, s.as_bytes().to_vec())
        } else {
            (Charset::Utf8, s.as_bytes().to_vec())
        }
    }
}

/// A challenge we issued: the header payload and the nonce to check the answer against.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub payload: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChallenge {
    pub nonce: [u8; NONCE_LEN],
    pub options: u8,
    pub realm: Option<String>,
}

impl ParsedChallenge {
    pub fn need_user(&self) -> bool {
        self.options & OPTION_USER_ID != 0
    }

    pub fn need_full_access(&self) -> bool {
        self.options & OPTION_READ_ONLY == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub digest: [u8; NONCE_LEN],
    pub user: Option<Vec<u8>>,
    pub nonce: Option<[u8; NONCE_LEN]>,
}

/// Walk tag-length-value triples; stops at the first truncated triple.
fn tlv(payload: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos + 2 > payload.len() {
            return None;
        }
        let tag = payload[pos];
        let len = payload[pos + 1] as usize;
        let start = pos + 2;
        if start + len > payload.len() {
            return None;
        }
        pos = start + len;
        Some((tag, &payload[start..start + len]))
    })
}

/// `value` must fit `MAX_TLV_LEN`.
fn push_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    debug_assert!(value.len() <= MAX_TLV_LEN);
    out.push(tag);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
}

/// Longest prefix of `s` no longer than `max` bytes that ends on a character boundary.
fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn to_nonce(bytes: &[u8]) -> Option<[u8; NONCE_LEN]> {
    bytes.try_into().ok()
}

fn fresh_nonce() -> [u8; NONCE_LEN] {
    let mut seed = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut seed);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = Md5::new();
    hasher.update(seed);
    hasher.update(now.to_be_bytes());
    hasher.finalize().into()
}

/// `MD5(nonce ":" password)`.
pub fn response_digest(nonce: &[u8; NONCE_LEN], password: &[u8]) -> [u8; NONCE_LEN] {
    let mut hasher = Md5::new();
    hasher.update(nonce);
    hasher.update(b":");
    hasher.update(password);
    hasher.finalize().into()
}

/// Build an AUTH_CHALLENGE payload with a fresh nonce.
pub fn build_challenge(
    realm: Option<&str>,
    require_user_id: bool,
    require_full_access: bool,
) -> Challenge {
    let nonce = fresh_nonce();
    let mut options = 0u8;
    if require_user_id {
        options |= OPTION_USER_ID;
    }
    if !require_full_access {
        options |= OPTION_READ_ONLY;
    }
    let mut payload = Vec::with_capacity(2 * NONCE_LEN);
    push_tlv(&mut payload, TAG_DIGEST, &nonce);
    push_tlv(&mut payload, TAG_OPTIONS, &[options]);
    if let Some(full) = realm {
        // One byte of the value is the charset id.
        let realm = truncate_str(full, MAX_TLV_LEN - 1);
        if realm.len() < full.len() {
            tracing::warn!(len = full.len(), "realm too long, truncated");
        }
        let (charset, bytes) = Charset::encode(realm);
        let mut value = Vec::with_capacity(bytes.len() + 1);
        value.push(charset.id());
        value.extend_from_slice(&bytes);
        push_tlv(&mut payload, TAG_REALM, &value);
    }
    Challenge { payload, nonce }
}

pub fn parse_challenge(payload: &[u8]) -> Result<ParsedChallenge, ObexError> {
    let mut nonce = None;
    let mut options = 0u8;
    let mut realm = None;
    for (tag, value) in tlv(payload) {
        match tag {
            TAG_DIGEST => nonce = to_nonce(value),
            TAG_OPTIONS => options = value.first().copied().unwrap_or(0),
            TAG_REALM => {
                if let Some((&charset, text)) = value.split_first() {
                    realm = Some(Charset::from_id(charset).decode(text));
                }
            }
            _ => {}
        }
    }
    let nonce =
        nonce.ok_or_else(|| ObexError::MalformedFrame("auth challenge without nonce".into()))?;
    Ok(ParsedChallenge {
        nonce,
        options,
        realm,
    })
}

pub fn parse_response(payload: &[u8]) -> Result<ParsedResponse, ObexError> {
    let mut digest = None;
    let mut user = None;
    let mut nonce = None;
    for (tag, value) in tlv(payload) {
        match tag {
            TAG_DIGEST => digest = to_nonce(value),
            TAG_USER => user = Some(value.to_vec()),
            TAG_NONCE => nonce = to_nonce(value),
            _ => {}
        }
    }
    let digest =
        digest.ok_or_else(|| ObexError::MalformedFrame("auth response without digest".into()))?;
    Ok(ParsedResponse {
        digest,
        user,
        nonce,
    })
}

/// Answer a peer's AUTH_CHALLENGE payload with credentials from `provider`.
pub fn build_response(
    challenge: &[u8],
    provider: &dyn CredentialProvider,
) -> Result<Vec<u8>, ObexError> {
    let parsed = parse_challenge(challenge)?;
    let creds = provider
        .on_challenge(
            parsed.realm.as_deref(),
            parsed.need_user(),
            parsed.need_full_access(),
        )
        .ok_or(ObexError::AuthenticationFailed)?;
    let digest = response_digest(&parsed.nonce, &creds.password);
    let mut payload = Vec::with_capacity(3 * NONCE_LEN);
    push_tlv(&mut payload, TAG_DIGEST, &digest);
    if let Some(user) = creds.user.as_deref() {
        if user.len() > MAX_TLV_LEN {
            return Err(ObexError::InvalidHeader {
                id: header_id::AUTH_RESPONSE,
            });
        }
        push_tlv(&mut payload, TAG_USER, user);
    }
    push_tlv(&mut payload, TAG_NONCE, &parsed.nonce);
    Ok(payload)
}

fn digests_equal(a: &[u8; NONCE_LEN], b: &[u8; NONCE_LEN]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check an AUTH_RESPONSE payload against the locally known password.
/// With `expected_nonce`, the echoed nonce must also be the one we issued.
/// Returns the user id the peer sent, if any.
pub fn verify_response(
    payload: &[u8],
    expected_nonce: Option<&[u8; NONCE_LEN]>,
    provider: &dyn CredentialProvider,
) -> Result<Option<Vec<u8>>, ObexError> {
    let parsed = parse_response(payload)?;
    let user = parsed.user.as_deref();
    let fail = || {
        provider.on_auth_failure(user);
        ObexError::AuthenticationFailed
    };
    let nonce = match (parsed.nonce, expected_nonce) {
        (Some(got), Some(expected)) if &got != expected => return Err(fail()),
        (Some(got), _) => got,
        (None, Some(expected)) => *expected,
        (None, None) => return Err(fail()),
    };
    let password = provider.on_response(user).ok_or_else(fail)?;
    if !digests_equal(&response_digest(&nonce, &password), &parsed.digest) {
        return Err(fail());
    }
    Ok(parsed.user)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(password: &str) -> StaticCredentials {
        StaticCredentials::new(Some("alice".into()), password)
    }

    #[test]
    fn challenge_layout() {
        let c = build_challenge(Some("realm"), true, false);
        assert_eq!(&c.payload[..2], &[0x00, 0x10]);
        assert_eq!(&c.payload[2..18], &c.nonce);
        assert_eq!(&c.payload[18..21], &[0x01, 0x01, OPTION_USER_ID | OPTION_READ_ONLY]);
        assert_eq!(&c.payload[21..24], &[0x02, 6, 0]);
        assert_eq!(&c.payload[24..], b"realm");
    }

    #[test]
    fn challenge_without_realm() {
        let c = build_challenge(None, false, true);
        let parsed = parse_challenge(&c.payload).unwrap();
        assert_eq!(parsed.nonce, c.nonce);
        assert_eq!(parsed.options, 0);
        assert!(parsed.realm.is_none());
        assert!(!parsed.need_user());
        assert!(parsed.need_full_access());
    }

    #[test]
    fn nonces_differ() {
        assert_ne!(build_challenge(None, false, true).nonce, build_challenge(None, false, true).nonce);
    }

    #[test]
    fn utf8_realm_roundtrip() {
        let c = build_challenge(Some("Bürø"), false, true);
        let parsed = parse_challenge(&c.payload).unwrap();
        assert_eq!(parsed.realm.as_deref(), Some("Bürø"));
    }

    #[test]
    fn long_realm_cut_on_char_boundary() {
        let realm = "é".repeat(200);
        let c = build_challenge(Some(&realm), false, true);
        assert_eq!(&c.payload[21..23], &[0x02, 0xFF]);
        let parsed = parse_challenge(&c.payload).unwrap();
        assert_eq!(parsed.realm, Some("é".repeat(127)));
    }

    #[test]
    fn oversized_user_id_refused() {
        let c = build_challenge(None, true, true);
        let long = StaticCredentials::new(Some("u".repeat(256)), "pw");
        assert!(matches!(
            build_response(&c.payload, &long),
            Err(ObexError::InvalidHeader { .. })
        ));
        let fits = StaticCredentials::new(Some("u".repeat(255)), "pw");
        let resp = build_response(&c.payload, &fits).unwrap();
        assert_eq!(parse_response(&resp).unwrap().user.map(|u| u.len()), Some(255));
    }

    #[test]
    fn response_verifies_with_matching_password() {
        let c = build_challenge(Some("realm"), true, false);
        let resp = build_response(&c.payload, &creds("secret")).unwrap();
        let user = verify_response(&resp, Some(&c.nonce), &creds("secret")).unwrap();
        assert_eq!(user.as_deref(), Some(&b"alice"[..]));
    }

    #[test]
    fn response_fails_with_wrong_password() {
        let c = build_challenge(Some("realm"), true, false);
        let resp = build_response(&c.payload, &creds("guess")).unwrap();
        assert!(matches!(
            verify_response(&resp, Some(&c.nonce), &creds("secret")),
            Err(ObexError::AuthenticationFailed)
        ));
    }

    #[test]
    fn response_to_other_nonce_rejected() {
        let c1 = build_challenge(None, false, true);
        let c2 = build_challenge(None, false, true);
        let resp = build_response(&c1.payload, &creds("secret")).unwrap();
        assert!(verify_response(&resp, Some(&c2.nonce), &creds("secret")).is_err());
        // Without an expected nonce the echoed one is trusted.
        assert!(verify_response(&resp, None, &creds("secret")).is_ok());
    }

    #[test]
    fn unknown_user_rejected() {
        let c = build_challenge(None, true, true);
        let resp = build_response(&c.payload, &creds("secret")).unwrap();
        let server = StaticCredentials::new(Some("bob".into()), "secret");
        assert!(verify_response(&resp, Some(&c.nonce), &server).is_err());
    }

    #[test]
    fn declined_challenge_fails() {
        let c = build_challenge(None, true, true);
        let anonymous = StaticCredentials::new(None, "secret");
        assert!(matches!(
            build_response(&c.payload, &anonymous),
            Err(ObexError::AuthenticationFailed)
        ));
    }

    #[test]
    fn response_layout_without_user() {
        let c = build_challenge(None, false, true);
        let resp = build_response(&c.payload, &StaticCredentials::new(None, "pw")).unwrap();
        assert_eq!(resp.len(), 36);
        assert_eq!(&resp[..2], &[0x00, 0x10]);
        assert_eq!(&resp[2..18], &response_digest(&c.nonce, b"pw"));
        assert_eq!(&resp[18..20], &[0x02, 0x10]);
        assert_eq!(&resp[20..], &c.nonce);
    }

    #[test]
    fn challenge_without_nonce_is_malformed() {
        assert!(matches!(
            parse_challenge(&[0x01, 0x01, 0x00]),
            Err(ObexError::MalformedFrame(_))
        ));
    }

    #[test]
    fn charset_ids() {
        assert_eq!(Charset::from_id(0), Charset::Ascii);
        assert_eq!(Charset::from_id(5), Charset::Iso8859(5));
        assert_eq!(Charset::from_id(0xFF), Charset::Utf8);
        assert_eq!(Charset::from_id(0x42), Charset::Iso8859(1));
        assert_eq!(Charset::Iso8859(1).decode(&[0x66, 0xE9]), "fé");
        assert_eq!(Charset::Utf16.decode(&[0x00, 0x41, 0x00, 0x42]), "AB");
    }
}
