//! Question-name grammar
//!
//! Every tunnel query is a DNS question name of the form
//!
//! ```text
//! <nonce>-<seq>-<session>.<data-label>.<zone>.
//! ```
//!
//! The first label is the *header label*: three 4-character hex tokens
//! joined by `-`. The second label is the *data label*: base-32 payload
//! bytes, absent entirely for poll frames (`seq == ffff`). The remaining
//! labels reproduce the zone the server is authoritative for.
//!
//! Parsing is strict: wrong token arity or width is a format error, a name
//! that does not end in the zone is out of zone. Both checks are
//! case-insensitive.

use std::fmt;

use rand::Rng;

use super::label::{encode_label, is_base32_alphabet, MAX_LABEL_LEN};
use super::CodecError;

/// Width of each header token in characters.
const HEADER_TOKEN_LEN: usize = 4;

/// Sequence value reserved for payload-free poll frames.
pub const POLL_SEQ: u16 = 0xffff;

/// Largest sequence number assigned to a payload frame; the counter wraps
/// back to zero after this so [`POLL_SEQ`] is never emitted as a payload
/// sequence.
pub const MAX_PAYLOAD_SEQ: u16 = 0xfffe;

/// Identifier of one logical tunnel, rendered as 4 lowercase hex
/// characters on the wire.
///
/// Chosen randomly by the client at construction and immutable for the
/// client's lifetime; the server keys its session table on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u16);

impl SessionId {
    /// Create a session id from its raw 16-bit value.
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Draw a random session id.
    #[must_use]
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    /// Parse a 4-character hex token.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedHeader`] if the token is not exactly
    /// four hex characters.
    pub fn parse(token: &str) -> Result<Self, CodecError> {
        parse_hex_token(token, "session").map(Self)
    }

    /// Raw 16-bit value.
    #[must_use]
    pub const fn as_raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Draw a fresh 4-character hex nonce.
///
/// The nonce has no protocol meaning beyond cache busting: recursive
/// resolvers must not coalesce distinct queries carrying distinct
/// payloads, so every query gets a new one.
#[must_use]
pub fn random_nonce() -> String {
    format!("{:04x}", rand::thread_rng().gen::<u16>())
}

/// A parsed tunnel question name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryName {
    /// Cache-busting token, 4 hex characters.
    pub nonce: String,
    /// Frame sequence number; [`POLL_SEQ`] marks a payload-free poll.
    pub seq: u16,
    /// Session the frame is addressed to.
    pub session: SessionId,
    /// Base-32 data label, lowercased; empty for polls.
    pub data_label: String,
}

impl QueryName {
    /// Whether this frame is a pure poll carrying no upstream payload.
    #[must_use]
    pub const fn is_poll(&self) -> bool {
        self.seq == POLL_SEQ
    }
}

fn parse_hex_token(token: &str, what: &'static str) -> Result<u16, CodecError> {
    if token.len() != HEADER_TOKEN_LEN || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CodecError::MalformedHeader {
            reason: format!("{what} token {token:?} is not 4 hex characters"),
        });
    }
    u16::from_str_radix(token, 16).map_err(|_| CodecError::MalformedHeader {
        reason: format!("{what} token {token:?} is not 4 hex characters"),
    })
}

/// Build the question name for a payload frame.
///
/// `zone` must be a fully-qualified suffix ending in `.`; the payload may
/// be empty, which produces the poll form without a data label.
///
/// # Errors
///
/// Returns [`CodecError::ChunkTooLarge`] if the payload does not fit one
/// data label.
pub fn build_query_name(
    nonce: &str,
    seq: u16,
    session: SessionId,
    payload: &[u8],
    zone: &str,
) -> Result<String, CodecError> {
    debug_assert!(zone.ends_with('.'), "zone must be fully qualified");
    if payload.is_empty() {
        return Ok(format!("{nonce}-{seq:04x}-{session}.{zone}"));
    }
    let label = encode_label(payload)?;
    Ok(format!("{nonce}-{seq:04x}-{session}.{label}.{zone}"))
}

/// Build the question name of a poll frame (no payload, `seq == ffff`).
#[must_use]
pub fn build_poll_name(nonce: &str, session: SessionId, zone: &str) -> String {
    debug_assert!(zone.ends_with('.'), "zone must be fully qualified");
    format!("{nonce}-ffff-{session}.{zone}")
}

/// Parse a question name against the configured zone.
///
/// `name` and `zone` are fully-qualified (trailing `.`); matching is
/// case-insensitive on every label.
///
/// # Errors
///
/// - [`CodecError::OutOfZone`] if the name does not end in `zone`
/// - [`CodecError::MalformedHeader`] on header arity or token-width
///   violations
/// - [`CodecError::DataLabel`] if the data label is overlong or contains
///   characters outside the base-32 alphabet
pub fn parse_query_name(name: &str, zone: &str) -> Result<QueryName, CodecError> {
    let name = name.to_ascii_lowercase();
    let zone = zone.to_ascii_lowercase();

    let prefix = if name == zone {
        // The zone apex itself carries no header label.
        return Err(CodecError::MalformedHeader {
            reason: "name has no header label before the zone".to_string(),
        });
    } else {
        name.strip_suffix(zone.as_str())
            .and_then(|p| p.strip_suffix('.'))
            .ok_or_else(|| CodecError::OutOfZone { name: name.clone() })?
    };

    let mut labels = prefix.split('.');
    let header = labels.next().unwrap_or("");
    let data_label = labels.next().unwrap_or("");
    if labels.next().is_some() {
        return Err(CodecError::MalformedHeader {
            reason: format!("{prefix:?} has more than two labels before the zone"),
        });
    }

    let mut tokens = header.split('-');
    let (nonce, seq, session) = match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
        (Some(nonce), Some(seq), Some(session), None) => (nonce, seq, session),
        _ => {
            return Err(CodecError::MalformedHeader {
                reason: format!("header label {header:?} does not split into 3 tokens"),
            });
        }
    };

    parse_hex_token(nonce, "nonce")?;
    let seq = parse_hex_token(seq, "sequence")?;
    let session = SessionId::parse(session)?;

    if data_label.len() > MAX_LABEL_LEN {
        return Err(CodecError::DataLabel {
            reason: format!("data label is {} characters (max {})", data_label.len(), MAX_LABEL_LEN),
        });
    }
    if !is_base32_alphabet(data_label) {
        return Err(CodecError::DataLabel {
            reason: "data label contains characters outside the base-32 alphabet".to_string(),
        });
    }

    Ok(QueryName {
        nonce: nonce.to_string(),
        seq,
        session,
        data_label: data_label.to_string(),
    })
}
