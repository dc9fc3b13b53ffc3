//! Base-32 data-label encoding
//!
//! Upstream payload bytes travel inside a single DNS label, encoded with
//! the RFC 4648 base-32 alphabet without padding. The wire form is
//! lowercase (DNS names are conventionally lowercase and several resolvers
//! re-case labels in flight), while decoding accepts either case.
//!
//! A DNS label is capped at 63 bytes. Base-32 encodes 5 payload bytes per
//! 8 label characters, so a full label carries at most 39 bytes; senders
//! stay below that (see [`MAX_CHUNK_LEN`]) to keep frame sizes uniform.

use data_encoding::BASE32_NOPAD;

use super::CodecError;

/// Maximum length of a DNS label in bytes (RFC 1035).
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum payload bytes a sender places in one frame.
///
/// 30 bytes encode to 48 label characters, well under the 63-byte label
/// cap, leaving headroom for future header growth.
pub const MAX_CHUNK_LEN: usize = 30;

/// Encode payload bytes into a lowercase base-32 data label.
///
/// # Errors
///
/// Returns [`CodecError::ChunkTooLarge`] if the encoded form would exceed
/// the 63-byte label limit.
pub fn encode_label(data: &[u8]) -> Result<String, CodecError> {
    let encoded = BASE32_NOPAD.encode(data).to_ascii_lowercase();
    if encoded.len() > MAX_LABEL_LEN {
        return Err(CodecError::ChunkTooLarge {
            payload_len: data.len(),
            label_len: encoded.len(),
        });
    }
    Ok(encoded)
}

/// Decode a base-32 data label back into payload bytes.
///
/// Accepts both cases. An empty label decodes to an empty payload.
///
/// # Errors
///
/// Returns [`CodecError::DataLabel`] if the label is not valid unpadded
/// base-32.
pub fn decode_label(label: &str) -> Result<Vec<u8>, CodecError> {
    if label.is_empty() {
        return Ok(Vec::new());
    }
    BASE32_NOPAD
        .decode(label.to_ascii_uppercase().as_bytes())
        .map_err(|e| CodecError::DataLabel {
            reason: e.to_string(),
        })
}

/// Check whether every character of a label belongs to the base-32
/// alphabet (either case).
///
/// This is the cheap syntactic gate applied while parsing a question name;
/// full decoding happens later and may still reject a label whose length
/// is not a valid base-32 quantum.
pub fn is_base32_alphabet(label: &str) -> bool {
    label
        .bytes()
        .all(|b| b.is_ascii_alphabetic() || (b'2'..=b'7').contains(&b))
}
