//! Wire codec for the DNS tunnel
//!
//! Both endpoints share this grammar:
//!
//! ```text
//! question:  <nonce>-<seq>-<session>.<base32-payload>.<zone>.
//! answer:    AAAA records, 16 downstream bytes per 128-bit address
//! ```
//!
//! - [`name`]: question-name construction and strict parsing
//! - [`label`]: base-32 data-label encoding (lowercase wire form,
//!   case-insensitive decode)
//! - [`payload`]: 16-byte answer-block packing and reassembly
//!
//! Parse failures carry the DNS response code the server replies with, so
//! the handler maps grammar violations onto the wire without guessing.

use hickory_proto::op::ResponseCode;
use thiserror::Error;

pub mod label;
pub mod name;
pub mod payload;

pub use label::{decode_label, encode_label, MAX_CHUNK_LEN, MAX_LABEL_LEN};
pub use name::{
    build_poll_name, build_query_name, parse_query_name, random_nonce, QueryName, SessionId,
    MAX_PAYLOAD_SEQ, POLL_SEQ,
};
pub use payload::{answer_bytes, block_to_addr, drain_blocks, BLOCK_LEN, MAX_BLOCKS_PER_ANSWER};

/// Errors produced while encoding or decoding tunnel frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The question name does not end in the configured zone.
    #[error("name {name:?} is outside the tunnel zone")]
    OutOfZone {
        /// The offending question name.
        name: String,
    },

    /// The header label violates the `nonce-seq-session` grammar.
    #[error("malformed header label: {reason}")]
    MalformedHeader {
        /// What was wrong with the label.
        reason: String,
    },

    /// The data label is overlong or not base-32.
    #[error("invalid data label: {reason}")]
    DataLabel {
        /// What was wrong with the label.
        reason: String,
    },

    /// A payload chunk does not fit in one 63-byte data label.
    #[error("payload of {payload_len} bytes encodes to a {label_len}-byte label (max {MAX_LABEL_LEN})")]
    ChunkTooLarge {
        /// Size of the offending payload.
        payload_len: usize,
        /// Size of its encoded label.
        label_len: usize,
    },
}

impl CodecError {
    /// The DNS response code the server answers with for this violation.
    #[must_use]
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Self::OutOfZone { .. } => ResponseCode::NXDomain,
            Self::MalformedHeader { .. } | Self::DataLabel { .. } | Self::ChunkTooLarge { .. } => {
                ResponseCode::FormErr
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_code_mapping() {
        let out = CodecError::OutOfZone {
            name: "x.example.net.".into(),
        };
        assert_eq!(out.response_code(), ResponseCode::NXDomain);

        let header = CodecError::MalformedHeader {
            reason: "arity".into(),
        };
        assert_eq!(header.response_code(), ResponseCode::FormErr);

        let data = CodecError::DataLabel {
            reason: "alphabet".into(),
        };
        assert_eq!(data.response_code(), ResponseCode::FormErr);
    }
}
