//! Downstream answer payload packing
//!
//! Downstream bytes ride in the 128-bit address field of AAAA records,
//! 16 bytes per record. A response carries up to [`MAX_BLOCKS_PER_ANSWER`]
//! full blocks drained from the session's downstream buffer; when fewer
//! than 16 bytes remain and no full block was available, exactly one
//! zero-right-padded block is emitted instead. The padded form loses the
//! payload length, so it is never mixed with full blocks in one response;
//! the payload layered on top is expected to tolerate trailing zeros.
//!
//! The client reassembles by concatenating record address bytes in answer
//! section order, which is the authoritative ordering within one response.

use std::net::Ipv6Addr;

use bytes::{Buf, BytesMut};
use hickory_proto::op::Message;
use hickory_proto::rr::RData;

/// Bytes carried by one AAAA record.
pub const BLOCK_LEN: usize = 16;

/// Ceiling on AAAA records per response, keeping UDP responses under
/// typical MTU.
pub const MAX_BLOCKS_PER_ANSWER: usize = 16;

/// Drain the next run of downstream bytes from `buf` into 16-byte blocks.
///
/// Takes up to [`MAX_BLOCKS_PER_ANSWER`] full blocks; if the buffer holds
/// fewer than [`BLOCK_LEN`] bytes, its entire tail is emitted as a single
/// zero-padded block. An empty buffer yields no blocks.
pub fn drain_blocks(buf: &mut BytesMut) -> Vec<[u8; BLOCK_LEN]> {
    if buf.is_empty() {
        return Vec::new();
    }

    let full = (buf.len() / BLOCK_LEN).min(MAX_BLOCKS_PER_ANSWER);
    if full == 0 {
        let mut block = [0_u8; BLOCK_LEN];
        block[..buf.len()].copy_from_slice(buf);
        buf.clear();
        return vec![block];
    }

    let mut blocks = Vec::with_capacity(full);
    for _ in 0..full {
        let mut block = [0_u8; BLOCK_LEN];
        block.copy_from_slice(&buf[..BLOCK_LEN]);
        buf.advance(BLOCK_LEN);
        blocks.push(block);
    }
    blocks
}

/// Convert a block into the AAAA address that carries it.
#[must_use]
pub fn block_to_addr(block: [u8; BLOCK_LEN]) -> Ipv6Addr {
    Ipv6Addr::from(block)
}

/// Extract downstream bytes from a DNS response.
///
/// Concatenates the address bytes of every AAAA record in answer-section
/// order; records of other types are ignored.
#[must_use]
pub fn answer_bytes(response: &Message) -> Vec<u8> {
    let mut out = Vec::new();
    for record in response.answers() {
        if let Some(RData::AAAA(addr)) = record.data() {
            out.extend_from_slice(&addr.0.octets());
        }
    }
    out
}
