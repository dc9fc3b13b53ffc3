//! Local SOCKS5 front-end
//!
//! The local listener speaks just enough SOCKS5 (RFC 1928) to satisfy
//! proxy-aware applications: no-authentication negotiation, CONNECT, and a
//! fixed success reply. The destination address is parsed and discarded —
//! every tunneled byte goes to the server's configured upstream target.
//!
//! Streams that do not open with the SOCKS version byte divert to
//! pass-through mode. If such a stream looks like TLS (first byte 0x16),
//! the complete first record is buffered before tunneling starts, so the
//! ClientHello ships as back-to-back frames instead of trickling through
//! 30-byte exchanges and tripping handshake timeouts on the far side.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::{TunnelError, TunnelResult};

/// SOCKS protocol version byte.
const SOCKS_VERSION: u8 = 0x05;

/// TLS record content type for handshake records.
const TLS_HANDSHAKE: u8 = 0x16;

/// Size of a TLS record header.
const TLS_RECORD_HEADER_LEN: usize = 5;

/// CONNECT command code.
const CMD_CONNECT: u8 = 0x01;

/// Success reply: version 5, succeeded, IPv4 0.0.0.0:0.
const SUCCESS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Negotiate the front of an accepted stream.
///
/// Returns the bytes that must be sent upstream before reading from the
/// stream again:
///
/// - SOCKS5 stream: negotiation is completed and consumed, `None`
/// - TLS pass-through: the complete first record
/// - other pass-through: the single byte consumed while detecting
///
/// # Errors
///
/// Returns [`TunnelError::Socks`] on malformed negotiation and
/// [`TunnelError::Network`] on stream I/O failures.
pub async fn prepare_stream<S>(stream: &mut S) -> TunnelResult<Option<Vec<u8>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut first = [0_u8; 1];
    stream
        .read_exact(&mut first)
        .await
        .map_err(|e| TunnelError::network_io("failed to read first byte", e))?;

    match first[0] {
        SOCKS_VERSION => {
            negotiate_socks5(stream).await?;
            Ok(None)
        }
        TLS_HANDSHAKE => {
            debug!("non-SOCKS5 stream looks like TLS, buffering first record");
            let record = read_tls_record(stream).await?;
            Ok(Some(record))
        }
        other => {
            debug!(first_byte = other, "pass-through stream");
            Ok(Some(vec![other]))
        }
    }
}

/// Complete SOCKS5 negotiation after the version byte was consumed.
async fn negotiate_socks5<S>(stream: &mut S) -> TunnelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let io_err = |e| TunnelError::network_io("SOCKS5 stream I/O failed", e);

    // Method selection: any offer is answered with "no authentication".
    let mut nmethods = [0_u8; 1];
    stream.read_exact(&mut nmethods).await.map_err(io_err)?;
    let mut methods = vec![0_u8; nmethods[0] as usize];
    stream.read_exact(&mut methods).await.map_err(io_err)?;
    stream
        .write_all(&[SOCKS_VERSION, 0x00])
        .await
        .map_err(io_err)?;

    // Request: VER CMD RSV ATYP.
    let mut request = [0_u8; 4];
    stream.read_exact(&mut request).await.map_err(io_err)?;
    if request[0] != SOCKS_VERSION {
        return Err(TunnelError::socks(format!(
            "unexpected request version {:#04x}",
            request[0]
        )));
    }
    if request[1] != CMD_CONNECT {
        return Err(TunnelError::socks(format!(
            "unsupported command {:#04x} (only CONNECT)",
            request[1]
        )));
    }

    // The destination is read for framing only; the tunnel always ends at
    // the server's configured target.
    let skip = match request[3] {
        // IPv4 + port
        0x01 => 4 + 2,
        // Domain: length byte, then name + port
        0x03 => {
            let mut len = [0_u8; 1];
            stream.read_exact(&mut len).await.map_err(io_err)?;
            len[0] as usize + 2
        }
        // IPv6 + port
        0x04 => 16 + 2,
        other => {
            return Err(TunnelError::socks(format!(
                "unknown address type {other:#04x}"
            )));
        }
    };
    let mut discard = vec![0_u8; skip];
    stream.read_exact(&mut discard).await.map_err(io_err)?;

    stream.write_all(&SUCCESS_REPLY).await.map_err(io_err)?;
    trace!("SOCKS5 CONNECT negotiated");
    Ok(())
}

/// Read the remainder of the first TLS record, the 0x16 content-type byte
/// having been consumed already.
///
/// The record header is 5 bytes; the payload length is the big-endian
/// 16-bit quantity at offset 3.
async fn read_tls_record<S>(stream: &mut S) -> TunnelResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let io_err = |e| TunnelError::network_io("failed to read TLS record", e);

    let mut header_rest = [0_u8; TLS_RECORD_HEADER_LEN - 1];
    stream.read_exact(&mut header_rest).await.map_err(io_err)?;

    let body_len = u16::from_be_bytes([header_rest[2], header_rest[3]]) as usize;
    let mut record = vec![0_u8; TLS_RECORD_HEADER_LEN + body_len];
    record[0] = TLS_HANDSHAKE;
    record[1..TLS_RECORD_HEADER_LEN].copy_from_slice(&header_rest);
    stream
        .read_exact(&mut record[TLS_RECORD_HEADER_LEN..])
        .await
        .map_err(io_err)?;

    debug!(len = record.len(), "buffered first TLS record");
    Ok(record)
}
