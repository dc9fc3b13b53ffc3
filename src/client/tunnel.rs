//! Client tunnel loops
//!
//! One accepted byte-stream maps onto two cooperating tasks:
//!
//! - **upstream**: read up to 30 bytes from the stream, frame them with
//!   the next sequence number, send as an AAAA query, discard the reply;
//! - **downstream**: on a fixed interval, send a poll frame (`seq ffff`,
//!   no data label) and write the reply's AAAA bytes, in record order, to
//!   the stream.
//!
//! Both tasks observe one cancellation token; whichever direction ends
//! first (local EOF, local write failure, external cancel) cancels the
//! other so the stream closes cleanly. Lost queries are not retransmitted;
//! the payload on top of the tunnel is expected to carry its own
//! integrity.
//!
//! The sequence counter and session id belong to the owning client, not
//! to this struct, so every connection of one client shares the same
//! session and a single monotonic frame sequence.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::exchange::DnsExchange;
use crate::codec::{
    answer_bytes, build_poll_name, build_query_name, random_nonce, SessionId, MAX_CHUNK_LEN,
    MAX_PAYLOAD_SEQ,
};

/// Per-connection tunnel driver.
///
/// Cheap to clone; clones share the exchange, the sequence counter, and
/// the cancellation token.
#[derive(Clone)]
pub struct ClientTunnel {
    exchange: Arc<DnsExchange>,
    zone: Arc<str>,
    session: SessionId,
    seq: Arc<parking_lot::Mutex<u16>>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl ClientTunnel {
    /// Create a tunnel driver.
    ///
    /// `seq` is the client-wide frame counter; `cancel` should be a child
    /// of the client's token so stopping the client stops every
    /// connection.
    #[must_use]
    pub fn new(
        exchange: Arc<DnsExchange>,
        zone: impl Into<Arc<str>>,
        session: SessionId,
        seq: Arc<parking_lot::Mutex<u16>>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            exchange,
            zone: zone.into(),
            session,
            seq,
            poll_interval,
            cancel,
        }
    }

    /// The cancellation token covering this connection.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Copy bytes in both directions until EOF or cancellation.
    ///
    /// `initial` is sent upstream before anything is read from the stream;
    /// the SOCKS adapter uses it for the buffered first TLS record and for
    /// the consumed detection byte of raw pass-through streams.
    pub async fn run<S>(&self, stream: S, initial: Option<Vec<u8>>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);

        let upstream = {
            let tunnel = self.clone();
            tokio::spawn(async move {
                tunnel.upstream_loop(reader, initial).await;
                tunnel.cancel.cancel();
            })
        };
        let downstream = {
            let tunnel = self.clone();
            tokio::spawn(async move {
                tunnel.downstream_loop(writer).await;
                tunnel.cancel.cancel();
            })
        };

        let _ = upstream.await;
        let _ = downstream.await;
        debug!(session = %self.session, "tunnel connection closed");
    }

    /// Allocate the next frame sequence number, wrapping past the poll
    /// sentinel.
    fn next_seq(&self) -> u16 {
        let mut seq = self.seq.lock();
        let current = *seq;
        *seq = if current >= MAX_PAYLOAD_SEQ { 0 } else { current + 1 };
        current
    }

    /// Send `payload` as frames dispatched back-to-back without awaiting
    /// the replies.
    ///
    /// Sequence numbers are allocated synchronously, so the frames are
    /// consecutive even though their queries fly concurrently. Used for
    /// the buffered first TLS record, where serial 30-byte exchanges would
    /// stall the handshake into server-side timeouts.
    pub fn dispatch_fast(&self, payload: &[u8]) {
        for chunk in payload.chunks(MAX_CHUNK_LEN) {
            let seq = self.next_seq();
            match self.build_frame(seq, chunk) {
                Ok(query) => {
                    let exchange = Arc::clone(&self.exchange);
                    let session = self.session;
                    tokio::spawn(async move {
                        if let Err(e) = exchange.exchange(&query).await {
                            warn!(session = %session, seq, error = %e, "fast-path frame failed");
                        }
                    });
                }
                Err(e) => warn!(session = %self.session, seq, error = %e, "fast-path frame dropped"),
            }
        }
    }

    fn build_frame(&self, seq: u16, payload: &[u8]) -> crate::error::TunnelResult<hickory_proto::op::Message> {
        let qname = build_query_name(&random_nonce(), seq, self.session, payload, &self.zone)
            .map_err(|e| crate::error::TunnelError::dns(e.to_string()))?;
        DnsExchange::build_aaaa_query(&qname)
    }

    /// Send one payload frame and discard its reply.
    async fn send_frame(&self, payload: &[u8]) {
        let seq = self.next_seq();
        trace!(session = %self.session, seq, len = payload.len(), "upstream frame");
        match self.build_frame(seq, payload) {
            Ok(query) => {
                if let Err(e) = self.exchange.exchange(&query).await {
                    // No retransmission: the next frame carries on.
                    warn!(session = %self.session, seq, error = %e, "upstream frame failed");
                }
            }
            Err(e) => warn!(session = %self.session, seq, error = %e, "upstream frame dropped"),
        }
    }

    async fn upstream_loop<R>(&self, mut reader: R, initial: Option<Vec<u8>>)
    where
        R: AsyncRead + Unpin,
    {
        if let Some(initial) = initial {
            self.dispatch_fast(&initial);
        }

        let mut buf = [0_u8; MAX_CHUNK_LEN];
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                result = reader.read(&mut buf) => match result {
                    Ok(0) => {
                        debug!(session = %self.session, "local stream closed");
                        return;
                    }
                    Ok(n) => self.send_frame(&buf[..n]).await,
                    Err(e) => {
                        debug!(session = %self.session, error = %e, "local read failed");
                        return;
                    }
                },
            }
        }
    }

    /// Send one poll and return whatever downstream bytes it yielded.
    async fn poll_once(&self) -> crate::error::TunnelResult<Vec<u8>> {
        let qname = build_poll_name(&random_nonce(), self.session, &self.zone);
        let query = DnsExchange::build_aaaa_query(&qname)?;
        let response = self.exchange.exchange(&query).await?;
        Ok(answer_bytes(&response))
    }

    async fn downstream_loop<W>(&self, mut writer: W)
    where
        W: AsyncWrite + Unpin,
    {
        let mut ticker = tokio::time::interval(self.poll_interval);
        // Sequential polling: a slow exchange must not be followed by a
        // burst of catch-up polls.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(bytes) if bytes.is_empty() => {}
                        Ok(bytes) => {
                            trace!(session = %self.session, len = bytes.len(), "downstream bytes");
                            if let Err(e) = writer.write_all(&bytes).await {
                                debug!(session = %self.session, error = %e, "local write failed");
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(session = %self.session, error = %e, "poll failed");
                        }
                    }
                }
            }
        }
    }
}
