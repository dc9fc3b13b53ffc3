//! Tunnel query handler
//!
//! One DNS query is one unit of work: parse the question name against the
//! zone, route it to the addressed session (dialing the upstream target on
//! first use), write any decoded upstream payload to the session's socket,
//! harvest whatever downstream bytes have arrived since the last query,
//! and pack them into AAAA records.
//!
//! ```text
//! Incoming query
//!     |
//!     v
//! Parse DNS message (hickory-proto)
//!     |
//!     v
//! Gate: qtype AAAA? in zone? header valid?
//!     |
//!     v
//! Session lookup / lazy dial ---- dial failure --> ServFail
//!     |
//!     v  (session lock held from here to the packed answer)
//! Refresh last-seen -> write upstream bytes -> bounded read harvest
//!     |
//!     v
//! Pack <=16 AAAA records, Authoritative, TTL 0
//! ```
//!
//! The server has no stimulus other than queries to drain a session's
//! socket, so every query doubles as a drain opportunity; downstream
//! latency is bounded by the client's poll interval.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Header, Message, ResponseCode};
use hickory_proto::rr::rdata::AAAA;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use super::session::{Session, SessionIo, SessionTable};
use crate::codec::{block_to_addr, decode_label, drain_blocks, parse_query_name};

/// Deadline for the per-query upstream read harvest.
///
/// Short enough that the handler stays effectively non-blocking; anything
/// that arrives later is picked up by the next poll.
pub const READ_DEADLINE: Duration = Duration::from_millis(10);

/// Ceiling on buffered downstream bytes per session.
///
/// Harvesting stops once the buffer is this full; backpressure propagates
/// to the upstream target through the unread socket.
const DOWNSTREAM_BUFFER_CAP: usize = 64 * 1024;

/// Read chunk size for the harvest loop.
const HARVEST_CHUNK: usize = 2048;

/// Counters for the query pipeline.
#[derive(Debug, Default)]
pub struct HandlerStats {
    queries_received: AtomicU64,
    queries_rejected: AtomicU64,
    dial_failures: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl HandlerStats {
    /// Total tunnel queries received.
    #[must_use]
    pub fn queries_received(&self) -> u64 {
        self.queries_received.load(Ordering::Relaxed)
    }

    /// Queries answered with a non-zero RCODE.
    #[must_use]
    pub fn queries_rejected(&self) -> u64 {
        self.queries_rejected.load(Ordering::Relaxed)
    }

    /// Queries that failed to create a session.
    #[must_use]
    pub fn dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }

    /// Payload frames dropped because their data label would not decode.
    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Bytes written to upstream sockets.
    #[must_use]
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes shipped in AAAA answers.
    #[must_use]
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> HandlerStatsSnapshot {
        HandlerStatsSnapshot {
            queries_received: self.queries_received(),
            queries_rejected: self.queries_rejected(),
            dial_failures: self.dial_failures(),
            frames_dropped: self.frames_dropped(),
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
        }
    }
}

/// Snapshot of [`HandlerStats`].
#[derive(Debug, Clone, Copy)]
pub struct HandlerStatsSnapshot {
    /// Total tunnel queries received
    pub queries_received: u64,
    /// Queries answered with a non-zero RCODE
    pub queries_rejected: u64,
    /// Failed session dials
    pub dial_failures: u64,
    /// Dropped undecodable payload frames
    pub frames_dropped: u64,
    /// Bytes written upstream
    pub bytes_up: u64,
    /// Bytes shipped downstream
    pub bytes_down: u64,
}

/// Per-query processing for the tunnel server.
pub struct TunnelHandler {
    /// Zone suffix, lowercase, fully qualified.
    zone: String,
    /// Session table shared with the reaper.
    sessions: Arc<SessionTable>,
    /// Pipeline counters.
    stats: HandlerStats,
    /// Harvest deadline (overridable for tests).
    read_deadline: Duration,
}

impl TunnelHandler {
    /// Create a handler answering for `zone` against `sessions`.
    #[must_use]
    pub fn new(zone: impl Into<String>, sessions: Arc<SessionTable>) -> Self {
        Self {
            zone: zone.into().to_ascii_lowercase(),
            sessions,
            stats: HandlerStats::default(),
            read_deadline: READ_DEADLINE,
        }
    }

    /// Override the harvest deadline.
    #[must_use]
    pub const fn with_read_deadline(mut self, read_deadline: Duration) -> Self {
        self.read_deadline = read_deadline;
        self
    }

    /// Pipeline counters.
    #[must_use]
    pub fn stats(&self) -> &HandlerStats {
        &self.stats
    }

    /// Handle one raw DNS query, returning the serialized reply.
    ///
    /// Returns `None` when the datagram is not a parseable DNS message or
    /// the reply fails to serialize; the caller drops the packet either
    /// way.
    pub async fn handle_query(&self, src: SocketAddr, data: &[u8]) -> Option<Vec<u8>> {
        self.stats.queries_received.fetch_add(1, Ordering::Relaxed);

        let query = match Message::from_vec(data) {
            Ok(message) => message,
            Err(e) => {
                debug!(src = %src, error = %e, "dropping undecodable datagram");
                return None;
            }
        };

        let response = self.process(src, &query).await;
        match response.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(src = %src, error = %e, "failed to serialize reply");
                None
            }
        }
    }

    async fn process(&self, src: SocketAddr, query: &Message) -> Message {
        let Some(question) = query.queries().first().cloned() else {
            return self.reject(query, ResponseCode::FormErr);
        };

        if question.query_type() != RecordType::AAAA {
            trace!(src = %src, qtype = %question.query_type(), "unsupported qtype");
            return self.reject(query, ResponseCode::NotImp);
        }

        let mut qname = question.name().to_utf8().to_ascii_lowercase();
        if !qname.ends_with('.') {
            qname.push('.');
        }

        let parsed = match parse_query_name(&qname, &self.zone) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(src = %src, qname = %qname, error = %e, "rejecting query");
                return self.reject(query, e.response_code());
            }
        };

        let session = match self.sessions.get_or_dial(parsed.session).await {
            Ok(session) => session,
            Err(e) => {
                self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                warn!(session = %parsed.session, error = %e, "upstream dial failed");
                return self.reject(query, ResponseCode::ServFail);
            }
        };

        // Socket and buffer stay locked from here until the answer is
        // packed; concurrent queries for this session serialize.
        let mut io = session.lock_io().await;
        session.touch();

        if !parsed.data_label.is_empty() {
            self.write_upstream(&session, &mut io, &parsed.data_label)
                .await;
        }

        if !session.is_broken() {
            self.harvest(&session, &mut io).await;
        }

        let blocks = drain_blocks(&mut io.down);
        drop(io);

        trace!(
            session = %session.id(),
            seq = parsed.seq,
            poll = parsed.is_poll(),
            answer_blocks = blocks.len(),
            "query handled"
        );

        self.answer(query, question.name(), blocks)
    }

    /// Decode the data label and write it to the session socket.
    ///
    /// An undecodable label drops the frame but still lets the query serve
    /// downstream bytes; a socket write failure marks the session broken
    /// for the reaper.
    async fn write_upstream(
        &self,
        session: &Session,
        io: &mut SessionIo,
        data_label: &str,
    ) {
        let payload = match decode_label(data_label) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(session = %session.id(), error = %e, "dropping undecodable payload frame");
                return;
            }
        };

        match io.stream.write_all(&payload).await {
            Ok(()) => {
                self.stats
                    .bytes_up
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(session = %session.id(), error = %e, "upstream write failed");
                session.mark_broken();
            }
        }
    }

    /// Drain bytes that arrived on the session socket since the last
    /// query, bounded by the read deadline and the buffer cap.
    async fn harvest(&self, session: &Session, io: &mut SessionIo) {
        let deadline = Instant::now() + self.read_deadline;
        let mut chunk = [0_u8; HARVEST_CHUNK];

        loop {
            if io.down.len() >= DOWNSTREAM_BUFFER_CAP {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match timeout(remaining, io.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    debug!(session = %session.id(), "upstream closed");
                    session.mark_broken();
                    break;
                }
                Ok(Ok(n)) => {
                    io.down.extend_from_slice(&chunk[..n]);
                }
                Ok(Err(e)) => {
                    warn!(session = %session.id(), error = %e, "upstream read failed");
                    session.mark_broken();
                    break;
                }
                // Deadline expired: nothing more has arrived yet.
                Err(_) => break,
            }
        }
    }

    /// Build the authoritative reply carrying `blocks` as AAAA records.
    fn answer(
        &self,
        query: &Message,
        qname: &hickory_proto::rr::Name,
        blocks: Vec<[u8; 16]>,
    ) -> Message {
        let mut response = query.clone();
        let mut header = Header::response_from_request(query.header());
        header.set_authoritative(true);
        header.set_response_code(ResponseCode::NoError);
        response.set_header(header);

        for block in blocks {
            self.stats.bytes_down.fetch_add(16, Ordering::Relaxed);
            let mut record = Record::new();
            record.set_name(qname.clone());
            record.set_record_type(RecordType::AAAA);
            record.set_dns_class(DNSClass::IN);
            record.set_ttl(0);
            record.set_data(Some(RData::AAAA(AAAA(block_to_addr(block)))));
            response.add_answer(record);
        }

        response
    }

    /// Build an error reply with the given response code and no answers.
    fn reject(&self, query: &Message, code: ResponseCode) -> Message {
        self.stats.queries_rejected.fetch_add(1, Ordering::Relaxed);
        let mut response = query.clone();
        let mut header = Header::response_from_request(query.header());
        header.set_authoritative(true);
        header.set_response_code(code);
        response.set_header(header);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{build_poll_name, build_query_name, SessionId};
    use crate::error::{TunnelError, TunnelResult};
    use crate::server::dial::{BoxedUpstream, UpstreamDialer};
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;
    use std::io;
    use std::str::FromStr;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::Mutex as TokioMutex;

    const ZONE: &str = "tunnel.example.com.";

    /// Dialer whose far ends are collected for the test to drive.
    struct PairDialer {
        far_ends: TokioMutex<Vec<DuplexStream>>,
        fail: bool,
    }

    impl PairDialer {
        fn new() -> Self {
            Self {
                far_ends: TokioMutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                far_ends: TokioMutex::new(Vec::new()),
                fail: true,
            }
        }

        async fn take_far_end(&self) -> DuplexStream {
            self.far_ends.lock().await.remove(0)
        }
    }

    #[async_trait::async_trait]
    impl UpstreamDialer for PairDialer {
        async fn dial(&self) -> TunnelResult<BoxedUpstream> {
            if self.fail {
                return Err(TunnelError::dial(
                    "test-target",
                    io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
                ));
            }
            let (near, far) = duplex(65536);
            self.far_ends.lock().await.push(far);
            Ok(Box::new(near))
        }

        fn target(&self) -> &str {
            "test-target"
        }
    }

    fn handler_with(dialer: Arc<PairDialer>) -> TunnelHandler {
        let table = Arc::new(SessionTable::new(dialer, Duration::from_secs(60)));
        TunnelHandler::new(ZONE, table)
    }

    fn aaaa_query(qname: &str, id: u16) -> Message {
        let mut query = Message::new();
        query.set_id(id);
        query.set_recursion_desired(true);
        query.add_query(Query::query(Name::from_str(qname).unwrap(), RecordType::AAAA));
        query
    }

    fn src() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    async fn exchange(handler: &TunnelHandler, query: &Message) -> Message {
        let bytes = handler
            .handle_query(src(), &query.to_vec().unwrap())
            .await
            .expect("reply expected");
        Message::from_vec(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_upstream_frame_reaches_socket() {
        let dialer = Arc::new(PairDialer::new());
        let handler = handler_with(Arc::clone(&dialer));

        let payload: Vec<u8> = (0..30).collect();
        let session = SessionId::from_raw(0xcafe);
        let qname = build_query_name("a1b2", 0, session, &payload, ZONE).unwrap();
        let query = aaaa_query(&qname, 0x1234);

        let response = exchange(&handler, &query).await;
        assert_eq!(response.id(), 0x1234);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.authoritative());

        let mut far = dialer.take_far_end().await;
        let mut received = vec![0_u8; payload.len()];
        far.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
        assert_eq!(handler.stats().bytes_up(), 30);
    }

    #[tokio::test]
    async fn test_poll_drains_downstream() {
        let dialer = Arc::new(PairDialer::new());
        let handler = handler_with(Arc::clone(&dialer));
        let session = SessionId::from_raw(0x0a0b);

        // First poll creates the session.
        let poll = aaaa_query(&build_poll_name("0001", session, ZONE), 1);
        let response = exchange(&handler, &poll).await;
        assert_eq!(response.answers().len(), 0);
        assert_eq!(response.response_code(), ResponseCode::NoError);

        // Target sends 40 bytes; next poll carries two full blocks.
        let data: Vec<u8> = (0..40).collect();
        let mut far = dialer.take_far_end().await;
        far.write_all(&data).await.unwrap();

        let poll = aaaa_query(&build_poll_name("0002", session, ZONE), 2);
        let response = exchange(&handler, &poll).await;
        assert_eq!(response.answers().len(), 2);
        let bytes = crate::codec::answer_bytes(&response);
        assert_eq!(bytes, &data[..32]);

        // The 8-byte tail arrives zero-padded in a lone record.
        let poll = aaaa_query(&build_poll_name("0003", session, ZONE), 3);
        let response = exchange(&handler, &poll).await;
        assert_eq!(response.answers().len(), 1);
        let bytes = crate::codec::answer_bytes(&response);
        assert_eq!(&bytes[..8], &data[32..]);
        assert_eq!(&bytes[8..], &[0_u8; 8]);

        for record in response.answers() {
            assert_eq!(record.ttl(), 0);
            assert_eq!(record.dns_class(), DNSClass::IN);
        }
    }

    #[tokio::test]
    async fn test_non_aaaa_qtype_not_implemented() {
        let dialer = Arc::new(PairDialer::new());
        let handler = handler_with(dialer);

        let mut query = Message::new();
        query.set_id(7);
        query.add_query(Query::query(
            Name::from_str("a1b2-0000-cafe.tunnel.example.com.").unwrap(),
            RecordType::A,
        ));

        let response = exchange(&handler, &query).await;
        assert_eq!(response.response_code(), ResponseCode::NotImp);
        assert_eq!(handler.stats().queries_rejected(), 1);
    }

    #[tokio::test]
    async fn test_out_of_zone_nxdomain() {
        let dialer = Arc::new(PairDialer::new());
        let handler = handler_with(dialer);

        let query = aaaa_query("a1b2-0000-cafe.elsewhere.example.net.", 8);
        let response = exchange(&handler, &query).await;
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn test_malformed_header_format_error() {
        let dialer = Arc::new(PairDialer::new());
        let handler = handler_with(dialer);

        let query = aaaa_query("abcd-xyz1-0000.tunnel.example.com.", 9);
        let response = exchange(&handler, &query).await;
        assert_eq!(response.response_code(), ResponseCode::FormErr);
    }

    #[tokio::test]
    async fn test_dial_failure_servfail_no_session() {
        let dialer = Arc::new(PairDialer::failing());
        let handler = handler_with(dialer);

        let query = aaaa_query(&build_poll_name("00ff", SessionId::from_raw(1), ZONE), 10);
        let response = exchange(&handler, &query).await;
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert_eq!(handler.stats().dial_failures(), 1);
    }

    #[tokio::test]
    async fn test_case_insensitive_name_accepted() {
        let dialer = Arc::new(PairDialer::new());
        let handler = handler_with(Arc::clone(&dialer));

        let payload = b"Case Test";
        let lower = build_query_name("00aa", 1, SessionId::from_raw(0x1111), payload, ZONE).unwrap();
        let query = aaaa_query(&lower.to_ascii_uppercase(), 11);

        let response = exchange(&handler, &query).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);

        let mut far = dialer.take_far_end().await;
        let mut received = vec![0_u8; payload.len()];
        far.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, payload);
    }

    #[tokio::test]
    async fn test_undecodable_payload_dropped_but_downstream_served() {
        let dialer = Arc::new(PairDialer::new());
        let handler = handler_with(Arc::clone(&dialer));
        let session = SessionId::from_raw(0x3333);

        // Open the session and park bytes in its downstream buffer.
        let poll = aaaa_query(&build_poll_name("0001", session, ZONE), 20);
        exchange(&handler, &poll).await;
        let mut far = dialer.take_far_end().await;
        far.write_all(b"queued bytes").await.unwrap();

        // "a" passes the alphabet gate but is not a valid base-32
        // quantum, so the decode fails and the frame is dropped.
        let query = aaaa_query(&format!("00ab-0002-3333.a.{ZONE}"), 21);
        let response = exchange(&handler, &query).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(handler.stats().frames_dropped(), 1);
        assert_eq!(handler.stats().bytes_up(), 0);

        // The downstream bytes still rode along in the same reply.
        let bytes = crate::codec::answer_bytes(&response);
        assert_eq!(&bytes[..12], b"queued bytes");
    }

    #[tokio::test]
    async fn test_upstream_eof_marks_session_broken() {
        let dialer = Arc::new(PairDialer::new());
        let table = Arc::new(SessionTable::new(
            Arc::clone(&dialer) as Arc<dyn UpstreamDialer>,
            Duration::from_secs(60),
        ));
        let handler = TunnelHandler::new(ZONE, Arc::clone(&table));
        let session_id = SessionId::from_raw(0x2222);

        let poll = aaaa_query(&build_poll_name("0001", session_id, ZONE), 12);
        exchange(&handler, &poll).await;

        // Closing the far end makes the next harvest observe EOF.
        let far = dialer.take_far_end().await;
        drop(far);

        let poll = aaaa_query(&build_poll_name("0002", session_id, ZONE), 13);
        let response = exchange(&handler, &poll).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);

        let session = table.lookup(session_id).await.unwrap();
        assert!(session.is_broken());
        assert_eq!(table.evict_expired().await, 1);
    }
}
