//! One-shot UDP DNS exchange
//!
//! Every tunnel frame is an independent DNS query: a fresh ephemeral
//! socket, one send, one reply bounded by the exchange timeout. Responses
//! from unexpected sources or with a mismatched id are rejected.

use std::net::SocketAddr;
use std::time::Duration;

use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{TunnelError, TunnelResult};

/// Receive buffer size; large enough for any response the server packs.
const RECV_BUFFER_SIZE: usize = 4096;

/// Stateless UDP DNS exchanger aimed at one recursive resolver.
#[derive(Debug)]
pub struct DnsExchange {
    server: SocketAddr,
    timeout: Duration,
}

impl DnsExchange {
    /// Create an exchanger for `server` with the given per-query timeout.
    #[must_use]
    pub const fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    /// The resolver this exchanger talks to.
    #[must_use]
    pub const fn server(&self) -> SocketAddr {
        self.server
    }

    /// Build an AAAA query for `qname` with a random message id.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Dns`] if `qname` is not a valid DNS name.
    pub fn build_aaaa_query(qname: &str) -> TunnelResult<Message> {
        let name = Name::from_ascii(qname)
            .map_err(|e| TunnelError::dns(format!("invalid query name {qname:?}: {e}")))?;

        let mut message = Message::new();
        message.set_id(rand::thread_rng().gen());
        message.set_recursion_desired(true);
        message.add_query(Query::query(name, RecordType::AAAA));
        Ok(message)
    }

    /// Send one query and await its response.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Dns`] on serialization or parse failures
    /// - [`TunnelError::Network`] on socket failures or a response from an
    ///   unexpected source
    /// - [`TunnelError::Timeout`] when no response arrives in time
    pub async fn exchange(&self, query: &Message) -> TunnelResult<Message> {
        let query_bytes = query
            .to_vec()
            .map_err(|e| TunnelError::dns(format!("failed to serialize query: {e}")))?;

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| TunnelError::network_io("failed to bind query socket", e))?;

        socket
            .send_to(&query_bytes, self.server)
            .await
            .map_err(|e| {
                TunnelError::network_io(format!("failed to send query to {}", self.server), e)
            })?;

        let mut buf = vec![0_u8; RECV_BUFFER_SIZE];
        let (len, src) = match timeout(self.timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                return Err(TunnelError::network_io(
                    format!("failed to receive response from {}", self.server),
                    e,
                ));
            }
            Err(_) => {
                return Err(TunnelError::timeout(
                    format!("query to {}", self.server),
                    self.timeout,
                ));
            }
        };

        if src != self.server {
            return Err(TunnelError::network(format!(
                "response from unexpected source {src} (expected {})",
                self.server
            )));
        }

        let response = Message::from_vec(&buf[..len])
            .map_err(|e| TunnelError::dns(format!("failed to parse response: {e}")))?;

        if response.id() != query.id() {
            return Err(TunnelError::network(format!(
                "response id {:#06x} does not match query id {:#06x}",
                response.id(),
                query.id()
            )));
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Header, ResponseCode};

    #[test]
    fn test_build_aaaa_query() {
        let query = DnsExchange::build_aaaa_query("abcd-0000-cafe.tunnel.example.com.").unwrap();
        let question = query.queries().first().unwrap();
        assert_eq!(question.query_type(), RecordType::AAAA);
        assert!(query.recursion_desired());
    }

    #[test]
    fn test_build_rejects_bad_name() {
        // A label above 63 characters is not a valid DNS name.
        let long = format!("{}.example.com.", "a".repeat(80));
        assert!(DnsExchange::build_aaaa_query(&long).is_err());
    }

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let resolver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = resolver.local_addr().unwrap();

        // Minimal responder echoing an empty NoError reply.
        tokio::spawn(async move {
            let mut buf = vec![0_u8; RECV_BUFFER_SIZE];
            let (len, src) = resolver.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..len]).unwrap();
            let mut reply = query.clone();
            let mut header = Header::response_from_request(query.header());
            header.set_response_code(ResponseCode::NoError);
            reply.set_header(header);
            resolver
                .send_to(&reply.to_vec().unwrap(), src)
                .await
                .unwrap();
        });

        let exchange = DnsExchange::new(addr, Duration::from_secs(1));
        let query = DnsExchange::build_aaaa_query("x-0000-cafe.z.example.").unwrap();
        let response = exchange.exchange(&query).await.unwrap();
        assert_eq!(response.id(), query.id());
    }

    #[tokio::test]
    async fn test_exchange_times_out() {
        // Nothing listens here; bind to reserve the port then keep silent.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let exchange = DnsExchange::new(addr, Duration::from_millis(50));
        let query = DnsExchange::build_aaaa_query("x-ffff-cafe.z.example.").unwrap();
        let err = exchange.exchange(&query).await.unwrap_err();
        assert!(err.is_timeout());
    }
}
