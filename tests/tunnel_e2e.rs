//! End-to-end tunnel tests
//!
//! These tests run the real client and server against each other over
//! loopback UDP, with a local TCP listener standing in for the upstream
//! target. The client's queries travel through its normal SOCKS5 and
//! polling paths; nothing is mocked below the byte-stream boundary.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use std::str::FromStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

use dnspipe::client::TunnelClient;
use dnspipe::config::{ClientConfig, ServerConfig};
use dnspipe::server::UdpTunnelServer;

const ZONE: &str = "tunnel.example.com.";

/// TCP listener standing in for the upstream target.
struct MockUpstream {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    conns: mpsc::UnboundedReceiver<TcpStream>,
}

impl MockUpstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (tx, conns) = mpsc::unbounded_channel();

        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                if tx.send(conn).is_err() {
                    return;
                }
            }
        });

        Self {
            addr,
            accepted,
            conns,
        }
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    async fn next_conn(&mut self) -> TcpStream {
        tokio::time::timeout(Duration::from_secs(5), self.conns.recv())
            .await
            .expect("upstream connection expected")
            .unwrap()
    }
}

struct TestServer {
    server: Arc<UdpTunnelServer>,
    shutdown: tokio::sync::oneshot::Sender<()>,
    runner: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(target: SocketAddr, session_timeout: Duration, reaper: Duration) -> Self {
        let mut config = ServerConfig::new(ZONE, "127.0.0.1", target.port())
            .with_listen("127.0.0.1:0")
            .with_session_timeout(session_timeout);
        config.reaper_interval_secs = reaper.as_secs().max(1);

        let server = Arc::new(UdpTunnelServer::bind(&config).await.unwrap());
        let (shutdown, shutdown_rx) = tokio::sync::oneshot::channel();
        let runner = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let _ = server.run_until_shutdown(shutdown_rx).await;
            })
        };

        Self {
            server,
            shutdown,
            runner,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = tokio::time::timeout(Duration::from_secs(2), self.runner).await;
    }
}

async fn start_client(server_addr: SocketAddr) -> dnspipe::client::TunnelHandle {
    let config = ClientConfig::new(ZONE)
        .with_dns_server(server_addr.to_string())
        .with_socks_port(0)
        .with_poll_interval(Duration::from_millis(20));
    TunnelClient::new(config).unwrap().start().await.unwrap()
}

/// Complete the SOCKS5 no-auth CONNECT dance and return the stream.
async fn socks5_connect(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0_u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    // CONNECT to a destination the tunnel will ignore.
    stream
        .write_all(&[0x05, 0x01, 0x00, 0x01, 9, 9, 9, 9, 0x00, 0x50])
        .await
        .unwrap();
    let mut success = [0_u8; 10];
    stream.read_exact(&mut success).await.unwrap();
    assert_eq!(&success[..4], &[0x05, 0x00, 0x00, 0x01]);

    stream
}

/// Send one raw query and return the parsed response.
async fn raw_query(server: SocketAddr, qname: &str, qtype: RecordType, id: u16) -> Message {
    let mut query = Message::new();
    query.set_id(id);
    query.set_recursion_desired(true);
    query.add_query(Query::query(Name::from_str(qname).unwrap(), qtype));

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&query.to_vec().unwrap(), server)
        .await
        .unwrap();

    let mut buf = vec![0_u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("response expected")
        .unwrap();
    Message::from_vec(&buf[..len]).unwrap()
}

/// Read from `stream` until `idle` passes with no new bytes.
async fn read_until_idle(stream: &mut TcpStream, idle: Duration) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0_u8; 1024];
    loop {
        match tokio::time::timeout(idle, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            _ => break,
        }
    }
    out
}

#[tokio::test]
async fn test_upstream_bytes_reach_target_in_order() {
    let mut upstream = MockUpstream::start().await;
    let server = TestServer::start(upstream.addr, Duration::from_secs(60), Duration::from_secs(10)).await;
    let client = start_client(server.addr()).await;

    let mut socks = socks5_connect(client.local_addr()).await;
    let payload: Vec<u8> = (0..0x1E).collect();
    socks.write_all(&payload).await.unwrap();

    let mut conn = upstream.next_conn().await;
    let mut received = vec![0_u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut received))
        .await
        .expect("upstream bytes expected")
        .unwrap();
    assert_eq!(received, payload);
    assert_eq!(upstream.accepted(), 1);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_downstream_blocks_and_padded_tail() {
    let mut upstream = MockUpstream::start().await;
    let server = TestServer::start(upstream.addr, Duration::from_secs(60), Duration::from_secs(10)).await;
    let client = start_client(server.addr()).await;

    let mut socks = socks5_connect(client.local_addr()).await;
    // A first upstream byte opens the session.
    socks.write_all(&[0xFF]).await.unwrap();
    let mut conn = upstream.next_conn().await;
    let mut one = [0_u8; 1];
    conn.read_exact(&mut one).await.unwrap();

    // 40 downstream bytes: two full blocks, then a zero-padded 8-byte
    // tail whose padding the client cannot distinguish from payload.
    let data: Vec<u8> = (1..=40).collect();
    conn.write_all(&data).await.unwrap();

    let received = read_until_idle(&mut socks, Duration::from_millis(500)).await;
    assert!(
        received.len() >= data.len(),
        "expected at least {} bytes, got {}",
        data.len(),
        received.len()
    );
    assert_eq!(&received[..data.len()], &data[..]);
    assert!(received[data.len()..].iter().all(|&b| b == 0));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_tls_passthrough_ships_first_record() {
    let mut upstream = MockUpstream::start().await;
    let server = TestServer::start(upstream.addr, Duration::from_secs(60), Duration::from_secs(10)).await;
    let client = start_client(server.addr()).await;

    // Not SOCKS5: first byte 0x16 makes the adapter buffer the whole TLS
    // record before tunneling. A 20-byte body keeps this to one frame so
    // arrival order is deterministic.
    let mut record = vec![0x16, 0x03, 0x01, 0x00, 0x14];
    record.extend((0..20).map(|i| i as u8));

    let mut stream = TcpStream::connect(client.local_addr()).await.unwrap();
    stream.write_all(&record).await.unwrap();

    let mut conn = upstream.next_conn().await;
    let mut received = vec![0_u8; record.len()];
    tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut received))
        .await
        .expect("record expected upstream")
        .unwrap();
    assert_eq!(received, record);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_same_session_queries_dial_once() {
    let upstream = MockUpstream::start().await;
    let server = TestServer::start(upstream.addr, Duration::from_secs(60), Duration::from_secs(10)).await;
    let addr = server.addr();

    // Two concurrent polls for one session id.
    let qname = "0a0a-ffff-beef.tunnel.example.com.";
    let (first, second) = tokio::join!(
        raw_query(addr, qname, RecordType::AAAA, 0x0001),
        raw_query(addr, qname, RecordType::AAAA, 0x0002),
    );

    assert_eq!(first.response_code(), ResponseCode::NoError);
    assert_eq!(second.response_code(), ResponseCode::NoError);
    assert_eq!(server.server.sessions().len().await, 1);
    assert_eq!(upstream.accepted(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_rejection_rcodes_and_id_echo() {
    let upstream = MockUpstream::start().await;
    let server = TestServer::start(upstream.addr, Duration::from_secs(60), Duration::from_secs(10)).await;
    let addr = server.addr();

    // Non-AAAA qtype: NotImp.
    let response = raw_query(addr, "aaaa-0000-cafe.tunnel.example.com.", RecordType::A, 0x1111).await;
    assert_eq!(response.response_code(), ResponseCode::NotImp);
    assert_eq!(response.id(), 0x1111);

    // Outside the zone: NXDomain.
    let response = raw_query(addr, "aaaa-0000-cafe.other.example.net.", RecordType::AAAA, 0x2222).await;
    assert_eq!(response.response_code(), ResponseCode::NXDomain);
    assert_eq!(response.id(), 0x2222);

    // Malformed header token: FormErr.
    let response = raw_query(addr, "abcd-xyz1-0000.tunnel.example.com.", RecordType::AAAA, 0x3333).await;
    assert_eq!(response.response_code(), ResponseCode::FormErr);
    assert_eq!(response.id(), 0x3333);

    // Nothing above should have touched the session table.
    assert_eq!(server.server.sessions().len().await, 0);
    assert_eq!(upstream.accepted(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_dial_failure_yields_servfail() {
    // Reserve a port with no listener behind it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_target = listener.local_addr().unwrap();
    drop(listener);

    let server = TestServer::start(dead_target, Duration::from_secs(60), Duration::from_secs(10)).await;
    let response = raw_query(
        server.addr(),
        "0001-ffff-dead.tunnel.example.com.",
        RecordType::AAAA,
        0x4444,
    )
    .await;
    assert_eq!(response.response_code(), ResponseCode::ServFail);
    assert_eq!(server.server.sessions().len().await, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_idle_session_is_reaped_and_redial_works() {
    let mut upstream = MockUpstream::start().await;
    // 1 s idle timeout, 1 s reaper cadence: the session must be gone
    // well before the 5 s assertion deadline.
    let server = TestServer::start(upstream.addr, Duration::from_secs(1), Duration::from_secs(1)).await;
    let addr = server.addr();
    let qname = "00aa-ffff-f00d.tunnel.example.com.";

    let response = raw_query(addr, qname, RecordType::AAAA, 0x5555).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(server.server.sessions().len().await, 1);
    let mut conn = upstream.next_conn().await;

    // No queries for the session: the reaper evicts it and closes its
    // socket.
    let mut deadline = 0;
    while server.server.sessions().len().await > 0 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        deadline += 1;
        assert!(deadline < 25, "session should have been evicted");
    }

    let mut buf = [0_u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf)).await;
    assert!(
        matches!(read, Ok(Ok(0)) | Ok(Err(_))),
        "socket should be closed after eviction"
    );

    // The same session id starts a fresh cycle with a new dial.
    let response = raw_query(addr, qname, RecordType::AAAA, 0x6666).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(upstream.accepted(), 2);

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_evicts_sessions() {
    let mut upstream = MockUpstream::start().await;
    let server = TestServer::start(upstream.addr, Duration::from_secs(60), Duration::from_secs(10)).await;

    let response = raw_query(
        server.addr(),
        "0001-ffff-aaaa.tunnel.example.com.",
        RecordType::AAAA,
        0x7777,
    )
    .await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    let mut conn = upstream.next_conn().await;

    server.stop().await;

    let mut buf = [0_u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf)).await;
    assert!(
        matches!(read, Ok(Ok(0)) | Ok(Err(_))),
        "socket should be closed after shutdown"
    );
}
