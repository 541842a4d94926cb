use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{Client, ClientOpts, Server};

// -- Test helpers --

/// Aborts the wrapped task when dropped.
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Call at the top of a test to see tunnel logs while debugging it.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

async fn with_timeout<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(30), fut)
        .await
        .expect("test timed out")
}

/// Spawns the pairing server on an ephemeral port.
async fn spawn_server(
    remote: impl Into<String>,
    window: Option<(Duration, Duration)>,
) -> (SocketAddr, TaskGuard) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut server = Server::new(remote.into());
    if let Some((pairing_timeout, sweep_interval)) = window {
        server = server.with_pairing_window(pairing_timeout, sweep_interval);
    }
    let task = tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (addr, TaskGuard(task))
}

/// Boots a server+client pair against `upstream_addr`; returns the client's
/// local listen address.
async fn spawn_tunnel(upstream_addr: SocketAddr) -> (SocketAddr, TaskGuard, TaskGuard) {
    let (server_addr, server_task) = spawn_server(upstream_addr.to_string(), None).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    let url = format!("http://{server_addr}/");
    let client = Client::new(ClientOpts {
        up_url: url.clone(),
        down_url: url,
        utls: false,
        skip_verify: false,
    })
    .unwrap();
    let client_task = tokio::spawn(async move {
        let _ = client.serve(listener).await;
    });

    (local_addr, server_task, TaskGuard(client_task))
}

/// TCP upstream that reads each connection to EOF and hands the bytes back.
async fn spawn_sink_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>, TaskGuard) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut received = Vec::new();
                if conn.read_to_end(&mut received).await.is_ok() {
                    tx.send(received).ok();
                }
            });
        }
    });
    (addr, rx, TaskGuard(task))
}

/// TCP upstream that writes `payload` to every connection and closes.
async fn spawn_source_upstream(payload: Vec<u8>) -> (SocketAddr, TaskGuard) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            let payload = payload.clone();
            tokio::spawn(async move {
                conn.write_all(&payload).await.ok();
            });
        }
    });
    (addr, TaskGuard(task))
}

/// TCP upstream that reads exactly `expect` bytes, then answers with the
/// bytewise complement and closes.
async fn spawn_complement_upstream(expect: usize) -> (SocketAddr, TaskGuard) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut received = vec![0u8; expect];
                if conn.read_exact(&mut received).await.is_err() {
                    return;
                }
                for byte in &mut received {
                    *byte = !*byte;
                }
                conn.write_all(&received).await.ok();
            });
        }
    });
    (addr, TaskGuard(task))
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    rand::rng().fill_bytes(&mut payload);
    payload
}

/// Sends raw request bytes and collects everything the server answers.
async fn raw_exchange(server_addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut conn = TcpStream::connect(server_addr).await.unwrap();
    conn.write_all(request).await.unwrap();
    let mut response = Vec::new();
    with_timeout(conn.read_to_end(&mut response)).await.unwrap();
    response
}

// -- End-to-end transfers --

/// A 4 KiB upload arrives at the upstream byte-exact.
#[tokio::test]
async fn upload_4096_bytes() {
    init_tracing();
    let (upstream_addr, mut received, _upstream) = spawn_sink_upstream().await;
    let (local_addr, _server, _client) = spawn_tunnel(upstream_addr).await;

    let payload = random_payload(4096);
    let mut conn = TcpStream::connect(local_addr).await.unwrap();
    conn.write_all(&payload).await.unwrap();
    conn.shutdown().await.unwrap();

    let received = with_timeout(received.recv()).await.unwrap();
    assert_eq!(received, payload);

    // The session tears down cleanly: the local read side drains to EOF.
    let mut rest = Vec::new();
    with_timeout(conn.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());
}

/// A 4 KiB download arrives at the local connection byte-exact.
#[tokio::test]
async fn download_4096_bytes() {
    init_tracing();
    let payload = random_payload(4096);
    let (upstream_addr, _upstream) = spawn_source_upstream(payload.clone()).await;
    let (local_addr, _server, _client) = spawn_tunnel(upstream_addr).await;

    let mut conn = TcpStream::connect(local_addr).await.unwrap();
    let mut received = Vec::new();
    with_timeout(conn.read_to_end(&mut received)).await.unwrap();
    assert_eq!(received, payload);
}

/// Random-length write bursts hash identically on both ends.
#[tokio::test]
async fn randomized_bursts_arrive_byte_exact() {
    init_tracing();
    let (upstream_addr, mut received, _upstream) = spawn_sink_upstream().await;
    let (local_addr, _server, _client) = spawn_tunnel(upstream_addr).await;

    let mut rng = rand::rng();
    let mut sent = Sha256::new();
    let mut conn = TcpStream::connect(local_addr).await.unwrap();
    for _ in 0..=20 {
        let burst = random_payload(rng.random_range(1..=2048));
        sent.update(&burst);
        conn.write_all(&burst).await.unwrap();
    }
    conn.shutdown().await.unwrap();

    let received = with_timeout(received.recv()).await.unwrap();
    assert_eq!(Sha256::digest(&received), sent.finalize());
}

/// Idle gaps longer than the pairing window must not kill a paired session.
#[tokio::test]
async fn idle_gaps_do_not_trip_pairing_timeout() {
    init_tracing();
    let (upstream_addr, mut received, _upstream) = spawn_sink_upstream().await;
    let (local_addr, _server, _client) = spawn_tunnel(upstream_addr).await;

    let mut sent = Sha256::new();
    let mut conn = TcpStream::connect(local_addr).await.unwrap();
    // 3 bursts with 4 s gaps stretch past the [10 s, 15 s] pairing window.
    for _ in 0..3 {
        let burst = random_payload(512);
        sent.update(&burst);
        conn.write_all(&burst).await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
    }
    conn.shutdown().await.unwrap();

    let received = with_timeout(received.recv()).await.unwrap();
    assert_eq!(Sha256::digest(&received), sent.finalize());
}

/// Many concurrent sessions each see their own bytes, both directions.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_sessions_are_isolated() {
    init_tracing();
    const SESSIONS: usize = 50;
    const PAYLOAD_LEN: usize = 64 * 1024;

    let (upstream_addr, _upstream) = spawn_complement_upstream(PAYLOAD_LEN).await;
    let (local_addr, _server, _client) = spawn_tunnel(upstream_addr).await;

    let mut tasks = Vec::with_capacity(SESSIONS);
    for _ in 0..SESSIONS {
        tasks.push(tokio::spawn(async move {
            let payload = random_payload(PAYLOAD_LEN);
            let mut conn = TcpStream::connect(local_addr).await.unwrap();
            conn.write_all(&payload).await.unwrap();

            let mut received = vec![0u8; PAYLOAD_LEN];
            conn.read_exact(&mut received).await.unwrap();
            for byte in &mut received {
                *byte = !*byte;
            }
            assert_eq!(Sha256::digest(&received), Sha256::digest(&payload));
        }));
    }
    for task in tasks {
        with_timeout(task).await.unwrap();
    }
}

/// A raw request pair where body bytes share a packet with the POST headers.
#[tokio::test]
async fn raw_pair_with_inline_body_bytes() {
    init_tracing();
    let (upstream_addr, mut received, _upstream) = spawn_sink_upstream().await;
    let (server_addr, _server) = spawn_server(upstream_addr.to_string(), None).await;

    let mut post = TcpStream::connect(server_addr).await.unwrap();
    post.write_all(
        b"POST /up HTTP/1.1\r\n\
          X-Session-Id: deadbeef\r\n\
          Transfer-Encoding: chunked\r\n\
          \r\n\
          5\r\nhello\r\n0\r\n\r\n",
    )
    .await
    .unwrap();

    let mut get = TcpStream::connect(server_addr).await.unwrap();
    get.write_all(b"GET /down HTTP/1.1\r\nX-Session-Id: deadbeef\r\n\r\n")
        .await
        .unwrap();

    let received = with_timeout(received.recv()).await.unwrap();
    assert_eq!(received, b"hello");

    let mut post_response = Vec::new();
    with_timeout(post.read_to_end(&mut post_response))
        .await
        .unwrap();
    assert!(post_response.starts_with(b"HTTP/1.1 200 OK\r\n"));
    let head = String::from_utf8(post_response).unwrap();
    assert!(head.contains("Content-Length: 0\r\n"));
    assert!(head.contains("Connection: close\r\n"));

    let mut get_response = Vec::new();
    with_timeout(get.read_to_end(&mut get_response))
        .await
        .unwrap();
    assert!(get_response.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(get_response.ends_with(b"0\r\n\r\n"));
}

// -- Pairing semantics --

/// A second POST for a half-attached session is rejected and the first
/// keeps waiting.
#[tokio::test]
async fn duplicate_upload_half_rejected() {
    init_tracing();
    let (server_addr, _server) = spawn_server("127.0.0.1:9", None).await;

    let head = b"POST / HTTP/1.1\r\nX-Session-Id: dup\r\nTransfer-Encoding: chunked\r\n\r\n";
    let mut first = TcpStream::connect(server_addr).await.unwrap();
    first.write_all(head).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = raw_exchange(server_addr, head).await;
    assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));

    // The extant half is unaffected: still attached, no response yet.
    let mut buf = [0u8; 1];
    let pending = tokio::time::timeout(Duration::from_millis(250), first.read(&mut buf)).await;
    assert!(pending.is_err());
}

#[tokio::test]
async fn duplicate_download_half_rejected() {
    init_tracing();
    let (server_addr, _server) = spawn_server("127.0.0.1:9", None).await;

    let head = b"GET / HTTP/1.1\r\nX-Session-Id: dup\r\n\r\n";
    let mut first = TcpStream::connect(server_addr).await.unwrap();
    first.write_all(head).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = raw_exchange(server_addr, head).await;
    assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
}

/// The lone half of a timed-out session is released within the window.
#[tokio::test]
async fn half_attached_post_released_within_window() {
    init_tracing();
    let pairing_timeout = Duration::from_millis(300);
    let sweep_interval = Duration::from_millis(100);
    let (server_addr, _server) =
        spawn_server("127.0.0.1:9", Some((pairing_timeout, sweep_interval))).await;

    let started = Instant::now();
    let response = raw_exchange(
        server_addr,
        b"POST / HTTP/1.1\r\nX-Session-Id: lonely\r\nTransfer-Encoding: chunked\r\n\r\n",
    )
    .await;
    let elapsed = started.elapsed();

    assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(
        elapsed >= pairing_timeout,
        "released too early: {elapsed:?}"
    );
    assert!(
        elapsed < pairing_timeout + sweep_interval + Duration::from_secs(2),
        "released too late: {elapsed:?}"
    );
}

/// A swept download half still gets its chunked body terminated.
#[tokio::test]
async fn unpaired_download_body_is_terminated() {
    init_tracing();
    let window = Some((Duration::from_millis(300), Duration::from_millis(100)));
    let (server_addr, _server) = spawn_server("127.0.0.1:9", window).await;

    let response = raw_exchange(
        server_addr,
        b"GET / HTTP/1.1\r\nX-Session-Id: lonely\r\n\r\n",
    )
    .await;
    assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with(b"0\r\n\r\n"));
}

/// After removal the id belongs to a fresh session, not a 400.
#[tokio::test]
async fn session_id_is_reusable_after_removal() {
    init_tracing();
    let window = Some((Duration::from_millis(200), Duration::from_millis(50)));
    let (server_addr, _server) = spawn_server("127.0.0.1:9", window).await;

    let head = b"POST / HTTP/1.1\r\nX-Session-Id: reuse\r\nTransfer-Encoding: chunked\r\n\r\n";
    let response = raw_exchange(server_addr, head).await;
    assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));

    // Same id again: a fresh session attaches and waits instead of a 400.
    let mut second = TcpStream::connect(server_addr).await.unwrap();
    second.write_all(head).await.unwrap();
    let mut buf = [0u8; 1];
    let pending = tokio::time::timeout(Duration::from_millis(100), second.read(&mut buf)).await;
    assert!(pending.is_err());
}

// -- Protocol errors --

/// Every rejection is a literal empty-body response with the right status.
#[tokio::test]
async fn protocol_errors_get_literal_responses() {
    init_tracing();
    let (server_addr, _server) = spawn_server("127.0.0.1:9", None).await;

    let cases: &[(&[u8], &str)] = &[
        (
            b"PUT / HTTP/1.1\r\nX-Session-Id: abc\r\n\r\n",
            "HTTP/1.1 405 Method Not Allowed",
        ),
        (
            b"GET / HTTP/2.0\r\nX-Session-Id: abc\r\n\r\n",
            "HTTP/1.1 505 HTTP Version Not Supported",
        ),
        (b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", "HTTP/1.1 400 Bad Request"),
        (
            b"GET / HTTP/1.1\r\nX-Session-Id: 0123456789abcdef0\r\n\r\n",
            "HTTP/1.1 400 Bad Request",
        ),
        (b"garbage\r\n\r\n", "HTTP/1.1 400 Bad Request"),
    ];

    for (request, expected_status) in cases {
        let response = raw_exchange(server_addr, request).await;
        let response = String::from_utf8(response).unwrap();
        assert!(
            response.starts_with(expected_status),
            "request {:?} answered {response:?}",
            String::from_utf8_lossy(request)
        );
        assert!(response.contains("Content-Length: 0\r\n"));
        assert!(response.contains("Connection: close\r\n"));
    }
}
