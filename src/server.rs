//! The server side of the tunnel: terminates the paired HTTP requests and
//! bridges each completed pair to the upstream TCP destination.

use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use n0_error::{Result, StdResultExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, info, warn, Instrument};

use crate::parse::{self, TunnelRequest};
use crate::server::session::{BridgeEnds, Session, SessionRegistry};
use crate::util::PeekReader;
use crate::{chunked, HEADER_SECTION_MAX_LENGTH};

mod session;

/// How long the first half of a session waits for its partner.
const PAIRING_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the registry sweep. Stacked on the pairing timeout this makes
/// the effective window [PAIRING_TIMEOUT, PAIRING_TIMEOUT + SWEEP_INTERVAL].
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Pairs upload and download requests by session id and bridges each pair to
/// one TCP connection toward `remote`.
pub struct Server {
    remote: String,
    registry: Arc<SessionRegistry>,
    pairing_timeout: Duration,
    sweep_interval: Duration,
}

impl Server {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            registry: Arc::new(SessionRegistry::new()),
            pairing_timeout: PAIRING_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
        }
    }

    /// Overrides the pairing window. The defaults match the protocol; tests
    /// shrink them to exercise the sweeper at millisecond scale.
    pub fn with_pairing_window(mut self, pairing_timeout: Duration, sweep_interval: Duration) -> Self {
        self.pairing_timeout = pairing_timeout;
        self.sweep_interval = sweep_interval;
        self
    }

    /// Accepts tunnel connections from the listener until the listener fails.
    ///
    /// Each connection is served in its own task; dropping the returned
    /// future cancels the in-flight handlers and the sweeper.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let cancel_token = CancellationToken::new();
        let _cancel_guard = cancel_token.clone().drop_guard();

        let sweeper = {
            let registry = self.registry.clone();
            let pairing_timeout = self.pairing_timeout;
            let sweep_interval = self.sweep_interval;
            async move {
                let mut tick = tokio::time::interval(sweep_interval);
                loop {
                    tick.tick().await;
                    registry.sweep(pairing_timeout);
                }
            }
        };
        tokio::spawn(
            cancel_token
                .child_token()
                .run_until_cancelled_owned(sweeper)
                .instrument(error_span!("sweeper")),
        );

        let mut id = 0;
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let remote = self.remote.clone();
            let registry = self.registry.clone();
            tokio::spawn(
                cancel_token
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%peer_addr, "accepted connection");
                        if let Err(err) = handle_connection(stream, remote, registry).await {
                            warn!("connection closed with error: {err:#}");
                        } else {
                            debug!("connection closed");
                        }
                    })
                    .instrument(error_span!("conn", id)),
            );
            id += 1;
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote: String,
    registry: Arc<SessionRegistry>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = PeekReader::new(read_half, HEADER_SECTION_MAX_LENGTH);

    let request = match TunnelRequest::read(&mut reader).await {
        Ok(request) => request,
        Err(reject) => {
            if let Some(status) = reject.status() {
                debug!(%status, "rejecting request");
                parse::write_empty_response(&mut write_half, status).await.ok();
            }
            return Err(reject.into());
        }
    };

    info!(method = %request.method, session_id = %request.session_id, "new request");
    let session = registry.find_or_create(&request.session_id);

    if request.method == Method::GET {
        if session.claim_down().is_err() {
            parse::write_empty_response(&mut write_half, StatusCode::BAD_REQUEST).await.ok();
            debug!(session_id = %session.id(), "duplicate download half");
            return Ok(());
        }
        handle_download(session, write_half, &registry, &remote).await
    } else {
        if session.claim_up().is_err() {
            parse::write_empty_response(&mut write_half, StatusCode::BAD_REQUEST).await.ok();
            debug!(session_id = %session.id(), "duplicate upload half");
            return Ok(());
        }
        handle_upload(session, reader, write_half, &registry, &remote).await
    }
}

/// Serves the POST half: hands the chunked request body to the session and
/// acknowledges with an empty 200 once the session is over.
async fn handle_upload(
    session: Arc<Session>,
    reader: PeekReader<OwnedReadHalf>,
    mut write_half: OwnedWriteHalf,
    registry: &SessionRegistry,
    remote: &str,
) -> Result<()> {
    if let Some(ends) = session.attach_up(BufReader::new(reader)) {
        start_bridge(&session, ends, remote);
    }

    session.done().cancelled().await;
    debug!(session_id = %session.id(), "upload connection ends");
    registry.remove(&session);

    if let Err(err) = parse::write_empty_response(&mut write_half, StatusCode::OK).await {
        debug!("failed to acknowledge upload end: {err:#}");
    }
    Ok(())
}

/// Serves the GET half: sends the chunked response head, hands the raw
/// socket writer to the session, and returns once the session is over.
async fn handle_download(
    session: Arc<Session>,
    mut write_half: OwnedWriteHalf,
    registry: &SessionRegistry,
    remote: &str,
) -> Result<()> {
    if let Err(err) = parse::write_download_head(&mut write_half).await {
        session.terminate();
        registry.remove(&session);
        return Err(err).std_context("write download response head");
    }

    if let Some(ends) = session.attach_down(write_half) {
        start_bridge(&session, ends, remote);
    }

    session.done().cancelled().await;
    debug!(session_id = %session.id(), "download connection ends");

    if let Some(mut down) = session.reclaim_down() {
        // The pair never bridged; the chunked body still needs its terminator.
        if let Err(err) = down.write_all(chunked::FINAL_CHUNK).await {
            debug!("terminate download stream: {err:#}");
        }
    }
    registry.remove(&session);
    Ok(())
}

fn start_bridge(session: &Arc<Session>, ends: BridgeEnds, remote: &str) {
    info!(session_id = %session.id(), "session ready");
    let done = session.done().clone();
    tokio::spawn(
        bridge(remote.to_string(), ends, done)
            .instrument(error_span!("bridge", session_id = %session.id())),
    );
}

/// Connects to the upstream and runs the two pumps until either direction
/// ends, then fires the session's one-shot `done`.
async fn bridge(remote: String, ends: BridgeEnds, done: CancellationToken) {
    let BridgeEnds { mut up, mut down } = ends;

    let upstream = match TcpStream::connect(&remote).await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!("dial upstream {remote}: {err:#}");
            if let Err(err) = down.write_all(chunked::FINAL_CHUNK).await {
                debug!("terminate download stream: {err:#}");
            }
            done.cancel();
            return;
        }
    };
    if let Err(err) = upstream.set_nodelay(true) {
        debug!("set nodelay on upstream: {err:#}");
    }
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    tokio::join!(
        // Upload pump: decoded chunk payloads flow to the upstream socket.
        async {
            let outcome = tokio::select! {
                outcome = chunked::copy_chunked(&mut up, &mut upstream_write) => Some(outcome),
                _ = done.cancelled() => None,
            };
            match outcome {
                Some(Ok(total)) => debug!(total, "upload stream ended"),
                Some(Err(err)) => debug!("upload pump: {err:#}"),
                None => {}
            }
            done.cancel();
        },
        // Download pump: each upstream read becomes one chunk, and the
        // stream is terminated on every exit path.
        async {
            let mut buf = [0u8; chunked::COPY_BUF_SIZE];
            loop {
                let n = tokio::select! {
                    read = upstream_read.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(err) => {
                            debug!("read upstream: {err:#}");
                            break;
                        }
                    },
                    _ = done.cancelled() => break,
                };
                if let Err(err) = chunked::write_chunk(&mut down, &buf[..n]).await {
                    warn!("copy upstream to download: {err:#}");
                    break;
                }
            }
            if let Err(err) = down.write_all(chunked::FINAL_CHUNK).await {
                debug!("terminate download stream: {err:#}");
            }
            done.cancel();
        },
    );
}
