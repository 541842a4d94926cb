//! The client side of the tunnel: accepts local TCP connections and carries
//! each one over a pair of HTTP/1.1 requests against the remote endpoint.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use n0_error::{Result, StdResultExt};
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, error_span, info, Instrument};

use crate::SESSION_ID_HEADER;

mod tls;

/// Time budget for establishing the TCP/TLS leg of either request.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientOpts {
    /// URL receiving the upload POST.
    pub up_url: String,
    /// URL answering the download GET.
    pub down_url: String,
    /// Shape the TLS handshake like a browser instead of the stock stack.
    pub utls: bool,
    /// Skip server certificate validation.
    pub skip_verify: bool,
}

/// Tunnels every accepted local connection through one POST/GET pair.
pub struct Client {
    opts: ClientOpts,
    http: reqwest::Client,
}

impl Client {
    pub fn new(opts: ClientOpts) -> Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if opts.utls {
            info!("using tls fingerprint mimicry");
            builder = builder.use_preconfigured_tls(tls::mimicry_config(opts.skip_verify)?);
        } else if opts.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build().std_context("build http client")?;
        Ok(Self { opts, http })
    }

    /// Accepts local connections from the listener and tunnels each one.
    ///
    /// Each connection is served in its own task; dropping the returned
    /// future cancels the in-flight sessions.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let cancel_token = CancellationToken::new();
        let _cancel_guard = cancel_token.clone().drop_guard();
        let this = Arc::new(self);
        loop {
            let (conn, peer_addr) = listener.accept().await?;
            let this = this.clone();
            tokio::spawn(
                cancel_token
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%peer_addr, "accepted local connection");
                        if let Err(err) = this.handle_connection(conn).await {
                            error!("handle connection: {err:#}");
                        }
                    })
                    .instrument(error_span!("local-conn", client = %peer_addr)),
            );
        }
    }

    /// Runs one session: twin requests linked by a shared cancellation
    /// scope, so either exchange ending aborts the other's in-flight I/O.
    async fn handle_connection(&self, conn: TcpStream) -> Result<()> {
        conn.set_nodelay(true)?;
        let session_id = generate_session_id();
        info!(%session_id, "new session");

        let (read_half, mut write_half) = conn.into_split();
        let cancel = CancellationToken::new();

        let upload = {
            let cancel = cancel.clone();
            let session_id = session_id.clone();
            async move {
                let body = reqwest::Body::wrap_stream(ReaderStream::new(read_half));
                let request = self
                    .http
                    .post(&self.opts.up_url)
                    .header(SESSION_ID_HEADER, &session_id)
                    .body(body);
                let response = tokio::select! {
                    response = request.send() => Some(response),
                    _ = cancel.cancelled() => None,
                };
                match response {
                    Some(Ok(response)) => {
                        debug!(status = %response.status(), "upload request finished");
                        // Drain whatever comes back; only the exchange end matters.
                        tokio::select! {
                            _ = response.bytes() => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                    Some(Err(err)) => error!("upload request: {err:#}"),
                    None => debug!("upload cancelled"),
                }
                cancel.cancel();
            }
        };

        let download = {
            let cancel = cancel.clone();
            let session_id = session_id.clone();
            async move {
                let request = self
                    .http
                    .get(&self.opts.down_url)
                    .header(SESSION_ID_HEADER, &session_id);
                let response = tokio::select! {
                    response = request.send() => Some(response),
                    _ = cancel.cancelled() => None,
                };
                let response = match response {
                    Some(Ok(response)) => response,
                    Some(Err(err)) => {
                        error!("download request: {err:#}");
                        cancel.cancel();
                        return;
                    }
                    None => {
                        debug!("download cancelled");
                        return;
                    }
                };
                if response.status() != StatusCode::OK {
                    error!(status = %response.status(), "download request refused");
                    cancel.cancel();
                    return;
                }
                debug!("download stream established");

                let mut body = response.bytes_stream();
                loop {
                    let chunk = tokio::select! {
                        chunk = body.next() => chunk,
                        _ = cancel.cancelled() => break,
                    };
                    match chunk {
                        Some(Ok(bytes)) => {
                            if let Err(err) = write_half.write_all(&bytes).await {
                                debug!("write to local connection: {err:#}");
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            debug!("read download stream: {err:#}");
                            break;
                        }
                        None => break,
                    }
                }
                write_half.shutdown().await.ok();
                cancel.cancel();
            }
        };

        tokio::join!(upload, download);
        info!(%session_id, "session ends");
        Ok(())
    }
}

/// Hex-encoded 8-byte random pairing token for the session-id header.
fn generate_session_id() -> String {
    let random_bytes: [u8; 8] = rand::rng().random();
    hex::encode(random_bytes)
}
