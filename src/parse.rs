//! Parsing of the two tunnel request forms and the literal responses the
//! server writes back on the raw socket.

use http::{Method, StatusCode};
use n0_error::{anyerr, stack_error, AnyError};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::util::PeekReader;
use crate::{MAX_SESSION_ID_LEN, SESSION_ID_HEADER};

/// A request turned away before reaching a handler.
///
/// Carries the HTTP status to answer with; `None` means the connection is
/// beyond answering (transport failure while reading the request).
#[stack_error(add_meta, derive)]
pub(crate) struct Reject {
    status: Option<StatusCode>,
    #[error(source)]
    source: AnyError,
}

impl Reject {
    pub(crate) fn status(&self) -> Option<StatusCode> {
        self.status
    }

    fn bad_request(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_REQUEST), source.into())
    }

    fn method_not_allowed(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::METHOD_NOT_ALLOWED), source.into())
    }

    fn version_not_supported(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::HTTP_VERSION_NOT_SUPPORTED), source.into())
    }

    fn io(source: impl Into<AnyError>) -> Self {
        Self::new(None, source.into())
    }
}

/// The validated request line and session id of one tunnel half.
#[derive(Debug)]
pub(crate) struct TunnelRequest {
    pub(crate) method: Method,
    pub(crate) session_id: String,
}

impl TunnelRequest {
    /// Reads and parses the request line and header section.
    ///
    /// The header section is consumed from `reader`; any body bytes that
    /// arrived with it stay buffered.
    pub(crate) async fn read<R>(reader: &mut PeekReader<R>) -> Result<Self, Reject>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let n = reader.fill().await.map_err(Reject::io)?;
            if let Some((header_len, request)) = Self::parse(reader.peeked())? {
                reader.consume(header_len);
                return Ok(request);
            }
            if n == 0 {
                return Err(Reject::bad_request(anyerr!(
                    "header section truncated or over the size limit"
                )));
            }
        }
    }

    /// Parses a request from a buffer; `None` when more input is needed.
    ///
    /// Returns the length of the header section and the validated request.
    pub(crate) fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, Reject> {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf) {
            Ok(httparse::Status::Partial) => Ok(None),
            Ok(httparse::Status::Complete(header_len)) => {
                Self::validate(&req).map(|request| Some((header_len, request)))
            }
            // httparse only speaks HTTP/1.0 and HTTP/1.1; any other version
            // token on an otherwise well-formed request line lands here.
            Err(httparse::Error::Version) => Err(Reject::version_not_supported(anyerr!(
                "unsupported HTTP version"
            ))),
            Err(err) => Err(Reject::bad_request(anyerr!("invalid request: {err}"))),
        }
    }

    fn validate(req: &httparse::Request<'_, '_>) -> Result<Self, Reject> {
        let method = match req.method {
            Some("GET") => Method::GET,
            Some("POST") => Method::POST,
            Some(other) => {
                return Err(Reject::method_not_allowed(anyerr!(
                    "method {other} not allowed"
                )))
            }
            None => return Err(Reject::bad_request(anyerr!("missing method"))),
        };

        let mut session_id = None;
        for header in req.headers.iter() {
            if header.name.eq_ignore_ascii_case(SESSION_ID_HEADER) {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| Reject::bad_request(anyerr!("session id is not ASCII")))?;
                session_id = Some(value.to_string());
            }
        }
        let session_id = session_id
            .ok_or_else(|| Reject::bad_request(anyerr!("missing {SESSION_ID_HEADER} header")))?;
        if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
            return Err(Reject::bad_request(anyerr!(
                "session id must be 1..={MAX_SESSION_ID_LEN} octets"
            )));
        }

        Ok(Self { method, session_id })
    }
}

/// Writes the literal empty-body response used for errors and the upload
/// acknowledgement, always closing the exchange.
pub(crate) async fn write_empty_response<W>(writer: &mut W, status: StatusCode) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    writer.write_all(head.as_bytes()).await
}

/// Writes the download response head that precedes the chunked body.
pub(crate) async fn write_download_head<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(
            b"HTTP/1.1 200 OK\r\n\
              Transfer-Encoding: chunked\r\n\
              Content-Type: application/octet-stream\r\n\
              Connection: close\r\n\
              \r\n",
        )
        .await
}
