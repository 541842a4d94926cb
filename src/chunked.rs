//! HTTP/1.1 chunked transfer framing as a raw byte-pipe adapter.
//!
//! Only the `size CRLF data CRLF` form is produced and consumed: no chunk
//! extensions, no trailers. Sizes parse as 32-bit values. The encoder
//! assembles size line, payload, and trailer into a single write.

use bytes::BytesMut;
use tokio::io::{
    self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt,
};

/// Terminating chunk ending a chunked stream.
pub(crate) const FINAL_CHUNK: &[u8] = b"0\r\n\r\n";

/// Read size of the download pump; reads map 1:1 onto emitted chunks.
pub(crate) const COPY_BUF_SIZE: usize = 2048;

/// Size line for a full `COPY_BUF_SIZE` read, skipping the hex formatting.
const FULL_SIZE_LINE: &[u8] = b"800\r\n";

/// 8 hex digits cover any 32-bit size; anything longer is malformed.
const MAX_SIZE_LINE: u64 = 10;

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Reads one chunk size line. `Ok(0)` is the terminating chunk.
async fn read_chunk_size<R>(reader: &mut R) -> io::Result<u32>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(16);
    let n = (&mut *reader)
        .take(MAX_SIZE_LINE)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    if !line.ends_with(b"\r\n") {
        return Err(invalid("chunk size line is not CRLF terminated"));
    }
    line.truncate(line.len() - 2);
    let digits = std::str::from_utf8(&line).map_err(|_| invalid("chunk size is not ASCII"))?;
    u32::from_str_radix(digits, 16).map_err(|_| invalid("malformed chunk size"))
}

/// Decodes a chunked stream from `reader`, copying each payload to `writer`.
///
/// Returns the total payload bytes delivered once the terminating chunk
/// arrives. A stream that drops mid-frame surfaces as `UnexpectedEof`.
pub(crate) async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let size = read_chunk_size(reader).await?;
        if size == 0 {
            return Ok(total);
        }
        let copied = io::copy(&mut (&mut *reader).take(u64::from(size)), writer).await?;
        if copied < u64::from(size) {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        total += copied;

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if crlf != *b"\r\n" {
            return Err(invalid("chunk payload is not CRLF terminated"));
        }
    }
}

/// Encodes one non-empty payload as exactly one chunk, written in one call.
pub(crate) async fn write_chunk<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(!payload.is_empty());
    let mut frame = BytesMut::with_capacity(payload.len() + 16);
    if payload.len() == COPY_BUF_SIZE {
        frame.extend_from_slice(FULL_SIZE_LINE);
    } else {
        frame.extend_from_slice(format!("{:x}\r\n", payload.len()).as_bytes());
    }
    frame.extend_from_slice(payload);
    frame.extend_from_slice(b"\r\n");
    writer.write_all(&frame).await
}
