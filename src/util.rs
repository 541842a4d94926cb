//! A bounded peek buffer over a Tokio `AsyncRead`.
//!
//! [`PeekReader`] accumulates input so a caller can inspect and partially
//! consume it (here: the HTTP header section), then keeps serving the
//! unconsumed remainder before falling through to the inner reader. Body
//! bytes that arrived in the same read as the headers are never lost.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::BytesMut;
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};

pub(crate) struct PeekReader<R> {
    inner: R,
    peeked: BytesMut,
    limit: usize,
}

impl<R: AsyncRead + Unpin> PeekReader<R> {
    /// Wraps `inner`, allowing at most `limit` bytes to sit in the peek buffer.
    pub(crate) fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            peeked: BytesMut::new(),
            limit,
        }
    }

    /// The bytes peeked so far and not yet consumed.
    pub(crate) fn peeked(&self) -> &[u8] {
        &self.peeked
    }

    /// Drops `n` bytes from the front of the peek buffer.
    pub(crate) fn consume(&mut self, n: usize) {
        let _ = self.peeked.split_to(n);
    }

    /// Pulls more bytes from the inner reader into the peek buffer.
    ///
    /// Returns 0 at EOF or once the peek limit is reached.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        let budget = self.limit.saturating_sub(self.peeked.len());
        if budget == 0 {
            return Ok(0);
        }
        (&mut self.inner)
            .take(budget as u64)
            .read_buf(&mut self.peeked)
            .await
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.peeked.is_empty() {
            return Pin::new(&mut self.inner).poll_read(cx, out);
        }
        let n = self.peeked.len().min(out.remaining());
        let chunk = self.peeked.split_to(n);
        out.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn fill_then_consume_then_read_through() {
        let mut reader = PeekReader::new(Cursor::new(b"HEADBODY".to_vec()), 4);
        assert_eq!(reader.fill().await.unwrap(), 4);
        assert_eq!(reader.peeked(), b"HEAD");
        // Limit reached, further fills are no-ops.
        assert_eq!(reader.fill().await.unwrap(), 0);

        reader.consume(4);
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"BODY");
    }

    #[tokio::test]
    async fn leftover_peeked_bytes_are_served_first() {
        let mut reader = PeekReader::new(Cursor::new(b"abcdef".to_vec()), 6);
        reader.fill().await.unwrap();
        reader.consume(2);

        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cde");
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"f");
    }

    #[tokio::test]
    async fn fill_at_eof_returns_zero() {
        let mut reader = PeekReader::new(Cursor::new(Vec::new()), 8);
        assert_eq!(reader.fill().await.unwrap(), 0);
        assert!(reader.peeked().is_empty());
    }

    #[tokio::test]
    async fn incremental_fills_extend_the_buffer() {
        let mut reader = PeekReader::new(Cursor::new(b"xyz".to_vec()), 8);
        while reader.fill().await.unwrap() > 0 {}
        assert_eq!(reader.peeked(), b"xyz");
    }
}
