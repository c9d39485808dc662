//! Protocol selection by peeking at the HTTP/2 client connection preface.

use std::cmp;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

pub(crate) const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Hard deadline from connection acceptance to a protocol decision.
pub(crate) const PREFACE_DEADLINE: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protocol {
    Http1,
    Http2,
}

/// Decide the protocol for a freshly accepted (and, in TLS mode, already
/// decrypted) stream.
///
/// Reads until the buffered bytes either diverge from the preface
/// (HTTP/1.1) or complete it (HTTP/2). A peer that goes away while its
/// bytes still look like a preface prefix yields an error and the socket
/// is destroyed. Whatever was read is handed back inside a [`Rewind`] so
/// the protocol engines observe the untouched byte stream. Callers apply
/// [`PREFACE_DEADLINE`].
pub(crate) async fn sniff<I>(mut io: I) -> io::Result<(Protocol, Rewind<I>)>
where
    I: AsyncRead + Unpin,
{
    let mut buf = [0u8; H2_PREFACE.len()];
    let mut filled = 0usize;

    let protocol = loop {
        if filled == H2_PREFACE.len() {
            break Protocol::Http2;
        }
        let n = io.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the protocol could be determined",
            ));
        }
        filled += n;
        if buf[..filled] != H2_PREFACE[..filled] {
            break Protocol::Http1;
        }
    };

    let peeked = Bytes::copy_from_slice(&buf[..filled]);
    Ok((protocol, Rewind::new(peeked, io)))
}

/// An IO wrapper that serves a peeked prefix before reading from the
/// underlying stream; writes pass straight through.
#[derive(Debug)]
pub(crate) struct Rewind<I> {
    prefix: Option<Bytes>,
    inner: I,
}

impl<I> Rewind<I> {
    fn new(prefix: Bytes, inner: I) -> Self {
        let prefix = (!prefix.is_empty()).then_some(prefix);
        Rewind { prefix, inner }
    }
}

impl<I> AsyncRead for Rewind<I>
where
    I: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(prefix) = self.prefix.take() {
            let n = cmp::min(prefix.len(), buf.remaining());
            buf.put_slice(&prefix[..n]);
            if n < prefix.len() {
                self.prefix = Some(prefix.slice(n..));
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<I> AsyncWrite for Rewind<I>
where
    I: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn full_preface_selects_http2() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(H2_PREFACE).await.unwrap();
        client.write_all(b"after").await.unwrap();

        let (protocol, mut io) = sniff(server).await.unwrap();
        assert_eq!(protocol, Protocol::Http2);

        // the engine still observes the untouched stream
        let mut seen = vec![0u8; H2_PREFACE.len() + 5];
        io.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen[..H2_PREFACE.len()], H2_PREFACE);
        assert_eq!(&seen[H2_PREFACE.len()..], b"after");
    }

    #[tokio::test]
    async fn divergent_bytes_select_http1() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"GET /test/foo HTTP/1.1\r\n").await.unwrap();

        let (protocol, mut io) = sniff(server).await.unwrap();
        assert_eq!(protocol, Protocol::Http1);

        let mut seen = vec![0u8; 4];
        io.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"GET ");
    }

    #[tokio::test]
    async fn short_preface_then_eof_destroys_the_connection() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&H2_PREFACE[..10]).await.unwrap();
        drop(client);

        let err = sniff(server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_preface_hits_the_deadline() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&H2_PREFACE[..10]).await.unwrap();

        let outcome = tokio::time::timeout(PREFACE_DEADLINE, sniff(server)).await;
        assert!(outcome.is_err());
    }
}
