//! Socket deadlines
//!
//! `DeadlineStream` wraps a raw connection and enforces two bounds:
//! - a handshake deadline: unless cleared, all I/O fails once it elapses
//! - a write-stall bound: a single write may stay blocked at most this long
//!
//! The handshake deadline is cleared through a [`DeadlineHandle`] once the
//! client has authenticated.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Clears the handshake deadline of the stream it was created with
#[derive(Clone, Debug, Default)]
pub struct DeadlineHandle {
    cleared: Arc<AtomicBool>,
}

impl DeadlineHandle {
    pub fn clear(&self) {
        self.cleared.store(true, Ordering::Release);
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::Acquire)
    }
}

pub struct DeadlineStream<S> {
    inner: S,
    handshake: Option<Pin<Box<Sleep>>>,
    cleared: Arc<AtomicBool>,
    write_timeout: Duration,
    write_stall: Option<Pin<Box<Sleep>>>,
}

impl<S> DeadlineStream<S> {
    pub fn new(inner: S, handshake_timeout: Duration, write_timeout: Duration) -> (Self, DeadlineHandle) {
        let handle = DeadlineHandle::default();
        let stream = Self {
            inner,
            handshake: Some(Box::pin(tokio::time::sleep(handshake_timeout))),
            cleared: handle.cleared.clone(),
            write_timeout,
            write_stall: None,
        };
        (stream, handle)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn check_handshake(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if self.handshake.is_some() && self.cleared.load(Ordering::Acquire) {
            self.handshake = None;
        }

        if let Some(deadline) = self.handshake.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection not established before deadline",
                ));
            }
        }
        Ok(())
    }

    fn check_stall(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        let timeout = self.write_timeout;
        let stall = self
            .write_stall
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));

        if stall.as_mut().poll(cx).is_ready() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
        }
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Err(e) = this.check_handshake(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Err(e) = this.check_handshake(cx) {
            return Poll::Ready(Err(e));
        }

        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_stall = None;
                Poll::Ready(result)
            }
            Poll::Pending => match this.check_stall(cx) {
                Ok(()) => Poll::Pending,
                Err(e) => Poll::Ready(Err(e)),
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.write_stall = None;
                Poll::Ready(result)
            }
            Poll::Pending => match this.check_stall(cx) {
                Ok(()) => Poll::Pending,
                Err(e) => Poll::Ready(Err(e)),
            },
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const SECS_30: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_handshake_deadline_fails_reads() {
        let (client, server) = tokio::io::duplex(64);
        let (mut stream, _handle) = DeadlineStream::new(server, SECS_30, SECS_30);

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        drop(client);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_deadline_allows_idle_connection() {
        let (mut client, server) = tokio::io::duplex(64);
        let (mut stream, handle) = DeadlineStream::new(server, SECS_30, SECS_30);
        handle.clear();
        assert!(handle.is_cleared());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            client.write_all(b"late").await.unwrap();
        });

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late");
    }

    #[tokio::test]
    async fn test_data_before_deadline_passes_through() {
        let mock = tokio_test::io::Builder::new()
            .read(b"SSH-2.0-test\r\n")
            .write(b"SSH-2.0-UPLINK\r\n")
            .build();
        let (mut stream, _handle) = DeadlineStream::new(mock, SECS_30, SECS_30);

        let mut buf = [0u8; 14];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0-test\r\n");

        stream.write_all(b"SSH-2.0-UPLINK\r\n").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let (_client, server) = tokio::io::duplex(8);
        let (mut stream, handle) = DeadlineStream::new(server, SECS_30, Duration::from_secs(5));
        handle.clear();

        // the peer never reads, so the pipe fills after 8 bytes
        let err = stream.write_all(&[0u8; 64]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
