//! Read and write deadlines for accepted connections.
//!
//! A read or write that stays pending longer than its timeout fails with
//! [`io::ErrorKind::TimedOut`], which ends the HTTP connection. Any progress
//! re-arms the timer.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

#[derive(Debug)]
struct Deadline {
    timeout: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            sleep: None,
        }
    }

    /// Called while the operation is pending. Starts the timer on first use.
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        let Some(timeout) = self.timeout else {
            return Ok(());
        };

        let sleep = self
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
        match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.sleep = None;
                Err(io::Error::new(io::ErrorKind::TimedOut, "connection i/o timed out"))
            }
            Poll::Pending => Ok(()),
        }
    }

    fn reset(&mut self) {
        self.sleep = None;
    }
}

/// Connection wrapper enforcing per-direction inactivity deadlines.
#[derive(Debug)]
pub(crate) struct TimeoutIo<C> {
    io: C,
    read: Deadline,
    write: Deadline,
}

impl<C> TimeoutIo<C> {
    pub(crate) fn new(io: C, read: Option<Duration>, write: Option<Duration>) -> Self {
        Self {
            io,
            read: Deadline::new(read),
            write: Deadline::new(write),
        }
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for TimeoutIo<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.io).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read.reset();
                Poll::Ready(result)
            }
            Poll::Pending => {
                this.read.poll_expired(cx)?;
                Poll::Pending
            }
        }
    }
}

impl<C: AsyncWrite + Unpin> TimeoutIo<C> {
    fn poll_write_op<T>(
        &mut self,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut C>, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        match op(Pin::new(&mut self.io), cx) {
            Poll::Ready(result) => {
                self.write.reset();
                Poll::Ready(result)
            }
            Poll::Pending => {
                self.write.poll_expired(cx)?;
                Poll::Pending
            }
        }
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for TimeoutIo<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_write_op(cx, |io, cx| io.poll_write(cx, buf))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_write_op(cx, |io, cx| io.poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_write_op(cx, |io, cx| io.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_write_op(cx, |io, cx| io.poll_shutdown(cx))
    }
}
