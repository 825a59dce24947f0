//! Accepted connections and the handler boundary.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::{Instant, Sleep};

use crate::listener::Addr;

/// Time allowed for reading, counted from accept.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for writing, counted from the first write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Serves one accepted connection.
///
/// Each connection runs in its own task. Returned errors are logged and do
/// not affect the server.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, conn: Connection) -> impl Future<Output = io::Result<()>> + Send;
}

#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            Stream::Unix(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Stream::Tcp(stream) => stream.is_write_vectored(),
            Stream::Unix(stream) => stream.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// An accepted connection with bounded read and write time.
///
/// Reading must finish within the read timeout of the connection being
/// accepted, and writing within the write timeout of the first write. Past
/// its deadline, every operation in that direction fails with
/// [`io::ErrorKind::TimedOut`]. Progress does not extend either deadline.
#[derive(Debug)]
pub struct Connection {
    stream: Stream,
    peer: Addr,
    read: Deadline,
    write: Deadline,
}

impl Connection {
    pub(crate) fn new(stream: Stream, peer: Addr) -> Self {
        Self::with_timeouts(stream, peer, READ_TIMEOUT, WRITE_TIMEOUT)
    }

    pub(crate) fn with_timeouts(
        stream: Stream,
        peer: Addr,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        let mut read = Deadline::new("read", read_timeout);
        read.start();
        Self {
            stream,
            peer,
            read,
            write: Deadline::new("write", write_timeout),
        }
    }

    /// Address of the remote end.
    pub fn peer_addr(&self) -> &Addr {
        &self.peer
    }
}

/// A fixed point in time, set once, after which one direction of the
/// connection fails.
#[derive(Debug)]
struct Deadline {
    direction: &'static str,
    timeout: Duration,
    at: Option<Instant>,
    timer: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    fn new(direction: &'static str, timeout: Duration) -> Self {
        Self {
            direction,
            timeout,
            at: None,
            timer: None,
        }
    }

    /// Arm the deadline; later calls keep the first instant.
    fn start(&mut self) {
        if self.at.is_none() {
            self.at = Some(Instant::now() + self.timeout);
        }
    }

    /// `Ready` with the error once the deadline has passed. Otherwise
    /// registers `cx` to be woken when it does.
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let Some(at) = self.at else {
            return Poll::Pending;
        };
        let timer = self
            .timer
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(at)));
        match timer.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} timed out after {:?}", self.direction, self.timeout),
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.read.poll_expired(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.write.start();
        if let Poll::Ready(err) = this.write.poll_expired(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.write.start();
        if let Poll::Ready(err) = this.write.poll_expired(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.write.start();
        if let Poll::Ready(err) = this.write.poll_expired(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.write.start();
        if let Poll::Ready(err) = this.write.poll_expired(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}
