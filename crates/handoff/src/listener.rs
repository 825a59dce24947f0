//! Listening socket acquisition.
//!
//! A fresh generation binds its listener. A generation spawned by a restart
//! adopts the listener its parent left at fd 3 and never rebinds; if that
//! descriptor is missing or is not a listening TCP socket, startup fails.

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsFd, BorrowedFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use tokio::net::{TcpListener, UnixListener};
use tracing::info;

use crate::connection::Stream;
use crate::error::AcquireError;

/// Descriptor number at which a successor finds the inherited listener.
pub const INHERITED_FD: RawFd = 3;

/// Argument that marks a process as started by a restart.
pub const GRACEFUL_FLAG: &str = "--graceful";

/// How the current process obtains its listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvocationMode {
    /// Bind a new listener.
    #[default]
    Fresh,
    /// Adopt the listener inherited at [`INHERITED_FD`].
    Inherited,
}

impl InvocationMode {
    /// Mode for a parsed `--graceful` flag.
    pub fn from_flag(graceful: bool) -> Self {
        if graceful {
            InvocationMode::Inherited
        } else {
            InvocationMode::Fresh
        }
    }

    /// Mode for a raw argument list; `Inherited` if any argument is
    /// [`GRACEFUL_FLAG`].
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Self::from_flag(args.into_iter().any(|arg| arg.as_ref() == GRACEFUL_FLAG))
    }

    pub fn is_inherited(self) -> bool {
        matches!(self, InvocationMode::Inherited)
    }
}

impl fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationMode::Fresh => write!(f, "fresh"),
            InvocationMode::Inherited => write!(f, "inherited"),
        }
    }
}

/// Address of either end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Tcp(SocketAddr),
    /// Unix domain socket; unnamed sockets carry no path.
    Unix(Option<PathBuf>),
}

impl Addr {
    fn from_unix(addr: &tokio::net::unix::SocketAddr) -> Self {
        Addr::Unix(addr.as_pathname().map(Path::to_path_buf))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Tcp(addr) => write!(f, "{}", addr),
            Addr::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            Addr::Unix(None) => write!(f, "unix:(unnamed)"),
        }
    }
}

/// The socket a generation accepts connections on.
#[derive(Debug)]
pub enum ListeningSocket {
    Tcp(TcpListener),
    /// Served like TCP, but cannot be handed to a successor.
    Unix(UnixListener),
}

impl ListeningSocket {
    pub(crate) async fn accept(&self) -> io::Result<(Stream, Addr)> {
        match self {
            ListeningSocket::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Stream::Tcp(stream), Addr::Tcp(peer)))
            }
            ListeningSocket::Unix(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Stream::Unix(stream), Addr::from_unix(&peer)))
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<Addr> {
        match self {
            ListeningSocket::Tcp(listener) => listener.local_addr().map(Addr::Tcp),
            ListeningSocket::Unix(listener) => {
                listener.local_addr().map(|addr| Addr::from_unix(&addr))
            }
        }
    }

    /// The descriptor a successor can adopt, or `None` if this listener
    /// does not support handoff.
    ///
    /// Only TCP listeners qualify: the successor rebuilds a TCP listener from
    /// the inherited descriptor.
    pub fn handoff_fd(&self) -> Option<BorrowedFd<'_>> {
        match self {
            ListeningSocket::Tcp(listener) => Some(listener.as_fd()),
            ListeningSocket::Unix(_) => None,
        }
    }
}

impl From<TcpListener> for ListeningSocket {
    fn from(listener: TcpListener) -> Self {
        ListeningSocket::Tcp(listener)
    }
}

impl From<UnixListener> for ListeningSocket {
    fn from(listener: UnixListener) -> Self {
        ListeningSocket::Unix(listener)
    }
}

/// Obtain this generation's listener.
///
/// Must be called exactly once per process.
pub async fn acquire(mode: InvocationMode, addr: &str) -> Result<ListeningSocket, AcquireError> {
    match mode {
        InvocationMode::Fresh => bind(addr).await,
        InvocationMode::Inherited => adopt(INHERITED_FD),
    }
}

/// Bind a new TCP listener on `addr`.
pub async fn bind(addr: &str) -> Result<ListeningSocket, AcquireError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| AcquireError::Bind {
            addr: addr.to_string(),
            source,
        })?;

    let local = listener.local_addr().map_err(|source| AcquireError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    info!(addr = %local, "Bound fresh listener");

    Ok(ListeningSocket::Tcp(listener))
}

/// Reconstruct a TCP listener from an inherited descriptor without
/// rebinding.
///
/// On success the listener owns `fd`, and `FD_CLOEXEC` is set on it again so
/// unrelated child processes do not inherit it.
///
/// # Panics
///
/// Panics if called outside a Tokio runtime.
pub fn adopt(fd: RawFd) -> Result<ListeningSocket, AcquireError> {
    let inherited = |source| AcquireError::Inherited { fd, source };

    validate_listener_fd(fd).map_err(inherited)?;

    // SAFETY: fd is an open listening stream socket (checked above) that
    // nothing else in this process owns; the listener takes ownership.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };

    // AF_UNIX sockets pass the checks above but have no TCP address.
    let addr = std_listener.local_addr().map_err(inherited)?;

    set_cloexec(fd).map_err(inherited)?;
    std_listener.set_nonblocking(true).map_err(inherited)?;
    let listener = TcpListener::from_std(std_listener).map_err(inherited)?;

    info!(fd, addr = %addr, "Adopted inherited listener");
    Ok(ListeningSocket::Tcp(listener))
}

/// Check that `fd` is an open, listening, stream socket.
fn validate_listener_fd(fd: RawFd) -> io::Result<()> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if (stat.st_mode & libc::S_IFMT) != libc::S_IFSOCK {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptor is not a socket",
        ));
    }
    if socket_option(fd, libc::SO_TYPE)? != libc::SOCK_STREAM {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket is not a stream socket",
        ));
    }
    if socket_option(fd, libc::SO_ACCEPTCONN)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket is not listening",
        ));
    }
    Ok(())
}

fn socket_option(fd: RawFd, option: libc::c_int) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
