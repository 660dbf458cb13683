use std::{
    fmt, fs, io,
    net::{TcpListener, ToSocketAddrs},
    os::unix::{
        fs::FileTypeExt,
        io::{AsRawFd, FromRawFd, RawFd},
        net::UnixListener,
    },
    path::PathBuf,
    str::FromStr,
};

use socket2::{Domain, Socket, Type};

use crate::error::SupervisorError;

/// A listen target: a transport tag plus a transport-specific address.
///
/// Endpoints are immutable once registered with the supervisor; the rendered
/// `network:address` form is also the wire format used to describe inherited
/// listeners to a successor process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A TCP `host:port` address.
    Tcp(String),
    /// A Unix domain socket path.
    Unix(PathBuf),
}

impl Endpoint {
    /// Creates a TCP endpoint from a `host:port` address string.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Endpoint::Tcp(addr.into())
    }

    /// Creates a Unix domain socket endpoint from a filesystem path.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix(path.into())
    }

    /// The transport tag for this endpoint.
    pub fn network(&self) -> &'static str {
        match self {
            Endpoint::Tcp(_) => "tcp",
            Endpoint::Unix(_) => "unix",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = SupervisorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (network, address) = value.split_once(':').ok_or_else(|| {
            SupervisorError::Inherit(format!("endpoint '{value}' missing network tag"))
        })?;

        match network {
            "tcp" => Ok(Endpoint::Tcp(address.to_string())),
            "unix" => Ok(Endpoint::Unix(PathBuf::from(address))),
            other => Err(SupervisorError::Inherit(format!(
                "unsupported network '{other}' in endpoint '{value}'"
            ))),
        }
    }
}

/// A listening socket for one of the supported transports.
///
/// Accept loops receive a [`try_clone`](Listener::try_clone) of the listener
/// installed in the supervisor; both handles share one open file description,
/// so [`shutdown`](Listener::shutdown) unblocks a pending `accept` on either.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Binds a fresh listening socket for the endpoint.
    ///
    /// TCP sockets are built with `SO_REUSEADDR` so a toggled endpoint can be
    /// re-bound immediately. A stale socket file left at a Unix endpoint's
    /// path is removed before binding; any other kind of file is left alone
    /// and the bind fails.
    pub fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("address '{addr}' did not resolve"),
                    )
                })?;
                let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
                socket.set_reuse_address(true)?;
                socket.bind(&addr.into())?;
                socket.listen(128)?;
                Ok(Listener::Tcp(socket.into()))
            }
            Endpoint::Unix(path) => {
                if let Ok(meta) = fs::symlink_metadata(path) {
                    if meta.file_type().is_socket() {
                        fs::remove_file(path)?;
                    }
                }
                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
        }
    }

    /// Adopts an inherited raw descriptor as a listener for the endpoint.
    ///
    /// # Safety
    ///
    /// `fd` must be an open listening socket of the endpoint's transport and
    /// must not be owned elsewhere.
    pub(crate) unsafe fn from_inherited_fd(endpoint: &Endpoint, fd: RawFd) -> Self {
        match endpoint {
            Endpoint::Tcp(_) => Listener::Tcp(TcpListener::from_raw_fd(fd)),
            Endpoint::Unix(_) => Listener::Unix(UnixListener::from_raw_fd(fd)),
        }
    }

    /// Duplicates the listener handle. Both handles refer to the same
    /// underlying socket.
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Listener::Tcp(lis) => lis.try_clone().map(Listener::Tcp),
            Listener::Unix(lis) => lis.try_clone().map(Listener::Unix),
        }
    }

    /// Shuts the listening socket down, unblocking any pending `accept` on
    /// this handle or any duplicate of it.
    pub fn shutdown(&self) -> io::Result<()> {
        nix::sys::socket::shutdown(self.as_raw_fd(), nix::sys::socket::Shutdown::Both)
            .map_err(io::Error::from)
    }

    /// The locally bound address, rendered for diagnostics.
    pub fn local_addr_string(&self) -> String {
        match self {
            Listener::Tcp(lis) => lis
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".into()),
            Listener::Unix(lis) => lis
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "<unnamed>".into()),
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(lis) => lis.as_raw_fd(),
            Listener::Unix(lis) => lis.as_raw_fd(),
        }
    }
}
