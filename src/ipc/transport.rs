// Connection URIs and the TCP / Unix-domain socket transports

use crate::ipc::error::{IpcError, Result};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

const INET_SCHEME: &str = "af-inet://";
const UNIX_SCHEME: &str = "af-unix://";

/// Where a server listens or a client connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUri {
    /// `af-inet://host:port`
    Inet { host: String, port: u16 },
    /// `af-unix:///absolute/path`
    Unix(PathBuf),
}

impl ConnectionUri {
    /// Loopback TCP connection on `port`
    pub fn local_port(port: u16) -> Self {
        ConnectionUri::Inet {
            host: Ipv4Addr::LOCALHOST.to_string(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        ConnectionUri::Unix(path.into())
    }

    fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        (host, port)
            .to_socket_addrs()
            .map_err(|e| IpcError::InvalidUri(format!("cannot resolve {}: {}", host, e)))?
            .next()
            .ok_or_else(|| IpcError::InvalidUri(format!("no address for {}", host)))
    }
}

impl FromStr for ConnectionUri {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Ok(port) = s.parse::<u16>() {
            return Ok(Self::local_port(port));
        }

        if let Some(rest) = s.strip_prefix(INET_SCHEME) {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| IpcError::InvalidUri(format!("missing port in {}", s)))?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() {
                return Err(IpcError::InvalidUri(format!("missing host in {}", s)));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| IpcError::InvalidUri(format!("invalid port in {}", s)))?;
            return Ok(ConnectionUri::Inet {
                host: host.to_string(),
                port,
            });
        }

        if let Some(path) = s.strip_prefix(UNIX_SCHEME) {
            let path = PathBuf::from(path);
            if !path.is_absolute() {
                return Err(IpcError::InvalidUri(format!(
                    "unix socket path must be absolute: {}",
                    s
                )));
            }
            return Ok(ConnectionUri::Unix(path));
        }

        Err(IpcError::InvalidUri(s.to_string()))
    }
}

impl fmt::Display for ConnectionUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionUri::Inet { host, port } if host.contains(':') => {
                write!(f, "{}[{}]:{}", INET_SCHEME, host, port)
            }
            ConnectionUri::Inet { host, port } => write!(f, "{}{}:{}", INET_SCHEME, host, port),
            ConnectionUri::Unix(path) => write!(f, "{}{}", UNIX_SCHEME, path.display()),
        }
    }
}

/// Socket buffer sizes; values <= 0 keep the platform default
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketBuffers {
    pub send: i64,
    pub receive: i64,
}

impl Default for SocketBuffers {
    fn default() -> Self {
        Self {
            send: -1,
            receive: -1,
        }
    }
}

impl SocketBuffers {
    fn apply(&self, socket: &TcpSocket) -> io::Result<()> {
        if self.send > 0 {
            socket.set_send_buffer_size(self.send.min(u32::MAX as i64) as u32)?;
        }
        if self.receive > 0 {
            socket.set_recv_buffer_size(self.receive.min(u32::MAX as i64) as u32)?;
        }
        Ok(())
    }
}

/// A connected duplex byte stream
pub enum IpcStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl IpcStream {
    /// Open a connection to `uri`, applying socket buffer sizes first
    pub async fn connect(uri: &ConnectionUri, buffers: SocketBuffers) -> Result<Self> {
        match uri {
            ConnectionUri::Inet { host, port } => {
                let addr = ConnectionUri::socket_addr(host, *port)?;
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                buffers.apply(&socket)?;
                let stream = socket.connect(addr).await.map_err(|e| {
                    IpcError::ConnectionFailed(format!("cannot connect to {}: {}", uri, e))
                })?;
                stream.set_nodelay(true)?;
                Ok(IpcStream::Tcp(stream))
            }
            #[cfg(unix)]
            ConnectionUri::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| {
                    IpcError::ConnectionFailed(format!("cannot connect to {}: {}", uri, e))
                })?;
                Ok(IpcStream::Unix(stream))
            }
            #[cfg(not(unix))]
            ConnectionUri::Unix(_) => Err(IpcError::InvalidUri(format!(
                "unix domain sockets are not supported on this platform: {}",
                uri
            ))),
        }
    }

    /// Human readable peer description for logging
    pub fn peer(&self) -> String {
        match self {
            IpcStream::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp".to_string()),
            #[cfg(unix)]
            IpcStream::Unix(_) => "unix".to_string(),
        }
    }
}

impl AsyncRead for IpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IpcStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            IpcStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            IpcStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            IpcStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IpcStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            IpcStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IpcStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            IpcStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A bound server socket
pub enum IpcListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl IpcListener {
    /// Bind to `uri`; accepted TCP sockets inherit the buffer sizes
    pub async fn bind(uri: &ConnectionUri, buffers: SocketBuffers) -> Result<Self> {
        match uri {
            ConnectionUri::Inet { host, port } => {
                let addr = ConnectionUri::socket_addr(host, *port)?;
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_reuseaddr(true)?;
                buffers.apply(&socket)?;
                socket.bind(addr)?;
                Ok(IpcListener::Tcp(socket.listen(1024)?))
            }
            #[cfg(unix)]
            ConnectionUri::Unix(path) => {
                // Remove old socket if exists
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                Ok(IpcListener::Unix(listener, path.clone()))
            }
            #[cfg(not(unix))]
            ConnectionUri::Unix(_) => Err(IpcError::InvalidUri(format!(
                "unix domain sockets are not supported on this platform: {}",
                uri
            ))),
        }
    }

    pub async fn accept(&self) -> io::Result<IpcStream> {
        match self {
            IpcListener::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                stream.set_nodelay(true)?;
                Ok(IpcStream::Tcp(stream))
            }
            #[cfg(unix)]
            IpcListener::Unix(l, _) => {
                let (stream, _) = l.accept().await?;
                Ok(IpcStream::Unix(stream))
            }
        }
    }

    /// The URI clients should use, with the actual port for port 0 binds
    pub fn local_uri(&self) -> Result<ConnectionUri> {
        match self {
            IpcListener::Tcp(l) => {
                let addr = l.local_addr()?;
                Ok(ConnectionUri::Inet {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
            #[cfg(unix)]
            IpcListener::Unix(_, path) => Ok(ConnectionUri::Unix(path.clone())),
        }
    }
}

#[cfg(unix)]
impl Drop for IpcListener {
    fn drop(&mut self) {
        if let IpcListener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
