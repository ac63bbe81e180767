//! Raw byte transport to an ElectrumX server: plain TCP or TLS over TCP.
//!
//! The transport only dials and hands back boxed read/write halves; line
//! framing and request correlation live in [`crate::network::client`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::network::tls::{TlsConfig, TlsError};
use crate::network_type::NetworkType;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Default dial timeout for a direct connection
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    #[error("failed to connect to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("TLS handshake with {addr} failed: {source}")]
    Tls {
        addr: String,
        #[source]
        source: TlsError,
    },

    #[error("{0} requires TLS but no TLS configuration was supplied")]
    TlsNotConfigured(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
}

/// `tcp://host:port`, `ssl://host:port`, `tls://host:port` or bare
/// `host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
}

impl ServerAddress {
    /// Parse with network defaults for the port and scheme when the string
    /// leaves them out.
    pub fn parse(s: &str, network: NetworkType, tls_default: bool) -> Result<Self, ConnectError> {
        let invalid = || ConnectError::InvalidAddress(s.to_string());
        let trimmed = s.trim();

        let (scheme, rest) = if let Some(rest) = trimmed.strip_prefix("tcp://") {
            (Scheme::Tcp, rest)
        } else if let Some(rest) = trimmed
            .strip_prefix("ssl://")
            .or_else(|| trimmed.strip_prefix("tls://"))
        {
            (Scheme::Tls, rest)
        } else if tls_default {
            (Scheme::Tls, trimmed)
        } else {
            (Scheme::Tcp, trimmed)
        };

        let default_port = match scheme {
            Scheme::Tcp => network.default_tcp_port(),
            Scheme::Tls => network.default_tls_port(),
        };

        // IPv6 literals are bracketed: [::1]:50002
        let (host, port) = if let Some(inner) = rest.strip_prefix('[') {
            let (host, after) = inner.split_once(']').ok_or_else(invalid)?;
            let port = match after.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| invalid())?,
                None if after.is_empty() => default_port,
                None => return Err(invalid()),
            };
            (host.to_string(), port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, p)) => (host.to_string(), p.parse().map_err(|_| invalid())?),
                None => (rest.to_string(), default_port),
            }
        };

        if host.is_empty() || host.contains('/') {
            return Err(invalid());
        }

        Ok(Self { host, port, scheme })
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Tls
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Tcp => "tcp",
            Scheme::Tls => "ssl",
        };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, NetworkType::Mainnet, false)
    }
}

/// An established connection, not yet framed.
pub struct Transport {
    peer: String,
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl Transport {
    /// Wrap an already-connected stream (in-process servers, tests).
    pub fn from_stream<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            peer: peer.into(),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Dial `address`, wrapping in TLS when its scheme asks for it.
    pub async fn connect(
        address: &ServerAddress,
        tls: Option<&TlsConfig>,
        dial_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let addr = address.to_string();
        info!("🔗 Connecting to {}", addr);

        let stream = match tokio::time::timeout(
            dial_timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ConnectError::Io { addr, source }),
            Err(_) => {
                return Err(ConnectError::Timeout {
                    addr,
                    timeout: dial_timeout,
                })
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }

        match address.scheme {
            Scheme::Tcp => Ok(Self::from_stream(stream, addr)),
            Scheme::Tls => {
                let tls = tls.ok_or_else(|| ConnectError::TlsNotConfigured(addr.clone()))?;
                // The handshake counts against the same dial budget
                let handshake = tls.connect_client(stream, &address.host);
                let tls_stream = match tokio::time::timeout(dial_timeout, handshake).await {
                    Ok(Ok(s)) => s,
                    Ok(Err(source)) => return Err(ConnectError::Tls { addr, source }),
                    Err(_) => {
                        return Err(ConnectError::Timeout {
                            addr,
                            timeout: dial_timeout,
                        })
                    }
                };
                info!(
                    "🔒 TLS established with {} (verified: {})",
                    addr,
                    tls.is_verifying()
                );
                Ok(Self::from_stream(tls_stream, addr))
            }
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn into_split(self) -> (String, BoxedReader, BoxedWriter) {
        (self.peer, self.reader, self.writer)
    }
}
