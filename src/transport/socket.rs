use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::Instant;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::codec::FramedRead;

use crate::error::{BuckError, Result};
use crate::transport::codec::{Envelope, EnvelopeCodec, DEFAULT_MAX_MESSAGE_SIZE};

#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Connect even when the host is one of this machine's addresses.
    pub force_client: bool,
    pub max_message_size: usize,
    pub connect_timeout: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            force_client: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl SocketOptions {
    pub fn client() -> Self {
        Self {
            force_client: true,
            ..Default::default()
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }
}

/// Bytes written by one [`Socket::send`] against the frame length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub written: usize,
    pub expected: usize,
}

impl Delivery {
    pub fn is_complete(&self) -> bool {
        self.written == self.expected
    }
}

enum Mode {
    Server {
        listener: TcpListener,
        peers: StreamMap<u64, FramedRead<TcpStream, EnvelopeCodec>>,
        next_peer: u64,
    },
    Client {
        reader: FramedRead<OwnedReadHalf, EnvelopeCodec>,
        writer: OwnedWriteHalf,
    },
}

/// One TCP endpoint carrying delimiter-framed envelopes.
///
/// A socket bound to a local address listens and accepts peers lazily while
/// receiving. Otherwise it holds a single persistent connection. Every send
/// and receive is bounded by the caller's timeout; zero means poll once.
pub struct Socket {
    host: String,
    port: u16,
    codec: EnvelopeCodec,
    mode: Mode,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("server", &self.is_server())
            .finish()
    }
}

impl Socket {
    /// Listen when `host` is local (unless forced into client mode), connect otherwise.
    pub async fn open(host: &str, port: u16, options: SocketOptions) -> Result<Self> {
        if !options.force_client && is_local_host(host).await {
            Self::listen(host, port, options).await
        } else {
            Self::connect(host, port, options).await
        }
    }

    pub async fn listen(host: &str, port: u16, options: SocketOptions) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| BuckError::SocketSetupFailure {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        let bound = listener
            .local_addr()
            .map_err(|e| BuckError::SocketSetupFailure {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(addr = %bound, "Listening");

        Ok(Self {
            host: host.to_string(),
            port: bound.port(),
            codec: EnvelopeCodec::new(options.max_message_size),
            mode: Mode::Server {
                listener,
                peers: StreamMap::new(),
                next_peer: 0,
            },
        })
    }

    pub async fn connect(host: &str, port: u16, options: SocketOptions) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let stream = match tokio::time::timeout(options.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(BuckError::SocketSetupFailure {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(BuckError::SocketSetupFailure {
                    addr,
                    reason: format!("connect timed out after {:?}", options.connect_timeout),
                })
            }
        };
        stream.set_nodelay(true)?;
        let codec = EnvelopeCodec::new(options.max_message_size);
        let (read_half, write_half) = stream.into_split();

        tracing::debug!(addr = %addr, "Connected");

        Ok(Self {
            host: host.to_string(),
            port,
            mode: Mode::Client {
                reader: FramedRead::new(read_half, codec.clone()),
                writer: write_half,
            },
            codec,
        })
    }

    pub fn is_server(&self) -> bool {
        matches!(self.mode, Mode::Server { .. })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Bound port for a listening socket, remote port for a connection.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.mode {
            Mode::Server { listener, .. } => listener.local_addr().ok(),
            Mode::Client { writer, .. } => writer.local_addr().ok(),
        }
    }

    /// Number of accepted connections still open.
    pub fn peer_count(&self) -> usize {
        match &self.mode {
            Mode::Server { peers, .. } => peers.len(),
            Mode::Client { .. } => 0,
        }
    }

    /// Write one frame, retrying partial writes until it is complete or the
    /// timeout elapses. I/O errors end the attempt and show up as a short
    /// [`Delivery`]; only an oversized message is an error.
    pub async fn send(&mut self, envelope: &Envelope, timeout: Duration) -> Result<Delivery> {
        let frame = self.codec.frame(envelope)?;
        let writer = match &mut self.mode {
            Mode::Client { writer, .. } => writer,
            Mode::Server { .. } => {
                return Err(BuckError::Io(std::io::Error::new(
                    ErrorKind::NotConnected,
                    "listening socket has no peer to send to",
                )))
            }
        };

        let deadline = Instant::now() + timeout;
        let mut written = 0;
        while written < frame.len() {
            match tokio::time::timeout_at(deadline, writer.writable()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Socket not writable");
                    break;
                }
                Err(_) => break,
            }
            match writer.try_write(&frame[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => {
                    tracing::debug!(error = %e, written, "Write failed");
                    break;
                }
            }
        }

        Ok(Delivery {
            written,
            expected: frame.len(),
        })
    }

    /// Receive one envelope, waiting at most `timeout`. Returns `None` when
    /// nothing arrived in time or the connection has closed.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<Envelope>> {
        let deadline = Instant::now() + timeout;
        let codec = self.codec.clone();

        match &mut self.mode {
            Mode::Client { reader, .. } => match tokio::time::timeout_at(deadline, reader.next()).await {
                Ok(Some(Ok(envelope))) => Ok(Some(envelope)),
                Ok(Some(Err(e))) => Err(e),
                Ok(None) | Err(_) => Ok(None),
            },
            Mode::Server {
                listener,
                peers,
                next_peer,
            } => loop {
                tokio::select! {
                    biased;

                    item = peers.next(), if !peers.is_empty() => match item {
                        Some((_, Ok(envelope))) => return Ok(Some(envelope)),
                        Some((peer, Err(e))) => {
                            tracing::warn!(peer, error = %e, "Dropping peer after bad frame");
                            peers.remove(&peer);
                        }
                        None => {}
                    },

                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let peer = *next_peer;
                            *next_peer += 1;
                            tracing::debug!(peer, addr = %addr, "Accepted connection");
                            peers.insert(peer, FramedRead::new(stream, codec.clone()));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                        }
                    },

                    _ = tokio::time::sleep_until(deadline) => return Ok(None),
                }
            },
        }
    }
}

/// Resolve `host` to its first address.
pub async fn resolve(host: &str) -> Result<IpAddr> {
    let mut addrs = tokio::net::lookup_host((host, 0)).await?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| BuckError::SocketSetupFailure {
            addr: host.to_string(),
            reason: "host resolved to no addresses".to_string(),
        })
}

/// Whether `ip` belongs to this machine. Binding succeeds only for local
/// addresses.
pub async fn is_local_ip(ip: IpAddr) -> bool {
    ip.is_loopback() || ip.is_unspecified() || UdpSocket::bind(SocketAddr::new(ip, 0)).await.is_ok()
}

pub async fn is_local_host(host: &str) -> bool {
    match resolve(host).await {
        Ok(ip) => is_local_ip(ip).await,
        Err(_) => false,
    }
}
