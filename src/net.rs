use std::{
    io::{self, Read, Write},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    ops::{Deref, DerefMut},
};

use bytes::{Buf, BytesMut};
use mio::Interest;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    reactor::Descriptor,
    Config,
};

/// The listening socket.
pub struct Listener {
    inner: mio::net::TcpListener,
    local_addr: SocketAddr,
}

// allow internal access to the source
impl Deref for Listener {
    type Target = mio::net::TcpListener;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
impl DerefMut for Listener {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Listener {
    /// Bind and listen on the first candidate address for the configured port.
    ///
    /// Candidates come from resolving `config.host`, or are the IPv4 and IPv6
    /// wildcard addresses when no host is set. Failing to set socket options
    /// is tolerated; failing to bind every candidate, or to listen, is not.
    pub fn create(config: &Config) -> Result<Self> {
        let candidates = candidates(config.host.as_deref(), config.port)?;

        let mut last_error = None;
        let mut bound = None;
        for &addr in &candidates {
            match bind(addr) {
                Ok(socket) => {
                    bound = Some((socket, addr));
                    break;
                }
                Err(e) => {
                    debug!(%addr, cause = %e, "could not bind candidate");
                    last_error = Some(e);
                }
            }
        }
        let (socket, addr) = bound.ok_or_else(|| Error::Bind {
            source: last_error
                .unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)),
            candidates,
        })?;

        socket
            .listen(config.backlog)
            .map_err(|source| Error::Listen { address: addr, source })?;

        let std_listener: std::net::TcpListener = socket.into();
        let local_addr = std_listener.local_addr()?;
        let inner = mio::net::TcpListener::from_std(std_listener);
        info!(address = %local_addr, backlog = config.backlog, "listening");

        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn candidates(host: Option<&str>, port: u16) -> Result<Vec<SocketAddr>> {
    let Some(host) = host else {
        return Ok(vec![
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
        ]);
    };

    let resolve_error = |source| Error::Resolve {
        address: format!("{host}:{port}"),
        source,
    };
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(resolve_error)?
        .collect();
    if addrs.is_empty() {
        return Err(resolve_error(io::ErrorKind::NotFound.into()));
    }
    Ok(addrs)
}

fn bind(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if let Err(e) = socket.set_reuse_address(true) {
        debug!(%addr, cause = %e, "failed to enable address reuse");
    }
    if let Err(e) = socket.set_nonblocking(true) {
        debug!(%addr, cause = %e, "failed to make socket non-blocking");
    }
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// An accepted connection, as seen by a [`ConnectionHandler`](crate::ConnectionHandler).
///
/// Output is queued with [`Connection::send`] (or through [`Write`]) and
/// flushed by the server without blocking. Bytes the socket cannot take
/// right away stay queued until it becomes writable again.
pub struct Connection {
    descriptor: Descriptor,
    stream: mio::net::TcpStream,
    peer: SocketAddr,
    outbound: BytesMut,
    pub(crate) interest: Interest,
    pub(crate) close_after_flush: bool,
}

impl Connection {
    pub(crate) fn new(descriptor: Descriptor, stream: mio::net::TcpStream, peer: SocketAddr) -> Self {
        Self {
            descriptor,
            stream,
            peer,
            outbound: BytesMut::new(),
            interest: Interest::READABLE,
            close_after_flush: false,
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Queue bytes for the peer.
    pub fn send(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }

    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    pub(crate) fn source(&mut self) -> &mut mio::net::TcpStream {
        &mut self.stream
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    /// Write as much queued output as the socket accepts.
    ///
    /// Returns whether the queue is now empty.
    pub(crate) fn drain_output(&mut self) -> io::Result<bool> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.outbound.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
