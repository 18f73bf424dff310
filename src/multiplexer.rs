use std::{collections::BTreeMap, io, net::SocketAddr, time::Duration};

use mio::Interest;
use tracing::{debug, trace, warn};

use crate::{
    error::Result,
    handler::{ConnectionHandler, Disposition},
    net::{Connection, Listener},
    reactor::{Descriptor, Event, ReadinessSet},
    Config,
};

/// The single threaded server loop.
///
/// Owns the listener, the readiness set and every open connection. Each
/// [`turn`](Multiplexer::turn) waits for readiness once, then walks the ready
/// descriptors in ascending order: the listener admits new connections,
/// anything else is handed to the [`ConnectionHandler`].
pub struct Multiplexer<H> {
    listener: Listener,
    listener_descriptor: Descriptor,
    readiness: ReadinessSet,
    connections: BTreeMap<Descriptor, Connection>,
    handler: H,
    buffer: Vec<u8>,
}

impl<H: ConnectionHandler> Multiplexer<H> {
    /// Create the listener and start watching it.
    pub fn bind(config: &Config, handler: H) -> Result<Self> {
        let listener = Listener::create(config)?;
        Self::with_listener(listener, config, handler)
    }

    pub fn with_listener(mut listener: Listener, config: &Config, handler: H) -> Result<Self> {
        let mut readiness = ReadinessSet::new(config.event_capacity, config.max_descriptors)?;
        let listener_descriptor = readiness.next_descriptor();
        readiness.watch(listener_descriptor, &mut *listener, Interest::READABLE)?;

        Ok(Self {
            listener,
            listener_descriptor,
            readiness,
            connections: BTreeMap::new(),
            handler,
            buffer: vec![0; config.buffer_size.max(1)],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn listener_descriptor(&self) -> Descriptor {
        self.listener_descriptor
    }

    pub fn readiness(&self) -> &ReadinessSet {
        &self.readiness
    }

    /// Descriptors of the open connections, ascending.
    pub fn connections(&self) -> impl Iterator<Item = Descriptor> + '_ {
        self.connections.keys().copied()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Serve forever. Only a failed wait ends the loop.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.turn(None)?;
        }
    }

    /// One dispatch cycle. Returns how many descriptors were ready.
    ///
    /// `timeout` bounds the wait; `None` blocks until something is ready.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let ready = self.readiness.wait(timeout)?;

        // a slot freed and handed out again within this cycle must not be
        // serviced on behalf of its previous owner
        let mut admitted = Vec::new();
        for &(d, event) in &ready {
            trace!(descriptor = %d, ?event, "ready");
            if d == self.listener_descriptor {
                self.accept(&mut admitted);
            } else if !admitted.contains(&d) {
                self.service(d, event);
            }
        }
        Ok(ready.len())
    }

    /// Admit every pending connection.
    fn accept(&mut self, admitted: &mut Vec<Descriptor>) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Some(d) = self.admit(stream, peer) {
                        admitted.push(d);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    debug!(cause = %e, "connection went away before accept");
                }
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, mut stream: mio::net::TcpStream, peer: SocketAddr) -> Option<Descriptor> {
        let d = self.readiness.next_descriptor();
        if let Err(e) = self.readiness.watch(d, &mut stream, Interest::READABLE) {
            // dropping the stream closes it
            warn!(%peer, cause = %e, "dropping new connection");
            return None;
        }
        debug!(descriptor = %d, %peer, "accepted connection");
        self.connections.insert(d, Connection::new(d, stream, peer));
        Some(d)
    }

    fn service(&mut self, d: Descriptor, event: Event) {
        let Some(conn) = self.connections.get_mut(&d) else {
            return;
        };

        let outcome =
            exchange(conn, event, &mut self.handler, &mut self.buffer).and_then(|disposition| {
                if disposition == Disposition::KeepOpen {
                    let interest = if conn.pending_output() > 0 {
                        Interest::READABLE | Interest::WRITABLE
                    } else {
                        Interest::READABLE
                    };
                    if interest != conn.interest {
                        self.readiness.rewatch(d, conn.source(), interest)?;
                        conn.interest = interest;
                    }
                }
                Ok(disposition)
            });

        match outcome {
            Ok(Disposition::KeepOpen) => {}
            Ok(Disposition::Close) => self.close(d),
            Err(e) => {
                debug!(descriptor = %d, cause = %e, "connection failed");
                self.close(d);
            }
        }
    }

    /// Unwatch and close `d`. Safe to call for a descriptor that is already gone.
    fn close(&mut self, d: Descriptor) {
        let Some(mut conn) = self.connections.remove(&d) else {
            return;
        };
        self.readiness.unwatch(d, conn.source());
        self.handler.on_close(&conn);
        debug!(descriptor = %d, peer = %conn.peer_addr(), "closed connection");
    }
}

/// One round of I/O on a ready connection.
///
/// Pending output is flushed first, and nothing is read until it is gone.
/// Input is read until the socket runs dry, because readiness is only
/// reported on edges. An empty read means the peer closed.
fn exchange<H: ConnectionHandler>(
    conn: &mut Connection,
    event: Event,
    handler: &mut H,
    buffer: &mut [u8],
) -> Result<Disposition> {
    if conn.pending_output() > 0 {
        if !conn.drain_output()? {
            return Ok(Disposition::KeepOpen);
        }
        if conn.close_after_flush {
            return Ok(Disposition::Close);
        }
    } else if !event.is_readable() {
        return Ok(Disposition::KeepOpen);
    }

    loop {
        let n = match conn.read(buffer) {
            Ok(0) => {
                debug!(descriptor = %conn.descriptor(), "peer closed connection");
                return Ok(Disposition::Close);
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Disposition::KeepOpen),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        let disposition = handler.on_data(conn, &buffer[..n]);
        if conn.pending_output() > 0 && !conn.drain_output()? {
            conn.close_after_flush = disposition == Disposition::Close;
            return Ok(Disposition::KeepOpen);
        }
        if disposition == Disposition::Close {
            return Ok(Disposition::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::BTreeSet,
        io::{Read, Write},
        net::{Shutdown, TcpStream},
    };

    struct Echo;

    impl ConnectionHandler for Echo {
        fn on_data(&mut self, conn: &mut Connection, input: &[u8]) -> Disposition {
            conn.send(input);
            if input.contains(&b'q') {
                Disposition::Close
            } else {
                Disposition::KeepOpen
            }
        }
    }

    fn server(config: Config) -> Multiplexer<Echo> {
        Multiplexer::bind(&config.with_host("127.0.0.1").with_port(0), Echo).unwrap()
    }

    fn turn_until(mux: &mut Multiplexer<Echo>, done: impl Fn(&Multiplexer<Echo>) -> bool) {
        for _ in 0..100 {
            if done(mux) {
                return;
            }
            mux.turn(Some(Duration::from_millis(20))).unwrap();
        }
        panic!("server never reached the expected state");
    }

    fn assert_bookkeeping(mux: &Multiplexer<Echo>) {
        let watched: BTreeSet<_> = mux.readiness().watched().collect();
        let mut expected: BTreeSet<_> = mux.connections().collect();
        expected.insert(mux.listener_descriptor());
        assert_eq!(watched, expected);

        let max = mux.readiness().max_descriptor().unwrap();
        assert!(watched.iter().all(|&d| d <= max));
    }

    #[test]
    fn listener_takes_the_first_slot() {
        let mux = server(Config::default());
        assert_eq!(mux.listener_descriptor(), Descriptor(0));
        assert_eq!(mux.readiness().len(), 1);
        assert_bookkeeping(&mux);
    }

    #[test]
    fn connect_echo_disconnect() {
        let mut mux = server(Config::default());
        let mut client = TcpStream::connect(mux.local_addr()).unwrap();
        turn_until(&mut mux, |mux| mux.connections().count() == 1);
        assert_bookkeeping(&mux);

        client.write_all(b"hello").unwrap();
        client.set_nonblocking(true).unwrap();
        let mut buf = Vec::new();
        for _ in 0..100 {
            mux.turn(Some(Duration::from_millis(10))).unwrap();
            let mut chunk = [0; 16];
            match client.read(&mut chunk) {
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("{e}"),
            }
            if buf.len() >= 5 {
                break;
            }
        }
        assert_eq!(buf, b"hello");

        drop(client);
        turn_until(&mut mux, |mux| mux.connections().count() == 0);
        assert_bookkeeping(&mux);
    }

    #[test]
    fn handler_close_tears_down() {
        let mut mux = server(Config::default());
        let mut client = TcpStream::connect(mux.local_addr()).unwrap();
        turn_until(&mut mux, |mux| mux.connections().count() == 1);

        client.write_all(b"q").unwrap();
        turn_until(&mut mux, |mux| mux.connections().count() == 0);
        assert_bookkeeping(&mux);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"q");
    }

    #[test]
    fn silent_disconnect_leaves_others_alone() {
        let mut mux = server(Config::default());
        let quiet = TcpStream::connect(mux.local_addr()).unwrap();
        let _kept = TcpStream::connect(mux.local_addr()).unwrap();
        turn_until(&mut mux, |mux| mux.connections().count() == 2);

        quiet.shutdown(Shutdown::Both).unwrap();
        drop(quiet);
        turn_until(&mut mux, |mux| mux.connections().count() == 1);
        assert_bookkeeping(&mux);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut mux = server(Config::default());
        let first = TcpStream::connect(mux.local_addr()).unwrap();
        let _second = TcpStream::connect(mux.local_addr()).unwrap();
        turn_until(&mut mux, |mux| mux.connections().count() == 2);
        assert_eq!(mux.connections().collect::<Vec<_>>(), vec![Descriptor(1), Descriptor(2)]);

        drop(first);
        turn_until(&mut mux, |mux| mux.connections().count() == 1);
        let _third = TcpStream::connect(mux.local_addr()).unwrap();
        turn_until(&mut mux, |mux| mux.connections().count() == 2);
        assert_eq!(mux.connections().collect::<Vec<_>>(), vec![Descriptor(1), Descriptor(2)]);
        assert_eq!(mux.readiness().max_descriptor(), Some(Descriptor(2)));
        assert_bookkeeping(&mux);
    }

    #[test]
    fn full_set_drops_new_connections() {
        let mut mux = server(Config::default().with_max_descriptors(2));
        let held = TcpStream::connect(mux.local_addr()).unwrap();
        turn_until(&mut mux, |mux| mux.connections().count() == 1);

        let mut rejected = TcpStream::connect(mux.local_addr()).unwrap();
        rejected.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        for _ in 0..5 {
            mux.turn(Some(Duration::from_millis(20))).unwrap();
        }
        assert_eq!(mux.connections().count(), 1);
        let mut buf = [0; 1];
        // either a clean EOF or a reset, never a hang
        assert!(matches!(rejected.read(&mut buf), Ok(0) | Err(_)));

        drop(held);
        turn_until(&mut mux, |mux| mux.connections().count() == 0);
        let _admitted = TcpStream::connect(mux.local_addr()).unwrap();
        turn_until(&mut mux, |mux| mux.connections().count() == 1);
        assert_bookkeeping(&mux);
    }
}
