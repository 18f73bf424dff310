mod static_files;

pub use static_files::StaticFiles;

use crate::net::Connection;

/// What to do with a connection after its handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    KeepOpen,
    Close,
}

/// Application logic for one connection event.
///
/// `on_data` is called with bytes just read from a readable connection. It
/// must not block: the whole server runs on one thread, so a handler that
/// waits stalls every other connection. Output goes through
/// [`Connection::send`] and is flushed by the server.
///
/// A peer that closes its end is always closed by the server, whatever the
/// handler said before.
pub trait ConnectionHandler {
    fn on_data(&mut self, conn: &mut Connection, input: &[u8]) -> Disposition;

    /// Called once, right before the connection is closed.
    fn on_close(&mut self, _conn: &Connection) {}
}

impl<F> ConnectionHandler for F
where
    F: FnMut(&mut Connection, &[u8]) -> Disposition,
{
    fn on_data(&mut self, conn: &mut Connection, input: &[u8]) -> Disposition {
        self(conn, input)
    }
}
