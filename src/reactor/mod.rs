pub mod io;

use std::fmt;

pub use io::{Event, ReadinessSet};

/// Numeric identity of a watched socket.
///
/// Doubles as the [`mio::Token`] the socket is registered under. Values are
/// handed out lowest-free-first by [`ReadinessSet::next_descriptor`], the
/// same way the OS hands out file descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Descriptor(pub usize);

impl From<Descriptor> for mio::Token {
    fn from(d: Descriptor) -> Self {
        mio::Token(d.0)
    }
}

impl From<mio::Token> for Descriptor {
    fn from(token: mio::Token) -> Self {
        Descriptor(token.0)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
