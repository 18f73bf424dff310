#![forbid(unsafe_code)]

//! A single threaded TCP server that multiplexes every connection over one
//! readiness poll.
//!
//! The [`Multiplexer`] owns a [`Listener`] and a [`ReadinessSet`]. Each cycle
//! it waits for readiness, admits new connections when the listener is ready
//! and passes input from ready connections to a [`ConnectionHandler`], which
//! decides whether the connection stays open.
//!
//! Nothing here runs in parallel. A handler that blocks stalls every client.

#[macro_use]
extern crate educe;

mod config;
mod error;
mod handler;
mod multiplexer;
mod reactor;

/// Listener setup and accepted connections
pub mod net;

pub use config::Config;
pub use error::{Error, Result};
pub use handler::{ConnectionHandler, Disposition, StaticFiles};
pub use multiplexer::Multiplexer;
pub use net::{Connection, Listener};
pub use reactor::{Descriptor, Event, ReadinessSet};

/// Serve the files below `config.root` until the readiness wait fails.
pub fn serve(config: &Config) -> Result<()> {
    Multiplexer::bind(config, StaticFiles::from_config(config))?.run()
}
