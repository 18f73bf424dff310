use std::{io, net::SocketAddr};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to resolve listening address {address}: {source}")]
    Resolve { address: String, source: io::Error },

    #[error("failed to bind any of {candidates:?}: {source}")]
    Bind {
        candidates: Vec<SocketAddr>,
        source: io::Error,
    },

    #[error("failed to listen on {address}: {source}")]
    Listen { address: SocketAddr, source: io::Error },

    #[error("readiness wait failed: {source}")]
    Wait { source: io::Error },

    #[error("readiness set is full ({max} descriptors)")]
    Capacity { max: usize },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl Error {
    pub fn wait(source: io::Error) -> Self {
        Self::Wait { source }
    }

    /// Fatal errors stop the server, everything else only affects one connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Resolve { .. } | Self::Bind { .. } | Self::Listen { .. } | Self::Wait { .. }
        )
    }
}
