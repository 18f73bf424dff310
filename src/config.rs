use std::path::PathBuf;

/// Server settings.
///
/// The defaults mirror a classic `select(2)` server: port 8080, a backlog of
/// 64 and a ceiling of 1024 watched descriptors (the usual `FD_SETSIZE`).
#[derive(Debug, Clone, Educe)]
#[educe(Default)]
pub struct Config {
    /// Host to resolve. `None` binds the wildcard address of both families.
    pub host: Option<String>,
    #[educe(Default = 8080)]
    pub port: u16,
    #[educe(Default = 64)]
    pub backlog: i32,
    /// Size of the buffer a single read fills before the handler sees it.
    #[educe(Default = 65535)]
    pub buffer_size: usize,
    /// How many readiness events one wait can report.
    #[educe(Default = 1024)]
    pub event_capacity: usize,
    /// Upper bound on simultaneously watched descriptors, listener included.
    #[educe(Default = 1024)]
    pub max_descriptors: usize,
    /// Directory served by the static file handler. Empty means the working directory.
    pub root: PathBuf,
    #[educe(Default = "index.html")]
    pub index: String,
}

impl Config {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_max_descriptors(mut self, max: usize) -> Self {
        self.max_descriptors = max;
        self
    }
}
