use std::{path::PathBuf, process};

use clap::Parser;
use pollserve::Config;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

/// Serve static files from one thread, multiplexing every client over a single readiness poll.
#[derive(Debug, Parser)]
#[command(name = "pollserve", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "POLLSERVE_PORT")]
    port: u16,

    /// Host to bind; both wildcard addresses are tried when omitted
    #[arg(long, env = "POLLSERVE_HOST")]
    host: Option<String>,

    /// Pending connection backlog
    #[arg(long, default_value_t = 64)]
    backlog: i32,

    /// Directory to serve
    #[arg(long, default_value = ".", env = "POLLSERVE_ROOT")]
    root: PathBuf,

    /// File served for directory requests
    #[arg(long, default_value = "index.html")]
    index: String,

    /// Bytes read from a connection per read call
    #[arg(long, default_value_t = 65535)]
    buffer_size: usize,

    /// Most descriptors watched at once, listener included
    #[arg(long, default_value_t = 1024)]
    max_descriptors: usize,

    #[arg(long, default_value_t = Level::INFO, env = "POLLSERVE_LOG")]
    log_level: Level,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Config {
            host: cli.host,
            port: cli.port,
            backlog: cli.backlog,
            buffer_size: cli.buffer_size,
            max_descriptors: cli.max_descriptors,
            root: cli.root,
            index: cli.index,
            ..Config::default()
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder().with_max_level(cli.log_level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = Config::from(cli);
    if let Err(e) = pollserve::serve(&config) {
        error!(cause = %e, "server stopped");
        process::exit(1);
    }
}
