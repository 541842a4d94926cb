use clap::{Parser, ValueEnum};
use n0_error::Result;
use tokio::net::TcpListener;
use tracing::info;

use httpair::{Client, ClientOpts, Server};

/// Which side of the tunnel this process runs.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Server,
    Client,
}

#[derive(Debug, Parser)]
#[command(
    name = "httpair",
    about = "Bidirectional TCP tunnel carried over a pair of plain HTTP/1.1 exchanges"
)]
struct Cli {
    /// Run the pairing server or the local client.
    #[arg(long, value_enum)]
    mode: Mode,

    /// Address to listen on (both modes).
    #[arg(long, default_value = "127.0.0.1:56100")]
    listen: String,

    /// Upstream address bridged sessions connect to (server only).
    #[arg(long, default_value = "127.0.0.1:56200")]
    remote: String,

    /// Upload URL (client only).
    #[arg(long, default_value = "http://127.0.0.1:56000/")]
    up: String,

    /// Download URL (client only).
    #[arg(long, default_value = "http://127.0.0.1:56000/")]
    down: String,

    /// Mimic a browser TLS fingerprint (client only).
    #[arg(long)]
    utls: bool,

    /// Skip TLS certificate validation (client only).
    #[arg(long)]
    skipverify: bool,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!(mode = ?cli.mode, "starting httpair");

    let listener = TcpListener::bind(&cli.listen).await?;
    info!(addr = %listener.local_addr()?, "listening");

    match cli.mode {
        Mode::Server => Server::new(cli.remote).serve(listener).await,
        Mode::Client => {
            let client = Client::new(ClientOpts {
                up_url: cli.up,
                down_url: cli.down,
                utls: cli.utls,
                skip_verify: cli.skipverify,
            })?;
            client.serve(listener).await
        }
    }
}
