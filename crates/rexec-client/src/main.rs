use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use futures_util::StreamExt;
use rexec_client::{ConnectionSet, Trust, connector};
use rexec_protocol::{DEFAULT_ADDR, MAX_LINE_BYTES};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rexec", version, about = "Interactive client for rexec servers")]
struct Cli {
    /// Server address to connect to at startup.
    #[arg(long, default_value = DEFAULT_ADDR)]
    host: String,

    /// Username for the startup connection.
    #[arg(long, requires = "token")]
    user: Option<String>,

    /// Token for the startup connection.
    #[arg(long, requires = "user")]
    token: Option<String>,

    /// PEM file with the CA that signed the server certificate.
    #[arg(long, conflicts_with = "insecure")]
    ca: Option<PathBuf>,

    /// Skip certificate verification (the default when no --ca is given).
    #[arg(long)]
    insecure: bool,

    /// Name expected in the server certificate.
    #[arg(long, default_value = "localhost")]
    server_name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rexec=warn")),
        )
        .init();

    let cli = Cli::parse();
    let trust = match cli.ca {
        Some(path) => Trust::Roots(path),
        None => Trust::Insecure,
    };
    let set = ConnectionSet::new(std::io::stdout()).with_dialer(connector(&trust)?, cli.server_name);

    if let (Some(user), Some(token)) = (&cli.user, &cli.token)
        && let Err(err) = set.connect(&cli.host, user, token).await
    {
        set.say(&format!("[!] {err:#}"));
    }
    set.greet();

    let mut stdin = FramedRead::new(
        tokio::io::stdin(),
        LinesCodec::new_with_max_length(MAX_LINE_BYTES),
    );
    while let Some(line) = stdin.next().await {
        match line {
            Ok(line) => set.handle_line(&line).await,
            Err(err) => {
                set.say(&format!("[!] {err}"));
                break;
            }
        }
    }

    set.close_all();
    Ok(())
}
