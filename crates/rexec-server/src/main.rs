use clap::Parser;
use rexec_server::{Cli, ServerConfig, server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rexec_server=info,librexec=info".into()),
        )
        .init();

    let config = ServerConfig::resolve(Cli::parse())?;
    server::run(config).await
}
