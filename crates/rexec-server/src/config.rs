use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use librexec::engine::DEFAULT_COMMAND_TIMEOUT;
use librexec::task::DEFAULT_POOL_SIZE;
use rexec_protocol::{DEFAULT_ADDR, paths};
use serde::Deserialize;

#[derive(Parser, Debug, Default)]
#[command(name = "rexec-server", version, about = "TLS remote command server")]
pub struct Cli {
    /// Address to listen on
    #[arg(long)]
    pub listen: Option<String>,

    /// PEM certificate chain presented to clients
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// PEM private key matching --cert
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// File of `username:token` lines
    #[arg(long)]
    pub tokens: Option<PathBuf>,

    /// Directory of external command manifests
    #[arg(long)]
    pub plugins: Option<PathBuf>,

    /// Background task pool capacity
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// Per-command execution timeout
    #[arg(long)]
    pub command_timeout_secs: Option<u64>,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Same keys as the CLI; every field optional.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen: Option<String>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    tokens: Option<PathBuf>,
    plugins: Option<PathBuf>,
    pool_size: Option<usize>,
    command_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub tokens: PathBuf,
    pub plugins: PathBuf,
    pub pool_size: usize,
    pub command_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_ADDR.to_string(),
            cert: paths::dirs_path().join("server.crt"),
            key: paths::dirs_path().join("server.key"),
            tokens: paths::token_file_path(),
            plugins: paths::plugin_dir_path(),
            pool_size: DEFAULT_POOL_SIZE,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// CLI over config file over defaults. An explicit `--config` must
    /// exist; the default location is optional.
    pub fn resolve(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => load_file(path)?,
            None => {
                let path = paths::config_path();
                if path.exists() {
                    load_file(&path)?
                } else {
                    FileConfig::default()
                }
            }
        };

        let defaults = Self::default();
        let config = Self {
            listen: cli.listen.or(file.listen).unwrap_or(defaults.listen),
            cert: cli.cert.or(file.cert).unwrap_or(defaults.cert),
            key: cli.key.or(file.key).unwrap_or(defaults.key),
            tokens: cli.tokens.or(file.tokens).unwrap_or(defaults.tokens),
            plugins: cli.plugins.or(file.plugins).unwrap_or(defaults.plugins),
            pool_size: cli.pool_size.or(file.pool_size).unwrap_or(defaults.pool_size),
            command_timeout: cli
                .command_timeout_secs
                .or(file.command_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.command_timeout),
        };
        if config.pool_size == 0 {
            bail!("pool size must be at least 1");
        }
        if config.command_timeout.is_zero() {
            bail!("command timeout must be at least one second");
        }
        Ok(config)
    }
}

fn load_file(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}
