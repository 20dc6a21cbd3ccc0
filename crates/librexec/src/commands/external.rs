use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::handler;
use super::process::{ChildExit, describe_exit, run_child};
use crate::command::{CommandDescriptor, CommandHandler, CommandOutput};
use crate::context::CommandContext;
use crate::error::CommandError;
use crate::io::CommandIo;
use crate::provider::CommandProvider;

pub const PLUGIN_CATEGORY: &str = "plugin";

/// A `*.toml` plugin manifest.
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default, rename = "command")]
    commands: Vec<ManifestCommand>,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestCommand {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    usage: String,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    background: bool,
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

fn default_category() -> String {
    PLUGIN_CATEGORY.to_string()
}

/// Commands declared by manifests in a plugin directory, each run as a
/// subprocess.
pub struct ExternalCommands {
    dir: PathBuf,
}

impl ExternalCommands {
    /// Creates `dir` when missing; failure to do so only leaves the
    /// provider empty.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if !dir.exists() {
            match fs::create_dir_all(&dir) {
                Ok(()) => info!(dir = %dir.display(), "created plugin directory"),
                Err(err) => warn!(dir = %dir.display(), error = %err, "cannot create plugin directory"),
            }
        }
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifests(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "cannot read plugin directory");
                return Vec::new();
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();
        paths
    }
}

fn load_manifest(path: &Path) -> Result<Vec<ManifestCommand>, String> {
    let raw = fs::read_to_string(path).map_err(|err| err.to_string())?;
    let manifest: Manifest = toml::from_str(&raw).map_err(|err| err.to_string())?;
    for command in &manifest.commands {
        if command.name.is_empty() || command.name.chars().any(char::is_whitespace) {
            return Err(format!("invalid command name {:?}", command.name));
        }
    }
    Ok(manifest.commands)
}

impl CommandProvider for ExternalCommands {
    fn provide_commands(&self) -> Vec<CommandDescriptor> {
        let mut descriptors = Vec::new();
        for path in self.manifests() {
            let commands = match load_manifest(&path) {
                Ok(commands) => commands,
                Err(err) => {
                    warn!(manifest = %path.display(), error = %err, "skipping plugin manifest");
                    continue;
                }
            };
            debug!(manifest = %path.display(), commands = commands.len(), "loaded plugin manifest");
            for command in commands {
                let usage = if command.usage.is_empty() {
                    command.name.clone()
                } else {
                    command.usage.clone()
                };
                descriptors.push(
                    CommandDescriptor::new(command.name.clone(), handler(ExternalCommand {
                        program: command.program.clone(),
                        args: command.args.clone(),
                    }))
                    .description(command.description)
                    .usage(usage)
                    .category(command.category)
                    .background(command.background),
                );
            }
        }
        descriptors
    }
}

struct ExternalCommand {
    program: String,
    args: Vec<String>,
}

#[async_trait]
impl CommandHandler for ExternalCommand {
    async fn call(
        &self,
        io: &mut CommandIo,
        ctx: CommandContext,
        args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).args(&args);

        let exit = run_child(io, &ctx, command, true).await?;
        match exit {
            ChildExit::Exited(status) if status.success() => Ok(Vec::new()),
            other => Err(CommandError::failed(describe_exit(&other))),
        }
    }
}
