use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use chrono::format::{Item, StrftimeItems};
use clap::Parser;
use tokio::process::Command;

use super::process::{ChildExit, describe_exit, run_child};
use super::{SYSTEM_CATEGORY, handler};
use crate::command::{CommandDescriptor, CommandHandler, CommandOutput};
use crate::context::CommandContext;
use crate::error::CommandError;
use crate::io::CommandIo;
use crate::provider::CommandProvider;
use crate::registry::Registry;

pub const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DEFAULT_PYTHON: &str = "python3";

const PYEXEC_USAGE: &str = "pyexec [options] -f <script_path> [script_args...]
Options:
    -f, --file        Python script file path (required)
    -p, --python      Python interpreter path (default: python3)
    -e, --env         Set environment variables (format: KEY=VALUE)
    -i, --interactive Forward session input to the script
Examples:
    pyexec -f script.py arg1 arg2
    pyexec -e PYTHONPATH=/custom/path -f script.py
    bg pyexec -f long_running.py";

/// help, list, info, time, echo, version, exec and pyexec.
pub struct CoreCommands {
    registry: Arc<Registry>,
}

impl CoreCommands {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl CommandProvider for CoreCommands {
    fn provide_commands(&self) -> Vec<CommandDescriptor> {
        let registry = &self.registry;
        vec![
            CommandDescriptor::new("help", handler(Help(Arc::clone(registry))))
                .description("Display help information for commands")
                .usage("help [command]")
                .category(SYSTEM_CATEGORY),
            CommandDescriptor::new("list", handler(List(Arc::clone(registry))))
                .description("List all available commands")
                .usage("list [-a]")
                .category(SYSTEM_CATEGORY),
            CommandDescriptor::new("info", handler(Info(Arc::clone(registry))))
                .description("Show engine and system information")
                .usage("info")
                .category(SYSTEM_CATEGORY),
            CommandDescriptor::new("time", handler(Time))
                .description("Display current UTC time")
                .usage("time [format]")
                .category(SYSTEM_CATEGORY),
            CommandDescriptor::new("echo", handler(Echo))
                .description("Echo input text")
                .usage("echo [text...]")
                .category(SYSTEM_CATEGORY),
            CommandDescriptor::new("version", handler(Version))
                .description("Show engine version information")
                .usage("version")
                .category(SYSTEM_CATEGORY),
            CommandDescriptor::new("exec", handler(Exec))
                .description("Execute a system command")
                .usage("exec <command> [args...]")
                .category(SYSTEM_CATEGORY),
            CommandDescriptor::new("pyexec", handler(PyExec))
                .description("Execute Python scripts with various options")
                .usage(PYEXEC_USAGE)
                .category(SYSTEM_CATEGORY)
                .background(true),
        ]
    }
}

/// Descriptors grouped by category, both levels sorted.
fn by_category(registry: &Registry) -> BTreeMap<String, Vec<CommandDescriptor>> {
    let mut groups: BTreeMap<String, Vec<CommandDescriptor>> = BTreeMap::new();
    for descriptor in registry.list() {
        let category = if descriptor.category.is_empty() {
            "other".to_string()
        } else {
            descriptor.category.clone()
        };
        groups.entry(category).or_default().push(descriptor);
    }
    for commands in groups.values_mut() {
        commands.sort_by(|a, b| a.name.cmp(&b.name));
    }
    groups
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

struct Help(Arc<Registry>);

impl Help {
    fn general(&self) -> String {
        let mut out = String::from("Available Commands:\n");
        out.push_str("Use 'help <command>' for more information about a specific command\n");
        for (category, commands) in by_category(&self.0) {
            out.push_str(&format!("\n{} Commands:\n", capitalize(&category)));
            let width = commands.iter().map(|c| c.name.len()).max().unwrap_or(0);
            for command in commands {
                let mark = if command.background { '*' } else { ' ' };
                out.push_str(&format!(
                    "  {mark} {:<width$}  {}\n",
                    command.name, command.description
                ));
            }
        }
        out.push_str("\nLegend:\n  * Command can run in background\n");
        out
    }

    fn detailed(&self, name: &str) -> Result<String, CommandError> {
        let command = self
            .0
            .get(name)
            .ok_or_else(|| CommandError::NotFound(name.to_string()))?;
        Ok(format!(
            "Command: {}\nCategory: {}\nDescription: {}\nUsage: {}\nBackground: {}\n",
            command.name, command.category, command.description, command.usage, command.background
        ))
    }
}

#[async_trait]
impl CommandHandler for Help {
    async fn call(
        &self,
        io: &mut CommandIo,
        _ctx: CommandContext,
        args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let text = match args.first() {
            Some(name) => self.detailed(name)?,
            None => self.general(),
        };
        io.write_str(&text).await?;
        Ok(text.into_bytes())
    }
}

struct List(Arc<Registry>);

#[async_trait]
impl CommandHandler for List {
    async fn call(
        &self,
        io: &mut CommandIo,
        _ctx: CommandContext,
        args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let detailed = args.first().is_some_and(|a| a == "-a");
        let mut out = String::from("Available Commands:\n==================\n\n");
        for (category, commands) in by_category(&self.0) {
            out.push_str(&format!("[{}]\n", category.to_uppercase()));
            if detailed {
                for command in &commands {
                    out.push_str(&format!("  {:<12} - {}\n", command.name, command.description));
                    out.push_str(&format!(
                        "    Category: {}, Background: {}\n",
                        command.category, command.background
                    ));
                }
            } else {
                let names: Vec<&str> = commands.iter().map(|c| c.name.as_str()).collect();
                out.push_str(&format!("  {}\n", names.join(", ")));
            }
            out.push('\n');
        }
        io.write_str(&out).await?;
        Ok(out.into_bytes())
    }
}

struct Info(Arc<Registry>);

#[async_trait]
impl CommandHandler for Info {
    async fn call(
        &self,
        io: &mut CommandIo,
        _ctx: CommandContext,
        _args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let commands = self.0.list();
        let background = commands.iter().filter(|c| c.background).count();
        let text = format!(
            "Engine Information:\n------------------\nVersion:    {}\nOS/Arch:    {}/{}\n\nCommands:   {} total\nBackground: {} commands capable\n",
            crate::VERSION,
            std::env::consts::OS,
            std::env::consts::ARCH,
            commands.len(),
            background
        );
        io.write_str(&text).await?;
        Ok(text.into_bytes())
    }
}

struct Time;

#[async_trait]
impl CommandHandler for Time {
    async fn call(
        &self,
        io: &mut CommandIo,
        _ctx: CommandContext,
        args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let format = if args.is_empty() {
            DEFAULT_TIME_FORMAT.to_string()
        } else {
            args.join(" ")
        };
        let items: Vec<Item<'_>> = StrftimeItems::new(&format).collect();
        if items.iter().any(|item| matches!(item, Item::Error)) {
            return Err(CommandError::failed(format!("invalid time format: {format}")));
        }
        let text = format!(
            "Current UTC time: {}\n",
            Utc::now().format_with_items(items.iter())
        );
        io.write_str(&text).await?;
        Ok(text.into_bytes())
    }
}

struct Echo;

#[async_trait]
impl CommandHandler for Echo {
    async fn call(
        &self,
        io: &mut CommandIo,
        _ctx: CommandContext,
        args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let text = args.join(" ");
        io.write_line(&text).await?;
        Ok(text.into_bytes())
    }
}

struct Version;

#[async_trait]
impl CommandHandler for Version {
    async fn call(
        &self,
        io: &mut CommandIo,
        _ctx: CommandContext,
        _args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let text = format!(
            "Engine Version Information:\n-------------------------\nVersion:     {}\nProtocol:    line/json handshake\nTarget:      {}-{}\n",
            crate::VERSION,
            std::env::consts::ARCH,
            std::env::consts::OS
        );
        io.write_str(&text).await?;
        Ok(text.into_bytes())
    }
}

struct Exec;

#[async_trait]
impl CommandHandler for Exec {
    async fn call(
        &self,
        io: &mut CommandIo,
        ctx: CommandContext,
        args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let Some((program, rest)) = args.split_first() else {
            return Err(CommandError::usage("exec <command> [args...]"));
        };
        let mut command = Command::new(program);
        command.args(rest);

        let exit = run_child(io, &ctx, command, false).await?;
        let summary = match exit {
            ChildExit::Cancelled if ctx.deadline().is_some() => "Command timed out".to_string(),
            ref other => describe_exit(other),
        };
        io.write_line(&summary).await?;
        Ok(summary.into_bytes())
    }
}

/// Options of `pyexec`; everything after the first positional word goes to
/// the script untouched.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(name = "pyexec", disable_version_flag = true)]
struct PyExecArgs {
    /// Python script file path
    #[arg(short = 'f', long = "file")]
    script: PathBuf,

    /// Python interpreter path
    #[arg(short = 'p', long = "python", default_value = DEFAULT_PYTHON)]
    interpreter: String,

    /// Environment variable for the script, as KEY=VALUE
    #[arg(short = 'e', long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Forward session input to the script
    #[arg(short = 'i', long)]
    interactive: bool,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl PyExecArgs {
    fn parse_args(args: &[String]) -> Result<Self, CommandError> {
        let mut parsed = Self::try_parse_from(
            std::iter::once("pyexec".to_string()).chain(args.iter().cloned()),
        )
        .map_err(|err| CommandError::usage(err.to_string().trim_end()))?;
        if let Ok(absolute) = std::path::absolute(&parsed.script) {
            parsed.script = absolute;
        }
        Ok(parsed)
    }
}

fn parse_env_pair(pair: &str) -> Result<(String, String), String> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| format!("invalid environment variable format: {pair}"))?;
    if key.is_empty() {
        return Err(format!("empty environment variable name: {pair}"));
    }
    Ok((key.to_string(), value.to_string()))
}

struct PyExec;

#[async_trait]
impl CommandHandler for PyExec {
    async fn call(
        &self,
        io: &mut CommandIo,
        ctx: CommandContext,
        args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let options = PyExecArgs::parse_args(&args)?;
        if tokio::fs::metadata(&options.script).await.is_err() {
            return Err(CommandError::failed(format!(
                "python script not found: {}",
                options.script.display()
            )));
        }

        let mut command = Command::new(&options.interpreter);
        command
            .arg(&options.script)
            .args(&options.args)
            .envs(options.env.iter().map(|(k, v)| (k, v)));

        match run_child(io, &ctx, command, options.interactive).await? {
            ChildExit::Exited(status) if status.success() => Ok(Vec::new()),
            ChildExit::Exited(status) => Err(CommandError::failed(format!(
                "python script execution failed: {status}"
            ))),
            ChildExit::Cancelled => {
                io.write_line("Script cancelled").await?;
                Ok(Vec::new())
            }
        }
    }
}
