use crate::shepherd::restart::RestartStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_START_PRIORITY: i32 = 10;

/// Command shape as written in the config: a bare string runs through
/// `/bin/sh -c`, an argv list execs directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandSpec {
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandSpec::Shell(line) => {
                vec!["/bin/sh".to_string(), "-c".to_string(), line.clone()]
            }
            CommandSpec::Exec(argv) => argv.clone(),
        }
    }

    fn validate(&self, what: &str) -> anyhow::Result<()> {
        match self {
            CommandSpec::Shell(line) => {
                anyhow::ensure!(!line.trim().is_empty(), "{what} must not be empty");
            }
            CommandSpec::Exec(argv) => {
                anyhow::ensure!(!argv.is_empty(), "{what} must not be an empty list");
                anyhow::ensure!(
                    !argv[0].trim().is_empty(),
                    "{what} has an empty program name"
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StdoutMode {
    #[default]
    #[serde(rename = "console")]
    Console,
    #[serde(rename = "/dev/null")]
    DevNull,
    #[serde(rename = "log")]
    Log,
}

/// One fully resolved daemon definition. Deep equality over all fields is
/// what the reload diff uses to decide whether a record keeps its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonSpec {
    pub name: String,
    pub start_command: CommandSpec,
    pub stop_command: Option<CommandSpec>,
    /// Signal used instead of SIGTERM when no stop_command is set.
    pub stop_signal: Option<String>,
    /// argv[0] override for the start command.
    pub argv0: Option<String>,
    pub start_priority: i32,
    pub cwd: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub stdout: StdoutMode,
    pub restart: RestartStrategy,
    /// Admin commands in declaration order.
    pub commands: Vec<(String, CommandSpec)>,
}

impl DaemonSpec {
    pub fn admin_command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, cmd)| cmd)
    }

    /// Minimal spec as produced by `--exec NAME=COMMAND`.
    pub fn from_exec(name: &str, command: &str) -> Self {
        DaemonSpec {
            name: name.to_string(),
            start_command: CommandSpec::Shell(command.to_string()),
            stop_command: None,
            stop_signal: None,
            argv0: None,
            start_priority: DEFAULT_START_PRIORITY,
            cwd: None,
            environment: BTreeMap::new(),
            user: None,
            group: None,
            stdout: StdoutMode::default(),
            restart: RestartStrategy::default(),
            commands: Vec::new(),
        }
    }
}

/// Where the roster comes from. Reload re-runs `load()`, so a file source
/// picks up edits while a static source (from `--exec`) always diffs clean.
#[derive(Debug, Clone)]
pub enum RosterSource {
    File(PathBuf),
    Static(Vec<DaemonSpec>),
}

impl RosterSource {
    pub fn load(&self) -> anyhow::Result<Vec<DaemonSpec>> {
        match self {
            RosterSource::File(path) => load_config_file(path),
            RosterSource::Static(specs) => Ok(specs.clone()),
        }
    }
}

// -------- YAML file schema (strict) --------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    defaults: DefaultsFile,
    #[serde(default)]
    daemons: serde_yaml::Mapping,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsFile {
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default)]
    stdout: Option<StdoutMode>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    start_priority: Option<i32>,
    #[serde(default)]
    restart: Option<RestartStrategy>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DaemonFile {
    start_command: CommandSpec,
    #[serde(default)]
    stop_command: Option<CommandSpec>,
    #[serde(default)]
    stop_signal: Option<String>,
    #[serde(default)]
    argv0: Option<String>,
    #[serde(default)]
    start_priority: Option<i32>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    stdout: Option<StdoutMode>,
    #[serde(default)]
    restart: Option<RestartStrategy>,
    // A mapping, like `daemons`, so declaration order survives parsing.
    #[serde(default)]
    commands: serde_yaml::Mapping,
}

/// Load and validate the roster config. Daemons come back in declaration
/// order; that order breaks start-priority ties.
pub fn load_config_file(path: &Path) -> anyhow::Result<Vec<DaemonSpec>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
    let file: ConfigFile = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", path.display()))?;

    let mut specs: Vec<DaemonSpec> = Vec::with_capacity(file.daemons.len());
    for (key, value) in &file.daemons {
        let name = key
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("daemon names must be strings, got {key:?}"))?;
        anyhow::ensure!(!name.trim().is_empty(), "daemon name must not be empty");
        anyhow::ensure!(
            name.trim() == name,
            "daemon name must not have leading/trailing whitespace: {name:?}"
        );

        let d: DaemonFile = serde_yaml::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("daemon {name}: {e}"))?;
        let spec = merge_spec(name, d, &file.defaults)
            .map_err(|e| anyhow::anyhow!("daemon {name}: {e}"))?;
        specs.push(spec);
    }
    Ok(specs)
}

fn merge_spec(name: &str, d: DaemonFile, defaults: &DefaultsFile) -> anyhow::Result<DaemonSpec> {
    d.start_command.validate("start_command")?;
    if let Some(stop) = &d.stop_command {
        stop.validate("stop_command")?;
    }
    if let Some(sig) = &d.stop_signal {
        crate::shepherd::child::parse_signal(sig)?;
    }

    let mut commands: Vec<(String, CommandSpec)> = Vec::with_capacity(d.commands.len());
    for (key, value) in &d.commands {
        let cmd_name = key
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("admin command names must be strings, got {key:?}"))?;
        anyhow::ensure!(
            !cmd_name.trim().is_empty(),
            "admin command name must not be empty"
        );
        anyhow::ensure!(
            !commands.iter().any(|(n, _)| n.as_str() == cmd_name),
            "duplicate admin command name: {cmd_name}"
        );
        let cmd: CommandSpec = serde_yaml::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("command {cmd_name}: {e}"))?;
        cmd.validate(&format!("command {cmd_name}"))?;
        commands.push((cmd_name.to_string(), cmd));
    }

    // Per-daemon environment entries override the defaults entry-wise.
    let mut environment = defaults.environment.clone();
    environment.extend(d.environment);

    Ok(DaemonSpec {
        name: name.to_string(),
        start_command: d.start_command,
        stop_command: d.stop_command,
        stop_signal: d.stop_signal,
        argv0: d.argv0,
        start_priority: d
            .start_priority
            .or(defaults.start_priority)
            .unwrap_or(DEFAULT_START_PRIORITY),
        cwd: d.cwd.or_else(|| defaults.cwd.clone()),
        environment,
        user: d.user.or_else(|| defaults.user.clone()),
        group: d.group.or_else(|| defaults.group.clone()),
        stdout: d.stdout.or(defaults.stdout).unwrap_or_default(),
        restart: d
            .restart
            .or_else(|| defaults.restart.clone())
            .unwrap_or_default(),
        commands,
    })
}
