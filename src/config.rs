//! TOML configuration.
//!
//! A configuration names where resources and collections live on disk, how
//! to reach the thread database, how to launch the agent, and which
//! resources exist. Several files can be layered: a later file replaces a
//! resource with the same name entirely and overrides any section it sets.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::ResourceDefinition;
use crate::validate::validate_definition;

/// Environment variable naming the default config file.
pub const CONFIG_ENV: &str = "RASK_CONFIG";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub resources: Vec<ResourceDefinition>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_resources_dir")]
    pub resources_dir: PathBuf,
    #[serde(default = "default_collections_dir")]
    pub collections_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            resources_dir: default_resources_dir(),
            collections_dir: default_collections_dir(),
        }
    }
}

fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(".local").join("share").join("repo-ask"))
        .unwrap_or_else(|| PathBuf::from(".repo-ask"))
}

fn default_resources_dir() -> PathBuf {
    data_dir().join("resources")
}

fn default_collections_dir() -> PathBuf {
    data_dir().join("collections")
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    data_dir().join("threads.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Executable that serves the agent's HTTP session API.
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u32,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Extra instructions prepended to every session's system prompt.
    #[serde(default)]
    pub instructions: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            provider: default_provider(),
            model: default_model(),
            hostname: default_hostname(),
            port_attempts: default_port_attempts(),
            startup_timeout_secs: default_startup_timeout_secs(),
            instructions: None,
        }
    }
}

fn default_agent_command() -> String {
    "opencode".to_string()
}
fn default_provider() -> String {
    "anthropic".to_string()
}
fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_hostname() -> String {
    "127.0.0.1".to_string()
}
fn default_port_attempts() -> u32 {
    3
}
fn default_startup_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Looks up a resource definition by name.
    pub fn resource(&self, name: &str) -> Option<&ResourceDefinition> {
        self.resources.iter().find(|r| r.name() == name)
    }

    /// Builds a configuration with defaults and the given resources.
    pub fn with_resources(resources: Vec<ResourceDefinition>) -> Self {
        Self {
            storage: StorageConfig::default(),
            db: DbConfig::default(),
            server: ServerConfig::default(),
            agent: AgentConfig::default(),
            resources,
        }
    }
}

/// One file's worth of configuration, before layering.
#[derive(Debug, Deserialize, Default)]
struct ConfigLayer {
    storage: Option<StorageConfig>,
    db: Option<DbConfig>,
    server: Option<ServerConfig>,
    agent: Option<AgentConfig>,
    #[serde(default)]
    resources: Vec<ResourceDefinition>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    load_layered(&[path.to_path_buf()])
}

/// Loads and merges config files in priority order (lowest first).
///
/// Missing files after the first are skipped so a project-level file is
/// optional; the first path must exist.
pub fn load_layered(paths: &[PathBuf]) -> Result<Config> {
    let mut config = Config::with_resources(Vec::new());
    let mut by_name: BTreeMap<String, usize> = BTreeMap::new();

    for (i, path) in paths.iter().enumerate() {
        if i > 0 && !path.exists() {
            continue;
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let layer: ConfigLayer = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        apply_layer(&mut config, &mut by_name, layer);
    }

    finish(config)
}

/// Parses a single configuration from a string (used by tests and `init`).
pub fn parse_config(content: &str) -> Result<Config> {
    let layer: ConfigLayer = toml::from_str(content).with_context(|| "Failed to parse config")?;
    let mut config = Config::with_resources(Vec::new());
    apply_layer(&mut config, &mut BTreeMap::new(), layer);
    finish(config)
}

fn apply_layer(config: &mut Config, by_name: &mut BTreeMap<String, usize>, layer: ConfigLayer) {
    if let Some(storage) = layer.storage {
        config.storage = storage;
    }
    if let Some(db) = layer.db {
        config.db = db;
    }
    if let Some(server) = layer.server {
        config.server = server;
    }
    if let Some(agent) = layer.agent {
        config.agent = agent;
    }
    for resource in layer.resources {
        match by_name.get(resource.name()) {
            Some(&idx) => config.resources[idx] = resource,
            None => {
                by_name.insert(resource.name().to_string(), config.resources.len());
                config.resources.push(resource);
            }
        }
    }
}

fn finish(mut config: Config) -> Result<Config> {
    config.storage.resources_dir = expand_tilde(&config.storage.resources_dir);
    config.storage.collections_dir = expand_tilde(&config.storage.collections_dir);
    config.db.path = expand_tilde(&config.db.path);

    if config.agent.port_attempts == 0 {
        anyhow::bail!("agent.port_attempts must be >= 1");
    }
    if config.agent.startup_timeout_secs == 0 {
        anyhow::bail!("agent.startup_timeout_secs must be >= 1");
    }
    if config.agent.command.trim().is_empty() {
        anyhow::bail!("agent.command must not be empty");
    }

    let mut validated = Vec::with_capacity(config.resources.len());
    for resource in &config.resources {
        let resource = match resource {
            ResourceDefinition::Local { name, path, notes } => ResourceDefinition::Local {
                name: name.clone(),
                path: expand_tilde(path),
                notes: notes.clone(),
            },
            git => git.clone(),
        };
        let resource = validate_definition(&resource)
            .with_context(|| format!("Invalid resource '{}'", resource.name()))?;
        validated.push(resource);
    }
    config.resources = validated;

    Ok(config)
}

/// Project-level config file picked up from the working directory.
pub const PROJECT_CONFIG: &str = "rask.toml";

/// `$RASK_CONFIG`, or `~/.config/repo-ask/config.toml`.
pub fn default_config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => expand_tilde(Path::new(&path)),
        _ => home_dir()
            .map(|h| h.join(".config").join("repo-ask").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml")),
    }
}

/// Loads the global config layered under `./rask.toml`.
///
/// An `explicit` path must exist. Without one, a missing global file is
/// tolerated as long as a project file is present.
pub fn load_default(explicit: Option<PathBuf>) -> Result<Config> {
    let project = PathBuf::from(PROJECT_CONFIG);
    let global = match explicit {
        Some(path) => path,
        None => {
            let path = default_config_path();
            if !path.exists() {
                if project.exists() {
                    return load_config(&project);
                }
                anyhow::bail!(
                    "No config found at {} (run `rask init` to create one)",
                    path.display()
                );
            }
            path
        }
    };
    load_layered(&[global, project])
}

/// Writes [`STARTER_CONFIG`] to `path` unless a file is already there.
/// Returns whether a file was written.
pub fn write_starter(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, STARTER_CONFIG)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(true)
}

/// Starter configuration written by `rask init`.
pub const STARTER_CONFIG: &str = r#"# repo-ask configuration

[agent]
command = "opencode"
provider = "anthropic"
model = "claude-sonnet-4-5"

# [[resources]]
# type = "git"
# name = "svelte"
# url = "https://github.com/sveltejs/svelte.dev"
# branch = "main"
# search_paths = ["apps/svelte.dev"]
# notes = "Documentation sources live under apps/svelte.dev"

# [[resources]]
# type = "local"
# name = "mine"
# path = "~/src/mine"
"#;

/// Expands a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[storage]
resources_dir = "/tmp/rask/resources"
collections_dir = "/tmp/rask/collections"

[agent]
provider = "openai"
model = "gpt-5"

[[resources]]
type = "git"
name = "svelte"
url = "https://github.com/sveltejs/svelte.git"
branch = "main"
notes = "compiler and runtime"

[[resources]]
type = "local"
name = "notes"
path = "/srv/notes"
"#;

    #[test]
    fn parses_and_normalizes() {
        let config = parse_config(BASE).unwrap();
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.agent.provider, "openai");
        assert_eq!(config.agent.port_attempts, 3);
        assert_eq!(config.server.bind, "127.0.0.1:8787");
        match config.resource("svelte").unwrap() {
            ResourceDefinition::Git { url, .. } => {
                assert_eq!(url, "https://github.com/sveltejs/svelte")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_invalid_resource() {
        let bad = r#"
[[resources]]
type = "git"
name = "1bad"
url = "https://github.com/a/b"
branch = "main"
"#;
        let err = parse_config(bad).unwrap_err();
        assert!(format!("{:#}", err).contains("invalid name"));
    }

    #[test]
    fn rejects_zero_port_attempts() {
        let err = parse_config("[agent]\nport_attempts = 0\n").unwrap_err();
        assert!(err.to_string().contains("port_attempts"));
    }

    #[test]
    fn later_layer_replaces_resource_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.toml");
        let project = dir.path().join("project.toml");
        std::fs::write(&global, BASE).unwrap();
        std::fs::write(
            &project,
            r#"
[[resources]]
type = "git"
name = "svelte"
url = "https://github.com/sveltejs/kit"
branch = "next"

[[resources]]
type = "git"
name = "effect"
url = "https://github.com/Effect-TS/effect"
branch = "main"
"#,
        )
        .unwrap();

        let config = load_layered(&[global, project]).unwrap();
        let names: Vec<&str> = config.resources.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["svelte", "notes", "effect"]);
        match config.resource("svelte").unwrap() {
            ResourceDefinition::Git {
                url, branch, notes, ..
            } => {
                assert_eq!(url, "https://github.com/sveltejs/kit");
                assert_eq!(branch, "next");
                // no field-level merge: notes from the lower layer are gone
                assert!(notes.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        // sections not set by the later layer are kept
        assert_eq!(config.agent.provider, "openai");
    }

    #[test]
    fn missing_optional_layer_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.toml");
        std::fs::write(&global, BASE).unwrap();
        let config = load_layered(&[global, dir.path().join("absent.toml")]).unwrap();
        assert_eq!(config.resources.len(), 2);
    }

    #[test]
    fn starter_config_parses() {
        let config = parse_config(STARTER_CONFIG).unwrap();
        assert!(config.resources.is_empty());
        assert_eq!(config.agent.command, "opencode");
    }

    #[test]
    fn write_starter_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        assert!(write_starter(&path).unwrap());
        std::fs::write(&path, BASE).unwrap();
        assert!(!write_starter(&path).unwrap());
        assert_eq!(load_config(&path).unwrap().resources.len(), 2);
    }

    #[test]
    fn expand_tilde_noop_for_absolute() {
        let path = Path::new("/usr/local/bin");
        assert_eq!(expand_tilde(path), path.to_path_buf());
    }
}
