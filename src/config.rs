//! Configuration for egsa-deploy paths and defaults.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (EGSA_DEPLOY_HOME, EGSA_DEPLOY_PIPELINES, EGSA_DEPLOY_WEBHOOK)
//! 2. Config file (.egsa-deploy/config.yaml)
//! 3. Defaults (~/.egsa-deploy, ./pipelines)
//!
//! Config file discovery:
//! - Searches current directory and parents for .egsa-deploy/config.yaml
//! - `home` is relative to the .egsa-deploy/ directory, `pipelines` to the
//!   project root (the directory containing .egsa-deploy/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const ENV_HOME: &str = "EGSA_DEPLOY_HOME";
pub const ENV_PIPELINES: &str = "EGSA_DEPLOY_PIPELINES";
pub const ENV_WEBHOOK: &str = "EGSA_DEPLOY_WEBHOOK";

const CONFIG_DIR: &str = ".egsa-deploy";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Run history and lock directory (relative to .egsa-deploy/)
    pub home: Option<String>,
    /// Pipeline definitions directory (relative to the project root)
    pub pipelines: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Webhook used by pipelines that do not name their own
    pub webhook_url: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Run history, deploy lock
    pub home: PathBuf,
    /// Directory searched for `<name>.yaml` pipelines
    pub pipelines: PathBuf,
    /// Default notification webhook
    pub webhook_url: Option<String>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Resolve a pipeline argument: an existing file path, or a name
    /// looked up as `<pipelines>/<name>.yaml`
    pub fn pipeline_path(&self, name: &str) -> PathBuf {
        let direct = PathBuf::from(name);
        if direct.extension().is_some_and(|e| e == "yaml" || e == "yml") || direct.is_file() {
            return direct;
        }
        self.pipelines.join(format!("{}.yaml", name))
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Resolve configuration from a working directory and an env lookup
fn load_config_from<F>(cwd: &Path, env: F) -> Result<ResolvedConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config_file = find_config_file(cwd);
    let parsed = config_file
        .as_deref()
        .map(|path| load_config_file(path).map(|c| (path, c)))
        .transpose()?;

    let (file_home, file_pipelines, file_webhook) = match &parsed {
        Some((config_path, config)) => {
            let config_dir = config_path.parent().unwrap_or(Path::new("."));
            let project_root = config_dir.parent().unwrap_or(Path::new("."));
            (
                config.paths.home.as_deref().map(|h| resolve_path(config_dir, h)),
                config
                    .paths
                    .pipelines
                    .as_deref()
                    .map(|p| resolve_path(project_root, p)),
                config.notify.as_ref().and_then(|n| n.webhook_url.clone()),
            )
        }
        None => (None, None, None),
    };

    let home = env(ENV_HOME)
        .map(PathBuf::from)
        .or(file_home)
        .unwrap_or(default_home);

    let pipelines = env(ENV_PIPELINES)
        .map(PathBuf::from)
        .or(file_pipelines)
        .unwrap_or_else(|| cwd.join("pipelines"));

    let webhook_url = env(ENV_WEBHOOK)
        .filter(|url| !url.trim().is_empty())
        .or(file_webhook);

    Ok(ResolvedConfig {
        home,
        pipelines,
        webhook_url,
        config_file,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_from(&cwd, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the egsa-deploy home directory
pub fn deploy_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($EGSA_DEPLOY_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.runs_dir())
}

/// Resolve a pipeline name or path to its YAML file
pub fn pipeline_path(name: &str) -> Result<PathBuf> {
    Ok(config()?.pipeline_path(name))
}

/// Default webhook, if configured
pub fn webhook_url() -> Option<String> {
    config().ok().and_then(|c| c.webhook_url.clone())
}
