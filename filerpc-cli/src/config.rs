//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use filerpc_core::{PreflightPolicy, RuntimeConfig};
use serde::Deserialize;

/// CLI configuration. File: ~/.config/filerpc/config.toml or /etc/filerpc/config.toml.
/// Env overrides: FILERPC_DATASITES, FILERPC_EMAIL, FILERPC_POLL_INTERVAL_MS,
/// FILERPC_MAX_WORKERS, FILERPC_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Root of the synchronized datasites tree.
    #[serde(default = "default_datasites")]
    pub datasites: PathBuf,
    /// Local identity. Required for every command that sends or serves.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,
    #[serde(default = "default_expiry_secs")]
    pub default_expiry_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub preflight: PreflightPolicy,
    #[serde(default)]
    pub expose_handler_errors: bool,
    /// tracing filter directive, e.g. "info" or "filerpc_core=debug".
    #[serde(default = "default_log")]
    pub log: String,
}

fn default_datasites() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join("SyftBox/datasites")
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_rescan_interval_ms() -> u64 {
    2000
}
fn default_expiry_secs() -> u64 {
    15 * 60
}
fn default_max_workers() -> usize {
    4
}
fn default_log() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            datasites: default_datasites(),
            email: None,
            poll_interval_ms: default_poll_interval_ms(),
            rescan_interval_ms: default_rescan_interval_ms(),
            default_expiry_secs: default_expiry_secs(),
            max_workers: default_max_workers(),
            preflight: PreflightPolicy::default(),
            expose_handler_errors: false,
            log: default_log(),
        }
    }
}

impl Config {
    /// Runtime settings for the configured identity.
    pub fn runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let Some(email) = self.email.as_deref().filter(|e| !e.is_empty()) else {
            bail!("no identity configured: set `email` in the config file or FILERPC_EMAIL");
        };
        let mut rc = RuntimeConfig::new(&self.datasites, email);
        rc.poll_interval = Duration::from_millis(self.poll_interval_ms.max(1));
        rc.rescan_interval = Duration::from_millis(self.rescan_interval_ms.max(1));
        rc.default_expiry = Duration::from_secs(self.default_expiry_secs);
        rc.max_workers = self.max_workers;
        rc.preflight = self.preflight;
        rc.expose_handler_errors = self.expose_handler_errors;
        Ok(rc)
    }
}

/// Load config: merge default, then config file, then env vars.
///
/// An explicit `path` must exist. Otherwise the first existing well-known path is used.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match path {
        Some(p) => read(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn read(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

/// Env overrides. Unparsable numbers are ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("FILERPC_DATASITES") {
        c.datasites = PathBuf::from(s);
    }
    if let Some(s) = var("FILERPC_EMAIL") {
        c.email = Some(s);
    }
    if let Some(s) = var("FILERPC_POLL_INTERVAL_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.poll_interval_ms = ms;
        }
    }
    if let Some(s) = var("FILERPC_MAX_WORKERS") {
        if let Ok(n) = s.parse::<usize>() {
            c.max_workers = n;
        }
    }
    if let Some(s) = var("FILERPC_LOG") {
        c.log = s;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/filerpc/config.toml"));
    }
    out.push(PathBuf::from("/etc/filerpc/config.toml"));
    out
}
