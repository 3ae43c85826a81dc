//! Patchgate configuration (`patchgate.toml`) plus environment overrides.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::naming::validate_tag;

/// Top-level configuration (TOML).
///
/// Missing fields default to the values the tool ships with, so an absent
/// config file is equivalent to an empty one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Directory every tool call is confined to. Must already exist.
    pub sandbox_root: PathBuf,
    /// Directory under which one `run-*` directory is created per invocation.
    pub runs_root: PathBuf,
    /// Model identifier recorded in session metadata.
    pub model: String,
    /// Optional operator tag appended to the run directory name.
    pub run_tag: Option<String>,
    pub files: FilesConfig,
    pub apply: ApplyConfig,
    pub verifier: VerifierConfig,
    pub signal: SignalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilesConfig {
    /// Largest file `write_file` accepts and `read_file` returns untruncated.
    pub max_bytes: usize,
    /// Extensions (without the dot) file tools may touch. Empty allows any.
    pub allowed_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApplyConfig {
    /// Wall-clock limit for one `git apply` invocation.
    pub timeout_secs: u64,
    /// Truncate captured apply-tool streams beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifierConfig {
    /// Container runtime binary (`docker`, `podman`).
    pub runtime: String,
    pub image: String,
    pub timeout_secs: u64,
    /// Keep only the last this-many bytes of checker output.
    pub output_limit_bytes: usize,
    /// Verification calls allowed per conversation turn.
    pub max_runs_per_turn: u32,
    pub memory: String,
    pub cpus: String,
    pub pids_limit: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalMode {
    /// Emit only when an editor is detected (`VSCODE_PID` / `TERM_PROGRAM=vscode`).
    Auto,
    Always,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SignalConfig {
    pub mode: SignalMode,
    /// Event file observers watch.
    pub path: PathBuf,
    /// Clip before/after text beyond this many bytes.
    pub max_bytes: usize,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_bytes: 200_000,
            allowed_extensions: ["rs", "toml", "lock", "md", "txt", "py"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "kani-runner:0.66".to_string(),
            timeout_secs: 300,
            output_limit_bytes: 20_000,
            max_runs_per_turn: 3,
            memory: "6g".to_string(),
            cpus: "2".to_string(),
            pids_limit: 512,
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            mode: SignalMode::Auto,
            path: PathBuf::from(".patchgate/ui.signal.json"),
            max_bytes: 400_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from("./workspace"),
            runs_root: PathBuf::from("./runs"),
            model: "gpt-5".to_string(),
            run_tag: None,
            files: FilesConfig::default(),
            apply: ApplyConfig::default(),
            verifier: VerifierConfig::default(),
            signal: SignalConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must not be empty"));
        }
        if let Some(tag) = &self.run_tag {
            validate_tag(tag).map_err(|msg| anyhow!(msg))?;
        }
        if self.files.max_bytes == 0 {
            return Err(anyhow!("files.max_bytes must be > 0"));
        }
        if self.apply.timeout_secs == 0 {
            return Err(anyhow!("apply.timeout_secs must be > 0"));
        }
        if self.apply.output_limit_bytes == 0 {
            return Err(anyhow!("apply.output_limit_bytes must be > 0"));
        }
        if self.verifier.runtime.trim().is_empty() || self.verifier.image.trim().is_empty() {
            return Err(anyhow!("verifier.runtime and verifier.image must be set"));
        }
        if self.verifier.timeout_secs == 0 {
            return Err(anyhow!("verifier.timeout_secs must be > 0"));
        }
        if self.verifier.output_limit_bytes == 0 {
            return Err(anyhow!("verifier.output_limit_bytes must be > 0"));
        }
        if self.verifier.max_runs_per_turn == 0 {
            return Err(anyhow!("verifier.max_runs_per_turn must be > 0"));
        }
        if self.verifier.pids_limit == 0 {
            return Err(anyhow!("verifier.pids_limit must be > 0"));
        }
        if self.signal.max_bytes == 0 {
            return Err(anyhow!("signal.max_bytes must be > 0"));
        }
        Ok(())
    }

    /// Resolve the signal mode against the environment snapshot.
    pub fn signal_enabled(&self, env: &EnvSnapshot) -> bool {
        match self.signal.mode {
            SignalMode::Always => true,
            SignalMode::Off => false,
            SignalMode::Auto => {
                env.get(ENV_VSCODE_PID).is_some()
                    || env.get(ENV_TERM_PROGRAM) == Some("vscode")
            }
        }
    }
}

pub const ENV_WORKSPACE: &str = "PATCHGATE_WORKSPACE";
pub const ENV_RUN_ROOT: &str = "PATCHGATE_RUN_ROOT";
pub const ENV_MODEL: &str = "PATCHGATE_MODEL";
pub const ENV_RUN_TAG: &str = "PATCHGATE_RUN_TAG";
pub const ENV_MAX_BYTES: &str = "PATCHGATE_MAX_BYTES";
pub const ENV_KANI_IMAGE: &str = "KANI_DOCKER_IMAGE";
pub const ENV_KANI_TIMEOUT: &str = "KANI_TIMEOUT_SECS";
pub const ENV_MAX_KANI_RUNS: &str = "PATCHGATE_MAX_KANI_RUNS";
pub const ENV_VSCODE_PID: &str = "VSCODE_PID";
pub const ENV_TERM_PROGRAM: &str = "TERM_PROGRAM";

/// Environment keys actually consulted, with the value seen (or `None`).
///
/// Recorded in session metadata instead of a full environment dump.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvSnapshot(BTreeMap<String, Option<String>>);

impl EnvSnapshot {
    fn record(&mut self, key: &str, value: Option<String>) -> Option<String> {
        self.0.insert(key.to_string(), value.clone());
        value
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_deref())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Apply environment overrides, reading variables through `lookup`.
pub fn apply_env_overrides<F>(cfg: &mut Config, lookup: F) -> Result<EnvSnapshot>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = EnvSnapshot::default();
    let mut read = |key: &str| env.record(key, lookup(key).filter(|v| !v.is_empty()));

    if let Some(v) = read(ENV_WORKSPACE) {
        cfg.sandbox_root = PathBuf::from(v);
    }
    if let Some(v) = read(ENV_RUN_ROOT) {
        cfg.runs_root = PathBuf::from(v);
    }
    if let Some(v) = read(ENV_MODEL) {
        cfg.model = v;
    }
    if let Some(v) = read(ENV_RUN_TAG) {
        cfg.run_tag = Some(v);
    }
    if let Some(v) = read(ENV_MAX_BYTES) {
        cfg.files.max_bytes = parse_number(ENV_MAX_BYTES, &v)?;
    }
    if let Some(v) = read(ENV_KANI_IMAGE) {
        cfg.verifier.image = v;
    }
    if let Some(v) = read(ENV_KANI_TIMEOUT) {
        cfg.verifier.timeout_secs = parse_number(ENV_KANI_TIMEOUT, &v)?;
    }
    if let Some(v) = read(ENV_MAX_KANI_RUNS) {
        cfg.verifier.max_runs_per_turn = parse_number(ENV_MAX_KANI_RUNS, &v)?;
    }
    if cfg.signal.mode == SignalMode::Auto {
        read(ENV_VSCODE_PID);
        read(ENV_TERM_PROGRAM);
    }
    Ok(env)
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| anyhow!("{key} must be a non-negative integer (got '{raw}')"))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        debug!(path = %path.display(), "config file missing, using defaults");
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load the file, then layer environment overrides on top and re-validate.
pub fn load_with_env<F>(path: &Path, lookup: F) -> Result<(Config, EnvSnapshot)>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = load_config(path)?;
    let env = apply_env_overrides(&mut cfg, lookup)?;
    cfg.validate()
        .with_context(|| format!("config after environment overrides ({})", path.display()))?;
    Ok((cfg, env))
}
