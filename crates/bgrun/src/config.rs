//! Configuration file support
//!
//! ```toml
//! [runtime]
//! slot = "default"
//! poll_interval_ms = 500
//!
//! [job]
//! max_turns = 20
//! max_events = 100
//!
//! [generator]
//! type = "command"
//! program = "python3"
//! args = ["team.py", "--task", "{task}"]
//! env = { OPENAI_API_KEY = "${OPENAI_API_KEY}" }
//! ```

use crate::controller::{ControllerOptions, SpawnMode};
use crate::generator::{CommandFactory, GeneratorFactory, ReplayFactory};
use crate::job::JobParams;
use anyhow::{Context, Result, anyhow};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const APP_DIR: &str = "bgrun";
const CONFIG_FILE: &str = "config.toml";
const HISTORY_FILE: &str = "history.json";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BgrunConfig {
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub job: JobSettings,
    pub generator: Option<GeneratorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeSettings {
    /// Root for slots and the history file. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
    pub slot: String,
    pub spawn_mode: SpawnMode,
    pub poll_interval_ms: u64,
    /// A running job with no writes for this long is reported as stale.
    pub stale_after_secs: u64,
    pub history_capacity: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            slot: "default".to_string(),
            spawn_mode: SpawnMode::Task,
            poll_interval_ms: 500,
            stale_after_secs: 600,
            history_capacity: crate::archive::DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct JobSettings {
    pub max_turns: u32,
    pub max_events: usize,
    pub include_timestamp: bool,
    pub skip_sources: Vec<String>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_events: 100,
            include_timestamp: true,
            skip_sources: vec!["user".to_string()],
        }
    }
}

/// The producer to run for each job.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum GeneratorConfig {
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        cwd: Option<PathBuf>,
    },
    Replay {
        path: PathBuf,
        #[serde(default)]
        delay_ms: u64,
    },
}

impl GeneratorConfig {
    pub fn build_factory(&self) -> Arc<dyn GeneratorFactory> {
        match self {
            GeneratorConfig::Command {
                program,
                args,
                env,
                cwd,
            } => {
                let mut factory = CommandFactory::new(program.clone()).with_args(args.clone());
                for (key, value) in env {
                    factory = factory.with_env(key.clone(), value.clone());
                }
                if let Some(cwd) = cwd {
                    factory = factory.with_cwd(cwd.clone());
                }
                Arc::new(factory)
            }
            GeneratorConfig::Replay { path, delay_ms } => Arc::new(ReplayFactory::new(
                path.clone(),
                Duration::from_millis(*delay_ms),
            )),
        }
    }

    fn resolve_paths(&mut self, base_path: &Path) {
        match self {
            GeneratorConfig::Command { cwd: Some(cwd), .. } if cwd.is_relative() => {
                *cwd = base_path.join(&*cwd);
            }
            GeneratorConfig::Replay { path, .. } if path.is_relative() => {
                *path = base_path.join(&*path);
            }
            _ => {}
        }
    }
}

impl BgrunConfig {
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.runtime.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join(APP_DIR))
                .ok_or_else(|| anyhow!("Cannot determine a data directory; set runtime.data_dir")),
        }
    }

    pub fn history_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(HISTORY_FILE))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.runtime.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.runtime.stale_after_secs)
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            spawn_mode: self.runtime.spawn_mode,
            include_timestamp: self.job.include_timestamp,
            skip_sources: self.job.skip_sources.clone(),
        }
    }

    /// Job parameters for `task`, with optional per-run overrides.
    pub fn job_params(
        &self,
        task: impl Into<String>,
        max_turns: Option<u32>,
        max_events: Option<usize>,
    ) -> JobParams {
        JobParams::new(
            task,
            max_turns.unwrap_or(self.job.max_turns),
            max_events.unwrap_or(self.job.max_events),
        )
    }

    pub fn generator_factory(&self) -> Result<Arc<dyn GeneratorFactory>> {
        self.generator
            .as_ref()
            .map(GeneratorConfig::build_factory)
            .ok_or_else(|| anyhow!("No [generator] section in config; nothing to run"))
    }
}

/// `<config dir>/bgrun/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

/// Load and parse a config file
pub async fn load_config(path: impl AsRef<Path>) -> Result<BgrunConfig> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let base_path = path.parent().unwrap_or(Path::new("."));
    parse_config(&content, base_path).with_context(|| format!("Invalid config file: {:?}", path))
}

/// Load `path` if given, otherwise the default config file if it exists,
/// otherwise built-in defaults.
pub async fn load_or_default(path: Option<&Path>) -> Result<BgrunConfig> {
    if let Some(path) = path {
        return load_config(path).await;
    }
    match default_config_path() {
        Some(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => {
            load_config(&path).await
        }
        _ => Ok(BgrunConfig::default()),
    }
}

/// Parse config text; relative generator paths resolve against `base_path`.
pub fn parse_config(content: &str, base_path: &Path) -> Result<BgrunConfig> {
    let processed = interpolate_env_vars(content)?;
    let mut config: BgrunConfig =
        toml::from_str(&processed).with_context(|| "Failed to parse config")?;
    validate(&config)?;
    if let Some(generator) = &mut config.generator {
        generator.resolve_paths(base_path);
    }
    Ok(config)
}

fn validate(config: &BgrunConfig) -> Result<()> {
    if config.runtime.poll_interval_ms == 0 {
        return Err(anyhow!("runtime.poll_interval_ms must be greater than 0"));
    }
    if config.runtime.history_capacity == 0 {
        return Err(anyhow!("runtime.history_capacity must be greater than 0"));
    }
    if config.job.max_turns == 0 || config.job.max_events == 0 {
        return Err(anyhow!("job.max_turns and job.max_events must be at least 1"));
    }
    if config.runtime.slot.trim().is_empty() {
        return Err(anyhow!("runtime.slot must not be empty"));
    }
    Ok(())
}

/// Interpolate environment variables in config content
/// Supports ${VAR} and ${VAR:-default} syntax
pub fn interpolate_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
        .context("Failed to compile env var regex")?;

    let mut missing = Vec::new();
    let result = re.replace_all(content, |caps: &Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str());

        match (std::env::var(var_name), default) {
            (Ok(val), _) => val,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                missing.push(var_name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(anyhow!(
            "Required environment variables not set: {}",
            missing.join(", ")
        ));
    }

    Ok(result.into_owned())
}
