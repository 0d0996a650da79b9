use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"scriptdeck"`.
    pub application: &'static str,
}

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Time a stopped job gets between SIGTERM and SIGKILL.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Where job records live; defaults to the platform data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

fn default_log_level() -> String { "info".to_string() }
fn default_grace_ms() -> u64 { 5_000 }

impl Default for Config {
    fn default() -> Self {
        Self { log_level: default_log_level(), grace_ms: default_grace_ms(), data_dir: None }
    }
}

impl Config {
    /// Grace window as a [`Duration`].
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Where the app keeps its config and its records.
#[derive(Debug, Clone)]
pub struct Dirs {
    /// Holds `config.toml`.
    pub config: PathBuf,
    /// Holds the record files.
    pub data: PathBuf,
}

impl Dirs {
    /// Platform directories for `app`, created if needed.
    pub fn for_app(app: &AppId) -> Result<Self> {
        let pd = ProjectDirs::from(app.qualifier, app.organization, app.application)
            .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))?;
        Self::create(pd.config_dir().to_path_buf(), pd.data_dir().to_path_buf())
    }

    /// Single directory for both, used by `--home` and tests.
    pub fn under(home: &Path) -> Result<Self> {
        Self::create(home.to_path_buf(), home.join("data"))
    }

    fn create(config: PathBuf, data: PathBuf) -> Result<Self> {
        fs::create_dir_all(&config).with_context(|| format!("create config dir {}", config.display()))?;
        Ok(Self { config, data })
    }

    /// Data directory after applying `cfg.data_dir`.
    pub fn data_dir(&self, cfg: &Config) -> PathBuf {
        cfg.data_dir.clone().unwrap_or_else(|| self.data.clone())
    }
}

/// Load `config.toml` from `dirs.config` or create a default one.
pub fn load_or_init(dirs: &Dirs) -> Result<Config> {
    let path = dirs.config.join("config.toml");
    if path.exists() {
        let txt = fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&txt)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    } else {
        let cfg = Config::default();
        save_config(&path, &cfg)?;
        Ok(cfg)
    }
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
