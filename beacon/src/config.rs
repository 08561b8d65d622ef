//! Configuration file handling.
//!
//! A single JSON file in the platform configuration directory. A missing
//! file is created with defaults on first run; the file is rewritten only
//! when the server refreshes the account token.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "beacon";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Account token, verbatim (bot tokens keep their `Bot ` prefix).
    pub token: String,
    /// Enable the game-detection service.
    pub game_detection: bool,
    /// Days between detectable-applications catalog refreshes; 0 refreshes
    /// on every start.
    pub game_list_download_delay: u64,
    /// Application ids never surfaced as detected games.
    pub games_blacklist: Vec<String>,
    /// Proxy URL (`http://host:port` or `socks5://host:port`).
    pub proxy: Option<String>,
    /// Alternative server (bare host or full URL).
    pub custom_host: Option<String>,
    /// Identity fingerprint mode: `default` or `anonymous`.
    pub client_properties: String,
    /// Override the generated user agent.
    pub custom_user_agent: Option<String>,
    /// Force legacy-host protocol quirks on or off; unset falls back to the
    /// hostname heuristic.
    pub legacy_host: Option<bool>,
    /// Resolve `https://` asset URLs through the external-assets endpoint.
    pub rpc_external_assets: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: String::new(),
            game_detection: true,
            game_list_download_delay: 7,
            games_blacklist: Vec::new(),
            proxy: None,
            custom_host: None,
            client_properties: "default".to_string(),
            custom_user_agent: None,
            legacy_host: None,
            rpc_external_assets: true,
        }
    }
}

impl Config {
    /// Load the config, writing a default file first when none exists.
    pub fn load_or_init(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating config directory {}", dir.display()))?;
            let default = Self::default();
            default.save(dir)?;
            return Ok(default);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let path = dir.join(CONFIG_FILE);
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, raw)
            .with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }
}

/// Platform configuration directory.
///
/// POSIX: `$XDG_DATA_HOME/beacon` when set, otherwise `~/.config/beacon`.
/// Windows: `%LOCALAPPDATA%\beacon`. macOS: `~/Library/Application
/// Support/beacon`.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            if !data_home.trim().is_empty() {
                return Ok(PathBuf::from(data_home).join(APP_NAME));
            }
        }
        let base = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("cannot determine the home directory"))?;
        Ok(base.home_dir().join(".config").join(APP_NAME))
    }
    #[cfg(target_os = "windows")]
    {
        let local = std::env::var("LOCALAPPDATA").context("LOCALAPPDATA is not set")?;
        Ok(PathBuf::from(local).join(APP_NAME))
    }
    #[cfg(target_os = "macos")]
    {
        let base = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("cannot determine the home directory"))?;
        Ok(base
            .home_dir()
            .join("Library/Application Support")
            .join(APP_NAME))
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        anyhow::bail!("unsupported platform")
    }
}
