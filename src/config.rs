// review-bridge/src/config.rs

use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, warn};

use crate::diff_review::DiffSettings;

pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
pub const DEFAULT_PUSH_QUEUE: usize = 256;
pub const DEFAULT_IDE_NAME: &str = "Neovim";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ACCEPT_KEY: &str = "<leader>da";
pub const DEFAULT_REJECT_KEY: &str = "<leader>dq";
pub const DEFAULT_RELOAD_DELAY_MS: u64 = 200;
pub const DEFAULT_MAX_FILES: usize = 20;
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Every field is optional so that each layer only overrides what it sets.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub editor: EditorConfig,
    pub diff: DiffConfig,
    pub tracker: TrackerConfig,
    pub lock: LockConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// 0 or unset picks an ephemeral port.
    pub port: Option<u16>,
    pub keep_alive_secs: Option<u64>,
    pub ide_name: Option<String>,
    pub push_queue: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct EditorConfig {
    pub socket: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct DiffConfig {
    pub accept_key: Option<String>,
    pub reject_key: Option<String>,
    pub reload_delay_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    pub max_files: Option<usize>,
    pub debounce_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    pub dir: Option<PathBuf>,
}

impl Config {
    pub fn port(&self) -> u16 { self.server.port.unwrap_or(0) }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.server.keep_alive_secs.filter(|s| *s > 0).unwrap_or(DEFAULT_KEEP_ALIVE_SECS))
    }

    pub fn ide_name(&self) -> String { self.server.ide_name.clone().unwrap_or_else(|| DEFAULT_IDE_NAME.to_string()) }

    pub fn push_queue(&self) -> usize { self.server.push_queue.filter(|n| *n > 0).unwrap_or(DEFAULT_PUSH_QUEUE) }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.editor.request_timeout_secs.filter(|s| *s > 0).unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    pub fn diff_settings(&self) -> DiffSettings {
        DiffSettings {
            accept_key: self.diff.accept_key.clone().unwrap_or_else(|| DEFAULT_ACCEPT_KEY.to_string()),
            reject_key: self.diff.reject_key.clone().unwrap_or_else(|| DEFAULT_REJECT_KEY.to_string()),
            reload_delay: Duration::from_millis(self.diff.reload_delay_ms.unwrap_or(DEFAULT_RELOAD_DELAY_MS)),
        }
    }

    pub fn max_files(&self) -> usize { self.tracker.max_files.filter(|n| *n > 0).unwrap_or(DEFAULT_MAX_FILES) }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.tracker.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS))
    }

    /// `$HOME/.claude/ide` unless overridden.
    pub fn lock_dir(&self) -> Option<PathBuf> {
        self.lock.dir.clone().or_else(|| directories::BaseDirs::new().map(|b| b.home_dir().join(".claude").join("ide")))
    }
}

fn merge(a: &mut Config, b: &Config) {
    fn overlay<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
        if src.is_some() {
            dst.clone_from(src);
        }
    }
    overlay(&mut a.server.port, &b.server.port);
    overlay(&mut a.server.keep_alive_secs, &b.server.keep_alive_secs);
    overlay(&mut a.server.ide_name, &b.server.ide_name);
    overlay(&mut a.server.push_queue, &b.server.push_queue);

    overlay(&mut a.editor.socket, &b.editor.socket);
    overlay(&mut a.editor.request_timeout_secs, &b.editor.request_timeout_secs);

    overlay(&mut a.diff.accept_key, &b.diff.accept_key);
    overlay(&mut a.diff.reject_key, &b.diff.reject_key);
    overlay(&mut a.diff.reload_delay_ms, &b.diff.reload_delay_ms);

    overlay(&mut a.tracker.max_files, &b.tracker.max_files);
    overlay(&mut a.tracker.debounce_ms, &b.tracker.debounce_ms);

    overlay(&mut a.lock.dir, &b.lock.dir);
}

fn config_paths(workspace_root: &Path) -> Result<(PathBuf, PathBuf, PathBuf)> {
    let proj = ProjectDirs::from("dev", "review-bridge", "review-bridge").context("ProjectDirs not available")?;
    let user = proj.config_dir().join("config.toml");
    let system = if cfg!(target_os = "windows") {
        PathBuf::from(r"C:\ProgramData\ReviewBridge\config.toml")
    } else {
        PathBuf::from("/etc/review-bridge/config.toml")
    };
    let workspace = workspace_root.join(".review-bridge").join("config.toml");
    Ok((system, user, workspace))
}

#[derive(Clone)]
pub struct ConfigManager {
    inner: Arc<RwLock<Config>>,
    system_path: PathBuf,
    user_path: PathBuf,
    workspace_path: PathBuf,
    runtime_overlay: Arc<RwLock<Config>>,
}

impl ConfigManager {
    pub fn load(workspace_root: impl AsRef<Path>) -> Result<Self> {
        let (system_path, user_path, workspace_path) = config_paths(workspace_root.as_ref())?;
        Self::with_paths(system_path, user_path, workspace_path)
    }

    fn with_paths(system_path: PathBuf, user_path: PathBuf, workspace_path: PathBuf) -> Result<Self> {
        let cm = Self {
            inner: Arc::new(RwLock::new(Config::default())),
            system_path,
            user_path,
            workspace_path,
            runtime_overlay: Arc::new(RwLock::new(Config::default())),
        };
        cm.reload_all()?;
        Ok(cm)
    }

    fn read_file(path: &Path) -> Result<Option<Config>> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config layer unreadable, skipping");
                return Ok(None);
            }
        };
        let cfg = toml::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
        debug!(path = %path.display(), "config layer loaded");
        Ok(Some(cfg))
    }

    pub fn reload_all(&self) -> Result<()> {
        let mut merged = Config::default();
        for p in [&self.system_path, &self.user_path, &self.workspace_path] {
            if let Some(layer) = Self::read_file(p)? {
                merge(&mut merged, &layer);
            }
        }
        let rt = self.runtime_overlay.read().clone();
        merge(&mut merged, &rt);
        *self.inner.write() = merged;
        Ok(())
    }

    pub fn get(&self) -> Config { self.inner.read().clone() }

    pub fn apply_runtime_overlay(&self, patch: Config) -> Result<()> {
        {
            let mut rt = self.runtime_overlay.write();
            merge(&mut rt, &patch);
        }
        self.reload_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> ConfigManager {
        ConfigManager::with_paths(dir.join("system.toml"), dir.join("user.toml"), dir.join("ws.toml")).unwrap()
    }

    #[test]
    fn defaults_apply_without_any_layer() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = manager(dir.path()).get();
        assert_eq!(cfg.keep_alive(), Duration::from_secs(30));
        assert_eq!(cfg.max_files(), 20);
        assert_eq!(cfg.debounce(), Duration::from_millis(100));
        assert_eq!(cfg.diff_settings().accept_key, "<leader>da");
        assert_eq!(cfg.port(), 0);
    }

    #[test]
    fn later_layers_override_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("system.toml"), "[server]\nport = 9000\nide_name = \"sys\"\n").unwrap();
        fs::write(dir.path().join("user.toml"), "[server]\nport = 9100\n[tracker]\nmax_files = 5\n").unwrap();
        fs::write(dir.path().join("ws.toml"), "[diff]\nreject_key = \"q\"\n").unwrap();
        let cm = manager(dir.path());
        let cfg = cm.get();
        assert_eq!(cfg.port(), 9100);
        assert_eq!(cfg.ide_name(), "sys");
        assert_eq!(cfg.max_files(), 5);
        assert_eq!(cfg.diff_settings().reject_key, "q");

        let mut patch = Config::default();
        patch.server.port = Some(1234);
        cm.apply_runtime_overlay(patch).unwrap();
        assert_eq!(cm.get().port(), 1234);
        assert_eq!(cm.get().max_files(), 5);
    }

    #[test]
    fn malformed_layer_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("user.toml"), "[server\nport = ").unwrap();
        let res = ConfigManager::with_paths(dir.path().join("s"), dir.path().join("user.toml"), dir.path().join("w"));
        assert!(res.is_err());
    }
}
