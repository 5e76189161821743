// review-bridge/src/lockfile.rs

use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("creating lock directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("writing lock file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("encoding lock file: {0}")]
    Encode(#[from] serde_json::Error),
}

pub const TRANSPORT: &str = "http";

/// Discovery descriptor. Field names are a stable contract with agents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    pub workspace_folders: Vec<String>,
    pub ide_name: String,
    pub transport: String,
    pub auth_token: String,
}

impl LockInfo {
    pub fn new(workspace: &Path, ide_name: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            pid: std::process::id(),
            workspace_folders: vec![workspace.to_string_lossy().into_owned()],
            ide_name: ide_name.into(),
            transport: TRANSPORT.into(),
            auth_token: auth_token.into(),
        }
    }
}

pub fn new_auth_token() -> String { uuid::Uuid::new_v4().to_string() }

/// Lock file on disk; removed when dropped.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Writes `<dir>/<port>.lock` through a temporary file so readers never
    /// see a partial descriptor.
    pub fn write(dir: &Path, port: u16, info: &LockInfo) -> Result<Self, LockError> {
        fs::create_dir_all(dir).map_err(|source| LockError::CreateDir { path: dir.to_path_buf(), source })?;
        let path = dir.join(format!("{port}.lock"));
        let tmp = dir.join(format!(".{port}.lock.tmp"));
        let text = serde_json::to_string(info)?;
        fs::write(&tmp, text)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|source| LockError::Write { path: path.clone(), source })?;
        info!(path = %path.display(), "lock file written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path { &self.path }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "lock file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove lock file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_as_flat_json_and_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let info = LockInfo::new(Path::new("/w/project"), "Neovim", "tok");
        let lock = LockFile::write(&dir.path().join("ide"), 41234, &info).unwrap();
        let path = lock.path().to_path_buf();
        assert_eq!(path.file_name().unwrap(), "41234.lock");

        let v: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["ideName"], "Neovim");
        assert_eq!(v["authToken"], "tok");
        assert_eq!(v["workspaceFolders"][0], "/w/project");
        assert!(v.as_object().unwrap().values().all(|f| !f.is_object()));

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn descriptor_matches_published_schema() {
        let schema: serde_json::Value =
            serde_json::from_str(include_str!("../schemas/lockfile.schema.json")).unwrap();
        let validator = jsonschema::validator_for(&schema).unwrap();
        let info = LockInfo::new(Path::new("/w"), "Neovim", new_auth_token());
        let value = serde_json::to_value(&info).unwrap();
        assert!(validator.is_valid(&value));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(new_auth_token(), new_auth_token());
    }
}
