// review-bridge/src/scratch.rs

use std::{
    io,
    path::{Component, Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

pub const ORIGINAL_TAG: &str = "bridge-original";
pub const PROPOSED_TAG: &str = "bridge-proposed";

#[derive(Debug, Error)]
pub enum ScratchError {
    #[error("target {0} has no file name")]
    NoFileName(PathBuf),
    #[error("reading {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("writing {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// The two on-disk sides of one review.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScratchPair {
    pub target: PathBuf,
    pub original: PathBuf,
    pub proposed: PathBuf,
}

/// Scratch files sit beside the target under decorated names
/// (`main.bridge-proposed.rs`), keeping the extension so the editor picks the
/// right filetype. Targets whose directory does not exist yet are staged under
/// `fallback_root` in a mirror of that directory, so two reviews never share
/// a scratch file.
#[derive(Clone, Debug)]
pub struct ScratchWorkspace {
    fallback_root: PathBuf,
}

impl ScratchWorkspace {
    pub fn new(fallback_root: impl Into<PathBuf>) -> Self {
        Self { fallback_root: fallback_root.into() }
    }

    pub fn paths_for(&self, target: &Path) -> Result<ScratchPair, ScratchError> {
        let name = target.file_name().ok_or_else(|| ScratchError::NoFileName(target.to_path_buf()))?;
        let dir = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() && p.is_dir() => p.to_path_buf(),
            _ => self.fallback_dir(target),
        };
        let name = Path::new(name);
        Ok(ScratchPair {
            target: target.to_path_buf(),
            original: dir.join(decorate(name, ORIGINAL_TAG)),
            proposed: dir.join(decorate(name, PROPOSED_TAG)),
        })
    }

    fn fallback_dir(&self, target: &Path) -> PathBuf {
        let mut dir = self.fallback_root.clone();
        for part in target.parent().into_iter().flat_map(Path::components) {
            match part {
                Component::Normal(p) => dir.push(p),
                Component::ParentDir => dir.push("_parent_"),
                Component::Prefix(p) => dir.push(p.as_os_str().to_string_lossy().replace([':', '\\', '?'], "_")),
                Component::RootDir | Component::CurDir => {}
            }
        }
        dir
    }

    /// Writes the current target content (empty when the target does not
    /// exist) and `proposed` to the scratch pair.
    pub async fn stage(&self, target: &Path, proposed: &str) -> Result<ScratchPair, ScratchError> {
        let pair = self.paths_for(target)?;
        let current = match tokio::fs::read(target).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(ScratchError::Read { path: target.to_path_buf(), source }),
        };
        if pair.original.starts_with(&self.fallback_root)
            && let Some(dir) = pair.original.parent()
        {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| ScratchError::Write { path: dir.to_path_buf(), source })?;
        }
        write(&pair.original, &current).await?;
        if let Err(e) = write(&pair.proposed, proposed.as_bytes()).await {
            let _ = tokio::fs::remove_file(&pair.original).await;
            return Err(e);
        }
        debug!(target = %target.display(), "scratch pair staged");
        Ok(pair)
    }

    pub async fn read_proposed(&self, pair: &ScratchPair) -> Result<String, ScratchError> {
        let bytes = tokio::fs::read(&pair.proposed)
            .await
            .map_err(|source| ScratchError::Read { path: pair.proposed.clone(), source })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Deletes both sides. Every failure is logged; the number of files that
    /// could not be removed is returned.
    pub async fn remove(&self, pair: &ScratchPair) -> usize {
        let mut failed = 0;
        for p in [&pair.original, &pair.proposed] {
            match tokio::fs::remove_file(p).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %p.display(), error = %e, "failed to delete scratch file");
                    failed += 1;
                }
            }
        }
        failed
    }
}

async fn write(path: &Path, bytes: &[u8]) -> Result<(), ScratchError> {
    tokio::fs::write(path, bytes).await.map_err(|source| ScratchError::Write { path: path.to_path_buf(), source })
}

fn decorate(name: &Path, tag: &str) -> String {
    let stem = name.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    match name.extension() {
        Some(ext) => format!("{stem}.{tag}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{tag}"),
    }
}

/// True for paths produced by `paths_for`.
pub fn is_scratch_path(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else { return false };
    [ORIGINAL_TAG, PROPOSED_TAG]
        .iter()
        .any(|tag| name.ends_with(&format!(".{tag}")) || name.contains(&format!(".{tag}.")))
}
