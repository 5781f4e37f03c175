//! A directory used as an object store.

use std::{io::Write as _, path::Component};

use tokio::fs;

use super::ObjectStore;
use crate::prelude::*;

/// Object store backed by a local directory. Keys map directly onto relative
/// paths below `root`.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Map a key to a path, refusing anything that could escape `root`.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid object key: {:?}", key);
        }
        Ok(self.root.join(relative))
    }

    /// Create the parent directory of `path`, if any.
    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {:?}", parent))?;
        }
        Ok(())
    }

    /// Convert a path below `root` back into a key.
    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(segments.join("/"))
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        let src = self.path_for(key)?;
        fs::copy(&src, dest)
            .await
            .with_context(|| format!("failed to copy {:?} to {:?}", src, dest))
    }

    async fn upload(&self, src: &Path, key: &str) -> Result<()> {
        let dest = self.path_for(key)?;
        Self::ensure_parent(&dest).await?;
        fs::copy(src, &dest)
            .await
            .with_context(|| format!("failed to copy {:?} to {:?}", src, dest))?;
        Ok(())
    }

    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let dest = self.path_for(key)?;
        Self::ensure_parent(&dest).await?;
        write_atomically(&dest, data).await
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {:?}", path)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        fs::try_exists(&path)
            .await
            .with_context(|| format!("failed to check {:?}", path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let start = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.path_for(prefix)?
        };
        let mut keys = vec![];
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to list {:?}", dir));
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("failed to list {:?}", dir))?
            {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to delete {:?}", path)),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list(prefix).await?;
        let path = self.path_for(prefix)?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(keys.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err).with_context(|| format!("failed to delete {:?}", path)),
        }
    }
}

/// Write `data` to `dest` via a temporary file in the same directory, then
/// rename it into place.
pub async fn write_atomically(dest: &Path, data: Vec<u8>) -> Result<()> {
    let dest = dest.to_owned();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let parent = dest
            .parent()
            .ok_or_else(|| anyhow!("no parent directory for {:?}", dest))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("failed to create temporary file in {:?}", parent))?;
        tmp.write_all(&data)
            .with_context(|| format!("failed to write {:?}", tmp.path()))?;
        tmp.persist(&dest)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to rename temporary file to {:?}", dest))?;
        Ok(())
    })
    .await
    .context("could not join blocking write task")?
}
