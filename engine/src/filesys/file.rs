//! File operations

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::errors::EngineError;

/// A file wrapper with path
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Create a new file reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, EngineError> {
        Ok(fs::read_to_string(&self.path).await?)
    }

    /// Read file contents, `None` when the file does not exist
    pub async fn read_bytes_opt(&self) -> Result<Option<Vec<u8>>, EngineError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write JSON to file, replacing it atomically
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), EngineError> {
        let contents = serde_json::to_vec_pretty(value)?;
        self.write_atomic(&contents).await
    }

    /// Hidden sibling scratch path, distinct per `tag`
    pub fn temp_path(&self, tag: &str) -> PathBuf {
        let mut name = OsString::from(".");
        name.push(self.path.file_name().unwrap_or_default());
        name.push(format!(".{}.tmp", tag));
        self.path.with_file_name(name)
    }

    /// Atomic write: the full contents go to a scratch file which is synced and
    /// renamed over the target. Readers see either the old or the new document.
    /// Every call uses its own scratch file, so concurrent writers never
    /// clobber each other and the last rename wins.
    pub async fn write_atomic(&self, contents: &[u8]) -> Result<(), EngineError> {
        let tag = Uuid::new_v4().simple().to_string();
        self.write_atomic_tagged(&tag, contents).await
    }

    /// [`File::write_atomic`] through the scratch file of `tag`. Callers must
    /// not run two writes with the same tag at once.
    pub async fn write_atomic_tagged(&self, tag: &str, contents: &[u8]) -> Result<(), EngineError> {
        let parent = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(&parent).await?;
        }

        let temp_path = self.temp_path(tag);
        if let Err(e) = write_and_sync(&temp_path, contents).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        // Persist the rename itself
        #[cfg(unix)]
        {
            if !parent.as_os_str().is_empty() {
                if let Ok(dir) = fs::File::open(&parent).await {
                    let _ = dir.sync_all().await;
                }
            }
        }

        Ok(())
    }

    /// Delete the file
    pub async fn delete(&self) -> Result<(), EngineError> {
        if self.exists().await {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }
}

async fn write_and_sync(path: &Path, contents: &[u8]) -> Result<(), std::io::Error> {
    let mut file = fs::File::create(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path_is_hidden_sibling() {
        let file = File::new("/etc/empaas/traefik/dynamic/web.yml");
        assert_eq!(
            file.temp_path("a1"),
            PathBuf::from("/etc/empaas/traefik/dynamic/.web.yml.a1.tmp")
        );
        assert_ne!(file.temp_path("a1"), file.temp_path("b2"));
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join("doc.json"));

        file.write_atomic(b"first").await.unwrap();
        file.write_atomic(b"second").await.unwrap();

        assert_eq!(file.read_string().await.unwrap(), "second");

        // No scratch files are left behind
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.yml");

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let file = File::new(&path);
                tokio::spawn(async move {
                    let contents = format!("writer {}\n", i).repeat(2048);
                    file.write_atomic(contents.as_bytes()).await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let contents = File::new(&path).read_string().await.unwrap();
        let first = contents.lines().next().unwrap().to_string();
        assert!(contents.lines().all(|line| line == first));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join("doc.yml"));
        file.write_atomic(b"v1").await.unwrap();

        std::fs::create_dir(file.temp_path("busy")).unwrap();
        assert!(file.write_atomic_tagged("busy", b"v2").await.is_err());
        assert_eq!(file.read_string().await.unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_read_bytes_opt_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join("missing.yml"));
        assert!(file.read_bytes_opt().await.unwrap().is_none());
    }
}
