//! On-disk state: snapshot, options document, raw response cache.
//!
//! Every file is written to a uniquely named temp file beside it and then
//! renamed into place, so a crash mid write leaves the previous version
//! intact and concurrent writers never share a temp file.

pub mod cache;
pub mod migrate;
pub mod options;
pub mod snapshot;

pub use cache::*;
pub use migrate::*;
pub use options::*;
pub use snapshot::*;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;

/// Write `data` to a fresh temp file in the target directory, sync it, then
/// rename it over `path`
pub async fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let path = path.to_path_buf();
    let data = data.to_vec();
    tokio::task::spawn_blocking(move || {
        let mut tmp = NamedTempFile::new_in(&parent)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map(drop).map_err(|e| e.error)
    })
    .await
    .map_err(io::Error::other)?
}

/// Serialize `value` as pretty JSON and write it atomically
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &data).await
}

/// Read and parse a JSON file; `Ok(None)` when it does not exist
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(io::Error::from),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entries(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_atomic_write_creates_parents_and_leaves_no_tmp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deep/state.json");

        atomic_write(&path, b"version 1").await.unwrap();
        atomic_write(&path, b"version 2").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"version 2");
        assert_eq!(entries(&dir.path().join("nested/deep")), vec!["state.json".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_to_one_path_all_succeed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("options.json");

        let writes = (0..8).map(|i| {
            let path = path.clone();
            tokio::spawn(async move { atomic_write(&path, format!("writer {i}").as_bytes()).await })
        });
        for handle in writes.collect::<Vec<_>>() {
            handle.await.unwrap().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("writer "));
        assert_eq!(entries(dir.path()), vec!["options.json".to_string()]);
    }

    #[tokio::test]
    async fn test_read_json_missing_is_none() {
        let dir = tempdir().unwrap();
        let value: Option<serde_json::Value> = read_json(&dir.path().join("nope.json")).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_read_json_corrupt_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{not json").unwrap();
        let result: io::Result<Option<serde_json::Value>> = read_json(&path).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
