use std::path::{Component, Path, PathBuf};

use anyhow::{Result, anyhow};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::config::collapse_scheme;

/// The managed storage namespace: files under `base_dir`, published under `base_url`.
#[derive(Clone, Debug)]
pub struct LocalFileStorage {
    base_dir: PathBuf,
    base_url: String,
}

impl LocalFileStorage {
    pub fn new(base_dir: PathBuf, base_url: String) -> Self {
        let base_url = collapse_scheme(base_url.trim().trim_end_matches('/'));
        Self { base_dir, base_url }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, data).await?;
        Ok(())
    }

    /// Like [`put`](Self::put), but fails if the key already holds an object.
    pub async fn put_new(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|err| anyhow!("create {key}: {err}"))?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Removes an object. `Ok(false)` when there was nothing to remove.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.resolve_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve_path(key)?;
        match fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Keys of the files directly under `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir_path = self.resolve_path(prefix)?;
        let mut dir = match fs::read_dir(&dir_path).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let prefix = prefix.trim_matches('/');
        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                keys.push(format!("{prefix}/{name}"));
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn get_public_url(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        format!("{}/{key}", self.base_url)
    }

    /// Maps a public URL back to its key, or `None` when the URL lies outside
    /// this namespace.
    pub fn key_for_url(&self, raw: &str) -> Option<String> {
        let base = Url::parse(&format!("{}/", self.base_url)).ok()?;
        let candidate = Url::parse(raw.trim()).ok()?;
        if candidate.scheme() != base.scheme()
            || candidate.host_str() != base.host_str()
            || candidate.port_or_known_default() != base.port_or_known_default()
        {
            return None;
        }
        let key = candidate.path().strip_prefix(base.path())?;
        let safe = !key.is_empty()
            && key
                .split('/')
                .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
        safe.then(|| key.to_string())
    }

    pub fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        let normalized = Path::new(key.trim_start_matches('/'));
        if normalized
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(anyhow!("invalid storage key: {key}"));
        }
        Ok(self.base_dir.join(normalized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &Path) -> LocalFileStorage {
        LocalFileStorage::new(dir.to_path_buf(), "http://http://cdn.test/cache/".to_string())
    }

    #[tokio::test]
    async fn put_get_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        storage.put("images/a.png", b"png").await.unwrap();
        assert!(storage.exists("images/a.png").await.unwrap());
        assert_eq!(storage.get("images/a.png").await.unwrap(), Some(b"png".to_vec()));

        assert!(storage.delete("images/a.png").await.unwrap());
        assert!(!storage.delete("images/a.png").await.unwrap());
        assert_eq!(storage.get("images/a.png").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_new_refuses_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        storage.put_new("sessions/t.json", b"{}").await.unwrap();
        assert!(storage.put_new("sessions/t.json", b"{}").await.is_err());
    }

    #[tokio::test]
    async fn list_returns_sorted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        assert!(storage.list("campaigns").await.unwrap().is_empty());

        storage.put("campaigns/b.json", b"{}").await.unwrap();
        storage.put("campaigns/a.json", b"{}").await.unwrap();
        storage.put("campaigns/nested/c.json", b"{}").await.unwrap();
        assert_eq!(
            storage.list("campaigns").await.unwrap(),
            vec!["campaigns/a.json", "campaigns/b.json"]
        );
    }

    #[test]
    fn public_urls_round_trip_to_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let url = storage.get_public_url("/uploads/abc.png");
        assert_eq!(url, "http://cdn.test/cache/uploads/abc.png");
        assert_eq!(storage.key_for_url(&url).as_deref(), Some("uploads/abc.png"));
    }

    #[test]
    fn foreign_and_traversing_urls_are_not_managed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        assert_eq!(storage.key_for_url("https://other.test/cache/x.png"), None);
        assert_eq!(storage.key_for_url("http://cdn.test/elsewhere/x.png"), None);
        assert_eq!(storage.key_for_url("http://cdn.test/cache/"), None);
        assert_eq!(storage.key_for_url("http://cdn.test/cache/a//b.png"), None);
        assert_eq!(storage.key_for_url("not a url"), None);
        assert!(storage.resolve_path("../etc/passwd").is_err());
    }
}
