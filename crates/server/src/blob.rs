use std::path::PathBuf;

use async_trait::async_trait;
use tramita_core::reconcile::BlobStore;

/// Stores completion artifacts on the local filesystem.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn store(&self, name: &str, bytes: &[u8]) -> Result<String, String> {
        let sanitized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '-' })
            .collect();
        let path = self.root.join(&sanitized);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|error| error.to_string())?;
        }
        tokio::fs::write(&path, bytes).await.map_err(|error| error.to_string())?;

        Ok(format!("file://{}", path.display()))
    }
}

/// Test double keeping artifacts in memory.
#[derive(Default)]
pub struct InMemoryBlobStore {
    pub stored: std::sync::Mutex<Vec<(String, Vec<u8>)>>,
    pub fail: bool,
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn store(&self, name: &str, bytes: &[u8]) -> Result<String, String> {
        if self.fail {
            return Err("blob storage unavailable".to_string());
        }
        let mut stored = self.stored.lock().unwrap();
        stored.push((name.to_string(), bytes.to_vec()));
        Ok(format!("blob://{name}"))
    }
}

#[cfg(test)]
mod tests {
    use tramita_core::reconcile::BlobStore;

    use super::FsBlobStore;

    #[tokio::test]
    async fn fs_store_writes_and_sanitizes_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());

        let url = store.store("certificado env/1.pdf", b"conteudo").await.expect("store");
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("certificado-env-1.pdf"));

        let written = std::fs::read(dir.path().join("certificado-env-1.pdf")).expect("read back");
        assert_eq!(written, b"conteudo");
    }
}
