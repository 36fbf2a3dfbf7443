//! Local chunk store with an embedded HTTP file server.
//!
//! Chunks are written under a directory which is simultaneously served over
//! HTTP so the target can `IMPORT` from it. The listen address and the
//! address the target uses to reach the server may differ (e.g. the target
//! runs inside Docker and reaches the host through a bridge); the access
//! address is never derived from the listen address.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use tower_http::services::ServeDir;
use tracing::info;

use super::{chunk_key, ChunkSink, ChunkWriter, Resource, Store};
use crate::compression::Compression;
use crate::dbtable::Name;
use crate::error::{MoltError, Result};

const DEFAULT_FLUSH_SIZE: usize = 128 << 20;

pub struct LocalStore {
    base_dir: PathBuf,
    server: tokio::task::JoinHandle<()>,
    sink: Arc<LocalSink>,
}

struct LocalSink {
    base_dir: PathBuf,
    /// Address the target uses to fetch chunks.
    access_addr: String,
}

struct LocalResource {
    key: String,
    path: PathBuf,
    url: String,
}

impl LocalStore {
    /// Create the chunk directory and start serving it on `listen_addr`.
    /// `crdb_access_addr` defaults to the listen address when not given.
    pub async fn new(
        base_dir: PathBuf,
        listen_addr: SocketAddr,
        crdb_access_addr: Option<String>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&base_dir).await?;

        let app = Router::new().fallback_service(ServeDir::new(base_dir.clone()));
        let listener = tokio::net::TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "local store file server exited");
            }
        });

        let access_addr = crdb_access_addr.unwrap_or_else(|| local_addr.to_string());
        info!(
            dir = %base_dir.display(),
            listen = %local_addr,
            access = %access_addr,
            "serving local chunk store"
        );
        Ok(Self {
            base_dir: base_dir.clone(),
            server,
            sink: Arc::new(LocalSink {
                base_dir,
                access_addr,
            }),
        })
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        self.server.abort();
    }
}

#[async_trait]
impl ChunkSink for LocalSink {
    async fn put(&self, key: String, data: Vec<u8>) -> Result<Arc<dyn Resource>> {
        let path = self.base_dir.join(&key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &data).await?;
        let url = format!("http://{}/{}", self.access_addr, key);
        Ok(Arc::new(LocalResource { key, path, url }))
    }
}

#[async_trait]
impl Store for LocalStore {
    fn create_writer(
        &self,
        table: &Name,
        _columns: &[String],
        part: u32,
        compression: Compression,
    ) -> Result<ChunkWriter> {
        Ok(ChunkWriter::new(
            chunk_key(table, part, compression),
            compression,
            self.sink.clone(),
        ))
    }

    fn default_flush_batch_size(&self) -> usize {
        DEFAULT_FLUSH_SIZE
    }

    fn can_be_target(&self) -> bool {
        true
    }

    async fn cleanup(&self) -> Result<()> {
        tokio::fs::remove_dir_all(&self.base_dir).await?;
        Ok(())
    }
}

#[async_trait]
impl Resource for LocalResource {
    fn key(&self) -> &str {
        &self.key
    }

    fn import_url(&self) -> Result<String> {
        Ok(self.url.clone())
    }

    async fn read_all(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&self.path).await?)
    }

    async fn mark_for_cleanup(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MoltError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn test_store(dir: &tempfile::TempDir, access: Option<String>) -> LocalStore {
        LocalStore::new(
            dir.path().to_path_buf(),
            "127.0.0.1:0".parse().unwrap(),
            access,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_chunk_lands_on_disk_with_access_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, Some("host.docker.internal:4040".into())).await;

        let table = Name::new("public", "teams");
        let mut w = store
            .create_writer(&table, &[], 0, Compression::None)
            .unwrap();
        w.write_all(b"1,alice,admin\n").unwrap();
        let resource = w.finish().await.unwrap();

        assert_eq!(
            resource.import_url().unwrap(),
            "http://host.docker.internal:4040/public.teams/part_00000000.csv"
        );
        assert_eq!(resource.read_all().await.unwrap(), b"1,alice,admin\n");

        // Cleanup is idempotent.
        resource.mark_for_cleanup().await.unwrap();
        resource.mark_for_cleanup().await.unwrap();
        assert!(resource.read_all().await.is_err());
    }

    #[tokio::test]
    async fn test_store_cleanup_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("chunks");
        let store = LocalStore::new(base.clone(), "127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let table = Name::new("public", "teams");
        let mut w = store
            .create_writer(&table, &[], 0, Compression::None)
            .unwrap();
        w.write_all(b"x\n").unwrap();
        w.finish().await.unwrap();

        store.cleanup().await.unwrap();
        assert!(!base.exists());
    }
}
