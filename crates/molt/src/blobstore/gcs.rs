//! Google Cloud Storage chunk store.

use std::sync::Arc;

use async_trait::async_trait;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use tracing::debug;

use super::{chunk_key, ChunkSink, ChunkWriter, Resource, Store};
use crate::compression::Compression;
use crate::dbtable::Name;
use crate::error::{MoltError, Result};

const DEFAULT_FLUSH_SIZE: usize = 256 << 20;

pub struct GcsStore {
    sink: Arc<GcsSink>,
}

struct GcsSink {
    client: Client,
    bucket: String,
    prefix: String,
}

struct GcsResource {
    client: Client,
    bucket: String,
    key: String,
}

impl GcsStore {
    /// Create a store using application default credentials. Import URLs
    /// use `AUTH=implicit`, so the target must hold equivalent credentials.
    pub async fn new(bucket: String, prefix: String) -> Result<Self> {
        let config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| MoltError::Config(format!("cannot resolve GCP credentials: {}", e)))?;
        Ok(Self {
            sink: Arc::new(GcsSink {
                client: Client::new(config),
                bucket,
                prefix,
            }),
        })
    }
}

impl GcsSink {
    fn object_key(&self, chunk: &str) -> String {
        if self.prefix.is_empty() {
            chunk.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), chunk)
        }
    }
}

#[async_trait]
impl ChunkSink for GcsSink {
    async fn put(&self, key: String, data: Vec<u8>) -> Result<Arc<dyn Resource>> {
        let object_key = self.object_key(&key);
        let upload_type = UploadType::Simple(Media::new(object_key.clone()));
        self.client
            .upload_object(
                &UploadObjectRequest {
                    bucket: self.bucket.clone(),
                    ..Default::default()
                },
                data,
                &upload_type,
            )
            .await
            .map_err(|e| {
                MoltError::store(format!("gcs upload of {:?} failed: {}", object_key, e))
            })?;
        debug!(bucket = %self.bucket, key = %object_key, "uploaded chunk");
        Ok(Arc::new(GcsResource {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: object_key,
        }))
    }
}

#[async_trait]
impl Store for GcsStore {
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
        let mut page_token: Option<String> = None;
        loop {
            let resp = self
                .sink
                .client
                .list_objects(&ListObjectsRequest {
                    bucket: self.sink.bucket.clone(),
                    prefix: Some(self.sink.prefix.clone()),
                    page_token: page_token.clone(),
                    ..Default::default()
                })
                .await
                .map_err(|e| MoltError::store(format!("gcs list failed: {}", e)))?;
            for object in resp.items.unwrap_or_default() {
                self.sink
                    .client
                    .delete_object(&DeleteObjectRequest {
                        bucket: self.sink.bucket.clone(),
                        object: object.name.clone(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| {
                        MoltError::store(format!("gcs delete of {:?} failed: {}", object.name, e))
                    })?;
            }
            match resp.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl Resource for GcsResource {
    fn key(&self) -> &str {
        &self.key
    }

    fn import_url(&self) -> Result<String> {
        Ok(format!("gs://{}/{}?AUTH=implicit", self.bucket, self.key))
    }

    async fn read_all(&self) -> Result<Vec<u8>> {
        self.client
            .download_object(
                &GetObjectRequest {
                    bucket: self.bucket.clone(),
                    object: self.key.clone(),
                    ..Default::default()
                },
                &Range::default(),
            )
            .await
            .map_err(|e| MoltError::store(format!("gcs get of {:?} failed: {}", self.key, e)))
    }

    async fn mark_for_cleanup(&self) -> Result<()> {
        match self
            .client
            .delete_object(&DeleteObjectRequest {
                bucket: self.bucket.clone(),
                object: self.key.clone(),
                ..Default::default()
            })
            .await
        {
            Ok(()) => Ok(()),
            // Already gone; cleanup is idempotent.
            Err(google_cloud_storage::http::Error::Response(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(MoltError::store(format!(
                "gcs delete of {:?} failed: {}",
                self.key, e
            ))),
        }
    }
}
