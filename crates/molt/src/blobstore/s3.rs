//! S3 chunk store.

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tracing::debug;

use super::{chunk_key, ChunkSink, ChunkWriter, Resource, Store};
use crate::compression::Compression;
use crate::dbtable::Name;
use crate::error::{MoltError, Result};

const DEFAULT_FLUSH_SIZE: usize = 256 << 20;

/// Static credentials embedded into `s3://` import URLs, as the target's
/// bulk loader requires.
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

pub struct S3Store {
    sink: Arc<S3Sink>,
}

struct S3Sink {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    credentials: S3Credentials,
}

struct S3Resource {
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
    credentials: S3Credentials,
}

impl S3Store {
    /// Create a store from the ambient AWS configuration.
    pub async fn new(bucket: String, prefix: String) -> Result<Self> {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let credentials = {
            use aws_credential_types::provider::ProvideCredentials;
            let provider = sdk_config.credentials_provider().ok_or_else(|| {
                MoltError::Config("no AWS credentials provider configured".to_string())
            })?;
            let creds = provider
                .provide_credentials()
                .await
                .map_err(|e| MoltError::Config(format!("cannot resolve AWS credentials: {}", e)))?;
            S3Credentials {
                access_key_id: creds.access_key_id().to_string(),
                secret_access_key: creds.secret_access_key().to_string(),
                session_token: creds.session_token().map(|t| t.to_string()),
            }
        };
        let client = aws_sdk_s3::Client::new(&sdk_config);
        Ok(Self::with_client(client, credentials, bucket, prefix))
    }

    pub fn with_client(
        client: aws_sdk_s3::Client,
        credentials: S3Credentials,
        bucket: String,
        prefix: String,
    ) -> Self {
        Self {
            sink: Arc::new(S3Sink {
                client,
                bucket,
                prefix,
                credentials,
            }),
        }
    }
}

impl S3Sink {
    fn object_key(&self, chunk: &str) -> String {
        if self.prefix.is_empty() {
            chunk.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), chunk)
        }
    }
}

#[async_trait]
impl ChunkSink for S3Sink {
    async fn put(&self, key: String, data: Vec<u8>) -> Result<Arc<dyn Resource>> {
        let object_key = self.object_key(&key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                MoltError::store(format!("s3 upload of {:?} failed: {}", object_key, e))
            })?;
        debug!(bucket = %self.bucket, key = %object_key, "uploaded chunk");
        Ok(Arc::new(S3Resource {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: object_key,
            credentials: self.credentials.clone(),
        }))
    }
}

#[async_trait]
impl Store for S3Store {
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
        // Delete everything under the prefix; chunk files are the sole
        // content there.
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .sink
                .client
                .list_objects_v2()
                .bucket(&self.sink.bucket)
                .prefix(&self.sink.prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| MoltError::store(format!("s3 list failed: {}", e)))?;
            for object in resp.contents() {
                if let Some(key) = object.key() {
                    self.sink
                        .client
                        .delete_object()
                        .bucket(&self.sink.bucket)
                        .key(key)
                        .send()
                        .await
                        .map_err(|e| {
                            MoltError::store(format!("s3 delete of {:?} failed: {}", key, e))
                        })?;
                }
            }
            if resp.is_truncated() == Some(true) {
                continuation = resp.next_continuation_token().map(|t| t.to_string());
            } else {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Resource for S3Resource {
    fn key(&self) -> &str {
        &self.key
    }

    fn import_url(&self) -> Result<String> {
        let encode = |s: &str| utf8_percent_encode(s, NON_ALPHANUMERIC).to_string();
        let mut url = format!(
            "s3://{}/{}?AWS_ACCESS_KEY_ID={}&AWS_SECRET_ACCESS_KEY={}",
            self.bucket,
            self.key,
            encode(&self.credentials.access_key_id),
            encode(&self.credentials.secret_access_key),
        );
        if let Some(token) = &self.credentials.session_token {
            url.push_str(&format!("&AWS_SESSION_TOKEN={}", encode(token)));
        }
        Ok(url)
    }

    async fn read_all(&self) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|e| MoltError::store(format!("s3 get of {:?} failed: {}", self.key, e)))?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| MoltError::store(format!("s3 read of {:?} failed: {}", self.key, e)))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn mark_for_cleanup(&self) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|e| MoltError::store(format!("s3 delete of {:?} failed: {}", self.key, e)))?;
        Ok(())
    }
}
