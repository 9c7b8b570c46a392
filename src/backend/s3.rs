//! S3 object-store backend
//!
//! Keeps the artifact as a single object under
//! `<prefix>/.clipshare/current.clip`. Change detection for the watcher is
//! a HEAD request returning the object ETag, which is far cheaper than the
//! full read the shared-folder variant needs. Concurrent writers are not
//! serialized server-side; the engine's last-writer-wins policy reconciles
//! them, and the recorded ETag only feeds the cheap change probe.

use std::sync::Mutex;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{Backend, BackendError, BackendKind};
use crate::artifact;
use crate::clipboard::ClipboardItem;

/// Object key suffix under the optional prefix
pub const OBJECT_KEY: &str = ".clipshare/current.clip";

#[derive(Default)]
struct S3State {
    bucket: String,
    prefix: String,
    region: String,
    client: Option<Client>,
    last_etag: Option<String>,
}

/// Backend over an S3 bucket
pub struct S3Backend {
    state: Mutex<S3State>,
}

impl S3Backend {
    /// Create an S3 backend for the given bucket, key prefix, and region.
    /// The client itself is built during `init` from the ambient AWS
    /// credential chain.
    pub fn new(bucket: &str, prefix: &str, region: &str) -> Self {
        Self {
            state: Mutex::new(S3State {
                bucket: bucket.to_string(),
                prefix: prefix.trim_end_matches('/').to_string(),
                region: region.to_string(),
                client: None,
                last_etag: None,
            }),
        }
    }

    fn object_key(&self) -> String {
        let state = self.state.lock().unwrap();
        if state.prefix.is_empty() {
            OBJECT_KEY.to_string()
        } else {
            format!("{}/{OBJECT_KEY}", state.prefix)
        }
    }

    fn client_and_bucket(&self) -> Result<(Client, String), BackendError> {
        let state = self.state.lock().unwrap();
        match (&state.client, state.bucket.is_empty()) {
            (Some(client), false) => Ok((client.clone(), state.bucket.clone())),
            _ => Err(BackendError::NotConfigured),
        }
    }

    fn record_etag(&self, etag: Option<&str>) {
        if let Some(etag) = etag {
            let trimmed = etag.trim_matches('"').to_string();
            self.state.lock().unwrap().last_etag = Some(trimmed);
        }
    }

    async fn head(
        &self,
    ) -> Result<aws_sdk_s3::operation::head_object::HeadObjectOutput, BackendError> {
        let (client, bucket) = self.client_and_bucket()?;
        client
            .head_object()
            .bucket(bucket)
            .key(self.object_key())
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_not_found() {
                    BackendError::NotFound
                } else {
                    BackendError::Transport(service.to_string())
                }
            })
    }
}

#[async_trait]
impl Backend for S3Backend {
    async fn init(&self) -> Result<(), BackendError> {
        let (bucket, region) = {
            let state = self.state.lock().unwrap();
            if state.bucket.is_empty() {
                return Err(BackendError::NotConfigured);
            }
            (state.bucket.clone(), state.region.clone())
        };

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if !region.is_empty() {
            loader = loader.region(aws_config::Region::new(region));
        }
        let shared = loader.load().await;
        let client = Client::new(&shared);

        client
            .head_bucket()
            .bucket(&bucket)
            .send()
            .await
            .map_err(|e| {
                BackendError::Transport(format!(
                    "failed to access bucket {bucket}: {}",
                    e.into_service_error()
                ))
            })?;

        self.state.lock().unwrap().client = Some(client);
        debug!(bucket, "s3 backend initialized");
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.state.lock().unwrap().client = None;
        Ok(())
    }

    async fn write(&self, item: &ClipboardItem) -> Result<(), BackendError> {
        let (client, bucket) = self.client_and_bucket()?;
        let data = artifact::encode(item)?;

        let output = client
            .put_object()
            .bucket(bucket)
            .key(self.object_key())
            .body(ByteStream::from(data))
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.into_service_error().to_string()))?;

        self.record_etag(output.e_tag());
        Ok(())
    }

    async fn read(&self) -> Result<Option<ClipboardItem>, BackendError> {
        let (client, bucket) = self.client_and_bucket()?;

        let output = match client
            .get_object()
            .bucket(bucket)
            .key(self.object_key())
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    return Ok(None);
                }
                return Err(BackendError::Transport(service.to_string()));
            }
        };

        self.record_etag(output.e_tag());

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?
            .into_bytes();

        Ok(Some(artifact::decode(&bytes)?))
    }

    async fn mod_time(&self) -> Result<DateTime<Utc>, BackendError> {
        let output = self.head().await?;
        self.record_etag(output.e_tag());

        let modified = output.last_modified().ok_or(BackendError::NotFound)?;
        let millis = modified
            .to_millis()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| BackendError::Transport("modification time out of range".to_string()))
    }

    // The ETag is opaque but stable per content, which is all the watcher
    // needs from a cheap digest.
    async fn checksum(&self) -> Result<String, BackendError> {
        let output = self.head().await?;
        match output.e_tag() {
            Some(etag) => {
                let etag = etag.trim_matches('"').to_string();
                self.state.lock().unwrap().last_etag = Some(etag.clone());
                Ok(etag)
            }
            None => Err(BackendError::NotFound),
        }
    }

    async fn exists(&self) -> bool {
        self.head().await.is_ok()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    fn location(&self) -> String {
        let state = self.state.lock().unwrap();
        if state.bucket.is_empty() {
            String::new()
        } else if state.prefix.is_empty() {
            format!("s3://{}", state.bucket)
        } else {
            format!("s3://{}/{}", state.bucket, state.prefix)
        }
    }

    /// Accepts `s3://bucket[/prefix]` or `bucket[/prefix]`
    fn set_location(&self, location: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if location.is_empty() {
            state.bucket.clear();
            state.prefix.clear();
            return Ok(());
        }

        let stripped = location.strip_prefix("s3://").unwrap_or(location);
        let (bucket, prefix) = match stripped.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_end_matches('/')),
            None => (stripped, ""),
        };

        if bucket.is_empty() {
            return Err(BackendError::InvalidLocation(
                "bucket name required".to_string(),
            ));
        }

        state.bucket = bucket.to_string();
        state.prefix = prefix.to_string();
        Ok(())
    }
}
