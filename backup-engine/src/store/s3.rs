//! S3 object storage backend.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::StorageClass;
use aws_sdk_s3::Client;
use bytes::Bytes;

use super::{ObjectStore, StoreError};

/// S3-backed [`ObjectStore`], bound to a single bucket.
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Connect using the default AWS credential/region chain.
    ///
    /// `endpoint_url` switches to a custom S3-compatible server (minio and
    /// friends), which also needs path-style addressing.
    pub async fn connect(bucket: impl Into<String>, endpoint_url: Option<&str>) -> Self {
        let sdk_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let client = match endpoint_url {
            Some(endpoint) => Client::from_conf(
                aws_sdk_s3::config::Builder::from(&sdk_config)
                    .endpoint_url(endpoint)
                    .force_path_style(true)
                    .build(),
            ),
            None => Client::new(&sdk_config),
        };
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Validate a storage class name, for use as a clap value parser.
pub fn parse_storage_class(value: &str) -> Result<StorageClass, String> {
    StorageClass::try_parse(value).map_err(|e| e.to_string())
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        storage_class: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data));
        if let Some(class) = storage_class {
            let class = StorageClass::try_parse(class)
                .map_err(|e| StoreError::Request(format!("storage class {class:?}: {e}")))?;
            request = request.storage_class(class);
        }
        request
            .send()
            .await
            .map_err(|e| StoreError::Request(format!("put {key}: {}", DisplayErrorContext(&e))))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::Request(format!("get {key}: {}", DisplayErrorContext(&e)))
                }
            })?;
        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Request(format!("read body of {key}: {e}")))?;
        Ok(data.into_bytes())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| {
                    StoreError::Request(format!("list {prefix}: {}", DisplayErrorContext(&e)))
                })?;
            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            match response.next_continuation_token() {
                Some(next) if response.is_truncated() == Some(true) => {
                    token = Some(next.to_string());
                }
                _ => break,
            }
        }
        Ok(keys)
    }
}
