//! S3 buckets used as object stores.

use aws_config::BehaviorVersion;
use aws_sdk_s3::{Client, primitives::ByteStream};
use tokio::{fs::File, io::BufWriter};

use super::{ObjectStore, join_key};
use crate::prelude::*;

/// Object store backed by an S3 bucket, optionally below a key prefix.
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Store {
    /// Create a new store, loading AWS credentials and region using the
    /// standard environment variables and config files.
    pub async fn new(bucket: String, prefix: String) -> Result<Self> {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let client = Client::new(&config);
        Ok(Self {
            client,
            bucket,
            prefix,
        })
    }

    /// The full S3 key for a store-relative key.
    fn full_key(&self, key: &str) -> String {
        join_key([self.prefix.as_str(), key])
    }

    /// The store-relative key for a full S3 key.
    fn relative_key<'a>(&self, full_key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            full_key
        } else {
            full_key
                .strip_prefix(self.prefix.as_str())
                .map(|rest| rest.trim_start_matches('/'))
                .unwrap_or(full_key)
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn describe(&self) -> String {
        format!("s3://{}", join_key([self.bucket.as_str(), self.prefix.as_str()]))
    }

    #[instrument(level = "debug", skip_all, fields(key = %key))]
    async fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        let full_key = self.full_key(key);
        info!("downloading image: s3://{}/{} => {}", self.bucket, full_key, dest.display());
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .with_context(|| format!("failed to download s3://{}/{}", self.bucket, full_key))?;
        let file = File::create(dest)
            .await
            .with_context(|| format!("failed to create local file {:?}", dest))?;
        let mut writer = BufWriter::new(file);
        let reader = response.body.into_async_read();
        tokio::pin!(reader);
        let bytes = tokio::io::copy(&mut reader, &mut writer)
            .await
            .with_context(|| format!("failed to write {:?}", dest))?;
        tokio::io::AsyncWriteExt::flush(&mut writer)
            .await
            .with_context(|| format!("failed to flush {:?}", dest))?;
        Ok(bytes)
    }

    #[instrument(level = "debug", skip_all, fields(key = %key))]
    async fn upload(&self, src: &Path, key: &str) -> Result<()> {
        let full_key = self.full_key(key);
        info!("uploading file: {} => s3://{}/{}", src.display(), self.bucket, full_key);
        let body = ByteStream::from_path(src)
            .await
            .with_context(|| format!("failed to open results file {:?}", src))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("failed to upload s3://{}/{}", self.bucket, full_key))?;
        Ok(())
    }

    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<()> {
        // A single PUT is atomic in S3.
        let full_key = self.full_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|| format!("failed to write s3://{}/{}", self.bucket, full_key))?;
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let full_key = self.full_key(key);
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Ok(None);
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read s3://{}/{}", self.bucket, full_key)
                });
            }
        };
        let data = response
            .body
            .collect()
            .await
            .with_context(|| format!("failed to read body of s3://{}/{}", self.bucket, full_key))?
            .into_bytes()
            .to_vec();
        Ok(Some(data))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) => Err(err)
                .with_context(|| format!("failed to check s3://{}/{}", self.bucket, full_key)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut full_prefix = self.full_key(prefix);
        if !full_prefix.is_empty() {
            full_prefix.push('/');
        }
        let mut keys = vec![];
        let mut continuation_token = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .with_context(|| {
                    format!("failed to list s3://{}/{}", self.bucket, full_prefix)
                })?;
            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .map(|key| self.relative_key(key).to_owned()),
            );
            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_owned());
                }
                _ => break,
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .with_context(|| format!("failed to delete s3://{}/{}", self.bucket, full_key))?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(keys.len())
    }
}
