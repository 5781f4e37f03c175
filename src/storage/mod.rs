//! Object storage for source images and job results.
//!
//! Both the source images and the result artifacts live in "object stores":
//! flat namespaces of `/`-separated keys. In production these are S3 buckets,
//! but a plain directory works the same way and is what the tests use.

use std::{fmt, str::FromStr, sync::Arc};

use crate::prelude::*;

pub mod fs;
pub mod s3;

/// Interface to an object store.
///
/// Keys are always relative, `/`-separated, and never start with `/`.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// A human-readable description of where this store lives, for logs.
    fn describe(&self) -> String;

    /// Download `key` into the local file `dest`, returning the byte count.
    async fn download(&self, key: &str, dest: &Path) -> Result<u64>;

    /// Upload the local file `src` to `key`.
    async fn upload(&self, src: &Path, key: &str) -> Result<()>;

    /// Write `data` to `key` as a single atomic object write. Readers see
    /// either the old object (or nothing) or the complete new one.
    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Read `key`, or return `None` if it does not exist.
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Does `key` exist?
    async fn exists(&self, key: &str) -> Result<bool>;

    /// List every key below `prefix`, in sorted order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key below `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

/// Join key segments with `/`, ignoring empty segments and stray slashes.
pub fn join_key<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Where an object store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A local (or mounted) directory.
    Dir(PathBuf),
    /// An S3 bucket, with an optional key prefix.
    S3 { bucket: String, prefix: String },
}

impl StoreLocation {
    /// Open the store at this location.
    pub async fn open(&self) -> Result<Arc<dyn ObjectStore>> {
        match self {
            StoreLocation::Dir(root) => Ok(Arc::new(fs::FsStore::new(root.clone()))),
            StoreLocation::S3 { bucket, prefix } => Ok(Arc::new(
                s3::S3Store::new(bucket.clone(), prefix.clone()).await?,
            )),
        }
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLocation::Dir(path) => write!(f, "{}", path.display()),
            StoreLocation::S3 { bucket, prefix } if prefix.is_empty() => {
                write!(f, "s3://{}", bucket)
            }
            StoreLocation::S3 { bucket, prefix } => write!(f, "s3://{}/{}", bucket, prefix),
        }
    }
}

impl FromStr for StoreLocation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("s3://") {
            let mut parts = rest.splitn(2, '/');
            let bucket = parts.next().unwrap_or_default();
            if bucket.is_empty() {
                bail!("Missing bucket name in store location: {:?}", s);
            }
            let prefix = join_key(parts.next());
            Ok(StoreLocation::S3 {
                bucket: bucket.to_owned(),
                prefix,
            })
        } else if s.is_empty() {
            Err(anyhow!("Empty store location"))
        } else {
            Ok(StoreLocation::Dir(PathBuf::from(s)))
        }
    }
}
