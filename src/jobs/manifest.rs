//! Documents we persist in the result store for each job.
//!
//! ```text
//! {key}/job.json                            JobRecord, written on acceptance
//! {key}/pages/{run}/{page}/results.*        artifacts uploaded by cleanup
//! {key}/pages/{run}/{page}/manifest.json    PageManifest, the terminal marker
//! ```
//!
//! Every accepted job gets a fresh run id, and only the run named by the
//! current record counts. Pipelines still finishing for a deleted job land
//! below their own run and are never read back.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;

use crate::{
    pipeline::Stage,
    prelude::*,
    storage::{ObjectStore, join_key},
};

/// Name of the job record below a job key.
pub const JOB_RECORD_FILE_NAME: &str = "job.json";

/// Directory holding one subdirectory per page below a job key.
pub const PAGES_DIR_NAME: &str = "pages";

/// Name of the terminal manifest written by a finished pipeline.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// The key of a job's record.
pub fn job_record_key(job_key: &str) -> String {
    join_key([job_key, JOB_RECORD_FILE_NAME])
}

/// The prefix holding every page of a job.
pub fn pages_prefix(job_key: &str) -> String {
    join_key([job_key, PAGES_DIR_NAME])
}

/// The prefix holding every page of one run of a job.
pub fn run_prefix(job_key: &str, run: &str) -> String {
    join_key([job_key, PAGES_DIR_NAME, run])
}

/// The results prefix for one page of one run of a job.
pub fn page_prefix(job_key: &str, run: &str, page_id: &str) -> String {
    join_key([run_prefix(job_key, run).as_str(), page_id])
}

/// A fresh run id.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// The key of the terminal manifest below a results prefix.
pub fn manifest_key(results_prefix: &str) -> String {
    join_key([results_prefix, MANIFEST_FILE_NAME])
}

/// One page to recognize.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PageDescriptor {
    /// The page's own identifier.
    pub pid: String,

    /// Key of the page image in the source store.
    pub filename: String,

    /// A title hint from the metadata service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Effective recognition languages for this page.
    #[serde(default)]
    pub lang: String,

    /// Key of the page's plain text in the result store.
    #[serde(default)]
    pub text_file: String,
}

/// Written to `{key}/job.json` when a job is accepted. Its presence means
/// "a pipeline has been started for this key".
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct JobRecord {
    /// The job identity.
    pub key: String,

    /// Identifies this acceptance of the job. Page results live below it.
    pub run: String,

    /// The document identifier from the request.
    pub pid: String,

    /// The unit, if one was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<u32>,

    /// The explicit page list, if one was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages_requested: Option<String>,

    /// Effective recognition languages.
    pub lang: String,

    /// Resize percentage.
    pub scale: u32,

    /// The pages we dispatched, in order.
    pub pages: Vec<PageDescriptor>,

    /// When the job was accepted.
    pub created_at: DateTime<Utc>,
}

/// How a pipeline run ended.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// The terminal marker for one pipeline run, written atomically after every
/// artifact has been uploaded.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PageManifest {
    /// Whether the run succeeded.
    pub status: RunStatus,

    /// The last stage the run reached.
    pub stage: Stage,

    /// The error which stopped the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Artifact file names uploaded next to this manifest.
    pub artifacts: Vec<String>,

    /// When cleanup finished.
    pub finished_at: DateTime<Utc>,
}

/// Read and parse a JSON document, or `None` if it does not exist.
pub async fn read_json<T>(store: &dyn ObjectStore, key: &str) -> Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
{
    let Some(data) = store.get_bytes(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse {} in {}", key, store.describe()))?;
    Ok(Some(value))
}

/// Serialize and write a JSON document atomically.
pub async fn write_json<T>(store: &dyn ObjectStore, key: &str, value: &T) -> Result<()>
where
    T: Serialize,
{
    let data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize {}", key))?;
    store.put_bytes(key, data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fs::FsStore;

    #[test]
    fn layout_keys() {
        assert_eq!(job_record_key("doc:1/3"), "doc:1/3/job.json");
        assert_eq!(pages_prefix("doc:1"), "doc:1/pages");
        assert_eq!(run_prefix("tok", "r1"), "tok/pages/r1");
        assert_eq!(page_prefix("tok", "r1", "p:7"), "tok/pages/r1/p:7");
        assert_eq!(manifest_key("tok/pages/r1/p:7"), "tok/pages/r1/p:7/manifest.json");
    }

    #[test]
    fn run_ids_are_unique_key_segments() {
        let (a, b) = (new_run_id(), new_run_id());
        assert_ne!(a, b);
        assert!(!a.contains('/'));
    }

    #[tokio::test]
    async fn manifests_survive_the_store() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("manifest")?;
        let store = FsStore::new(tmpdir.path().to_owned());
        let manifest = PageManifest {
            status: RunStatus::Failed,
            stage: Stage::Recognizing,
            error: Some("failed to ocr converted image".to_owned()),
            artifacts: vec!["results.log".to_owned()],
            finished_at: Utc::now(),
        };
        write_json(&store, "j/pages/p/manifest.json", &manifest).await?;

        let read: Option<PageManifest> = read_json(&store, "j/pages/p/manifest.json").await?;
        assert_eq!(read, Some(manifest));
        let raw = std::fs::read(tmpdir.path().join("j/pages/p/manifest.json"))?;
        let json: serde_json::Value = serde_json::from_slice(&raw)?;
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "recognizing");

        let missing: Option<PageManifest> = read_json(&store, "j/pages/q/manifest.json").await?;
        assert!(missing.is_none());
        Ok(())
    }
}
