//! Job status, results and deletion, all derived from what's in the store.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;

use crate::{
    jobs::manifest::{
        JobRecord, PageManifest, RunStatus, job_record_key, manifest_key, page_prefix,
        pages_prefix, read_json,
    },
    pipeline::{RESULTS_STEM, Stage},
    prelude::*,
    storage::ObjectStore,
};

/// The state of a job, as seen by callers.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// No such job.
    Unknown,
    /// At least one page has not finished.
    InProgress,
    /// Every page finished, and at least one failed.
    Failed,
    /// Every page succeeded.
    Complete,
}

impl JobState {
    /// Will this state never change again (short of deletion)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Failed | JobState::Complete)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Unknown => "unknown",
            JobState::InProgress => "in_progress",
            JobState::Failed => "failed",
            JobState::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Why one page failed.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PageFailure {
    pub pid: String,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The status of a job.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct StatusReport {
    /// The job key.
    pub key: String,

    /// Overall state.
    pub status: JobState,

    /// Pages in the job.
    pub total_pages: usize,

    /// Pages which finished successfully.
    pub completed_pages: usize,

    /// Pages which finished with an error.
    pub failed_pages: usize,

    /// Details of each failed page.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<PageFailure>,

    /// When the job was accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl StatusReport {
    fn unknown(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            status: JobState::Unknown,
            total_pages: 0,
            completed_pages: 0,
            failed_pages: 0,
            failures: vec![],
            created_at: None,
        }
    }
}

/// Load the job record for `key`, if any.
pub async fn load_record(store: &dyn ObjectStore, key: &str) -> Result<Option<JobRecord>> {
    read_json(store, &job_record_key(key)).await
}

/// Work out the status of the job at `key`.
#[instrument(level = "debug", skip(store))]
pub async fn job_status(store: &dyn ObjectStore, key: &str) -> Result<StatusReport> {
    match load_record(store, key).await? {
        Some(record) => run_status(store, &record).await,
        None => Ok(StatusReport::unknown(key)),
    }
}

/// Work out the status of the run named by `record`. Manifests left by
/// other runs of the same key are ignored.
async fn run_status(store: &dyn ObjectStore, record: &JobRecord) -> Result<StatusReport> {
    let mut report = StatusReport::unknown(&record.key);
    report.total_pages = record.pages.len();
    report.created_at = Some(record.created_at);
    let mut unfinished = 0;
    for page in &record.pages {
        let manifest_key = manifest_key(&page_prefix(&record.key, &record.run, &page.pid));
        match read_json::<PageManifest>(store, &manifest_key).await? {
            None => unfinished += 1,
            Some(manifest) if manifest.status == RunStatus::Succeeded => {
                report.completed_pages += 1;
            }
            Some(manifest) => {
                report.failed_pages += 1;
                report.failures.push(PageFailure {
                    pid: page.pid.clone(),
                    stage: manifest.stage,
                    error: manifest.error,
                });
            }
        }
    }

    report.status = if unfinished > 0 {
        JobState::InProgress
    } else if report.failed_pages > 0 {
        JobState::Failed
    } else {
        JobState::Complete
    };
    Ok(report)
}

/// The result of asking for a job's text.
#[derive(Debug, PartialEq)]
pub enum Fetched {
    /// The text of every page, in page order.
    Text(String),
    /// The job has no text to give, because of its state.
    NotReady(JobState),
}

/// Fetch the text of a complete job.
#[instrument(level = "debug", skip(store))]
pub async fn fetch_text(store: &dyn ObjectStore, key: &str) -> Result<Fetched> {
    let Some(record) = load_record(store, key).await? else {
        return Ok(Fetched::NotReady(JobState::Unknown));
    };
    let report = run_status(store, &record).await?;
    if report.status != JobState::Complete {
        return Ok(Fetched::NotReady(report.status));
    }

    let mut text = String::new();
    for page in &record.pages {
        let text_key = if page.text_file.is_empty() {
            format!(
                "{}/{}.txt",
                page_prefix(key, &record.run, &page.pid),
                RESULTS_STEM
            )
        } else {
            page.text_file.clone()
        };
        let data = store
            .get_bytes(&text_key)
            .await?
            .ok_or_else(|| anyhow!("complete job {} is missing {}", key, text_key))?;
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&String::from_utf8_lossy(&data));
    }
    Ok(Fetched::Text(text))
}

/// Delete the job at `key`. Returns `false` if there was no such job.
///
/// Only the job record and its pages are removed. Unit jobs stored below a
/// document's key are separate jobs and are left alone.
#[instrument(level = "debug", skip(store))]
pub async fn delete_job(store: &dyn ObjectStore, key: &str) -> Result<bool> {
    let record_key = job_record_key(key);
    if !store.exists(&record_key).await? {
        return Ok(false);
    }
    let removed = store.delete_prefix(&pages_prefix(key)).await?;
    store.delete(&record_key).await?;
    info!("deleted job {} ({} artifacts)", key, removed);
    Ok(true)
}
