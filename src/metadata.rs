//! Client for the metadata service which knows what pages a document has.

use std::{collections::HashSet, time::Duration};

use crate::{jobs::manifest::PageDescriptor, prelude::*};

/// Interface to the metadata service.
#[async_trait]
pub trait PageSource: Send + Sync + 'static {
    /// List the pages of `pid`, optionally restricted to a unit or to an
    /// explicit page list. Pages without an identifier are dropped.
    async fn get_pages(
        &self,
        pid: &str,
        unit: Option<u32>,
        pages: Option<&str>,
    ) -> Result<Vec<PageDescriptor>>;

    /// Fetch any existing text for `pid`.
    async fn get_text_hint(&self, pid: &str) -> Result<Option<String>>;
}

/// A page as returned by the metadata service. Any field may be missing.
#[derive(Debug, Deserialize)]
struct PageEntry {
    #[serde(default)]
    pid: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

/// Keep only the entries we can recognize. A pid names one results prefix,
/// so only its first entry is kept.
fn usable_pages(entries: Vec<PageEntry>) -> Vec<PageDescriptor> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter_map(|entry| match (entry.pid, entry.filename) {
            (Some(pid), Some(_)) if seen.contains(&pid) => {
                warn!("skipping repeated page {}", pid);
                None
            }
            (Some(pid), Some(filename)) if !pid.is_empty() && !filename.is_empty() => {
                seen.insert(pid.clone());
                Some(PageDescriptor {
                    pid,
                    filename,
                    title: entry.title.filter(|title| !title.is_empty()),
                    lang: String::new(),
                    text_file: String::new(),
                })
            }
            (pid, filename) => {
                warn!(
                    "skipping page with missing pid or filename: pid={:?} filename={:?}",
                    pid, filename
                );
                None
            }
        })
        .collect()
}

/// A [`PageSource`] talking JSON over HTTP.
pub struct HttpPageSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPageSource {
    /// Create a client for the service at `base_url`.
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    fn url(&self, path: &str, pid: &str) -> String {
        format!("{}/{}/{}", self.base_url, path, urlencoding::encode(pid))
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    #[instrument(level = "debug", skip(self))]
    async fn get_pages(
        &self,
        pid: &str,
        unit: Option<u32>,
        pages: Option<&str>,
    ) -> Result<Vec<PageDescriptor>> {
        let mut query = vec![];
        if let Some(unit) = unit {
            query.push(("unit", unit.to_string()));
        }
        if let Some(pages) = pages {
            query.push(("pages", pages.to_owned()));
        }
        let url = self.url("pages", pid);
        let response = self
            .client
            .get(&url)
            .query(&query)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .with_context(|| format!("failed to request pages from {}", url))?
            .error_for_status()
            .with_context(|| format!("metadata service refused {}", url))?;
        let entries = response
            .json::<Vec<PageEntry>>()
            .await
            .with_context(|| format!("failed to parse pages from {}", url))?;
        let pages = usable_pages(entries);
        info!(
            "{} pids: [{}]",
            pages.len(),
            pages
                .iter()
                .map(|p| p.pid.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        );
        Ok(pages)
    }

    #[instrument(level = "debug", skip(self))]
    async fn get_text_hint(&self, pid: &str) -> Result<Option<String>> {
        let url = self.url("text", pid);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .with_context(|| format!("failed to request text from {}", url))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response
            .error_for_status()
            .with_context(|| format!("metadata service refused {}", url))?
            .text()
            .await
            .with_context(|| format!("failed to read text from {}", url))?;
        Ok(Some(text).filter(|text| !text.is_empty()))
    }
}
