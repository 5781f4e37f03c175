//! Accepting OCR requests and handing their pages to the worker pool.
//!
//! [`Dispatcher::handle`] does only cheap work before returning: it resolves
//! the job key, checks for an existing job, asks the metadata service for
//! pages, and writes the job record. Recognition happens later, in a feeder
//! task which submits each page to the bounded pipeline pool.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::FutureExt as _;

use crate::{
    async_utils::{JoinWorker, spawn_logged},
    jobs::{
        identity::{IdentityError, OcrRequest, check_existing, resolve_identity, resolve_options},
        manifest::{
            JobRecord, job_record_key, new_run_id, page_prefix, run_prefix, write_json,
        },
        status::{JobState, job_status, load_record},
    },
    metadata::PageSource,
    notify::Notifier,
    pipeline::{PipelineEnv, RESULTS_STEM, job::RecognitionJob, run_pipeline},
    prelude::*,
    queues::work::{WorkFn, WorkQueue, WorkQueueHandle},
    storage::ObjectStore,
};

/// Handle for submitting pipeline runs to the pool.
pub type PipelineQueueHandle = WorkQueueHandle<RecognitionJob, String>;

/// Start a pool running at most `jobs` pipelines at once.
pub fn start_pipeline_pool(
    env: Arc<PipelineEnv>,
    jobs: usize,
) -> (WorkQueue<RecognitionJob, String>, JoinWorker) {
    info!("starting pipeline pool with {} workers", jobs);
    let work_fn: WorkFn<RecognitionJob, String> = Arc::new(move |job| {
        let env = env.clone();
        async move { run_pipeline(&env, &job).await }.boxed()
    });
    WorkQueue::new(jobs, work_fn)
}

/// Why a request was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Request(#[from] IdentityError),

    #[error("Metadata service error: {0:#}")]
    Metadata(anyhow::Error),

    #[error("No pages found for this PID")]
    NoPages,

    #[error("Result store unavailable: {0:#}")]
    Store(anyhow::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// What happened to an accepted request.
#[derive(Clone, Debug, PartialEq)]
pub enum Dispatched {
    /// A new job was started.
    Started { key: String, pages: usize },
    /// A job with this key already exists.
    Existing { key: String },
}

/// Accepts requests and starts jobs.
#[derive(Clone)]
pub struct Dispatcher {
    results: Arc<dyn ObjectStore>,
    page_source: Arc<dyn PageSource>,
    notifier: Arc<dyn Notifier>,
    queue: PipelineQueueHandle,
    default_language: String,
    default_scale: u32,
    poll_interval: Duration,
    monitor_timeout: Duration,
}

impl Dispatcher {
    /// Create a new dispatcher.
    pub fn new(
        results: Arc<dyn ObjectStore>,
        page_source: Arc<dyn PageSource>,
        notifier: Arc<dyn Notifier>,
        queue: PipelineQueueHandle,
        default_language: String,
        default_scale: u32,
    ) -> Self {
        Self {
            results,
            page_source,
            notifier,
            queue,
            default_language,
            default_scale,
            poll_interval: Duration::from_secs(10),
            monitor_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Change how often we check on existing jobs before notifying.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Change how long we watch an existing job before giving up and
    /// notifying with whatever state it is in.
    pub fn with_monitor_timeout(mut self, monitor_timeout: Duration) -> Self {
        self.monitor_timeout = monitor_timeout;
        self
    }

    /// The result store.
    pub fn results(&self) -> &dyn ObjectStore {
        self.results.as_ref()
    }

    /// Accept a request. Never waits for recognition.
    #[instrument(level = "debug", skip_all, fields(pid = %req.pid))]
    pub async fn handle(&self, req: &OcrRequest) -> Result<Dispatched, DispatchError> {
        let identity = resolve_identity(req)?;
        let scale = resolve_options(req, self.default_scale)?;
        let key = identity.key.clone();

        let existing = check_existing(self.results(), &key)
            .await
            .map_err(DispatchError::Store)?;
        if existing {
            info!("Request already in progress or completed: {}", key);
            if let Some(address) = req.email() {
                self.spawn_monitor(key.clone(), address.to_owned());
            }
            return Ok(Dispatched::Existing { key });
        }

        let mut pages = self
            .page_source
            .get_pages(&identity.pid, identity.unit, identity.pages.as_deref())
            .await
            .map_err(DispatchError::Metadata)?;
        if pages.is_empty() {
            info!("No pages found for {}", key);
            return Err(DispatchError::NoPages);
        }

        match self.page_source.get_text_hint(&identity.pid).await {
            Ok(Some(text)) => debug!("existing text for {}:\n\n{}\n", identity.pid, text),
            Ok(None) => {}
            Err(err) => warn!("could not get existing text for {}: {:#}", identity.pid, err),
        }

        let lang = if req.lang().is_empty() {
            self.default_language.clone()
        } else {
            req.lang().to_owned()
        };
        let run = new_run_id();
        for page in &mut pages {
            page.lang = lang.clone();
            page.text_file = format!(
                "{}/{}.txt",
                page_prefix(&key, &run, &page.pid),
                RESULTS_STEM
            );
        }

        let record = JobRecord {
            key: key.clone(),
            run,
            pid: identity.pid.clone(),
            unit: identity.unit,
            pages_requested: identity.pages.clone(),
            lang,
            scale,
            pages,
            created_at: Utc::now(),
        };
        write_json(self.results(), &job_record_key(&key), &record).await?;

        let page_count = record.pages.len();
        let this = self.clone();
        let email = req.email().map(|s| s.to_owned());
        spawn_logged("feed_pages", async move { this.feed_pages(record, email).await });

        info!("accepted job {} with {} pages", key, page_count);
        Ok(Dispatched::Started {
            key,
            pages: page_count,
        })
    }

    /// Submit every page of `record` to the pool, wait for them all, then
    /// notify if anyone asked.
    #[instrument(level = "debug", skip_all, fields(key = %record.key))]
    async fn feed_pages(self, record: JobRecord, email: Option<String>) -> Result<()> {
        let mut receivers = Vec::with_capacity(record.pages.len());
        for page in &record.pages {
            if !self.is_current_run(&record).await? {
                info!(
                    "job {} was deleted or replaced, not submitting more pages",
                    record.key
                );
                break;
            }
            let job = RecognitionJob::for_page(
                page_prefix(&record.key, &record.run, &page.pid),
                &page.filename,
                &page.lang,
                record.scale,
            );
            receivers.push((page.pid.clone(), self.queue.submit(job).await?));
        }

        let mut failed = 0;
        for (pid, rx) in receivers {
            match rx.await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    failed += 1;
                    warn!("page {} of {} failed: {:#}", pid, record.key, err);
                }
                Err(_) => {
                    failed += 1;
                    warn!("page {} of {} was dropped by the pool", pid, record.key);
                }
            }
        }
        info!(
            "job {} finished: {} pages, {} failed",
            record.key,
            record.pages.len(),
            failed
        );

        // Pages still in the pool when the job was deleted wrote their
        // results anyway. Nothing reads them now.
        if !self.is_current_run(&record).await? {
            let removed = self
                .results()
                .delete_prefix(&run_prefix(&record.key, &record.run))
                .await?;
            info!(
                "removed {} artifacts left by a stale run of {}",
                removed, record.key
            );
            return Ok(());
        }

        if let Some(address) = email {
            let report = job_status(self.results(), &record.key).await?;
            self.notifier
                .notify(&address, &record.key, report.status)
                .await?;
        }
        Ok(())
    }

    /// Does the stored record for this job still name our run?
    async fn is_current_run(&self, record: &JobRecord) -> Result<bool> {
        let current = load_record(self.results(), &record.key).await?;
        Ok(current.is_some_and(|current| current.run == record.run))
    }

    /// Watch an existing job until it finishes, then notify `address`.
    ///
    /// Holds only the store and notifier, never the pool.
    fn spawn_monitor(&self, key: String, address: String) {
        let results = self.results.clone();
        let notifier = self.notifier.clone();
        let poll_interval = self.poll_interval;
        let monitor_timeout = self.monitor_timeout;
        spawn_logged("monitor_job", async move {
            let status =
                wait_for_terminal(results.as_ref(), &key, poll_interval, monitor_timeout)
                    .await?;
            notifier.notify(&address, &key, status).await
        });
    }
}

/// Poll the status of `key` until it stops changing, or until `timeout`
/// has passed. Either way, returns the last status seen.
async fn wait_for_terminal(
    store: &dyn ObjectStore,
    key: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<JobState> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let report = job_status(store, key).await?;
        if report.status.is_terminal() || report.status == JobState::Unknown {
            return Ok(report.status);
        }
        if tokio::time::Instant::now() + poll_interval > deadline {
            warn!(
                "gave up waiting for job {} after {:?}, still {}",
                key, timeout, report.status
            );
            return Ok(report.status);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        jobs::{manifest::PageDescriptor, status::delete_job},
        storage::join_key,
        test_util::TestEnv,
    };

    /// Serves a fixed page list, and counts calls.
    pub(crate) struct FakePageSource {
        pub pages: Vec<PageDescriptor>,
        pub calls: Mutex<usize>,
    }

    impl FakePageSource {
        pub(crate) fn new(pids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                pages: pids
                    .iter()
                    .map(|pid| PageDescriptor {
                        pid: pid.to_string(),
                        filename: format!("images/{}.tif", pid),
                        title: None,
                        lang: String::new(),
                        text_file: String::new(),
                    })
                    .collect(),
                calls: Mutex::new(0),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            *self.calls.lock().expect("lock poisoned")
        }
    }

    #[async_trait]
    impl PageSource for FakePageSource {
        async fn get_pages(
            &self,
            _pid: &str,
            _unit: Option<u32>,
            _pages: Option<&str>,
        ) -> Result<Vec<PageDescriptor>> {
            *self.calls.lock().expect("lock poisoned") += 1;
            Ok(self.pages.clone())
        }

        async fn get_text_hint(&self, _pid: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    /// Records every notification.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub sent: Mutex<Vec<(String, String, JobState)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, address: &str, key: &str, status: JobState) -> Result<()> {
            self.sent.lock().expect("lock poisoned").push((
                address.to_owned(),
                key.to_owned(),
                status,
            ));
            Ok(())
        }
    }

    /// A dispatcher over a [`TestEnv`], plus its pool worker.
    pub(crate) struct TestDispatcher {
        pub test: TestEnv,
        pub pages: Arc<FakePageSource>,
        pub notifier: Arc<RecordingNotifier>,
        pub dispatcher: Dispatcher,
        pub worker: JoinWorker,
    }

    impl TestDispatcher {
        pub(crate) async fn new(test: TestEnv, pids: &[&str]) -> Result<Self> {
            for pid in pids {
                test.add_source(&format!("images/{}.tif", pid)).await?;
            }
            let pages = FakePageSource::new(pids);
            let notifier = Arc::new(RecordingNotifier::default());
            let (queue, worker) = start_pipeline_pool(test.env.clone(), 2);
            let dispatcher = Dispatcher::new(
                test.results.clone(),
                pages.clone(),
                notifier.clone(),
                queue.handle(),
                "eng".to_owned(),
                100,
            )
            .with_poll_interval(Duration::from_millis(20));
            Ok(Self {
                test,
                pages,
                notifier,
                dispatcher,
                worker,
            })
        }

        /// Poll until `key` is terminal.
        pub(crate) async fn wait(&self, key: &str) -> Result<JobState> {
            tokio::time::timeout(
                Duration::from_secs(20),
                wait_for_terminal(
                    self.test.results.as_ref(),
                    key,
                    Duration::from_millis(20),
                    Duration::from_secs(20),
                ),
            )
            .await
            .context("job did not finish")?
        }
    }

    fn request(pid: &str) -> OcrRequest {
        OcrRequest {
            pid: pid.to_owned(),
            ..OcrRequest::default()
        }
    }

    #[tokio::test]
    async fn jobs_run_every_page_and_notify() -> Result<()> {
        let t = TestDispatcher::new(TestEnv::new("page text")?, &["p1", "p2", "p3"]).await?;
        let mut req = request("doc");
        req.email = Some("reader@example.com".to_owned());

        let dispatched = t.dispatcher.handle(&req).await?;
        assert_eq!(
            dispatched,
            Dispatched::Started {
                key: "doc".to_owned(),
                pages: 3
            }
        );
        assert_eq!(t.wait("doc").await?, JobState::Complete);

        // The feeder notifies after the last page's manifest is written.
        tokio::time::timeout(Duration::from_secs(5), async {
            while t.notifier.sent.lock().expect("lock poisoned").is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        assert_eq!(
            t.notifier.sent.lock().expect("lock poisoned")[0],
            (
                "reader@example.com".to_owned(),
                "doc".to_owned(),
                JobState::Complete
            )
        );
        assert_eq!(t.test.leftover_work_dirs(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_requests_attach_to_the_existing_job() -> Result<()> {
        let t = TestDispatcher::new(TestEnv::new("text")?, &["p1"]).await?;
        let req = request("doc");

        assert!(matches!(
            t.dispatcher.handle(&req).await?,
            Dispatched::Started { .. }
        ));
        assert_eq!(
            t.dispatcher.handle(&req).await?,
            Dispatched::Existing {
                key: "doc".to_owned()
            }
        );
        assert_eq!(t.pages.calls(), 1);
        t.wait("doc").await?;
        Ok(())
    }

    #[tokio::test]
    async fn missing_token_is_rejected_before_the_store_is_touched() -> Result<()> {
        let t = TestDispatcher::new(TestEnv::new("text")?, &["p1"]).await?;
        let mut req = request("doc");
        req.pages = Some("p1".to_owned());

        let err = t.dispatcher.handle(&req).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Request(IdentityError::MissingToken)
        ));
        assert_eq!(t.pages.calls(), 0);
        assert!(t.test.results.list("").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn documents_without_pages_are_not_found() -> Result<()> {
        let t = TestDispatcher::new(TestEnv::new("text")?, &[]).await?;
        let err = t.dispatcher.handle(&request("doc")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoPages));
        assert!(t.test.results.list("").await?.is_empty());
        assert!(!t.test.env.work_root.exists());
        Ok(())
    }

    #[tokio::test]
    async fn deleted_jobs_can_be_resubmitted() -> Result<()> {
        let t = TestDispatcher::new(TestEnv::new("text")?, &["p1"]).await?;
        let req = request("doc");
        t.dispatcher.handle(&req).await?;
        assert_eq!(t.wait("doc").await?, JobState::Complete);

        assert!(delete_job(t.test.results.as_ref(), "doc").await?);
        assert_eq!(
            job_status(t.test.results.as_ref(), "doc").await?.status,
            JobState::Unknown
        );

        assert!(matches!(
            t.dispatcher.handle(&req).await?,
            Dispatched::Started { .. }
        ));
        assert_eq!(t.pages.calls(), 2);
        assert_eq!(t.wait("doc").await?, JobState::Complete);
        Ok(())
    }

    #[tokio::test]
    async fn failed_pages_fail_the_job() -> Result<()> {
        let t = TestDispatcher::new(TestEnv::failing()?, &["p1", "p2"]).await?;
        t.dispatcher.handle(&request("doc")).await?;
        assert_eq!(t.wait("doc").await?, JobState::Failed);
        let record = load_record(t.test.results.as_ref(), "doc")
            .await?
            .context("job record missing")?;
        let log = join_key([page_prefix("doc", &record.run, "p1").as_str(), "results.log"]);
        assert!(t.test.results.exists(&log).await?);
        Ok(())
    }

    #[tokio::test]
    async fn deleting_a_running_job_discards_its_late_results() -> Result<()> {
        let t = TestDispatcher::new(TestEnv::slow("text")?, &["p1", "p2", "p3"]).await?;
        let req = request("doc");
        t.dispatcher.handle(&req).await?;
        let stale = load_record(t.test.results.as_ref(), "doc")
            .await?
            .context("job record missing")?;

        // Pages are still recognizing when the job goes away.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(delete_job(t.test.results.as_ref(), "doc").await?);
        assert_eq!(
            job_status(t.test.results.as_ref(), "doc").await?.status,
            JobState::Unknown
        );

        assert!(matches!(
            t.dispatcher.handle(&req).await?,
            Dispatched::Started { pages: 3, .. }
        ));
        let current = load_record(t.test.results.as_ref(), "doc")
            .await?
            .context("job record missing")?;
        assert_ne!(current.run, stale.run);
        assert_eq!(
            job_status(t.test.results.as_ref(), "doc").await?.status,
            JobState::InProgress
        );
        assert_eq!(t.wait("doc").await?, JobState::Complete);

        // Once its pool work drains, the stale run's feeder cleans up after
        // itself and leaves the current run alone.
        let stale_prefix = run_prefix("doc", &stale.run);
        tokio::time::timeout(Duration::from_secs(20), async {
            while !t.test.results.list(&stale_prefix).await?.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            anyhow::Ok(())
        })
        .await
        .context("stale run was never cleaned up")??;
        let current_prefix = run_prefix("doc", &current.run);
        let keys = t.test.results.list("doc/pages").await?;
        assert!(!keys.is_empty());
        assert!(keys.iter().all(|key| key.starts_with(&current_prefix)));
        assert_eq!(
            job_status(t.test.results.as_ref(), "doc").await?.status,
            JobState::Complete
        );
        Ok(())
    }

    #[tokio::test]
    async fn monitors_give_up_after_their_deadline() -> Result<()> {
        let t = TestDispatcher::new(TestEnv::new("text")?, &["p1"]).await?;
        let dispatcher = t
            .dispatcher
            .clone()
            .with_monitor_timeout(Duration::from_millis(100));

        // A job whose only page never reports back.
        let record = JobRecord {
            key: "doc".to_owned(),
            run: new_run_id(),
            pid: "doc".to_owned(),
            unit: None,
            pages_requested: None,
            lang: "eng".to_owned(),
            scale: 100,
            pages: t.pages.pages.clone(),
            created_at: Utc::now(),
        };
        write_json(t.test.results.as_ref(), &job_record_key("doc"), &record).await?;

        let mut req = request("doc");
        req.email = Some("reader@example.com".to_owned());
        assert_eq!(
            dispatcher.handle(&req).await?,
            Dispatched::Existing {
                key: "doc".to_owned()
            }
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while t.notifier.sent.lock().expect("lock poisoned").is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .context("monitor never gave up")?;
        assert_eq!(
            t.notifier.sent.lock().expect("lock poisoned")[0],
            (
                "reader@example.com".to_owned(),
                "doc".to_owned(),
                JobState::InProgress
            )
        );
        assert_eq!(t.pages.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn pool_drains_before_shutdown() -> Result<()> {
        let t = TestDispatcher::new(TestEnv::new("text")?, &["p1", "p2"]).await?;
        t.dispatcher.handle(&request("doc")).await?;
        let TestDispatcher {
            test,
            dispatcher,
            worker,
            ..
        } = t;
        // The feeder holds its own clone of the dispatcher, so the pool stays
        // open until every page has been submitted and finished.
        drop(dispatcher);
        tokio::time::timeout(Duration::from_secs(20), worker.join()).await??;
        assert_eq!(
            job_status(test.results.as_ref(), "doc").await?.status,
            JobState::Complete
        );
        Ok(())
    }
}
