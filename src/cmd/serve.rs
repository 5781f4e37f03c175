//! The `serve` subcommand.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::Args;

use super::PipelineOpts;
use crate::{
    jobs::dispatcher::{Dispatcher, start_pipeline_pool},
    metadata::HttpPageSource,
    notify::{LogNotifier, Notifier, WebhookNotifier},
    prelude::*,
    server::{AppState, router, serve},
};

/// Serve command line arguments.
#[derive(Debug, Args)]
pub struct ServeOpts {
    /// Address to listen on.
    #[clap(long, env = "OCRWS_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Base URL of the metadata service which lists a document's pages.
    #[clap(long, env = "OCRWS_METADATA_URL")]
    pub metadata_url: String,

    /// Max number of pages to recognize at a time. Defaults to the number
    /// of CPUs.
    #[clap(short = 'j', long = "jobs")]
    pub job_count: Option<usize>,

    /// Webhook which receives `{address, key, status}` when a job that
    /// asked for notification finishes. If absent, notifications are only
    /// logged.
    #[clap(long, env = "OCRWS_NOTIFY_URL")]
    pub notify_url: Option<String>,

    /// Seconds between status checks when watching an existing job for a
    /// notification.
    #[clap(long, env = "OCRWS_POLL_INTERVAL", default_value_t = 10)]
    pub poll_interval: u64,

    /// Seconds to watch an existing job before notifying with whatever
    /// state it is in.
    #[clap(long, env = "OCRWS_MONITOR_TIMEOUT", default_value_t = 24 * 60 * 60)]
    pub monitor_timeout: u64,

    #[command(flatten)]
    pub pipeline: PipelineOpts,
}

/// The `serve` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_serve(opts: &ServeOpts) -> Result<()> {
    let source = opts
        .pipeline
        .source
        .as_ref()
        .ok_or_else(|| anyhow!("--source or OCRWS_SOURCE is required"))?;
    let results = opts
        .pipeline
        .results
        .as_ref()
        .ok_or_else(|| anyhow!("--results or OCRWS_RESULTS is required"))?;
    let env = Arc::new(opts.pipeline.build_env(source, results).await?);
    let results_store = env.results.clone();

    let client = reqwest::Client::new();
    let page_source = Arc::new(HttpPageSource::new(client.clone(), &opts.metadata_url));
    let notifier: Arc<dyn Notifier> = match &opts.notify_url {
        Some(url) => Arc::new(WebhookNotifier::new(client, url)),
        None => Arc::new(LogNotifier),
    };

    let job_count = opts.job_count.unwrap_or_else(num_cpus::get).max(1);
    let (queue, worker) = start_pipeline_pool(env, job_count);
    let dispatcher = Dispatcher::new(
        results_store,
        page_source,
        notifier,
        queue.handle(),
        opts.pipeline.default_language.clone(),
        opts.pipeline.default_scale,
    )
    .with_poll_interval(Duration::from_secs(opts.poll_interval.max(1)))
    .with_monitor_timeout(Duration::from_secs(opts.monitor_timeout));
    let app = router(AppState::new(dispatcher));

    serve(opts.listen, app).await?;

    // Let pages already in the pool finish before we exit.
    drop(queue);
    info!("waiting for running pages to finish");
    worker.join().await?;
    Ok(())
}
