use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::prelude::*;

mod async_utils;
mod cmd;
mod jobs;
mod metadata;
mod notify;
mod pipeline;
mod prelude;
mod queues;
mod server;
mod storage;
#[cfg(test)]
mod test_util;

/// Run OCR over scanned pages, as a web service or one request at a time.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OCRWS_SOURCE, OCRWS_RESULTS: Source and result stores, as a directory
    or s3://bucket/prefix.
  - OCRWS_METADATA_URL: Base URL of the metadata service (serve only).
  - TESSDATA_PREFIX: Writeable directory for Tesseract language data.
  - RUST_LOG: Log filter, "info" by default.

  Standard AWS environment variables and credential files
  are used for S3 stores.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run the OCR web service.
    Serve(cmd::serve::ServeOpts),
    /// OCR a single workflow request or standalone image, and print the text.
    Ocr(cmd::ocr::OcrOpts),
    /// Print schemas for stored records and request formats.
    Schema(cmd::schema::SchemaOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main().await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Serve(serve_opts) => cmd::serve::cmd_serve(serve_opts).await?,
        Cmd::Ocr(ocr_opts) => cmd::ocr::cmd_ocr(ocr_opts).await?,
        Cmd::Schema(schema_opts) => cmd::schema::cmd_schema(schema_opts).await?,
    }
    Ok(())
}
