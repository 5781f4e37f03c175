//! The `ocr` subcommand, which runs a single recognition request in the
//! foreground.

use clap::Args;

use super::PipelineOpts;
use crate::{
    async_utils::io::{read_json_input, write_json_output},
    pipeline::{
        job::{InvocationRequest, RecognitionJob, WorkflowResponse},
        run_pipeline,
    },
    prelude::*,
    storage::StoreLocation,
};

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// A JSON workflow request, or an object-created event for the
    /// standalone area. Defaults to standard input.
    #[clap(value_name = "REQUEST")]
    pub input_path: Option<PathBuf>,

    /// Where to write the `{"text": ...}` response. Defaults to standard
    /// output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    #[command(flatten)]
    pub pipeline: PipelineOpts,
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(opts: &OcrOpts) -> Result<()> {
    let request: InvocationRequest = read_json_input(opts.input_path.as_deref()).await?;
    let job = RecognitionJob::from_invocation(&request, opts.pipeline.default_scale)?;

    // Requests which name a bucket read from, and write back to, that bucket
    // unless we were told otherwise.
    let bucket_location = job.source_bucket.as_ref().map(|bucket| StoreLocation::S3 {
        bucket: bucket.clone(),
        prefix: String::new(),
    });
    let source = opts
        .pipeline
        .source
        .clone()
        .or_else(|| bucket_location.clone())
        .ok_or_else(|| anyhow!("request names no bucket, and no --source was given"))?;
    let results = opts
        .pipeline
        .results
        .clone()
        .or(bucket_location)
        .ok_or_else(|| anyhow!("request names no bucket, and no --results was given"))?;

    let env = opts.pipeline.build_env(&source, &results).await?;
    let text = run_pipeline(&env, &job).await?;
    write_json_output(opts.output_path.as_deref(), &WorkflowResponse { text }).await
}
