//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer,
    jobs::{
        manifest::{JobRecord, PageManifest},
        status::StatusReport,
    },
    pipeline::job::{WorkflowRequest, WorkflowResponse},
    prelude::*,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// The record stored for each accepted job.
    JobRecord,
    /// The manifest written after each page finishes.
    PageManifest,
    /// The body returned by the status route.
    StatusReport,
    /// A workflow request accepted by `ocr`.
    WorkflowRequest,
    /// The response printed by `ocr`.
    WorkflowResponse,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::JobRecord => schema_for!(JobRecord),
        SchemaType::PageManifest => schema_for!(PageManifest),
        SchemaType::StatusReport => schema_for!(StatusReport),
        SchemaType::WorkflowRequest => schema_for!(WorkflowRequest),
        SchemaType::WorkflowResponse => schema_for!(WorkflowResponse),
    };

    let mut wtr = create_writer(schema_opts.output_path.as_deref()).await?;
    let schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    wtr.write_all(schema_str.as_bytes())
        .await
        .context("failed to write schema")?;
    wtr.write_all(b"\n")
        .await
        .context("failed to write schema")?;
    wtr.flush().await.context("failed to flush schema")?;
    Ok(())
}
