//! The per-page OCR pipeline.
//!
//! A run moves strictly forward through the [`Stage`]s, stopping at the
//! first failure. Whatever happens, cleanup then saves the command log,
//! uploads every `results.*` file to the job's results prefix, writes the
//! terminal manifest, and removes the run's private working directory.

use std::sync::Arc;

use chrono::Utc;
use schemars::JsonSchema;
use tempfile::TempDir;

use self::{
    commands::CommandLog,
    job::RecognitionJob,
    languages::LanguageResolver,
};
use crate::{
    jobs::manifest::{PageManifest, RunStatus, manifest_key, write_json},
    prelude::*,
    storage::{ObjectStore, join_key},
};

pub mod commands;
pub mod convert;
pub mod job;
pub mod languages;
pub mod recognize;

/// Every file whose name starts with this stem is a result artifact.
pub const RESULTS_STEM: &str = "results";

/// Name of the converted image inside a working directory.
const CONVERTED_IMAGE_NAME: &str = "source-converted.tif";

/// Where a pipeline run is, or where it stopped.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Downloading,
    VersionCheck,
    LanguageResolution,
    Converting,
    Recognizing,
    ReadingResult,
    Succeeded,
}

/// External tools used by the pipeline.
#[derive(Clone, Debug)]
pub struct Toolchain {
    /// The ImageMagick executable.
    pub magick: String,

    /// The Tesseract executable.
    pub tesseract: String,

    /// Installation prefix of the tools. When set, we record `ldd` output
    /// for everything in its `bin` and `lib` directories.
    pub home: Option<PathBuf>,
}

/// Everything shared by all pipeline runs.
pub struct PipelineEnv {
    /// Where source images come from.
    pub source: Arc<dyn ObjectStore>,

    /// Where results go.
    pub results: Arc<dyn ObjectStore>,

    /// Local tessdata cache.
    pub languages: LanguageResolver,

    /// External tools.
    pub tools: Toolchain,

    /// Directory in which each run creates its own working directory.
    pub work_root: PathBuf,

    /// Languages used when a job does not name any.
    pub default_language: String,
}

impl PipelineEnv {
    /// The languages a job should actually use.
    pub fn effective_language<'a>(&'a self, requested: &'a str) -> &'a str {
        if requested.is_empty() {
            &self.default_language
        } else {
            requested
        }
    }
}

/// The state of a single run.
struct PipelineRun<'a> {
    env: &'a PipelineEnv,
    job: &'a RecognitionJob,
    work_dir: &'a Path,
    log: CommandLog,
    stage: Stage,
}

impl PipelineRun<'_> {
    fn enter(&mut self, stage: Stage) {
        debug!(?stage, "entering stage");
        self.stage = stage;
    }

    /// Run every stage in order, returning the recognized text.
    async fn execute(&mut self) -> Result<String> {
        let env = self.env;
        let job = self.job;

        self.enter(Stage::Downloading);
        let basename = job.source_key.rsplit('/').next().unwrap_or_default();
        let source_image = self.work_dir.join(format!("source-{}", basename));
        info!(
            "downloading image: {}/{} => {}",
            env.source.describe(),
            job.source_key,
            source_image.display()
        );
        env.source
            .download(&job.source_key, &source_image)
            .await
            .context("failed to download source image")?;

        self.enter(Stage::VersionCheck);
        self.record_versions().await;

        self.enter(Stage::LanguageResolution);
        let languages = env.effective_language(&job.languages).to_owned();
        env.languages.ensure_languages(&languages).await?;

        self.enter(Stage::Converting);
        let converted_image = self.work_dir.join(CONVERTED_IMAGE_NAME);
        convert::normalize(
            &mut self.log,
            &env.tools.magick,
            &source_image,
            &converted_image,
            job.scale,
        )
        .await?;

        self.enter(Stage::Recognizing);
        let output_base = self.work_dir.join(RESULTS_STEM);
        recognize::recognize(
            &mut self.log,
            &env.tools.tesseract,
            &converted_image,
            &output_base,
            env.languages.tessdata_dir(),
            &languages,
            &job.additional_formats,
        )
        .await?;

        self.enter(Stage::ReadingResult);
        let text_path = self.work_dir.join(format!("{}.txt", RESULTS_STEM));
        let text = tokio::fs::read_to_string(&text_path)
            .await
            .with_context(|| format!("failed to read ocr results file {:?}", text_path))?;

        self.enter(Stage::Succeeded);
        Ok(text)
    }

    /// Record tool versions in the command log. Never fails.
    async fn record_versions(&mut self) {
        let env = self.env;
        let tools = &env.tools;
        for tool in [&tools.magick, &tools.tesseract] {
            if let Err(err) = self.log.run(tool, ["--version"]).await {
                warn!("could not get version of {}: {:#}", tool, err);
            }
        }

        let Some(home) = &tools.home else {
            return;
        };
        let mut files = vec![];
        for dir in ["bin", "lib"] {
            files.extend(list_files(&home.join(dir)).await);
        }
        if files.is_empty() {
            return;
        }
        if let Err(err) = self.log.run("ldd", &files).await {
            // ldd exits nonzero when any file is not a dynamic executable.
            debug!("ldd reported problems: {:#}", err);
        }
    }

    /// Save the log, upload artifacts, and write the terminal manifest.
    /// Failures here are logged, never returned.
    async fn cleanup(&self, outcome: &Result<String>) {
        let results = &self.env.results;
        let prefix = &self.job.results_prefix;

        let log_path = self.work_dir.join(format!("{}.log", RESULTS_STEM));
        if let Err(err) = self.log.save(&log_path).await {
            error!("failed to save command log: {:?}", err);
        }

        info!("uploading results");
        let artifacts = match result_files(self.work_dir).await {
            Ok(artifacts) => artifacts,
            Err(err) => {
                error!("failed to find results file(s): {:?}", err);
                return;
            }
        };
        let mut all_uploaded = true;
        for name in &artifacts {
            let key = join_key([prefix.as_str(), name.as_str()]);
            info!("uploading file: {} => {}/{}", name, results.describe(), key);
            if let Err(err) = results.upload(&self.work_dir.join(name), &key).await {
                error!("failed to upload result {}: {:?}", name, err);
                all_uploaded = false;
            }
        }
        if !all_uploaded {
            // Leave the run without a terminal marker, so it reads as
            // incomplete until resubmitted.
            warn!("not writing manifest for {} after upload failures", prefix);
            return;
        }

        let manifest = PageManifest {
            status: if outcome.is_ok() {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            },
            stage: self.stage,
            error: outcome.as_ref().err().map(|err| format!("{:#}", err)),
            artifacts,
            finished_at: Utc::now(),
        };
        if let Err(err) = write_json(results.as_ref(), &manifest_key(prefix), &manifest).await {
            error!("failed to write manifest for {}: {:?}", prefix, err);
        }
    }
}

/// Files in `dir`, sorted, ignoring anything we can't read.
async fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = vec![];
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return files;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        files.push(entry.path());
    }
    files.sort();
    files
}

/// Names of the result artifacts in `work_dir`, sorted.
async fn result_files(work_dir: &Path) -> Result<Vec<String>> {
    let stem = format!("{}.", RESULTS_STEM);
    let mut names = vec![];
    let mut entries = tokio::fs::read_dir(work_dir)
        .await
        .with_context(|| format!("failed to list {:?}", work_dir))?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(&stem) {
                names.push(name.to_owned());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Run the whole pipeline for `job` in a fresh working directory below
/// `env.work_root`, returning the recognized text.
///
/// Cleanup has always run by the time this returns, including on error.
#[instrument(level = "debug", skip_all, fields(source = %job.source_key, results = %job.results_prefix))]
pub async fn run_pipeline(env: &PipelineEnv, job: &RecognitionJob) -> Result<String> {
    tokio::fs::create_dir_all(&env.work_root)
        .await
        .with_context(|| format!("failed to create work root {:?}", env.work_root))?;
    let work_root = env.work_root.clone();
    let work_dir = tokio::task::spawn_blocking(move || {
        TempDir::with_prefix_in("ocr-", &work_root)
            .with_context(|| format!("failed to create work dir in {:?}", work_root))
    })
    .await
    .context("work dir task panicked")??;

    let mut run = PipelineRun {
        env,
        job,
        work_dir: work_dir.path(),
        log: CommandLog::new(),
        stage: Stage::Created,
    };
    let outcome = run.execute().await;
    match &outcome {
        Ok(_) => info!("pipeline succeeded for {}", job.results_prefix),
        Err(err) => warn!(
            "pipeline failed at {:?} for {}: {:#}",
            run.stage, job.results_prefix, err
        ),
    }
    run.cleanup(&outcome).await;

    match tokio::task::spawn_blocking(move || work_dir.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("failed to remove work dir: {:?}", err),
        Err(err) => warn!("work dir cleanup task panicked: {:?}", err),
    }
    outcome
}
