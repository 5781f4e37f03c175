//! Command-line entry points.

use std::sync::Arc;

use clap::Args;

use crate::{
    pipeline::{
        PipelineEnv, Toolchain,
        languages::{
            DEFAULT_TESSDATA_URL_TEMPLATE, HttpLanguageFetcher, LanguageResolver,
            TessdataSource, validate_language_string,
        },
    },
    prelude::*,
    storage::StoreLocation,
};

pub mod ocr;
pub mod schema;
pub mod serve;

/// Options shared by every subcommand that runs the recognition pipeline.
#[derive(Debug, Clone, Args)]
pub struct PipelineOpts {
    /// Where source images are read from: a directory, or
    /// `s3://bucket/prefix`.
    #[clap(long, env = "OCRWS_SOURCE")]
    pub source: Option<StoreLocation>,

    /// Where results are written: a directory, or `s3://bucket/prefix`.
    #[clap(long, env = "OCRWS_RESULTS")]
    pub results: Option<StoreLocation>,

    /// Directory in which each run gets its own working directory.
    /// Defaults to the system temporary directory.
    #[clap(long, env = "OCRWS_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Writeable directory holding Tesseract language data.
    #[clap(long, env = "TESSDATA_PREFIX", default_value = "/tmp/tessdata")]
    pub tessdata_dir: PathBuf,

    /// Language data files to copy into `--tessdata-dir` at startup.
    #[clap(long, env = "OCRWS_BUNDLED_TESSDATA")]
    pub bundled_tessdata: Option<PathBuf>,

    /// URL template for downloading missing language data.
    #[clap(long, default_value = DEFAULT_TESSDATA_URL_TEMPLATE)]
    pub tessdata_url_template: String,

    /// Language data flavor: `fast`, `best`, or empty for the plain models.
    #[clap(long, default_value = "fast")]
    pub tessdata_flavor: String,

    /// Branch or tag of the language data repository.
    #[clap(long, default_value = "4.0.0")]
    pub tessdata_branch: String,

    /// The ImageMagick executable.
    #[clap(long, default_value = "magick")]
    pub magick: String,

    /// The Tesseract executable.
    #[clap(long, default_value = "tesseract")]
    pub tesseract: String,

    /// Installation prefix of the OCR tools. Enables recording library
    /// versions of everything below it.
    #[clap(long)]
    pub tool_home: Option<PathBuf>,

    /// Languages used when a request does not name any.
    #[clap(long, default_value = "eng")]
    pub default_language: String,

    /// Resize percentage used when a request does not give one.
    #[clap(long, default_value = "100")]
    pub default_scale: u32,
}

impl PipelineOpts {
    /// Build a pipeline environment reading from `source` and writing to
    /// `results`, with any bundled language data seeded into place.
    #[instrument(level = "debug", skip_all, fields(source = %source, results = %results))]
    pub async fn build_env(
        &self,
        source: &StoreLocation,
        results: &StoreLocation,
    ) -> Result<PipelineEnv> {
        validate_language_string(&self.default_language)
            .context("invalid --default-language")?;
        if !(1..=1000).contains(&self.default_scale) {
            bail!("--default-scale must be between 1 and 1000");
        }

        let tessdata = TessdataSource {
            url_template: self.tessdata_url_template.clone(),
            flavor: self.tessdata_flavor.clone(),
            branch: self.tessdata_branch.clone(),
        };
        let fetcher = Arc::new(HttpLanguageFetcher::new(reqwest::Client::new()));
        let languages = LanguageResolver::new(self.tessdata_dir.clone(), tessdata, fetcher);
        if let Some(bundled) = &self.bundled_tessdata {
            let copied = languages.seed_from(bundled).await?;
            info!(
                "copied {} bundled language files into {}",
                copied,
                self.tessdata_dir.display()
            );
        }

        let work_root = self
            .work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("page-ocr"));
        info!(
            "source: {}, results: {}, work dir: {}",
            source,
            results,
            work_root.display()
        );

        Ok(PipelineEnv {
            source: source.open().await?,
            results: results.open().await?,
            languages,
            tools: Toolchain {
                magick: self.magick.clone(),
                tesseract: self.tesseract.clone(),
                home: self.tool_home.clone(),
            },
            work_root,
            default_language: self.default_language.clone(),
        })
    }
}
