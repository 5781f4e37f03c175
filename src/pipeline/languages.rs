//! Making sure Tesseract has every language and script file it needs.
//!
//! Tesseract reads `{tessdata}/{code}.traineddata` for every code in its `-l`
//! argument, plus `osd` for orientation and script detection. Some languages
//! are written in more than one script and only recognize well when both
//! variants are loaded, so we expand requests using [`LANGUAGE_PAIRS`].
//!
//! Missing files are downloaded on first use and then cached in the tessdata
//! directory for every later pipeline run.

use std::sync::Arc;

use crate::{prelude::*, storage::fs::write_atomically};

/// Orientation and script detection data, always required.
pub const OSD_LANGUAGE: &str = "osd";

/// Languages whose data files only work together. Lookups go both ways.
pub static LANGUAGE_PAIRS: &[(&str, &str)] = &[("aze", "aze_cyrl"), ("uzb", "uzb_cyrl")];

/// Default URL template for downloading tessdata files.
pub const DEFAULT_TESSDATA_URL_TEMPLATE: &str =
    "https://github.com/tesseract-ocr/tessdata_{flavor}/raw/{branch}/{subdir}{code}.traineddata";

/// Find the companion of `code` in [`LANGUAGE_PAIRS`], if it has one.
pub fn paired_language(code: &str) -> Option<&'static str> {
    LANGUAGE_PAIRS.iter().find_map(|&(a, b)| {
        if a == code {
            Some(b)
        } else if b == code {
            Some(a)
        } else {
            None
        }
    })
}

/// Is `code` something we're willing to turn into a file name and URL?
fn is_valid_code(code: &str) -> bool {
    !code.is_empty()
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Check a `+`-joined language string supplied by a caller.
pub fn validate_language_string(languages: &str) -> Result<()> {
    for code in languages.split('+').filter(|code| !code.is_empty()) {
        if !is_valid_code(code) {
            bail!("invalid language code: {:?}", code);
        }
    }
    Ok(())
}

/// Expand a `+`-joined language string into every data file code needed,
/// starting with [`OSD_LANGUAGE`]. The result has no duplicates.
pub fn expand_languages(requested: &str) -> Vec<String> {
    let mut all = vec![OSD_LANGUAGE.to_owned()];
    let mut push = |code: &str| {
        if !all.iter().any(|existing| existing == code) {
            all.push(code.to_owned());
        }
    };
    for code in requested.split('+').filter(|code| !code.is_empty()) {
        push(code);
        if let Some(pair) = paired_language(code) {
            push(pair);
        }
    }
    all
}

/// Where to download tessdata files from.
#[derive(Clone, Debug)]
pub struct TessdataSource {
    /// A URL with `{flavor}`, `{branch}`, `{subdir}` and `{code}` placeholders.
    pub url_template: String,

    /// Which model flavor to use: `fast`, `best` or plain.
    pub flavor: String,

    /// Which branch or tag of the tessdata repository to use.
    pub branch: String,
}

impl Default for TessdataSource {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_TESSDATA_URL_TEMPLATE.to_owned(),
            flavor: "fast".to_owned(),
            branch: "4.0.0".to_owned(),
        }
    }
}

impl TessdataSource {
    /// Render the template for `code`, below `subdir`.
    fn render(&self, subdir: &str, code: &str) -> String {
        self.url_template
            .replace("{flavor}", &self.flavor)
            .replace("{branch}", &self.branch)
            .replace("{subdir}", subdir)
            .replace("{code}", code)
    }

    /// URL of the data file for a language.
    pub fn language_url(&self, code: &str) -> String {
        self.render("", code)
    }

    /// URL of the data file for a script.
    pub fn script_url(&self, code: &str) -> String {
        self.render("script/", code)
    }
}

/// Downloads a data file to a local path.
#[async_trait]
pub trait LanguageFetcher: Send + Sync + 'static {
    /// Fetch `url` into `dest`. `dest` must not be visible until complete.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// A [`LanguageFetcher`] using plain HTTP GET.
pub struct HttpLanguageFetcher {
    client: reqwest::Client,
}

impl HttpLanguageFetcher {
    /// Create a new fetcher.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LanguageFetcher for HttpLanguageFetcher {
    #[instrument(level = "debug", skip_all, fields(url = %url))]
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        info!("downloading file: [{}]", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to request language file: [{}]", url))?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            bail!("failed to download language file: [{}] ({})", url, status);
        }
        let data = response
            .bytes()
            .await
            .with_context(|| format!("failed to read language file: [{}]", url))?;
        // Two pipelines may fetch the same file at once. Each renames a
        // complete file into place, so neither can load a truncated one.
        write_atomically(dest, data.to_vec()).await
    }
}

/// Resolves requested languages to data files in a local tessdata directory.
#[derive(Clone)]
pub struct LanguageResolver {
    tessdata_dir: PathBuf,
    source: TessdataSource,
    fetcher: Arc<dyn LanguageFetcher>,
}

impl LanguageResolver {
    /// Create a new resolver caching files in `tessdata_dir`.
    pub fn new(
        tessdata_dir: PathBuf,
        source: TessdataSource,
        fetcher: Arc<dyn LanguageFetcher>,
    ) -> Self {
        Self {
            tessdata_dir,
            source,
            fetcher,
        }
    }

    /// The directory Tesseract should load data files from.
    pub fn tessdata_dir(&self) -> &Path {
        &self.tessdata_dir
    }

    /// The local path of the data file for `code`.
    pub fn data_file(&self, code: &str) -> PathBuf {
        self.tessdata_dir.join(format!("{}.traineddata", code))
    }

    /// Copy bundled data files into the tessdata directory, skipping any
    /// that are already present. Returns the number of files copied.
    #[instrument(level = "debug", skip_all, fields(bundled = %bundled.display()))]
    pub async fn seed_from(&self, bundled: &Path) -> Result<usize> {
        tokio::fs::create_dir_all(&self.tessdata_dir)
            .await
            .with_context(|| format!("failed to create {:?}", self.tessdata_dir))?;
        let mut entries = tokio::fs::read_dir(bundled)
            .await
            .with_context(|| format!("failed to read bundled tessdata {:?}", bundled))?;
        let mut copied = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let dest = self.tessdata_dir.join(entry.file_name());
            if tokio::fs::try_exists(&dest).await? {
                continue;
            }
            tokio::fs::copy(entry.path(), &dest)
                .await
                .with_context(|| format!("failed to copy {:?}", entry.path()))?;
            copied += 1;
        }
        info!("seeded {} bundled tessdata files into {:?}", copied, self.tessdata_dir);
        Ok(copied)
    }

    /// Make sure every data file needed for `requested` exists locally,
    /// downloading missing ones. Returns the expanded list of codes.
    ///
    /// Any file that cannot be fetched as either a language or a script is
    /// fatal.
    #[instrument(level = "debug", skip(self))]
    pub async fn ensure_languages(&self, requested: &str) -> Result<Vec<String>> {
        validate_language_string(requested)?;
        let codes = expand_languages(requested);
        tokio::fs::create_dir_all(&self.tessdata_dir)
            .await
            .with_context(|| format!("failed to create {:?}", self.tessdata_dir))?;

        for code in &codes {
            let data_file = self.data_file(code);
            if tokio::fs::try_exists(&data_file).await? {
                continue;
            }

            // Try it as a language first, then as a script.
            let language_url = self.source.language_url(code);
            let language_err = match self.fetcher.fetch(&language_url, &data_file).await {
                Ok(()) => continue,
                Err(err) => err,
            };
            debug!("{} is not a language file: {:?}", code, language_err);

            let script_url = self.source.script_url(code);
            self.fetcher
                .fetch(&script_url, &data_file)
                .await
                .with_context(|| format!("could not fetch tessdata for {:?}", code))?;
        }
        Ok(codes)
    }
}
