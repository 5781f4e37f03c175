//! Running Tesseract against a normalized image.

use std::{fmt, str::FromStr};

use schemars::JsonSchema;

use super::commands::CommandLog;
use crate::prelude::*;

/// An output format Tesseract can write next to its plain text.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Plain text. Always produced.
    Txt,
    /// Positional markup.
    Hocr,
    /// Searchable PDF.
    Pdf,
    /// ALTO XML.
    Alto,
    /// Tab-separated word boxes.
    Tsv,
}

impl OutputFormat {
    /// The Tesseract config name, which is also the file extension.
    pub fn name(self) -> &'static str {
        match self {
            OutputFormat::Txt => "txt",
            OutputFormat::Hocr => "hocr",
            OutputFormat::Pdf => "pdf",
            OutputFormat::Alto => "alto",
            OutputFormat::Tsv => "tsv",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "txt" => Ok(OutputFormat::Txt),
            "hocr" => Ok(OutputFormat::Hocr),
            "pdf" => Ok(OutputFormat::Pdf),
            "alto" => Ok(OutputFormat::Alto),
            "tsv" => Ok(OutputFormat::Tsv),
            _ => Err(anyhow!("unknown output format: {:?}", s)),
        }
    }
}

/// Build the `tesseract` arguments. Plain text comes first and is never
/// repeated, even if `additional` asks for it.
pub fn recognize_args(
    image: &Path,
    output_base: &Path,
    tessdata_dir: &Path,
    languages: &str,
    additional: &[OutputFormat],
) -> Vec<String> {
    let mut args = vec![
        image.display().to_string(),
        output_base.display().to_string(),
        "--tessdata-dir".to_owned(),
        tessdata_dir.display().to_string(),
        "--psm".to_owned(),
        "1".to_owned(),
        "-l".to_owned(),
        languages.to_owned(),
        OutputFormat::Txt.name().to_owned(),
    ];
    for format in additional {
        if *format != OutputFormat::Txt && !args.iter().any(|a| a == format.name()) {
            args.push(format.name().to_owned());
        }
    }
    args
}

/// Run `tesseract`, writing one `{output_base}.{ext}` file per format.
#[instrument(level = "debug", skip(log))]
pub async fn recognize(
    log: &mut CommandLog,
    tesseract: &str,
    image: &Path,
    output_base: &Path,
    tessdata_dir: &Path,
    languages: &str,
    additional: &[OutputFormat],
) -> Result<()> {
    info!("ocring image...");
    let args = recognize_args(image, output_base, tessdata_dir, languages, additional);
    log.run(tesseract, args)
        .await
        .context("failed to ocr converted image")?;
    Ok(())
}
