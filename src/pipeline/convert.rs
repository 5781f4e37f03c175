//! Normalizing source images with ImageMagick before recognition.

use super::commands::CommandLog;
use crate::prelude::*;

/// Build the `magick` arguments that turn the first frame of `source` into a
/// grayscale, uncompressed TIFF, resampled to `scale_percent` on both axes.
pub fn normalize_args(source: &Path, dest: &Path, scale_percent: u32) -> Vec<String> {
    vec![
        "convert".to_owned(),
        "-units".to_owned(),
        "PixelsPerInch".to_owned(),
        "-type".to_owned(),
        "Grayscale".to_owned(),
        "+compress".to_owned(),
        "+repage".to_owned(),
        format!("{}[0]", source.display()),
        "-filter".to_owned(),
        "Lanczos".to_owned(),
        "-resize".to_owned(),
        format!("{}%", scale_percent),
        dest.display().to_string(),
    ]
}

/// Run `magick` to normalize `source` into `dest`.
#[instrument(level = "debug", skip(log))]
pub async fn normalize(
    log: &mut CommandLog,
    magick: &str,
    source: &Path,
    dest: &Path,
    scale_percent: u32,
) -> Result<()> {
    info!("converting image...");
    log.run(magick, normalize_args(source, dest, scale_percent))
        .await
        .context("failed to convert source image")?;
    Ok(())
}
