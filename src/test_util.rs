//! Helpers shared by unit tests.
//!
//! The pipeline shells out to `magick` and `tesseract`. Tests replace them
//! with tiny shell scripts, so they run anywhere `/bin/sh` does.

use std::{os::unix::fs::PermissionsExt as _, sync::Arc};

use tempfile::TempDir;

use crate::{
    pipeline::{
        PipelineEnv, Toolchain,
        languages::{LanguageFetcher, LanguageResolver, TessdataSource},
    },
    prelude::*,
    storage::{ObjectStore as _, fs::FsStore},
};

/// Write an executable `/bin/sh` script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))
        .with_context(|| format!("cannot write script {:?}", path))?;
    let mut perms = std::fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms)?;
    Ok(path)
}

/// A fake `magick` that copies `{src}[0]` to the destination (last argument).
pub fn fake_magick(dir: &Path) -> Result<PathBuf> {
    write_script(
        dir,
        "magick",
        r#"if [ "$1" = "--version" ]; then echo "Version: ImageMagick 7 (fake)"; exit 0; fi
for arg; do last="$arg"; done
for arg; do case "$arg" in *"[0]") src="${arg%\[0\]}";; esac; done
cp "$src" "$last""#,
    )
}

/// A fake `tesseract` writing `text` into `{base}.txt`, and one file per
/// extra format argument after `txt`.
pub fn fake_tesseract(dir: &Path, text: &str) -> Result<PathBuf> {
    slow_tesseract(dir, text, 0)
}

/// Like [`fake_tesseract`], but sleeps `secs` seconds before recognizing.
pub fn slow_tesseract(dir: &Path, text: &str, secs: u32) -> Result<PathBuf> {
    write_script(
        dir,
        "tesseract",
        &format!(
            r#"if [ "$1" = "--version" ]; then echo "tesseract 5 (fake)"; exit 0; fi
sleep {secs}
base="$2"
echo "{text}" > "$base.txt"
seen_txt=0
for arg; do
  if [ "$seen_txt" = 1 ]; then echo "<$arg/>" > "$base.$arg"; fi
  if [ "$arg" = "txt" ]; then seen_txt=1; fi
done"#
        ),
    )
}

/// A fake `tesseract` that fails recognition but reports its version.
pub fn failing_tesseract(dir: &Path) -> Result<PathBuf> {
    write_script(
        dir,
        "tesseract",
        r#"if [ "$1" = "--version" ]; then echo "tesseract 5 (fake)"; exit 0; fi
echo "Error opening data file" >&2
exit 1"#,
    )
}

/// A [`LanguageFetcher`] for tests which must never touch the network.
pub struct OfflineFetcher;

#[async_trait]
impl LanguageFetcher for OfflineFetcher {
    async fn fetch(&self, url: &str, _dest: &Path) -> Result<()> {
        Err(anyhow!("offline: refusing to download [{}]", url))
    }
}

/// A complete pipeline environment inside one temporary directory: fake
/// tools, a tessdata directory holding `osd` and `eng`, and filesystem
/// stores for sources and results.
pub struct TestEnv {
    pub tmpdir: TempDir,
    pub source: Arc<FsStore>,
    pub results: Arc<FsStore>,
    pub env: Arc<PipelineEnv>,
}

impl TestEnv {
    /// Build an environment whose `tesseract` recognizes `text`.
    pub fn new(text: &str) -> Result<Self> {
        let tmpdir = TempDir::with_prefix("page-ocr")?;
        let bin = tmpdir.path().join("bin");
        std::fs::create_dir_all(&bin)?;
        fake_tesseract(&bin, text)?;
        Self::with_bin(tmpdir, bin)
    }

    /// Build an environment whose `tesseract` takes a second per page.
    pub fn slow(text: &str) -> Result<Self> {
        let tmpdir = TempDir::with_prefix("page-ocr")?;
        let bin = tmpdir.path().join("bin");
        std::fs::create_dir_all(&bin)?;
        slow_tesseract(&bin, text, 1)?;
        Self::with_bin(tmpdir, bin)
    }

    /// Build an environment whose `tesseract` always fails.
    pub fn failing() -> Result<Self> {
        let tmpdir = TempDir::with_prefix("page-ocr")?;
        let bin = tmpdir.path().join("bin");
        std::fs::create_dir_all(&bin)?;
        failing_tesseract(&bin)?;
        Self::with_bin(tmpdir, bin)
    }

    fn with_bin(tmpdir: TempDir, bin: PathBuf) -> Result<Self> {
        let magick = fake_magick(&bin)?;
        let tessdata = tmpdir.path().join("tessdata");
        std::fs::create_dir_all(&tessdata)?;
        std::fs::write(tessdata.join("osd.traineddata"), b"osd")?;
        std::fs::write(tessdata.join("eng.traineddata"), b"eng")?;

        let source = Arc::new(FsStore::new(tmpdir.path().join("source")));
        let results = Arc::new(FsStore::new(tmpdir.path().join("results")));
        let env = Arc::new(PipelineEnv {
            source: source.clone(),
            results: results.clone(),
            languages: LanguageResolver::new(
                tessdata,
                TessdataSource::default(),
                Arc::new(OfflineFetcher),
            ),
            tools: Toolchain {
                magick: path_str(&magick)?,
                tesseract: path_str(&bin.join("tesseract"))?,
                home: None,
            },
            work_root: tmpdir.path().join("work"),
            default_language: "eng".to_owned(),
        });
        Ok(Self {
            tmpdir,
            source,
            results,
            env,
        })
    }

    /// Put a source image into the source store.
    pub async fn add_source(&self, key: &str) -> Result<()> {
        self.source
            .put_bytes(key, format!("image {}", key).into_bytes())
            .await
    }

    /// Number of entries left in the pipeline work root.
    pub fn leftover_work_dirs(&self) -> usize {
        std::fs::read_dir(&self.env.work_root)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(|s| s.to_owned())
        .ok_or_else(|| anyhow!("non-UTF-8 path {:?}", path))
}
