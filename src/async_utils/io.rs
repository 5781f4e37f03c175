//! Reading command input and writing command output, from files or standard
//! I/O.

use tokio::{
    fs::File,
    io::{AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
};

use crate::prelude::*;

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Read a JSON document from a file, or from stdin if `path` is `None`.
pub async fn read_json_input<T>(path: Option<&Path>) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let mut data = String::new();
    let description = match path {
        Some(path) => {
            File::open(path)
                .await
                .with_context(|| format!("Failed to open file at path: {:?}", path))?
                .read_to_string(&mut data)
                .await
                .with_context(|| format!("Failed to read file at path: {:?}", path))?;
            path.display().to_string()
        }
        None => {
            tokio::io::stdin()
                .read_to_string(&mut data)
                .await
                .context("Failed to read standard input")?;
            "standard input".to_owned()
        }
    };
    serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse JSON from {}", description))
}

/// Write `value` as pretty JSON, followed by a newline, to a file or stdout.
pub async fn write_json_output<T>(path: Option<&Path>, value: &T) -> Result<()>
where
    T: Serialize,
{
    let mut wtr = create_writer(path).await?;
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    wtr.write_all(json.as_bytes())
        .await
        .context("Failed to write JSON to output")?;
    wtr.write_all(b"\n")
        .await
        .context("Failed to write JSON to output")?;
    wtr.flush().await.context("Failed to flush output")?;
    Ok(())
}
