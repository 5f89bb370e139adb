use std::path::{Path, PathBuf};

use reqwest::Response;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("response exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("empty response body")]
    Empty,

    #[error("server returned an HTML error page")]
    HtmlErrorPage,
}

/// Stream a response body to `dest`, aborting once `max_bytes` is exceeded.
///
/// Bytes land in a sibling `.part` file that is renamed into place only
/// after the whole body has been read, so `dest` never holds a partial file.
pub(crate) async fn stream_to_file(
    mut response: Response,
    dest: &Path,
    max_bytes: u64,
    reject_html: bool,
) -> Result<u64, DownloadError> {
    if let Some(len) = response.content_length() {
        if len > max_bytes {
            return Err(DownloadError::TooLarge { limit: max_bytes });
        }
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let part = part_path(dest);

    let result = async {
        let mut file = File::create(&part).await?;
        let mut written: u64 = 0;
        let mut first = true;

        while let Some(chunk) = response.chunk().await? {
            if first {
                first = false;
                if reject_html && looks_like_html_error(&chunk) {
                    return Err(DownloadError::HtmlErrorPage);
                }
            }
            written += chunk.len() as u64;
            if written > max_bytes {
                return Err(DownloadError::TooLarge { limit: max_bytes });
            }
            file.write_all(&chunk).await?;
        }

        if written == 0 {
            return Err(DownloadError::Empty);
        }
        file.flush().await?;
        Ok(written)
    }
    .await;

    match result {
        Ok(written) => {
            fs::rename(&part, dest).await?;
            Ok(written)
        }
        Err(e) => {
            let _ = fs::remove_file(&part).await;
            Err(e)
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

fn looks_like_html_error(chunk: &[u8]) -> bool {
    let head = &chunk[..chunk.len().min(200)];
    let lower = String::from_utf8_lossy(head).to_ascii_lowercase();
    let lower = lower.trim_start();
    lower.starts_with("<!doctype html") || lower.starts_with("<html")
}

/// Size of an existing non-empty regular file.
pub(crate) async fn existing_len(path: &Path) -> Option<u64> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(meta.len()),
        _ => None,
    }
}
