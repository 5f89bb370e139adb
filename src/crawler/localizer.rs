use std::path::PathBuf;
use std::sync::Arc;

use reqwest::Client;
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::download::{existing_len, stream_to_file, DownloadError};
use super::throttle::Throttle;
use crate::config::Config;
use crate::error::Result;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "bmp", "ico"];
const MAX_STEM_CHARS: usize = 60;

#[derive(Debug, Error)]
pub enum LocalizeError {
    #[error("unsupported resource url: {0}")]
    InvalidUrl(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    Status(u16),

    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// Mirrors embedded resources under `<root>/<article id>/`.
pub struct ResourceLocalizer {
    client: Client,
    root: PathBuf,
    url_prefix: String,
    max_bytes: u64,
    force_refresh: bool,
    throttle: Arc<Throttle>,
}

impl ResourceLocalizer {
    pub fn new(config: &Config, throttle: Arc<Throttle>, force_refresh: bool) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            root: config.images_dir(),
            url_prefix: config.images_url_prefix.trim_end_matches('/').to_string(),
            max_bytes: config.max_image_bytes,
            force_refresh,
            throttle,
        })
    }

    /// Download `remote_url` for an article and return the local reference.
    ///
    /// The file name depends only on the URL, so repeated runs land on the
    /// same path and an existing non-empty file is reused.
    pub async fn localize(
        &self,
        article_id: u64,
        remote_url: &str,
    ) -> std::result::Result<String, LocalizeError> {
        let url = Url::parse(remote_url)
            .map_err(|_| LocalizeError::InvalidUrl(remote_url.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LocalizeError::InvalidUrl(remote_url.to_string()));
        }

        let filename = local_filename(&url);
        let dest = self.root.join(article_id.to_string()).join(&filename);
        let local_ref = format!("{}/{}/{}", self.url_prefix, article_id, filename);

        if !self.force_refresh && existing_len(&dest).await.is_some() {
            debug!(kb = article_id, file = %filename, "Image already on disk");
            return Ok(local_ref);
        }

        self.throttle.wait().await;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(LocalizeError::Status(response.status().as_u16()));
        }

        let size = stream_to_file(response, &dest, self.max_bytes, false).await?;
        debug!(kb = article_id, file = %filename, size, "Image saved");
        Ok(local_ref)
    }
}

/// `<sanitized stem>-<8 hex of BLAKE3(url)>.<ext>`
fn local_filename(url: &Url) -> String {
    let last = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    let last = urlencoding::decode(last)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| last.to_string());

    let (stem, ext) = match last.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), ext.to_ascii_lowercase()),
        None => (last.clone(), String::new()),
    };
    let ext = if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        ext
    } else {
        "bin".to_string()
    };

    let mut stem: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(MAX_STEM_CHARS)
        .collect();
    if stem.trim_matches('_').is_empty() {
        stem = "image".to_string();
    }

    let digest = blake3::hash(url.as_str().as_bytes()).to_hex();
    format!("{}-{}.{}", stem, &digest[..8], ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localizer(server_dir: &std::path::Path, force_refresh: bool) -> ResourceLocalizer {
        let config = Config {
            static_root: server_dir.to_string_lossy().to_string(),
            delay_min_ms: 0,
            delay_max_ms: 0,
            requests_per_second: 1000,
            max_image_bytes: 1024,
            ..Config::default()
        };
        let throttle = Arc::new(Throttle::from_config(&config));
        ResourceLocalizer::new(&config, throttle, force_refresh).unwrap()
    }

    #[test]
    fn filenames_are_deterministic_and_distinct() {
        let a = Url::parse("https://kb.example.com/img/Screen%20Shot.PNG").unwrap();
        let b = Url::parse("https://kb.example.com/other/Screen%20Shot.PNG").unwrap();

        let name_a = local_filename(&a);
        assert_eq!(name_a, local_filename(&a));
        assert!(name_a.starts_with("Screen_Shot-"));
        assert!(name_a.ends_with(".png"));
        assert_ne!(name_a, local_filename(&b));

        let query = Url::parse("https://kb.example.com/download?id=5").unwrap();
        assert!(local_filename(&query).ends_with(".bin"));
    }

    #[tokio::test]
    async fn downloads_once_then_reuses_file() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/img/diagram.png")
            .with_body(vec![9u8; 512])
            .expect(1)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let localizer = localizer(dir.path(), false);
        let remote = format!("{}/img/diagram.png", server.url());

        let first = localizer.localize(42, &remote).await.unwrap();
        let second = localizer.localize(42, &remote).await.unwrap();

        assert_eq!(first, second);
        assert!(first.starts_with("/static/images/kb/42/diagram-"));
        let file = first.rsplit('/').next().unwrap();
        let on_disk = dir.path().join("images/kb/42").join(file);
        assert_eq!(std::fs::metadata(on_disk).unwrap().len(), 512);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn failures_are_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/img/gone.png")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/img/huge.png")
            .with_body(vec![0u8; 4096])
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let localizer = localizer(dir.path(), false);

        let gone = localizer
            .localize(1, &format!("{}/img/gone.png", server.url()))
            .await;
        assert!(matches!(gone, Err(LocalizeError::Status(404))));

        let huge = localizer
            .localize(1, &format!("{}/img/huge.png", server.url()))
            .await;
        assert!(matches!(
            huge,
            Err(LocalizeError::Download(DownloadError::TooLarge { .. }))
        ));

        let bad = localizer.localize(1, "ftp://example.com/a.png").await;
        assert!(matches!(bad, Err(LocalizeError::InvalidUrl(_))));
    }
}
