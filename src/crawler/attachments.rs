use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use reqwest::{Client, RequestBuilder, Response};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::download::{existing_len, stream_to_file, DownloadError};
use super::extractor::{AttachmentLink, AttachmentSource};
use super::html::{escape_attr, replace_attr_value};
use super::throttle::{RetryPolicy, Throttle};
use crate::config::Config;
use crate::error::Result;
use crate::models::AttachmentMeta;

const ALLOWED_EXTENSIONS: &[&str] = &[
    // archives
    "zip", "rar", "7z", "tar", "gz", "tgz", "tar.gz", "bz2", "xz",
    // documents
    "pdf", "doc", "docx", "odt", "rtf", "ppt", "pptx",
    // spreadsheets
    "xls", "xlsx", "ods", "csv",
    // text
    "txt", "log", "json", "xml", "yaml", "yml", "md", "conf", "cfg", "ini",
];

const MAX_STEM_CHARS: usize = 150;
const MAX_SUFFIX: u32 = 1000;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    Status(u16),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("no free file name for {0}")]
    NameExhausted(String),
}

impl AttachmentError {
    fn is_retryable(&self) -> bool {
        match self {
            AttachmentError::Network(_) => true,
            AttachmentError::Status(code) => *code == 408 || *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SavedAttachment {
    pub link: AttachmentLink,
    pub meta: AttachmentMeta,
}

impl SavedAttachment {
    /// Point the body's link to this attachment at the local copy.
    pub fn rewrite_links(&self, body: &str) -> String {
        match &self.link.source {
            AttachmentSource::Direct { url } => {
                replace_attr_value(body, "href", url, &self.meta.local_path)
            }
            AttachmentSource::Api { file_id, .. } => {
                let marker = format!("data-uniquefileid=\"{}\"", escape_attr(file_id));
                let linked = format!(
                    "href=\"{}\" {}",
                    escape_attr(&self.meta.local_path),
                    marker
                );
                body.replace(&marker, &linked)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentFailure {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct AttachmentReport {
    pub saved: Vec<SavedAttachment>,
    /// Links skipped because their type is not on the allow-list.
    pub rejected: Vec<String>,
    pub failed: Vec<AttachmentFailure>,
}

enum Target {
    Fresh(String),
    Reused(String, u64),
}

pub struct AttachmentFetcher {
    client: Client,
    root: PathBuf,
    url_prefix: String,
    max_bytes: u64,
    retry: RetryPolicy,
    throttle: Arc<Throttle>,
}

impl AttachmentFetcher {
    pub fn new(config: &Config, throttle: Arc<Throttle>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.attachment_timeout())
            .connect_timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            root: config.attachments_dir(),
            url_prefix: config.attachments_url_prefix.trim_end_matches('/').to_string(),
            max_bytes: config.max_attachment_bytes,
            retry: RetryPolicy::from_config(config),
            throttle,
        })
    }

    /// Download every allow-listed attachment of one article.
    ///
    /// Links are handled in order so that name collisions resolve the same
    /// way on every run. A failed link is recorded and the rest continue.
    pub async fn fetch_attachments(
        &self,
        article_id: u64,
        links: &[AttachmentLink],
    ) -> AttachmentReport {
        let mut report = AttachmentReport::default();
        let mut claimed = HashSet::new();

        for link in links {
            let original_name = link.display_name();
            let Some((stem, extension)) = split_allowed(&original_name) else {
                debug!(kb = article_id, name = %original_name, "Attachment type not allowed");
                report.rejected.push(original_name);
                continue;
            };

            match self
                .fetch_one(article_id, link, &stem, &extension, &mut claimed)
                .await
            {
                Ok(mut meta) => {
                    meta.original_name = original_name;
                    info!(kb = article_id, file = %meta.filename, size = meta.size, "Attachment saved");
                    report.saved.push(SavedAttachment {
                        link: link.clone(),
                        meta,
                    });
                }
                Err(e) => {
                    warn!(kb = article_id, name = %original_name, error = %e, "Attachment failed");
                    report.failed.push(AttachmentFailure {
                        name: original_name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report
    }

    async fn fetch_one(
        &self,
        article_id: u64,
        link: &AttachmentLink,
        stem: &str,
        extension: &str,
        claimed: &mut HashSet<String>,
    ) -> std::result::Result<AttachmentMeta, AttachmentError> {
        let response = self.send_with_retry(&link.source).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let dir = self.root.join(article_id.to_string());

        let target = self
            .pick_target(&dir, stem, extension, response.content_length(), claimed)
            .await?;
        let (filename, size) = match target {
            Target::Reused(filename, size) => {
                debug!(kb = article_id, file = %filename, "Attachment already on disk");
                (filename, size)
            }
            Target::Fresh(filename) => {
                let size =
                    stream_to_file(response, &dir.join(&filename), self.max_bytes, true).await?;
                (filename, size)
            }
        };
        claimed.insert(filename.clone());

        Ok(AttachmentMeta {
            local_path: format!("{}/{}/{}", self.url_prefix, article_id, filename),
            filename,
            original_name: String::new(),
            size,
            extension: extension.to_string(),
            content_type,
        })
    }

    async fn send_with_retry(
        &self,
        source: &AttachmentSource,
    ) -> std::result::Result<Response, AttachmentError> {
        let mut attempt = 1;
        loop {
            self.throttle.wait().await;
            let error = match self.request(source).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => AttachmentError::Status(response.status().as_u16()),
                Err(e) => AttachmentError::Network(e),
            };

            if !error.is_retryable() || attempt >= self.retry.max_attempts {
                return Err(error);
            }
            tokio::time::sleep(self.retry.backoff(attempt)).await;
            attempt += 1;
        }
    }

    fn request(&self, source: &AttachmentSource) -> RequestBuilder {
        match source {
            AttachmentSource::Direct { url } => self.client.get(url),
            AttachmentSource::Api { endpoint, file_id } => {
                let data = serde_json::json!({ "uniqueFileId": file_id }).to_string();
                self.client.post(endpoint).form(&[("data", data)])
            }
        }
    }

    /// First unclaimed name among `stem.ext`, `stem-1.ext`, ... An existing
    /// file of exactly the expected size is reused; any other occupant is
    /// left untouched and the next suffix is tried.
    async fn pick_target(
        &self,
        dir: &std::path::Path,
        stem: &str,
        extension: &str,
        expected_len: Option<u64>,
        claimed: &HashSet<String>,
    ) -> std::result::Result<Target, AttachmentError> {
        for n in 0..MAX_SUFFIX {
            let candidate = if n == 0 {
                format!("{}.{}", stem, extension)
            } else {
                format!("{}-{}.{}", stem, n, extension)
            };
            if claimed.contains(&candidate) {
                continue;
            }
            match existing_len(&dir.join(&candidate)).await {
                None => return Ok(Target::Fresh(candidate)),
                Some(len) if Some(len) == expected_len => return Ok(Target::Reused(candidate, len)),
                Some(_) => continue,
            }
        }
        Err(AttachmentError::NameExhausted(format!("{}.{}", stem, extension)))
    }
}

/// Split a file name into a sanitized stem and an allow-listed extension.
fn split_allowed(name: &str) -> Option<(String, String)> {
    let lower = name.to_ascii_lowercase();
    let ext_len = if lower.ends_with(".tar.gz") {
        "tar.gz".len()
    } else {
        lower.rsplit_once('.').map(|(_, ext)| ext.len())?
    };
    let extension = lower[lower.len() - ext_len..].to_string();
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return None;
    }

    let stem = &name[..name.len() - ext_len - 1];
    let mut stem: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_CHARS)
        .collect();
    stem = stem.trim_start_matches('.').to_string();
    if stem.trim_matches('_').is_empty() {
        stem = "attachment".to_string();
    }

    Some((stem, extension))
}
