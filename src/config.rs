use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppError, Result};

const APP_DIR: &str = "kb-crawler";
const DEFAULT_BASE_URL: &str = "https://knowledge.broadcom.com/external/article/";
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Root for downloaded images and attachments, served as-is by the catalog.
    #[serde(default = "default_static_root")]
    pub static_root: String,

    #[serde(default = "default_images_url_prefix")]
    pub images_url_prefix: String,

    #[serde(default = "default_attachments_url_prefix")]
    pub attachments_url_prefix: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_attachment_timeout")]
    pub attachment_timeout_secs: u64,

    /// Total attempts per page, including the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_delay_min")]
    pub delay_min_ms: u64,

    #[serde(default = "default_delay_max")]
    pub delay_max_ms: u64,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,

    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,

    #[serde(default = "default_max_title_chars")]
    pub max_title_chars: usize,

    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,

    #[serde(default = "default_max_products")]
    pub max_products: usize,
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_db_path() -> String {
    data_dir().join("kb.db").to_string_lossy().to_string()
}

fn default_static_root() -> String {
    data_dir().join("static").to_string_lossy().to_string()
}

fn default_images_url_prefix() -> String {
    "/static/images/kb".to_string()
}

fn default_attachments_url_prefix() -> String {
    "/static/attachments/kb".to_string()
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_workers() -> usize {
    50
}

fn default_request_timeout() -> u64 {
    15
}

fn default_attachment_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    1000
}

fn default_delay_min() -> u64 {
    100
}

fn default_delay_max() -> u64 {
    300
}

fn default_requests_per_second() -> u32 {
    20
}

fn default_max_image_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_attachment_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_max_title_chars() -> usize {
    1000
}

fn default_max_body_chars() -> usize {
    200_000
}

fn default_max_products() -> usize {
    20
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            static_root: default_static_root(),
            images_url_prefix: default_images_url_prefix(),
            attachments_url_prefix: default_attachments_url_prefix(),
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            workers: default_workers(),
            request_timeout_secs: default_request_timeout(),
            attachment_timeout_secs: default_attachment_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            delay_min_ms: default_delay_min(),
            delay_max_ms: default_delay_max(),
            requests_per_second: default_requests_per_second(),
            max_image_bytes: default_max_image_bytes(),
            max_attachment_bytes: default_max_attachment_bytes(),
            max_title_chars: default_max_title_chars(),
            max_body_chars: default_max_body_chars(),
            max_products: default_max_products(),
        }
    }
}

impl Config {
    /// Load from the default location, writing defaults on first run.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(AppError::Config("workers must be at least 1".to_string()));
        }
        if self.max_retries == 0 {
            return Err(AppError::Config("max_retries must be at least 1".to_string()));
        }
        if self.requests_per_second == 0 {
            return Err(AppError::Config(
                "requests_per_second must be at least 1".to_string(),
            ));
        }
        if self.delay_min_ms > self.delay_max_ms {
            return Err(AppError::Config(format!(
                "delay_min_ms ({}) exceeds delay_max_ms ({})",
                self.delay_min_ms, self.delay_max_ms
            )));
        }
        url::Url::parse(&self.base_url)?;
        Ok(())
    }

    pub fn images_dir(&self) -> PathBuf {
        Path::new(&self.static_root).join("images").join("kb")
    }

    pub fn attachments_dir(&self) -> PathBuf {
        Path::new(&self.static_root).join("attachments").join("kb")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn attachment_timeout(&self) -> Duration {
        Duration::from_secs(self.attachment_timeout_secs)
    }
}
