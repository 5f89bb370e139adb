use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored knowledge-base article, keyed by its numeric identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub article_number: Option<String>,
    pub url: String,
    pub updated_at: DateTime<Utc>,
    pub updated_raw: Option<String>,
    pub crawled_at: DateTime<Utc>,
    pub content_hash: Option<String>,
}

/// Everything extracted from one fetched page, ready to be committed.
#[derive(Debug, Clone)]
pub struct ArticleDraft {
    pub id: u64,
    pub title: String,
    /// Cleaned body with embedded resources already pointing at local copies.
    pub body: String,
    pub article_number: Option<String>,
    pub url: String,
    pub updated_at: DateTime<Utc>,
    pub updated_raw: Option<String>,
    pub crawled_at: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub products: Vec<String>,
    /// Embedded references left remote because localization failed.
    pub unresolved_resources: Vec<String>,
}
