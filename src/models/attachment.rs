use serde::{Deserialize, Serialize};

/// Metadata for a downloaded attachment, produced by the attachment fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub original_name: String,
    pub local_path: String,
    pub size: u64,
    pub extension: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub article_id: u64,
    pub filename: String,
    pub original_name: String,
    pub local_path: String,
    pub size: u64,
    pub extension: String,
    pub content_type: Option<String>,
}
