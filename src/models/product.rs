use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
}

/// Collapse internal whitespace and trim. The first-seen casing is what
/// gets displayed.
pub fn normalize_product_name(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Uniqueness key for a product: the normalized name, lowercased with full
/// Unicode case mapping.
pub fn product_key(raw: &str) -> String {
    normalize_product_name(raw).to_lowercase()
}
