use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::Result;
use crate::models::{
    normalize_product_name, product_key, Article, ArticleDraft, Attachment, AttachmentMeta,
    Product,
};

use super::schema::SCHEMA;

/// Result of committing one crawled article.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Committed,
    /// The article already existed and the crawl was not forced; nothing was written.
    Skipped,
}

/// SQLite-backed catalog storage.
///
/// Every call runs on the single connection thread owned by
/// `tokio_rusqlite`, so mutating operations are serialized no matter how
/// many crawl workers share the repository.
pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path).await?;
        Self::init(conn).await
    }

    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.busy_timeout(Duration::from_secs(30))?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    // Article operations

    pub async fn article_exists(&self, id: u64) -> Result<bool> {
        let exists = self
            .conn
            .call(move |conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM articles WHERE id = ?1)",
                    params![id],
                    |row| row.get(0),
                )?;
                Ok(exists)
            })
            .await?;
        Ok(exists)
    }

    /// Identifiers already stored within `start..=end`, loaded in one query.
    pub async fn existing_ids_between(&self, start: u64, end: u64) -> Result<HashSet<u64>> {
        let ids = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT id FROM articles WHERE id BETWEEN ?1 AND ?2")?;
                let ids = stmt
                    .query_map(params![start, end], |row| row.get::<_, u64>(0))?
                    .collect::<std::result::Result<HashSet<_>, _>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    /// Commit an article together with its product associations and
    /// attachment rows as one transaction.
    ///
    /// Products are get-or-created in their own short transaction first;
    /// they outlive the article regardless of whether its commit succeeds.
    pub async fn upsert_article(
        &self,
        draft: ArticleDraft,
        attachments: Vec<AttachmentMeta>,
        forced: bool,
    ) -> Result<UpsertOutcome> {
        if !forced && self.article_exists(draft.id).await? {
            return Ok(UpsertOutcome::Skipped);
        }

        let product_ids = self.ensure_products(draft.products.clone()).await?;

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM articles WHERE id = ?1)",
                    params![draft.id],
                    |row| row.get(0),
                )?;
                if exists && !forced {
                    // Lost a race with another crawl of the same id; dropping tx rolls back.
                    return Ok(UpsertOutcome::Skipped);
                }

                tx.execute(
                    r#"INSERT INTO articles (id, title, body, article_number, url, updated_at, updated_raw, crawled_at, content_hash)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                       ON CONFLICT(id) DO UPDATE SET
                           title = excluded.title,
                           body = excluded.body,
                           article_number = excluded.article_number,
                           url = excluded.url,
                           updated_at = excluded.updated_at,
                           updated_raw = excluded.updated_raw,
                           crawled_at = excluded.crawled_at,
                           content_hash = excluded.content_hash"#,
                    params![
                        draft.id,
                        draft.title,
                        draft.body,
                        draft.article_number,
                        draft.url,
                        draft.updated_at.to_rfc3339(),
                        draft.updated_raw,
                        draft.crawled_at.to_rfc3339(),
                        draft.content_hash,
                    ],
                )?;

                tx.execute(
                    "DELETE FROM article_products WHERE article_id = ?1",
                    params![draft.id],
                )?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO article_products (article_id, product_id) VALUES (?1, ?2)",
                    )?;
                    for product_id in &product_ids {
                        stmt.execute(params![draft.id, product_id])?;
                    }
                }

                tx.execute(
                    "DELETE FROM attachments WHERE article_id = ?1",
                    params![draft.id],
                )?;
                {
                    let mut stmt = tx.prepare(
                        r#"INSERT INTO attachments (article_id, filename, original_name, local_path, size, extension, content_type)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
                    )?;
                    for meta in &attachments {
                        stmt.execute(params![
                            draft.id,
                            meta.filename,
                            meta.original_name,
                            meta.local_path,
                            meta.size,
                            meta.extension,
                            meta.content_type,
                        ])?;
                    }
                }

                tx.commit()?;
                Ok(UpsertOutcome::Committed)
            })
            .await?;
        Ok(outcome)
    }

    pub async fn get_article(&self, id: u64) -> Result<Option<Article>> {
        let article = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT id, title, body, article_number, url, updated_at, updated_raw, crawled_at, content_hash
                       FROM articles WHERE id = ?1"#,
                )?;
                let article = stmt.query_row(params![id], article_from_row).optional()?;
                Ok(article)
            })
            .await?;
        Ok(article)
    }

    pub async fn count_articles(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM articles").await
    }

    // Product operations

    /// Get-or-create products by name, returning their ids in first-seen order.
    ///
    /// Names are matched on `product_key`. The unique index on that key
    /// turns a concurrent first sighting into a no-op insert followed by a
    /// re-read of the existing row.
    pub async fn ensure_products(&self, names: Vec<String>) -> Result<Vec<i64>> {
        let names: Vec<(String, String)> = names
            .iter()
            .map(|n| normalize_product_name(n))
            .filter(|n| !n.is_empty())
            .map(|n| (product_key(&n), n))
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let ids = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut ids: Vec<i64> = Vec::with_capacity(names.len());
                {
                    let mut insert = tx.prepare(
                        "INSERT INTO products (name, name_key) VALUES (?1, ?2) ON CONFLICT(name_key) DO NOTHING",
                    )?;
                    let mut select = tx.prepare("SELECT id FROM products WHERE name_key = ?1")?;
                    for (key, name) in &names {
                        insert.execute(params![name, key])?;
                        let id: i64 = select.query_row(params![key], |row| row.get(0))?;
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                }
                tx.commit()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    pub async fn article_products(&self, article_id: u64) -> Result<Vec<Product>> {
        let products = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT p.id, p.name
                       FROM products p
                       JOIN article_products ap ON ap.product_id = p.id
                       WHERE ap.article_id = ?1
                       ORDER BY p.name"#,
                )?;
                let products = stmt
                    .query_map(params![article_id], |row| {
                        Ok(Product {
                            id: row.get(0)?,
                            name: row.get(1)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(products)
            })
            .await?;
        Ok(products)
    }

    pub async fn count_products(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM products").await
    }

    // Attachment operations

    pub async fn article_attachments(&self, article_id: u64) -> Result<Vec<Attachment>> {
        let attachments = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT id, article_id, filename, original_name, local_path, size, extension, content_type
                       FROM attachments WHERE article_id = ?1 ORDER BY id"#,
                )?;
                let attachments = stmt
                    .query_map(params![article_id], attachment_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(attachments)
            })
            .await?;
        Ok(attachments)
    }

    async fn count(&self, sql: &'static str) -> Result<u64> {
        let count = self
            .conn
            .call(move |conn| {
                let count: u64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56+00:00")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

fn article_from_row(row: &Row) -> rusqlite::Result<Article> {
    Ok(Article {
        id: row.get(0)?,
        title: row.get(1)?,
        body: row.get(2)?,
        article_number: row.get(3)?,
        url: row.get(4)?,
        updated_at: row
            .get::<_, String>(5)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
        updated_raw: row.get(6)?,
        crawled_at: row
            .get::<_, String>(7)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
        content_hash: row.get(8)?,
    })
}

fn attachment_from_row(row: &Row) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        id: row.get(0)?,
        article_id: row.get(1)?,
        filename: row.get(2)?,
        original_name: row.get(3)?,
        local_path: row.get(4)?,
        size: row.get(5)?,
        extension: row.get(6)?,
        content_type: row.get(7)?,
    })
}
