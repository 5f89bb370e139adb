pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- articles table (id is the knowledge-base number, stable across re-crawls)
CREATE TABLE IF NOT EXISTS articles (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    article_number TEXT,
    url TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    updated_raw TEXT,
    crawled_at TEXT NOT NULL,
    content_hash TEXT
);

CREATE INDEX IF NOT EXISTS idx_articles_updated_at ON articles(updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_articles_title ON articles(title COLLATE NOCASE);
CREATE INDEX IF NOT EXISTS idx_articles_crawled_at ON articles(crawled_at DESC);

-- products table
CREATE TABLE IF NOT EXISTS products (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    -- lowercased name; SQLite NOCASE only folds ASCII
    name_key TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- article_products table
CREATE TABLE IF NOT EXISTS article_products (
    article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
    product_id INTEGER NOT NULL REFERENCES products(id),
    PRIMARY KEY (article_id, product_id)
);

CREATE INDEX IF NOT EXISTS idx_article_products_product ON article_products(product_id);

-- attachments table
CREATE TABLE IF NOT EXISTS attachments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
    filename TEXT NOT NULL,
    original_name TEXT NOT NULL,
    local_path TEXT NOT NULL,
    size INTEGER NOT NULL,
    extension TEXT NOT NULL,
    content_type TEXT,
    UNIQUE(article_id, filename)
);

CREATE INDEX IF NOT EXISTS idx_attachments_article_id ON attachments(article_id);
"#;
