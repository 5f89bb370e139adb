//! Crawl knowledge-base articles by numeric id and normalize them into a
//! local SQLite catalog with mirrored images and attachments.

pub mod config;
pub mod crawler;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use error::{AppError, Result};
