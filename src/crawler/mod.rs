//! Crawl-and-normalize pipeline.
//!
//! One identifier flows through the stages in order:
//!
//! - `PageFetcher`: fetch with retry, polite delay and a global rate limit
//! - `ContentExtractor`: pull title, body, timestamp, products and the
//!   attachment section out of the page, localizing embedded images
//! - `ResourceLocalizer`: download one embedded resource under the article's
//!   directory and hand back the local reference
//! - `AttachmentFetcher`: download allow-listed attachments with a size cap
//! - `Repository::upsert_article`: commit everything atomically
//!
//! `Crawler` drives a fixed pool of workers over an identifier range and
//! returns a `CrawlSummary`.

mod attachments;
mod download;
mod extractor;
mod fetcher;
mod html;
mod localizer;
mod orchestrator;
mod throttle;

pub mod dates;

pub use attachments::{AttachmentFailure, AttachmentFetcher, AttachmentReport, SavedAttachment};
pub use download::DownloadError;
pub use extractor::{
    AttachmentLink, AttachmentSource, ArticleLocator, ContentExtractor, ExtractError, Extraction,
    KbLocator,
};
pub use fetcher::{FetchError, FetchOutcome, PageFetcher, RawPage};
pub use localizer::{LocalizeError, ResourceLocalizer};
pub use orchestrator::{CrawlOptions, CrawlOutcome, CrawlSummary, CrawlTargets, Crawler};
pub use throttle::{RetryPolicy, Throttle};
