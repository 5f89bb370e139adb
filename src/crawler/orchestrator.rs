use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::attachments::AttachmentFetcher;
use super::extractor::{ContentExtractor, ExtractError, Extraction};
use super::fetcher::{FetchOutcome, PageFetcher};
use super::localizer::ResourceLocalizer;
use super::throttle::Throttle;
use crate::config::Config;
use crate::db::{Repository, UpsertOutcome};
use crate::error::{AppError, Result};

/// Which identifiers to crawl. Identifiers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlTargets {
    Single(u64),
    Range { start: u64, end: u64 },
}

impl CrawlTargets {
    pub fn single(id: u64) -> Result<Self> {
        if id == 0 {
            return Err(AppError::Config("article id must be positive".to_string()));
        }
        Ok(CrawlTargets::Single(id))
    }

    pub fn range(start: u64, end: u64) -> Result<Self> {
        if start == 0 {
            return Err(AppError::Config("range start must be positive".to_string()));
        }
        if start > end {
            return Err(AppError::Config(format!(
                "range start {} is after range end {}",
                start, end
            )));
        }
        Ok(CrawlTargets::Range { start, end })
    }

    fn bounds(&self) -> (u64, u64) {
        match *self {
            CrawlTargets::Single(id) => (id, id),
            CrawlTargets::Range { start, end } => (start, end),
        }
    }

    pub fn count(&self) -> u64 {
        let (start, end) = self.bounds();
        end.saturating_sub(start).saturating_add(1)
    }
}

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub workers: usize,
    /// Re-crawl and overwrite articles that are already stored.
    pub force: bool,
}

/// Terminal state of one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    Committed {
        images: usize,
        unresolved: usize,
        attachments: usize,
        attachment_failures: usize,
    },
    Skipped,
    NotFound,
    Failed(String),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CrawlSummary {
    pub committed: u64,
    pub skipped: u64,
    pub not_found: u64,
    pub failed: u64,
    /// Failed identifiers with their reason, sorted by id.
    pub failures: Vec<(u64, String)>,
    pub images_localized: u64,
    pub images_unresolved: u64,
    pub attachments_saved: u64,
    pub attachment_failures: u64,
    pub interrupted: bool,
    pub not_attempted: u64,
}

impl CrawlSummary {
    pub fn record(&mut self, id: u64, outcome: &CrawlOutcome) {
        match outcome {
            CrawlOutcome::Committed {
                images,
                unresolved,
                attachments,
                attachment_failures,
            } => {
                self.committed += 1;
                self.images_localized += *images as u64;
                self.images_unresolved += *unresolved as u64;
                self.attachments_saved += *attachments as u64;
                self.attachment_failures += *attachment_failures as u64;
            }
            CrawlOutcome::Skipped => self.skipped += 1,
            CrawlOutcome::NotFound => self.not_found += 1,
            CrawlOutcome::Failed(reason) => {
                self.failed += 1;
                self.failures.push((id, reason.clone()));
            }
        }
    }

    pub fn merge(&mut self, other: CrawlSummary) {
        self.committed += other.committed;
        self.skipped += other.skipped;
        self.not_found += other.not_found;
        self.failed += other.failed;
        self.failures.extend(other.failures);
        self.images_localized += other.images_localized;
        self.images_unresolved += other.images_unresolved;
        self.attachments_saved += other.attachments_saved;
        self.attachment_failures += other.attachment_failures;
        self.interrupted |= other.interrupted;
        self.not_attempted += other.not_attempted;
    }

    /// Identifiers that reached a terminal state.
    pub fn attempted(&self) -> u64 {
        self.committed + self.skipped + self.not_found + self.failed
    }
}

impl fmt::Display for CrawlSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Committed:   {}", self.committed)?;
        writeln!(f, "Skipped:     {}", self.skipped)?;
        writeln!(f, "Not found:   {}", self.not_found)?;
        writeln!(f, "Failed:      {}", self.failed)?;
        writeln!(
            f,
            "Images:      {} localized, {} left remote",
            self.images_localized, self.images_unresolved
        )?;
        write!(
            f,
            "Attachments: {} saved, {} failed",
            self.attachments_saved, self.attachment_failures
        )?;
        if self.interrupted {
            write!(f, "\nInterrupted: {} not attempted", self.not_attempted)?;
        }
        for (id, reason) in &self.failures {
            write!(f, "\n  KB {}: {}", id, reason)?;
        }
        Ok(())
    }
}

/// Drives fetch, extract, localize, attachments and upsert for each identifier.
pub struct Crawler {
    repo: Arc<Repository>,
    fetcher: PageFetcher,
    extractor: ContentExtractor,
    localizer: ResourceLocalizer,
    attachments: AttachmentFetcher,
    shutdown: Option<watch::Receiver<bool>>,
    show_progress: bool,
}

impl Crawler {
    /// `refresh_resources` re-downloads images that are already on disk.
    pub fn new(config: &Config, repo: Arc<Repository>, refresh_resources: bool) -> Result<Self> {
        let throttle = Arc::new(Throttle::from_config(config));

        Ok(Self {
            repo,
            fetcher: PageFetcher::new(config, Arc::clone(&throttle))?,
            extractor: ContentExtractor::new(config)?,
            localizer: ResourceLocalizer::new(config, Arc::clone(&throttle), refresh_resources)?,
            attachments: AttachmentFetcher::new(config, throttle)?,
            shutdown: None,
            show_progress: false,
        })
    }

    /// Stop handing out new identifiers once the receiver reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Crawl every identifier in `targets` with a fixed pool of workers.
    ///
    /// Each worker keeps its own summary; they are merged once all workers
    /// have drained the queue or observed shutdown.
    pub async fn run(
        self: Arc<Self>,
        targets: CrawlTargets,
        options: CrawlOptions,
    ) -> Result<CrawlSummary> {
        let (start, end) = targets.bounds();
        let total = targets.count();

        let known = if options.force {
            HashSet::new()
        } else {
            self.repo.existing_ids_between(start, end).await?
        };
        info!(
            start,
            end,
            already_stored = known.len(),
            force = options.force,
            "Starting crawl"
        );
        let known = Arc::new(known);

        let workers = options
            .workers
            .max(1)
            .min(usize::try_from(total).unwrap_or(usize::MAX));
        let cursor = Arc::new(AtomicU64::new(0));
        let progress = self.progress_bar(total);

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let crawler = Arc::clone(&self);
            let cursor = Arc::clone(&cursor);
            let known = Arc::clone(&known);
            let progress = progress.clone();
            let force = options.force;

            handles.push(tokio::spawn(async move {
                let mut summary = CrawlSummary::default();
                loop {
                    if crawler.shutdown_requested() {
                        debug!(worker, "Worker stopping on shutdown");
                        break;
                    }
                    let offset = cursor.fetch_add(1, Ordering::SeqCst);
                    if offset >= total {
                        break;
                    }
                    let id = start + offset;

                    let outcome = if !force && known.contains(&id) {
                        CrawlOutcome::Skipped
                    } else {
                        crawler
                            .crawl_one(id, force)
                            .instrument(info_span!("article", kb = id))
                            .await
                    };
                    summary.record(id, &outcome);
                    progress.inc(1);
                }
                summary
            }));
        }

        let mut summary = CrawlSummary::default();
        for joined in join_all(handles).await {
            match joined {
                Ok(worker_summary) => summary.merge(worker_summary),
                Err(e) => error!(error = %e, "Crawl worker panicked"),
            }
        }
        progress.finish_and_clear();

        summary.failures.sort_by_key(|(id, _)| *id);
        summary.interrupted = self.shutdown_requested();
        summary.not_attempted = total.saturating_sub(summary.attempted());

        info!(
            committed = summary.committed,
            skipped = summary.skipped,
            not_found = summary.not_found,
            failed = summary.failed,
            interrupted = summary.interrupted,
            "Crawl finished"
        );
        Ok(summary)
    }

    /// Run the whole pipeline for one identifier.
    ///
    /// An unforced crawl of an article that is already stored still fetches
    /// it, but the commit reports `Skipped` and writes nothing.
    pub async fn crawl_one(&self, id: u64, force: bool) -> CrawlOutcome {
        let page = match self.fetcher.fetch(id).await {
            Ok(FetchOutcome::Page(page)) => page,
            Ok(FetchOutcome::NotFound) => {
                debug!("Article does not exist");
                return CrawlOutcome::NotFound;
            }
            Err(e) => {
                warn!(error = %e, "Fetch failed");
                return CrawlOutcome::Failed(e.to_string());
            }
        };

        let Extraction {
            mut draft,
            attachments: links,
            localized_images,
        } = match self.extractor.extract(&page, &self.localizer).await {
            Ok(extraction) => extraction,
            Err(ExtractError::NotFound(title)) => {
                debug!(title = %title, "Placeholder page treated as missing");
                return CrawlOutcome::NotFound;
            }
            Err(e) => {
                warn!(error = %e, "Extraction failed");
                return CrawlOutcome::Failed(e.to_string());
            }
        };

        let report = self.attachments.fetch_attachments(id, &links).await;
        for saved in &report.saved {
            draft.body = saved.rewrite_links(&draft.body);
        }

        let unresolved = draft.unresolved_resources.len();
        let attachment_count = report.saved.len();
        let attachment_failures = report.failed.len();
        let metas = report.saved.into_iter().map(|s| s.meta).collect();

        match self.repo.upsert_article(draft, metas, force).await {
            Ok(UpsertOutcome::Committed) => {
                info!(
                    images = localized_images,
                    unresolved,
                    attachments = attachment_count,
                    "Article committed"
                );
                CrawlOutcome::Committed {
                    images: localized_images,
                    unresolved,
                    attachments: attachment_count,
                    attachment_failures,
                }
            }
            Ok(UpsertOutcome::Skipped) => {
                debug!("Article already stored");
                CrawlOutcome::Skipped
            }
            Err(e) => {
                error!(error = %e, "Commit failed");
                CrawlOutcome::Failed(e.to_string())
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta}) {msg}")
        {
            bar.set_style(style.progress_chars("##-"));
        }
        bar.set_message("crawling");
        bar
    }
}
