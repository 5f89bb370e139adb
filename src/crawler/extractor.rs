use std::collections::HashSet;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::dates::parse_updated;
use super::fetcher::{is_not_found_title, RawPage};
use super::html::{
    clean_body, normalize_whitespace, replace_attr_value, truncate_chars, truncate_markup,
};
use super::localizer::ResourceLocalizer;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::ArticleDraft;

const MAX_PRODUCT_CHARS: usize = 200;
const MAX_ARTICLE_NUMBER_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("page has no title")]
    MissingTitle,

    #[error("page has no article body")]
    MissingBody,

    /// Served with a success status, but the page title says the article is missing.
    #[error("placeholder page titled {0:?}")]
    NotFound(String),

    #[error("invalid page url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttachmentSource {
    Direct { url: String },
    /// Served by the download API, which takes the file id as a form field.
    Api { endpoint: String, file_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentLink {
    pub name: Option<String>,
    pub source: AttachmentSource,
}

impl AttachmentLink {
    /// Name shown on the page, else the last URL segment.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        if let AttachmentSource::Direct { url } = &self.source {
            let segment = Url::parse(url).ok().and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back())
                    .map(|s| s.to_string())
            });
            if let Some(segment) = segment.filter(|s| !s.is_empty()) {
                return urlencoding::decode(&segment)
                    .map(|s| s.into_owned())
                    .unwrap_or(segment);
            }
        }
        "attachment".to_string()
    }
}

/// Structural lookups on a parsed article page.
///
/// Implementations only find things; cleanup, limits and localization are
/// applied by `ContentExtractor` so that a different page layout only needs
/// a new locator.
pub trait ArticleLocator: Send + Sync {
    fn locate_title(&self, doc: &Html) -> Option<String>;

    fn locate_body<'a>(&self, doc: &'a Html) -> Option<ElementRef<'a>>;

    /// Raw last-updated string as printed on the page.
    fn locate_updated(&self, doc: &Html) -> Option<String>;

    fn locate_article_number(&self, doc: &Html) -> Option<String>;

    fn locate_products(&self, doc: &Html) -> Vec<String>;

    /// Regions that hold the article's attachments. Links outside these are
    /// never downloaded.
    fn locate_attachment_regions<'a>(&self, doc: &'a Html) -> Vec<ElementRef<'a>>;

    /// Download API endpoint for attachments referenced by file id.
    fn locate_attachment_api(&self, doc: &Html) -> Option<String>;
}

/// Locator for the knowledge-base article layout.
pub struct KbLocator {
    title: Vec<Selector>,
    body: Vec<Selector>,
    products: Selector,
    products_fallback: Selector,
    script: Selector,
    json_ld: Selector,
    attachment_regions: Vec<Selector>,
    attachment_card: Selector,
    date_var: Regex,
    date_token: Regex,
    api_domain: Regex,
    download_domain: Regex,
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| AppError::Parse(format!("selector {}: {:?}", css, e)))
}

fn regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| AppError::Parse(e.to_string()))
}

impl KbLocator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            title: vec![
                selector(r#"h3[class*="wolken-h3"]"#)?,
                selector("h1")?,
                selector("h2")?,
                selector("h3")?,
                selector("title")?,
            ],
            body: vec![
                selector(r#"div[class*="wolken-content-container"]"#)?,
                selector(r#"div[class*="article-container"]"#)?,
                selector(r#"div[class*="detail-card-content"]"#)?,
                selector("article")?,
                selector("main")?,
            ],
            products: selector(r#"div[class*="product-container"] span[class*="product-chip"]"#)?,
            products_fallback: selector(r#"span[class*="product-chip"]"#)?,
            script: selector("script")?,
            json_ld: selector(r#"script[type="application/ld+json"]"#)?,
            attachment_regions: vec![
                selector(r#"[class*="attachment-container"]"#)?,
                selector(r#"[class*="attachments-section"]"#)?,
                selector("#attachments")?,
            ],
            attachment_card: selector(r#"[class*="attachment-card"]"#)?,
            date_var: regex(r#"var\s+d\s*=\s*['"]([^'"]+)['"]"#)?,
            date_token: regex(
                r"\d{4}-\d{2}-\d{2}(?:[ T]\d{2}:\d{2}(?::\d{2})?)?|\d{1,2}[-/]\d{1,2}[-/]\d{4}",
            )?,
            api_domain: regex(r#"apiDomain\s*[:=]\s*['"]([^'"]+)['"]"#)?,
            download_domain: regex(r#"kbDownloadDomain\s*[:=]\s*['"]([^'"]+)['"]"#)?,
        })
    }

    fn scripts(&self, doc: &Html) -> Vec<String> {
        doc.select(&self.script)
            .map(|s| s.text().collect::<String>())
            .collect()
    }

    /// Value printed after `label`, either in the same text node or the next one.
    fn labelled_value(doc: &Html, label: &str) -> Option<String> {
        let mut chunks = doc.root_element().text();
        while let Some(chunk) = chunks.next() {
            let Some(pos) = chunk.find(label) else {
                continue;
            };
            let rest = chunk[pos + label.len()..].trim().trim_start_matches(':').trim();
            if !rest.is_empty() {
                return Some(rest.to_string());
            }
            return chunks
                .map(str::trim)
                .map(|s| s.trim_start_matches(':').trim())
                .find(|s| !s.is_empty())
                .map(str::to_string);
        }
        None
    }

    fn json_ld_date(&self, doc: &Html) -> Option<String> {
        fn find(value: &Value) -> Option<String> {
            match value {
                Value::Object(map) => map
                    .get("dateModified")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| map.get("@graph").and_then(find)),
                Value::Array(items) => items.iter().find_map(find),
                _ => None,
            }
        }

        doc.select(&self.json_ld).find_map(|script| {
            let text = script.text().collect::<String>();
            serde_json::from_str::<Value>(&text).ok().as_ref().and_then(find)
        })
    }
}

impl ArticleLocator for KbLocator {
    fn locate_title(&self, doc: &Html) -> Option<String> {
        self.title.iter().find_map(|sel| {
            doc.select(sel)
                .map(|el| normalize_whitespace(&el.text().collect::<String>()))
                .find(|t| !t.is_empty())
        })
    }

    fn locate_body<'a>(&self, doc: &'a Html) -> Option<ElementRef<'a>> {
        self.body.iter().find_map(|sel| {
            doc.select(sel)
                .find(|el| el.text().any(|t| !t.trim().is_empty()))
        })
    }

    fn locate_updated(&self, doc: &Html) -> Option<String> {
        // Only the script that renders the `date_time` element carries the page date.
        let from_script = self
            .scripts(doc)
            .iter()
            .filter(|text| text.contains("date_time"))
            .find_map(|text| self.date_var.captures(text).map(|c| c[1].trim().to_string()));
        if from_script.is_some() {
            return from_script;
        }

        if let Some(date) = self.json_ld_date(doc) {
            return Some(date);
        }

        let printed = Self::labelled_value(doc, "Updated On")?;
        Some(
            self.date_token
                .find(&printed)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| truncate_chars(&printed, 40)),
        )
    }

    fn locate_article_number(&self, doc: &Html) -> Option<String> {
        Self::labelled_value(doc, "Article ID")
            .map(|v| truncate_chars(&normalize_whitespace(&v), MAX_ARTICLE_NUMBER_CHARS))
            .filter(|v| !v.is_empty())
    }

    fn locate_products(&self, doc: &Html) -> Vec<String> {
        let collect = |sel: &Selector| -> Vec<String> {
            doc.select(sel)
                .map(|el| normalize_whitespace(&el.text().collect::<String>()))
                .collect()
        };
        let primary = collect(&self.products);
        if primary.is_empty() {
            collect(&self.products_fallback)
        } else {
            primary
        }
    }

    fn locate_attachment_regions<'a>(&self, doc: &'a Html) -> Vec<ElementRef<'a>> {
        let mut regions: Vec<ElementRef<'a>> = self
            .attachment_regions
            .iter()
            .flat_map(|sel| doc.select(sel))
            .collect();
        if regions.is_empty() {
            regions = doc.select(&self.attachment_card).collect();
        }

        // Nested matches would yield the same links twice.
        let ids: Vec<_> = regions.iter().map(|r| r.id()).collect();
        let mut kept = Vec::new();
        regions.retain(|r| {
            if kept.contains(&r.id()) || r.ancestors().any(|a| ids.contains(&a.id())) {
                return false;
            }
            kept.push(r.id());
            true
        });
        regions
    }

    fn locate_attachment_api(&self, doc: &Html) -> Option<String> {
        let scripts = self.scripts(doc);
        let find = |re: &Regex| {
            scripts
                .iter()
                .find_map(|text| re.captures(text).map(|c| c[1].to_string()))
        };
        let api = find(&self.api_domain)?;
        let domain = find(&self.download_domain)?;
        Some(format!(
            "{}/es/attachments/download_attachment?domain={}",
            api.trim_end_matches('/'),
            urlencoding::encode(&domain)
        ))
    }
}

/// Output of a successful extraction.
#[derive(Debug)]
pub struct Extraction {
    pub draft: ArticleDraft,
    pub attachments: Vec<AttachmentLink>,
    pub localized_images: usize,
}

/// Parsed fields before any network work.
struct ParsedPage {
    title: String,
    body: String,
    images: Vec<String>,
    article_number: Option<String>,
    updated_raw: Option<String>,
    products: Vec<String>,
    attachments: Vec<AttachmentLink>,
}

pub struct ContentExtractor<L: ArticleLocator = KbLocator> {
    locator: L,
    link_selector: Selector,
    card_name_selector: Selector,
    max_title_chars: usize,
    max_body_chars: usize,
    max_products: usize,
}

impl ContentExtractor<KbLocator> {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_locator(KbLocator::new()?, config)
    }
}

impl<L: ArticleLocator> ContentExtractor<L> {
    pub fn with_locator(locator: L, config: &Config) -> Result<Self> {
        Ok(Self {
            locator,
            link_selector: selector("a, [data-uniquefileid]")?,
            card_name_selector: selector(r#"[class*="attachment-name"]"#)?,
            max_title_chars: config.max_title_chars,
            max_body_chars: config.max_body_chars,
            max_products: config.max_products,
        })
    }

    /// Turn a fetched page into an article draft.
    ///
    /// Every embedded image is handed to `localizer`; the ones that fail stay
    /// remote and are listed in `unresolved_resources`.
    pub async fn extract(
        &self,
        page: &RawPage,
        localizer: &ResourceLocalizer,
    ) -> std::result::Result<Extraction, ExtractError> {
        let parsed = self.parse(page)?;

        let mut body = parsed.body;
        let mut unresolved = Vec::new();
        let mut localized_images = 0;
        for remote in &parsed.images {
            match localizer.localize(page.id, remote).await {
                Ok(local) => {
                    body = replace_attr_value(&body, "src", remote, &local);
                    localized_images += 1;
                }
                Err(e) => {
                    warn!(kb = page.id, url = %remote, error = %e, "Image left remote");
                    unresolved.push(remote.clone());
                }
            }
        }

        let updated_at = match parsed.updated_raw.as_deref().and_then(parse_updated) {
            Some(ts) => ts,
            None => {
                debug!(kb = page.id, raw = ?parsed.updated_raw, "No usable timestamp, using crawl time");
                page.fetched_at
            }
        };

        Ok(Extraction {
            draft: ArticleDraft {
                id: page.id,
                title: parsed.title,
                body: truncate_markup(&body, self.max_body_chars),
                article_number: parsed.article_number,
                url: page.url.clone(),
                updated_at,
                updated_raw: parsed.updated_raw,
                crawled_at: page.fetched_at,
                content_hash: Some(page.content_hash.clone()),
                products: parsed.products,
                unresolved_resources: unresolved,
            },
            attachments: parsed.attachments,
            localized_images,
        })
    }

    fn parse(&self, page: &RawPage) -> std::result::Result<ParsedPage, ExtractError> {
        let base = Url::parse(&page.url)?;
        let doc = Html::parse_document(&page.html);

        let title = self
            .locator
            .locate_title(&doc)
            .map(|t| truncate_chars(&t, self.max_title_chars))
            .ok_or(ExtractError::MissingTitle)?;
        if is_not_found_title(&title) {
            return Err(ExtractError::NotFound(title));
        }
        let container = self.locator.locate_body(&doc).ok_or(ExtractError::MissingBody)?;
        let cleaned = clean_body(container, &base);

        let mut seen = HashSet::new();
        let products = self
            .locator
            .locate_products(&doc)
            .into_iter()
            .filter(|p| !p.is_empty() && p.chars().count() <= MAX_PRODUCT_CHARS)
            .filter(|p| seen.insert(p.to_lowercase()))
            .take(self.max_products)
            .collect();

        Ok(ParsedPage {
            title,
            body: cleaned.html,
            images: cleaned.images,
            article_number: self.locator.locate_article_number(&doc),
            updated_raw: self.locator.locate_updated(&doc),
            products,
            attachments: self.attachment_links(&doc, &base),
        })
    }

    fn attachment_links(&self, doc: &Html, base: &Url) -> Vec<AttachmentLink> {
        let api = self.locator.locate_attachment_api(doc);
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for region in self.locator.locate_attachment_regions(doc) {
            for el in region.select(&self.link_selector) {
                let file_id = el
                    .value()
                    .attr("data-uniquefileid")
                    .map(str::trim)
                    .filter(|id| !id.is_empty());
                let href = el
                    .value()
                    .attr("href")
                    .and_then(|h| base.join(h.trim()).ok())
                    .filter(|u| matches!(u.scheme(), "http" | "https"))
                    .filter(|u| {
                        let mut bare = u.clone();
                        bare.set_fragment(None);
                        bare.as_str() != base.as_str()
                    });

                let source = match (file_id, &api, href) {
                    (Some(file_id), Some(endpoint), _) => AttachmentSource::Api {
                        endpoint: endpoint.clone(),
                        file_id: file_id.to_string(),
                    },
                    (_, _, Some(url)) => AttachmentSource::Direct {
                        url: url.to_string(),
                    },
                    _ => continue,
                };
                if !seen.insert(source.clone()) {
                    continue;
                }

                links.push(AttachmentLink {
                    name: self.link_name(el),
                    source,
                });
            }
        }

        links
    }

    /// The card's file name label, else link text or title that looks like a file name.
    fn link_name(&self, link: ElementRef<'_>) -> Option<String> {
        let card_name = link
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|a| a.value().classes().any(|c| c.contains("attachment-card")))
            .and_then(|card| card.select(&self.card_name_selector).next())
            .map(|el| normalize_whitespace(&el.text().collect::<String>()))
            .filter(|n| !n.is_empty());
        if card_name.is_some() {
            return card_name;
        }

        let text = normalize_whitespace(&link.text().collect::<String>());
        let title = link.value().attr("title").map(normalize_whitespace);
        [Some(text), title]
            .into_iter()
            .flatten()
            .find(|n| n.contains('.') && !n.contains(' '))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    use crate::crawler::throttle::Throttle;

    const PAGE: &str = r##"<!DOCTYPE html>
<html><head><title>KB 380 | Support</title>
<script>var apiDomain = "https://api.example.com/"; var kbDownloadDomain = "kb-portal";</script>
<script>function date_time(){ var d='2024-03-07 14:30:05'; }</script>
</head><body>
<nav class="top-nav"><a href="/other/file.zip">Not an attachment</a></nav>
<div class="wolken-content-container">
  <h3 class="wolken-h3">  Upgrading   ESXi hosts </h3>
  <p>Article ID: 380</p>
  <p>See <img src="/images/upgrade.png" alt="steps"> and the
     <a href="https://kb.example.com/files/inline.zip">inline zip</a>.</p>
  <div class="feedback-widget">Was this helpful?</div>
</div>
<div class="product-container">
  <span class="product-chip">VMware vSphere ESXi</span>
  <span class="product-chip">vmware  vsphere esxi</span>
  <span class="product-chip">VMware vCenter Server</span>
</div>
<div class="attachment-container">
  <div class="attachment-card">
    <span class="attachment-name">logs bundle.tar.gz</span>
    <a href="#" data-uniquefileid="f-1">Download</a>
  </div>
  <div class="attachment-card">
    <a href="/files/notes.txt">notes.txt</a>
  </div>
</div>
</body></html>"##;

    fn config() -> Config {
        Config {
            delay_min_ms: 0,
            delay_max_ms: 0,
            requests_per_second: 1000,
            ..Config::default()
        }
    }

    fn page(html: &str) -> RawPage {
        RawPage {
            id: 380,
            url: "https://kb.example.com/external/article/380".to_string(),
            html: html.to_string(),
            content_hash: "hash".to_string(),
            fetched_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn parses_fields_from_article_layout() {
        let extractor = ContentExtractor::new(&config()).unwrap();
        let parsed = extractor.parse(&page(PAGE)).unwrap();

        assert_eq!(parsed.title, "Upgrading ESXi hosts");
        assert_eq!(parsed.article_number.as_deref(), Some("380"));
        assert_eq!(parsed.updated_raw.as_deref(), Some("2024-03-07 14:30:05"));
        assert_eq!(
            parsed.products,
            vec!["VMware vSphere ESXi", "VMware vCenter Server"]
        );
        assert_eq!(
            parsed.images,
            vec!["https://kb.example.com/images/upgrade.png"]
        );
        assert!(parsed.body.contains("Upgrading"));
        assert!(!parsed.body.contains("Was this helpful"));
    }

    #[test]
    fn only_links_inside_the_attachment_region_are_collected() {
        let extractor = ContentExtractor::new(&config()).unwrap();
        let parsed = extractor.parse(&page(PAGE)).unwrap();

        assert_eq!(
            parsed.attachments,
            vec![
                AttachmentLink {
                    name: Some("logs bundle.tar.gz".to_string()),
                    source: AttachmentSource::Api {
                        endpoint: "https://api.example.com/es/attachments/download_attachment?domain=kb-portal"
                            .to_string(),
                        file_id: "f-1".to_string(),
                    },
                },
                AttachmentLink {
                    name: Some("notes.txt".to_string()),
                    source: AttachmentSource::Direct {
                        url: "https://kb.example.com/files/notes.txt".to_string(),
                    },
                },
            ]
        );
    }

    #[test]
    fn missing_title_or_body_is_an_error() {
        let extractor = ContentExtractor::new(&config()).unwrap();

        let no_title = extractor.parse(&page(
            r#"<html><body><div class="wolken-content-container"><p>text</p></div></body></html>"#,
        ));
        assert!(matches!(no_title, Err(ExtractError::MissingTitle)));

        let no_body = extractor.parse(&page(
            r#"<html><head><title>Something</title></head><body><p>loose</p></body></html>"#,
        ));
        assert!(matches!(no_body, Err(ExtractError::MissingBody)));
    }

    #[test]
    fn located_title_announcing_a_missing_article_is_not_found() {
        let extractor = ContentExtractor::new(&config()).unwrap();

        let parsed = extractor.parse(&page(
            r#"<html><head><title>Broadcom Support Portal</title></head><body>
               <div class="wolken-content-container"><h3 class="wolken-h3">Article Not Found</h3>
               <p>The article you requested does not exist.</p></div></body></html>"#,
        ));
        assert!(matches!(parsed, Err(ExtractError::NotFound(t)) if t == "Article Not Found"));
    }

    #[test]
    fn printed_date_and_json_ld_are_used_when_no_script_date() {
        let extractor = ContentExtractor::new(&config()).unwrap();

        let printed = extractor
            .parse(&page(
                r#"<html><body><div class="article-container"><h1>T</h1>
                   <span>Updated On:</span><span> 05-21-2023 </span></div></body></html>"#,
            ))
            .unwrap();
        assert_eq!(printed.updated_raw.as_deref(), Some("05-21-2023"));

        let json_ld = extractor
            .parse(&page(
                r#"<html><head><script type="application/ld+json">
                   {"@context":"https://schema.org","dateModified":"2022-11-02T08:00:00Z"}
                   </script></head><body><article><h1>T</h1><p>b</p></article></body></html>"#,
            ))
            .unwrap();
        assert_eq!(json_ld.updated_raw.as_deref(), Some("2022-11-02T08:00:00Z"));
    }

    #[test]
    fn unrelated_script_variables_do_not_shadow_json_ld_date() {
        let extractor = ContentExtractor::new(&config()).unwrap();

        let parsed = extractor
            .parse(&page(
                r#"<html><head><script>var d = "analytics";</script>
                   <script type="application/ld+json">
                   {"@context":"https://schema.org","dateModified":"2022-11-02T08:00:00Z"}
                   </script></head><body><article><h1>T</h1><p>b</p></article></body></html>"#,
            ))
            .unwrap();
        assert_eq!(parsed.updated_raw.as_deref(), Some("2022-11-02T08:00:00Z"));
    }

    #[test]
    fn display_name_falls_back_to_url() {
        let link = AttachmentLink {
            name: None,
            source: AttachmentSource::Direct {
                url: "https://kb.example.com/files/My%20Report.pdf".to_string(),
            },
        };
        assert_eq!(link.display_name(), "My Report.pdf");
    }

    #[tokio::test]
    async fn localizes_images_and_keeps_failures_remote() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/img/ok.png")
            .with_body(vec![1u8; 64])
            .create_async()
            .await;
        server
            .mock("GET", "/img/broken.png")
            .with_status(500)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            static_root: dir.path().to_string_lossy().to_string(),
            ..config()
        };
        let localizer =
            ResourceLocalizer::new(&config, Arc::new(Throttle::from_config(&config)), false)
                .unwrap();
        let extractor = ContentExtractor::new(&config).unwrap();
        let html = format!(
            r#"<html><head><title>Images</title></head><body><article><h1>Images</h1>
               <img src="{0}/img/ok.png"><img src="{0}/img/broken.png">
               <p>Updated On: not a date</p></article></body></html>"#,
            server.url()
        );
        let mut raw = page(&html);
        raw.url = format!("{}/external/article/380", server.url());

        let extraction = extractor.extract(&raw, &localizer).await.unwrap();
        let draft = extraction.draft;

        assert_eq!(extraction.localized_images, 1);
        assert!(draft.body.contains(r#"src="/static/images/kb/380/ok-"#));
        assert!(draft.body.contains(&format!("{}/img/broken.png", server.url())));
        assert_eq!(
            draft.unresolved_resources,
            vec![format!("{}/img/broken.png", server.url())]
        );
        assert_eq!(draft.updated_at, raw.fetched_at);
        assert_eq!(draft.content_hash.as_deref(), Some("hash"));
    }
}
