use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use mockito::{Mock, ServerGuard};
use tempfile::TempDir;
use tokio::sync::watch;

use kb_crawler::crawler::{CrawlOptions, CrawlTargets, Crawler};
use kb_crawler::db::Repository;
use kb_crawler::models::ArticleDraft;
use kb_crawler::Config;

fn test_config(server: &ServerGuard, dir: &TempDir) -> Config {
    Config {
        db_path: dir.path().join("kb.db").to_string_lossy().to_string(),
        static_root: dir.path().join("static").to_string_lossy().to_string(),
        base_url: format!("{}/external/article/", server.url()),
        workers: 4,
        retry_backoff_ms: 0,
        delay_min_ms: 0,
        delay_max_ms: 0,
        requests_per_second: 1000,
        ..Config::default()
    }
}

fn article_page(id: u64, products: &[&str], image: bool, extra: &str) -> String {
    let chips: String = products
        .iter()
        .map(|p| format!(r#"<span class="product-chip">{}</span>"#, p))
        .collect();
    let img = if image {
        format!(r#"<img src="/img/{}.png" alt="diagram">"#, id)
    } else {
        String::new()
    };
    format!(
        r#"<!DOCTYPE html><html><head><title>KB {id}</title>
<script>function date_time(){{ var d='2024-05-0{day} 10:00:00'; }}</script></head>
<body><div class="wolken-content-container">
<h3 class="wolken-h3">Resolution for issue {id}</h3>
<p>Article ID: {id}</p><p>Steps to resolve. {img}</p>
</div>
<div class="product-container">{chips}</div>
{extra}
</body></html>"#,
        id = id,
        day = id % 9 + 1,
        img = img,
        chips = chips,
        extra = extra,
    )
}

async fn page_mock(server: &mut ServerGuard, id: u64, body: String) -> Mock {
    server
        .mock("GET", format!("/external/article/{}", id).as_str())
        .with_status(200)
        .with_header("content-type", "text/html; charset=utf-8")
        .with_body(body)
        .create_async()
        .await
}

fn seed_draft(id: u64, products: Vec<String>) -> ArticleDraft {
    let now = Utc::now();
    ArticleDraft {
        id,
        title: format!("Existing {}", id),
        body: "<p>stored earlier</p>".to_string(),
        article_number: Some(id.to_string()),
        url: format!("https://kb.example.com/external/article/{}", id),
        updated_at: now,
        updated_raw: None,
        crawled_at: now,
        content_hash: None,
        products,
        unresolved_resources: Vec::new(),
    }
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

#[tokio::test]
async fn range_crawl_reports_each_outcome() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, &dir);
    let shared = ["VMware vSphere ESXi", "VMware vCenter Server"];

    let untouched = server
        .mock("GET", "/external/article/100")
        .expect(0)
        .create_async()
        .await;
    server
        .mock("GET", "/external/article/101")
        .with_status(404)
        .create_async()
        .await;
    for id in 102..=104 {
        page_mock(&mut server, id, article_page(id, &shared, true, "")).await;
        server
            .mock("GET", format!("/img/{}.png", id).as_str())
            .with_body(vec![id as u8; 256])
            .create_async()
            .await;
    }
    let flaky = server
        .mock("GET", "/external/article/105")
        .with_status(500)
        .expect(2)
        .create_async()
        .await;
    let recovered = server
        .mock("GET", "/external/article/105")
        .with_status(200)
        .with_body(article_page(105, &shared, false, ""))
        .expect(1)
        .create_async()
        .await;

    let repo = Arc::new(Repository::new(&config.db_path).await.unwrap());
    repo.upsert_article(seed_draft(100, Vec::new()), Vec::new(), false)
        .await
        .unwrap();

    let crawler = Crawler::new(&config, Arc::clone(&repo), false).unwrap();
    let summary = Arc::new(crawler)
        .run(
            CrawlTargets::range(100, 105).unwrap(),
            CrawlOptions {
                workers: config.workers,
                force: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.not_found, 1);
    assert_eq!(summary.committed, 4);
    assert_eq!(summary.failed, 0);
    assert!(!summary.interrupted);
    assert_eq!(summary.not_attempted, 0);

    assert_eq!(repo.count_products().await.unwrap(), 2);
    assert_eq!(repo.count_articles().await.unwrap(), 5);
    assert_eq!(count_files(&config.images_dir()), 3);

    // Every image in a committed body points at a file that exists.
    for id in 102..=104 {
        let article = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.title, format!("Resolution for issue {}", id));
        assert!(!article.body.contains(&server.url()));
        let start = article.body.find("/static/images/kb/").unwrap();
        let local_ref = &article.body[start..];
        let local_ref = &local_ref[..local_ref.find('"').unwrap()];
        let relative = local_ref.trim_start_matches("/static/images/kb/");
        assert!(config.images_dir().join(relative).is_file());

        let products: Vec<_> = repo
            .article_products(id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(products, vec!["VMware vCenter Server", "VMware vSphere ESXi"]);
    }

    let seeded = repo.get_article(100).await.unwrap().unwrap();
    assert_eq!(seeded.title, "Existing 100");

    untouched.assert_async().await;
    flaky.assert_async().await;
    recovered.assert_async().await;
}

#[tokio::test]
async fn second_unforced_crawl_is_skipped_and_force_replaces_products() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, &dir);

    let first = server
        .mock("GET", "/external/article/200")
        .with_body(article_page(200, &["ESXi", "vCenter"], false, ""))
        .expect(1)
        .create_async()
        .await;
    let second = server
        .mock("GET", "/external/article/200")
        .with_body(article_page(200, &["ESXi", "NSX"], false, ""))
        .expect(1)
        .create_async()
        .await;

    let repo = Arc::new(Repository::new(&config.db_path).await.unwrap());
    let crawler = Arc::new(Crawler::new(&config, Arc::clone(&repo), false).unwrap());
    let options = |force| CrawlOptions { workers: 2, force };
    let target = CrawlTargets::single(200).unwrap();

    let initial = Arc::clone(&crawler).run(target, options(false)).await.unwrap();
    assert_eq!(initial.committed, 1);

    let repeat = Arc::clone(&crawler).run(target, options(false)).await.unwrap();
    assert_eq!(repeat.skipped, 1);
    assert_eq!(repeat.committed, 0);
    assert_eq!(repo.count_articles().await.unwrap(), 1);

    let forced = Arc::clone(&crawler).run(target, options(true)).await.unwrap();
    assert_eq!(forced.committed, 1);

    let products: Vec<_> = repo
        .article_products(200)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(products, vec!["ESXi", "NSX"]);
    assert_eq!(repo.count_products().await.unwrap(), 3);
    assert_eq!(repo.count_articles().await.unwrap(), 1);

    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn attachment_policy_is_enforced_inside_the_pipeline() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        max_attachment_bytes: 2048,
        ..test_config(&server, &dir)
    };

    let section = r#"<div class="attachment-container">
  <div class="attachment-card"><a href="/files/notes.txt">notes.txt</a></div>
  <div class="attachment-card"><a href="/files/tool.exe">tool.exe</a></div>
  <div class="attachment-card"><a href="/files/huge.zip">huge.zip</a></div>
</div>
<p><a href="/files/elsewhere.pdf">elsewhere.pdf</a></p>"#;
    page_mock(&mut server, 300, article_page(300, &["ESXi"], false, section)).await;
    server
        .mock("GET", "/files/notes.txt")
        .with_body("first line\nsecond line\n")
        .create_async()
        .await;
    let exe = server
        .mock("GET", "/files/tool.exe")
        .expect(0)
        .create_async()
        .await;
    let outside = server
        .mock("GET", "/files/elsewhere.pdf")
        .expect(0)
        .create_async()
        .await;
    server
        .mock("GET", "/files/huge.zip")
        .with_body(vec![0u8; 8192])
        .create_async()
        .await;

    let repo = Arc::new(Repository::new(&config.db_path).await.unwrap());
    let crawler = Arc::new(Crawler::new(&config, Arc::clone(&repo), false).unwrap());
    let summary = crawler
        .run(
            CrawlTargets::single(300).unwrap(),
            CrawlOptions {
                workers: 1,
                force: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(summary.committed, 1);
    assert_eq!(summary.attachments_saved, 1);
    assert_eq!(summary.attachment_failures, 1);

    let attachments = repo.article_attachments(300).await.unwrap();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].filename, "notes.txt");
    assert_eq!(attachments[0].size, 23);

    let article_dir = config.attachments_dir().join("300");
    assert_eq!(count_files(&article_dir), 1);
    assert!(article_dir.join("notes.txt").is_file());

    exe.assert_async().await;
    outside.assert_async().await;
}

#[tokio::test]
async fn shutdown_stops_handing_out_ids() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, &dir);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shutdown is requested while the first article is being served.
    let first_page = article_page(400, &["ESXi"], false, "");
    let first = server
        .mock("GET", "/external/article/400")
        .with_chunked_body(move |w| {
            use std::io::Write;
            let _ = shutdown_tx.send(true);
            w.write_all(first_page.as_bytes())
        })
        .expect(1)
        .create_async()
        .await;
    let rest = server
        .mock("GET", mockito::Matcher::Regex(r"^/external/article/40[1-4]$".to_string()))
        .expect(0)
        .create_async()
        .await;

    let repo = Arc::new(Repository::new(&config.db_path).await.unwrap());
    let crawler = Crawler::new(&config, Arc::clone(&repo), false)
        .unwrap()
        .with_shutdown(shutdown_rx);
    let summary = Arc::new(crawler)
        .run(
            CrawlTargets::range(400, 404).unwrap(),
            CrawlOptions {
                workers: 1,
                force: false,
            },
        )
        .await
        .unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.committed, 1);
    assert_eq!(summary.not_attempted, 4);
    assert_eq!(repo.count_articles().await.unwrap(), 1);
    let stored = repo.get_article(400).await.unwrap().unwrap();
    assert_eq!(stored.title, "Resolution for issue 400");
    assert_eq!(repo.article_products(400).await.unwrap().len(), 1);

    first.assert_async().await;
    rest.assert_async().await;
}

#[tokio::test]
async fn placeholder_article_is_counted_as_not_found() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, &dir);

    page_mock(
        &mut server,
        500,
        r#"<html><head><title>Broadcom Support Portal</title></head><body>
<div class="wolken-content-container"><h3 class="wolken-h3">Article Not Found</h3>
<p>The requested article is unavailable.</p></div></body></html>"#
            .to_string(),
    )
    .await;

    let repo = Arc::new(Repository::new(&config.db_path).await.unwrap());
    let crawler = Arc::new(Crawler::new(&config, Arc::clone(&repo), false).unwrap());
    let summary = crawler
        .run(
            CrawlTargets::single(500).unwrap(),
            CrawlOptions {
                workers: 1,
                force: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(summary.not_found, 1);
    assert_eq!(summary.committed, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(repo.count_articles().await.unwrap(), 0);
}
