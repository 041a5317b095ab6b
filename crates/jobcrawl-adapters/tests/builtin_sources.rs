use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use jobcrawl_adapters::{
    page_url, AdapterSettings, DescriptorAdapter, FixtureRenderer, PaginationState, ScrapeContext,
    SessionEvent, SourceAdapter, SourceBatch, SourceRegistry,
};
use jobcrawl_core::{DateNormalizer, NormalizedPosting};
use jobcrawl_storage::BackoffPolicy;
use uuid::Uuid;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture(source_id: &str, name: &str) -> String {
    let path = workspace_root().join("fixtures").join(source_id).join(name);
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
}

async fn scrape(source_id: &str, renderer: &FixtureRenderer, max_pages: u32) -> SourceBatch {
    let registry = SourceRegistry::builtin().unwrap();
    let descriptor = registry.get(source_id).unwrap().clone();
    let adapter = DescriptorAdapter::new(
        descriptor,
        Arc::new(renderer.clone()),
        AdapterSettings {
            navigation_timeout: Duration::from_millis(200),
            content_wait: BackoffPolicy::immediate(1),
        },
    )
    .unwrap();
    adapter
        .scrape(&ScrapeContext {
            run_id: Uuid::new_v4(),
            max_pages,
        })
        .await
        .unwrap()
}

fn start_url(source_id: &str) -> String {
    SourceRegistry::builtin()
        .unwrap()
        .get(source_id)
        .unwrap()
        .start_url
        .clone()
}

#[tokio::test]
async fn amazon_follows_next_button_until_disabled() {
    let start = start_url("amazon");
    let renderer = FixtureRenderer::new()
        .with_page(start.clone(), fixture("amazon", "listing-page-1.html"))
        .with_page(
            "https://www.amazon.jobs/content/en/job-categories/software-development?page=2",
            fixture("amazon", "listing-page-2.html"),
        );

    let batch = scrape("amazon", &renderer, 5).await;

    assert_eq!(batch.pages_loaded, 2);
    assert_eq!(batch.final_state, PaginationState::Exhausted);
    assert_eq!(batch.postings.len(), 3);
    assert_eq!(renderer.clicks().len(), 1);
    assert!(renderer
        .events()
        .contains(&SessionEvent::ClickAll("button[class*='footer-module']".to_string())));
    assert_eq!(renderer.open_sessions(), 0);

    let first = &batch.postings[0];
    assert_eq!(first.title, "Software Development Engineer, AWS Lambda");
    assert_eq!(first.location, "USA, WA, Seattle");
    assert_eq!(first.raw_date, "2/15/2024");
    assert_eq!(
        first.description,
        "Build the serverless compute platform that millions of developers rely on."
    );
    assert_eq!(
        first.link,
        "https://www.amazon.jobs/en/jobs/2871234/software-development-engineer-aws-lambda"
    );
    assert_eq!(first.company.as_deref(), Some("Amazon"));

    let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).single().unwrap();
    let normalized = NormalizedPosting::from_raw(first.clone(), now, &DateNormalizer::utc());
    assert!(normalized.date_resolved);
    assert_eq!(
        normalized.posted_at,
        Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).single().unwrap()
    );
}

#[tokio::test]
async fn amazon_page_bound_stops_before_second_click() {
    let start = start_url("amazon");
    let renderer = FixtureRenderer::new()
        .with_page(start.clone(), fixture("amazon", "listing-page-1.html"))
        .with_page(
            "https://www.amazon.jobs/content/en/job-categories/software-development?page=2",
            fixture("amazon", "listing-page-2.html"),
        );

    let batch = scrape("amazon", &renderer, 1).await;

    assert_eq!(batch.pages_loaded, 1);
    assert_eq!(batch.postings.len(), 2);
    assert!(renderer.clicks().is_empty());
    assert_eq!(renderer.navigations(), vec![start]);
}

#[tokio::test]
async fn google_url_param_stops_on_empty_page() {
    let start = start_url("google");
    let page_1 = page_url(&start, "page", 1).unwrap();
    let page_2 = page_url(&start, "page", 2).unwrap();
    let renderer = FixtureRenderer::new()
        .with_page(page_1.clone(), fixture("google", "listing-page-1.html"))
        .with_page(page_2.clone(), fixture("google", "listing-page-2.html"));

    let batch = scrape("google", &renderer, 10).await;

    assert_eq!(renderer.navigations(), vec![page_1, page_2]);
    assert_eq!(batch.pages_loaded, 2);
    assert_eq!(batch.final_state, PaginationState::Exhausted);
    assert_eq!(batch.postings.len(), 2);

    let first = &batch.postings[0];
    assert_eq!(first.title, "Software Engineer III, Google Cloud");
    assert_eq!(first.location, "Bengaluru, Karnataka, India");
    assert_eq!(first.raw_date, "Posted 2 days ago");
    assert!(first.description.starts_with("Minimum qualifications"));
    assert!(first
        .link
        .starts_with("https://www.google.com/about/careers/applications/jobs/results/1234567-"));

    let second = &batch.postings[1];
    assert_eq!(second.title, "Staff Software Engineer, Android");
    assert_eq!(second.raw_date, "");
}

#[tokio::test]
async fn microsoft_builds_links_and_reads_detail_pages() {
    let start = start_url("microsoft");
    let detail_ok = "https://jobs.careers.microsoft.com/global/en/job/1701234/Software-Engineer-II";
    let renderer = FixtureRenderer::new()
        .with_page(
            page_url(&start, "pg", 1).unwrap(),
            fixture("microsoft", "listing-page-1.html"),
        )
        .with_page(detail_ok, fixture("microsoft", "detail-1701234.html"));

    let batch = scrape("microsoft", &renderer, 1).await;

    assert_eq!(batch.pages_loaded, 1);
    assert_eq!(batch.postings.len(), 2);

    let first = &batch.postings[0];
    assert_eq!(first.native_id.as_deref(), Some("1701234"));
    assert_eq!(first.title, "Software Engineer II");
    assert_eq!(first.location, "Redmond, Washington, United States");
    assert_eq!(first.raw_date, "Today");
    assert_eq!(first.link, detail_ok);
    assert_eq!(
        first.description,
        "Join the Azure Compute team and build the control plane that schedules millions of virtual machines."
    );

    // No fixture exists for the second detail page, so its fetch fails.
    let second = &batch.postings[1];
    assert_eq!(second.title, "Senior Software Engineer - Azure");
    assert_eq!(
        second.link,
        "https://jobs.careers.microsoft.com/global/en/job/1705678/Senior-Software-Engineer---Azure"
    );
    assert_eq!(second.description, "");
    assert_eq!(batch.detail_failures, 1);
    assert_eq!(renderer.open_sessions(), 0);
}

#[tokio::test]
async fn listing_failure_on_first_page_yields_empty_batch() {
    let start = start_url("microsoft");
    let renderer = FixtureRenderer::new().with_failing_url(page_url(&start, "pg", 1).unwrap());

    let batch = scrape("microsoft", &renderer, 3).await;

    assert_eq!(batch.final_state, PaginationState::Failed);
    assert!(batch.postings.is_empty());
    assert_eq!(batch.pages_loaded, 0);
    assert_eq!(renderer.open_sessions(), 0);
}
