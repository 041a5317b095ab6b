use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use jobcrawl_adapters::{build_adapters, AdapterSettings, FixtureRenderer, SourceRegistry};
use jobcrawl_core::{FixedClock, JobFilter, PageRequest};
use jobcrawl_storage::{BackoffPolicy, JobStore, MemoryJobStore};
use jobcrawl_sync::{Orchestrator, SourceStatus};

const SOURCES: &str = r#"
sources:
  - source_id: alpha
    display_name: Alpha
    company: Alpha Corp
    start_url: https://alpha.test/jobs
    list_selector: ul.jobs
    item_selector: li
    fields:
      title: { selector: h3 }
      location: { selector: .loc }
      date: { selector: .posted }
      link: { selector: a, attr: href }
  - source_id: beta
    display_name: Beta
    start_url: https://beta.test/careers
    list_selector: ul.jobs
    item_selector: li
    fields:
      title: { selector: h3 }
  - source_id: gamma
    display_name: Gamma
    company: Gamma Inc
    start_url: https://gamma.test/openings
    list_selector: ul.jobs
    item_selector: li
    fields:
      title: { selector: h3 }
      location: { selector: .loc }
      date: { selector: .posted }
      link: { selector: a, attr: href }
"#;

fn listing(items: &[(&str, &str, &str)]) -> String {
    let items = items
        .iter()
        .enumerate()
        .map(|(i, (title, loc, posted))| {
            format!(
                r#"<li><h3>{title}</h3><span class="loc">{loc}</span><span class="posted">{posted}</span><a href="/job/{i}">apply</a></li>"#
            )
        })
        .collect::<String>();
    format!(r#"<html><body><ul class="jobs">{items}</ul></body></html>"#)
}

fn renderer() -> FixtureRenderer {
    FixtureRenderer::new()
        .with_page(
            "https://alpha.test/jobs",
            listing(&[
                ("Backend Engineer", "Austin, TX", "today"),
                ("Data Engineer", "Remote", "2 days ago"),
            ]),
        )
        .with_failing_url("https://beta.test/careers")
        .with_page(
            "https://gamma.test/openings",
            listing(&[
                ("SRE", "Berlin", "3/1/2026"),
                ("Platform Lead", "Berlin", "1 day ago"),
                ("QA Analyst", "Lisbon", "whenever"),
            ]),
        )
}

#[tokio::test]
async fn repeated_cycles_converge_on_one_record_per_posting() {
    let registry = SourceRegistry::parse(SOURCES).unwrap();
    let renderer = renderer();
    let adapters = build_adapters(
        &registry,
        Arc::new(renderer.clone()),
        &AdapterSettings {
            navigation_timeout: Duration::from_millis(200),
            content_wait: BackoffPolicy::immediate(1),
        },
    )
    .unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let start = Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).single().unwrap();
    let clock = Arc::new(FixedClock::new(start));
    let orchestrator = Orchestrator::new(adapters, store.clone(), clock.clone())
        .with_write_retry(BackoffPolicy::immediate(1));

    let first = orchestrator.run_cycle().await.unwrap();
    assert_eq!(first.scraped, 5);
    assert_eq!(first.inserted, 5);
    assert_eq!(first.unresolved_dates, 1);
    assert_eq!(first.sources[0].status, SourceStatus::Completed);
    assert!(matches!(first.sources[1].status, SourceStatus::Partial { .. }));
    assert_eq!(first.sources[1].postings, 0);
    assert_eq!(store.count().await.unwrap(), 5);
    assert_eq!(renderer.open_sessions(), 0);

    let before = store.snapshot().await;

    clock.advance(chrono::Duration::hours(1));
    let second = orchestrator.run_cycle().await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 5);
    assert_eq!(store.count().await.unwrap(), 5);

    let after = store.snapshot().await;
    for record in &after {
        let earlier = before.iter().find(|r| r.id == record.id).unwrap();
        assert_eq!(record.created_at, earlier.created_at);
        assert_eq!(record.created_at, start);
        assert_eq!(record.updated_at, start + chrono::Duration::hours(1));
    }

    let gamma = store
        .list_filtered(
            &JobFilter::new(Some("Gamma Inc".into()), Some("Berlin".into()), None),
            PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(gamma.pagination.total, 2);
    assert_eq!(gamma.jobs[0].title, "Platform Lead");
    assert_eq!(gamma.jobs[1].title, "SRE");
    assert_eq!(gamma.jobs[0].source_url, "https://gamma.test/job/1");
}
