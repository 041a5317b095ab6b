//! Renderer backends: a live HTTP one and an in-memory fixture one.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jobcrawl_storage::HttpFetcher;
use scraper::Html;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::extract::{is_disabled, parse_selector};
use crate::{RenderError, Renderer, RendererSession};

#[derive(Debug, Clone)]
struct LoadedPage {
    url: String,
    html: String,
}

/// Resolves the navigation target of the first element matching `selector`.
///
/// Static markup cannot run scripts, so a control is interactable only when
/// it is enabled and carries an `href`.
pub fn resolve_click_target(html: &str, page_url: &str, selector: &str) -> Result<String, RenderError> {
    let parsed = parse_selector(selector).map_err(|reason| RenderError::Selector {
        selector: selector.to_string(),
        reason,
    })?;
    let document = Html::parse_document(html);
    let element = document
        .select(&parsed)
        .next()
        .ok_or_else(|| RenderError::NotFound {
            selector: selector.to_string(),
        })?;
    let not_interactable = || RenderError::NotInteractable {
        selector: selector.to_string(),
    };
    if is_disabled(element) {
        return Err(not_interactable());
    }
    let href = element
        .value()
        .attr("href")
        .map(str::trim)
        .filter(|h| !h.is_empty() && !h.starts_with("javascript:"))
        .ok_or_else(not_interactable)?;
    let base = Url::parse(page_url).map_err(|e| RenderError::Navigation {
        url: page_url.to_string(),
        reason: e.to_string(),
    })?;
    base.join(href)
        .map(|u| u.to_string())
        .map_err(|e| RenderError::Navigation {
            url: href.to_string(),
            reason: e.to_string(),
        })
}

fn count_matches(html: &str, selector: &str) -> Result<usize, RenderError> {
    let parsed = parse_selector(selector).map_err(|reason| RenderError::Selector {
        selector: selector.to_string(),
        reason,
    })?;
    Ok(Html::parse_document(html).select(&parsed).count())
}

/// Renders pages by plain HTTP through the shared rate-limited fetcher.
#[derive(Debug, Clone)]
pub struct HttpRenderer {
    fetcher: Arc<HttpFetcher>,
}

impl HttpRenderer {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn open_session(
        &self,
        source_id: &str,
        run_id: Uuid,
    ) -> Result<Box<dyn RendererSession>, RenderError> {
        Ok(Box::new(HttpSession {
            fetcher: Arc::clone(&self.fetcher),
            source_id: source_id.to_string(),
            run_id,
            page: None,
            closed: false,
        }))
    }
}

struct HttpSession {
    fetcher: Arc<HttpFetcher>,
    source_id: String,
    run_id: Uuid,
    page: Option<LoadedPage>,
    closed: bool,
}

impl HttpSession {
    fn loaded(&self) -> Result<&LoadedPage, RenderError> {
        if self.closed {
            return Err(RenderError::Closed);
        }
        self.page.as_ref().ok_or(RenderError::NoPage)
    }
}

#[async_trait]
impl RendererSession for HttpSession {
    async fn goto(&mut self, url: &str) -> Result<(), RenderError> {
        if self.closed {
            return Err(RenderError::Closed);
        }
        let response = self
            .fetcher
            .fetch_bytes(self.run_id, &self.source_id, url)
            .await?;
        self.page = Some(LoadedPage {
            html: response.text(),
            url: response.final_url,
        });
        Ok(())
    }

    async fn content(&mut self) -> Result<String, RenderError> {
        Ok(self.loaded()?.html.clone())
    }

    async fn click(&mut self, selector: &str) -> Result<(), RenderError> {
        let page = self.loaded()?;
        let target = resolve_click_target(&page.html, &page.url, selector)?;
        self.goto(&target).await
    }

    async fn click_all(&mut self, selector: &str) -> Result<usize, RenderError> {
        // Server-rendered markup already carries the collapsed text.
        let matched = count_matches(&self.loaded()?.html, selector)?;
        debug!(selector, matched, "expand controls are inert without scripting");
        Ok(0)
    }

    fn current_url(&self) -> Option<String> {
        self.page.as_ref().map(|p| p.url.clone())
    }

    async fn close(&mut self) -> Result<(), RenderError> {
        self.closed = true;
        self.page = None;
        Ok(())
    }
}

/// Everything a fixture session did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened { source_id: String },
    Goto(String),
    Click(String),
    ClickAll(String),
    Closed { source_id: String },
}

/// Serves canned pages keyed by exact URL and records every interaction.
#[derive(Debug, Clone, Default)]
pub struct FixtureRenderer {
    pages: HashMap<String, String>,
    failing: HashSet<String>,
    stalled: HashSet<String>,
    refuse_sessions: Option<String>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl FixtureRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }

    /// Navigation to `url` fails with an error.
    pub fn with_failing_url(mut self, url: impl Into<String>) -> Self {
        self.failing.insert(url.into());
        self
    }

    /// Navigation to `url` never completes.
    pub fn with_stalled_url(mut self, url: impl Into<String>) -> Self {
        self.stalled.insert(url.into());
        self
    }

    pub fn refusing_sessions(mut self, reason: impl Into<String>) -> Self {
        self.refuse_sessions = Some(reason.into());
        self
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Goto(url) => Some(url),
                _ => None,
            })
            .collect()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Click(selector) => Some(selector),
                _ => None,
            })
            .collect()
    }

    pub fn open_sessions(&self) -> usize {
        self.events().iter().fold(0usize, |open, e| match e {
            SessionEvent::Opened { .. } => open + 1,
            SessionEvent::Closed { .. } => open.saturating_sub(1),
            _ => open,
        })
    }
}

fn record(events: &Mutex<Vec<SessionEvent>>, event: SessionEvent) {
    if let Ok(mut log) = events.lock() {
        log.push(event);
    }
}

#[async_trait]
impl Renderer for FixtureRenderer {
    async fn open_session(
        &self,
        source_id: &str,
        _run_id: Uuid,
    ) -> Result<Box<dyn RendererSession>, RenderError> {
        if let Some(reason) = &self.refuse_sessions {
            return Err(RenderError::Unavailable(reason.clone()));
        }
        record(
            &self.events,
            SessionEvent::Opened {
                source_id: source_id.to_string(),
            },
        );
        Ok(Box::new(FixtureSession {
            renderer: self.clone(),
            source_id: source_id.to_string(),
            page: None,
            closed: false,
        }))
    }
}

struct FixtureSession {
    renderer: FixtureRenderer,
    source_id: String,
    page: Option<LoadedPage>,
    closed: bool,
}

impl FixtureSession {
    fn loaded(&self) -> Result<&LoadedPage, RenderError> {
        if self.closed {
            return Err(RenderError::Closed);
        }
        self.page.as_ref().ok_or(RenderError::NoPage)
    }
}

#[async_trait]
impl RendererSession for FixtureSession {
    async fn goto(&mut self, url: &str) -> Result<(), RenderError> {
        if self.closed {
            return Err(RenderError::Closed);
        }
        record(&self.renderer.events, SessionEvent::Goto(url.to_string()));
        if self.renderer.stalled.contains(url) {
            std::future::pending::<()>().await;
        }
        if self.renderer.failing.contains(url) {
            return Err(RenderError::Navigation {
                url: url.to_string(),
                reason: "fixture marked as failing".to_string(),
            });
        }
        let html = self
            .renderer
            .pages
            .get(url)
            .cloned()
            .ok_or_else(|| RenderError::Navigation {
                url: url.to_string(),
                reason: "no fixture page for url".to_string(),
            })?;
        self.page = Some(LoadedPage {
            url: url.to_string(),
            html,
        });
        Ok(())
    }

    async fn content(&mut self) -> Result<String, RenderError> {
        Ok(self.loaded()?.html.clone())
    }

    async fn click(&mut self, selector: &str) -> Result<(), RenderError> {
        let page = self.loaded()?;
        let target = resolve_click_target(&page.html, &page.url, selector)?;
        record(&self.renderer.events, SessionEvent::Click(selector.to_string()));
        self.goto(&target).await
    }

    async fn click_all(&mut self, selector: &str) -> Result<usize, RenderError> {
        let matched = count_matches(&self.loaded()?.html, selector)?;
        record(&self.renderer.events, SessionEvent::ClickAll(selector.to_string()));
        Ok(matched)
    }

    fn current_url(&self) -> Option<String> {
        self.page.as_ref().map(|p| p.url.clone())
    }

    async fn close(&mut self) -> Result<(), RenderError> {
        if !self.closed {
            self.closed = true;
            record(
                &self.renderer.events,
                SessionEvent::Closed {
                    source_id: self.source_id.clone(),
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn click_target_resolves_relative_href() {
        let html = r#"<a class="next" href="?page=2">Next</a>"#;
        assert_eq!(
            resolve_click_target(html, "https://jobs.test/list?page=1", "a.next").unwrap(),
            "https://jobs.test/list?page=2"
        );
    }

    #[test]
    fn disabled_or_scripted_controls_are_not_interactable() {
        let disabled = r#"<a class="next" href="?page=2" aria-disabled="true">Next</a>"#;
        assert!(matches!(
            resolve_click_target(disabled, "https://jobs.test/", "a.next"),
            Err(RenderError::NotInteractable { .. })
        ));
        let scripted = r#"<button class="next">Next</button>"#;
        assert!(matches!(
            resolve_click_target(scripted, "https://jobs.test/", ".next"),
            Err(RenderError::NotInteractable { .. })
        ));
        assert!(matches!(
            resolve_click_target("<p></p>", "https://jobs.test/", ".next"),
            Err(RenderError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn fixture_session_records_interactions() {
        let renderer = FixtureRenderer::new()
            .with_page("https://jobs.test/1", r#"<a class="next" href="/2">n</a>"#)
            .with_page("https://jobs.test/2", "<p>done</p>");
        let mut session = renderer.open_session("fixture", Uuid::nil()).await.unwrap();

        assert!(matches!(session.content().await, Err(RenderError::NoPage)));
        session.goto("https://jobs.test/1").await.unwrap();
        session.click("a.next").await.unwrap();
        assert_eq!(session.current_url().as_deref(), Some("https://jobs.test/2"));
        assert_eq!(session.content().await.unwrap(), "<p>done</p>");
        assert_eq!(renderer.open_sessions(), 1);
        session.close().await.unwrap();

        assert_eq!(
            renderer.navigations(),
            vec!["https://jobs.test/1".to_string(), "https://jobs.test/2".to_string()]
        );
        assert_eq!(renderer.clicks(), vec!["a.next".to_string()]);
        assert_eq!(renderer.open_sessions(), 0);
        assert!(matches!(session.goto("https://jobs.test/1").await, Err(RenderError::Closed)));
    }

    #[tokio::test]
    async fn unknown_and_failing_urls_error() {
        let renderer = FixtureRenderer::new()
            .with_page("https://jobs.test/ok", "<p></p>")
            .with_failing_url("https://jobs.test/ok");
        let mut session = renderer.open_session("fixture", Uuid::nil()).await.unwrap();
        assert!(matches!(
            session.goto("https://jobs.test/ok").await,
            Err(RenderError::Navigation { .. })
        ));
        assert!(matches!(
            session.goto("https://jobs.test/missing").await,
            Err(RenderError::Navigation { .. })
        ));
    }

    #[tokio::test]
    async fn refused_sessions_surface_unavailable() {
        let renderer = FixtureRenderer::new().refusing_sessions("browser crashed");
        assert!(matches!(
            renderer.open_session("fixture", Uuid::nil()).await,
            Err(RenderError::Unavailable(_))
        ));
    }
}
