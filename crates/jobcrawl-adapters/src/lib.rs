//! Source adapter contracts and the descriptor-driven adapter used by every
//! built-in career site.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use jobcrawl_core::RawPosting;
use jobcrawl_storage::{BackoffPolicy, FetchError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

mod descriptor;
mod extract;
mod pagination;
mod render;

pub use descriptor::{DetailRule, DetailSpec, FieldMap, FieldSpec, SourceDescriptor, SourceRegistry};
pub use extract::{ContentProbe, ExtractionEngine, ListingExtraction};
pub use pagination::{
    page_url, Advance, NextControl, PageObservation, PaginationController, PaginationMode,
    PaginationState,
};
pub use render::{resolve_click_target, FixtureRenderer, HttpRenderer, SessionEvent};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer unavailable: {0}")]
    Unavailable(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("no element matches `{selector}`")]
    NotFound { selector: String },
    #[error("element `{selector}` is not interactable")]
    NotInteractable { selector: String },
    #[error("{reason}")]
    Selector { selector: String, reason: String },
    #[error("no page loaded in session")]
    NoPage,
    #[error("session already closed")]
    Closed,
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("invalid link `{link}`: {reason}")]
    InvalidLink { link: String, reason: String },
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid descriptor for {source_id}: {reason}")]
    Descriptor { source_id: String, reason: String },
    #[error("could not open renderer session: {0}")]
    Session(#[source] RenderError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("navigation to {target} timed out after {timeout:?}")]
    NavigationTimeout { target: String, timeout: Duration },
    #[error("listing content never appeared at {url}")]
    ContentNotReady { url: String },
    #[error("invalid page url: {0}")]
    PageUrl(#[from] url::ParseError),
}

/// One isolated page context. Sessions are never shared between sources.
#[async_trait]
pub trait RendererSession: Send {
    async fn goto(&mut self, url: &str) -> Result<(), RenderError>;
    async fn content(&mut self) -> Result<String, RenderError>;
    async fn click(&mut self, selector: &str) -> Result<(), RenderError>;
    /// Activates every match; returns how many were activated.
    async fn click_all(&mut self, selector: &str) -> Result<usize, RenderError>;
    fn current_url(&self) -> Option<String>;
    async fn close(&mut self) -> Result<(), RenderError>;
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn open_session(
        &self,
        source_id: &str,
        run_id: Uuid,
    ) -> Result<Box<dyn RendererSession>, RenderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeContext {
    pub run_id: Uuid,
    pub max_pages: u32,
}

/// Everything one source produced during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBatch {
    pub source_id: String,
    pub postings: Vec<RawPosting>,
    pub pages_loaded: u32,
    pub final_state: PaginationState,
    /// Why pagination stopped early; the postings gathered so far are kept.
    pub failure: Option<String>,
    pub skipped_items: usize,
    pub detail_failures: usize,
}

impl SourceBatch {
    fn empty(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            postings: Vec::new(),
            pages_loaded: 0,
            final_state: PaginationState::Initial,
            failure: None,
            skipped_items: 0,
            detail_failures: 0,
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Errors only when no session could be opened. Later failures end
    /// pagination and are reported inside the batch.
    async fn scrape(&self, ctx: &ScrapeContext) -> Result<SourceBatch, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub navigation_timeout: Duration,
    /// Polling schedule while waiting for listing or detail content.
    pub content_wait: BackoffPolicy,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(30),
            content_wait: BackoffPolicy {
                max_retries: 8,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(2),
            },
        }
    }
}

/// Scrapes one source by following its [`SourceDescriptor`].
pub struct DescriptorAdapter {
    descriptor: SourceDescriptor,
    engine: ExtractionEngine,
    renderer: Arc<dyn Renderer>,
    settings: AdapterSettings,
}

impl std::fmt::Debug for DescriptorAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorAdapter")
            .field("source_id", &self.descriptor.source_id)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DescriptorAdapter {
    pub fn new(
        descriptor: SourceDescriptor,
        renderer: Arc<dyn Renderer>,
        settings: AdapterSettings,
    ) -> Result<Self, AdapterError> {
        let engine = ExtractionEngine::compile(&descriptor)?;
        Ok(Self {
            descriptor,
            engine,
            renderer,
            settings,
        })
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn crawl(&self, session: &mut dyn RendererSession, ctx: &ScrapeContext) -> SourceBatch {
        let mut batch = SourceBatch::empty(&self.descriptor.source_id);
        let mut pager = PaginationController::new(
            self.descriptor.pagination.clone(),
            self.descriptor.start_url.clone(),
            ctx.max_pages,
        );

        loop {
            let advance = match pager.next_advance() {
                Ok(Some(advance)) => advance,
                Ok(None) => break,
                Err(err) => {
                    pager.fail();
                    batch.failure = Some(AdapterError::from(err).to_string());
                    break;
                }
            };

            let html = match self.load_listing_page(session, &advance).await {
                Ok(html) => html,
                Err(AdapterError::Render(
                    RenderError::NotInteractable { selector } | RenderError::NotFound { selector },
                )) if matches!(advance, Advance::Click(_)) => {
                    debug!(selector = %selector, "next control cannot be activated; last page reached");
                    pager.exhaust();
                    break;
                }
                Err(err) => {
                    warn!(error = %err, pages_loaded = pager.pages_loaded(), "pagination stopped");
                    pager.fail();
                    batch.failure = Some(err.to_string());
                    break;
                }
            };

            let page_url = session.current_url().unwrap_or_default();
            let extraction = self.engine.extract_listing(&html, &page_url);
            for err in &extraction.skipped {
                warn!(error = %err, page_url = %page_url, "skipping malformed item");
            }
            pager.record(PageObservation {
                item_count: extraction.item_count,
                next_control: self.engine.next_control(&html),
            });
            debug!(
                page_url = %page_url,
                items = extraction.item_count,
                extracted = extraction.postings.len(),
                state = ?pager.state(),
                "listing page extracted"
            );
            batch.skipped_items += extraction.skipped.len();
            batch.postings.extend(extraction.postings);
        }

        batch.pages_loaded = pager.pages_loaded();
        batch.final_state = pager.state();

        if self.engine.has_detail() {
            batch.detail_failures = self.fill_descriptions(session, &mut batch.postings).await;
        }
        batch
    }

    async fn navigate(&self, session: &mut dyn RendererSession, url: &str) -> Result<(), AdapterError> {
        let timeout = self.settings.navigation_timeout;
        tokio::time::timeout(timeout, session.goto(url))
            .await
            .map_err(|_| AdapterError::NavigationTimeout {
                target: url.to_string(),
                timeout,
            })??;
        Ok(())
    }

    async fn load_listing_page(
        &self,
        session: &mut dyn RendererSession,
        advance: &Advance,
    ) -> Result<String, AdapterError> {
        match advance {
            Advance::Navigate(url) => self.navigate(session, url).await?,
            Advance::Click(selector) => {
                let timeout = self.settings.navigation_timeout;
                tokio::time::timeout(timeout, session.click(selector))
                    .await
                    .map_err(|_| AdapterError::NavigationTimeout {
                        target: selector.clone(),
                        timeout,
                    })??;
            }
        }

        let mut html = self.wait_for_listing(session).await?;
        if let Some(expand) = &self.descriptor.expand_selector {
            match session.click_all(expand).await {
                Ok(0) => {}
                Ok(expanded) => {
                    debug!(expanded, "expanded collapsed descriptions");
                    html = session.content().await?;
                }
                Err(err) => debug!(error = %err, "expand controls unavailable"),
            }
        }
        Ok(html)
    }

    /// Polls until at least one item is present. A container with no items is
    /// accepted once polling runs out, as an empty page.
    async fn wait_for_listing(&self, session: &mut dyn RendererSession) -> Result<String, AdapterError> {
        let policy = &self.settings.content_wait;
        let mut container_seen = None;
        for attempt in 0..=policy.max_retries {
            let html = session.content().await?;
            let probe = self.engine.probe(&html);
            if probe.item_count > 0 {
                return Ok(html);
            }
            if probe.container_present {
                container_seen = Some(html);
            }
            if attempt < policy.max_retries {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
        }
        container_seen.ok_or_else(|| AdapterError::ContentNotReady {
            url: session.current_url().unwrap_or_default(),
        })
    }

    async fn fetch_detail(&self, session: &mut dyn RendererSession, link: &str) -> Result<String, AdapterError> {
        self.navigate(session, link).await?;
        let policy = &self.settings.content_wait;
        for attempt in 0..=policy.max_retries {
            let html = session.content().await?;
            if self.engine.detail_ready(&html) {
                return Ok(self.engine.extract_detail(&html));
            }
            if attempt < policy.max_retries {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
        }
        Err(AdapterError::ContentNotReady {
            url: link.to_string(),
        })
    }

    /// Replaces each description with its detail-page text. A failed detail
    /// fetch leaves the description empty. Returns the number of failures.
    async fn fill_descriptions(&self, session: &mut dyn RendererSession, postings: &mut [RawPosting]) -> usize {
        let mut failures = 0;
        for posting in postings.iter_mut().filter(|p| !p.link.is_empty()) {
            match self.fetch_detail(session, &posting.link).await {
                Ok(text) => posting.description = text,
                Err(err) => {
                    warn!(link = %posting.link, error = %err, "detail fetch failed");
                    posting.description.clear();
                    failures += 1;
                }
            }
        }
        failures
    }
}

#[async_trait]
impl SourceAdapter for DescriptorAdapter {
    fn source_id(&self) -> &str {
        &self.descriptor.source_id
    }

    async fn scrape(&self, ctx: &ScrapeContext) -> Result<SourceBatch, AdapterError> {
        let span = info_span!("scrape_source", run_id = %ctx.run_id, source_id = %self.descriptor.source_id);
        async move {
            let mut session = self
                .renderer
                .open_session(&self.descriptor.source_id, ctx.run_id)
                .await
                .map_err(AdapterError::Session)?;

            let crawled = AssertUnwindSafe(self.crawl(session.as_mut(), ctx))
                .catch_unwind()
                .await;
            if let Err(err) = session.close().await {
                warn!(error = %err, "failed to release renderer session");
            }
            let batch = crawled.unwrap_or_else(|panic| std::panic::resume_unwind(panic));

            info!(
                postings = batch.postings.len(),
                pages = batch.pages_loaded,
                skipped = batch.skipped_items,
                detail_failures = batch.detail_failures,
                state = ?batch.final_state,
                "source scraped"
            );
            Ok(batch)
        }
        .instrument(span)
        .await
    }
}

/// Builds one adapter per enabled descriptor, all sharing `renderer`.
pub fn build_adapters(
    registry: &SourceRegistry,
    renderer: Arc<dyn Renderer>,
    settings: &AdapterSettings,
) -> Result<Vec<Arc<dyn SourceAdapter>>, AdapterError> {
    registry
        .enabled()
        .map(|descriptor| {
            DescriptorAdapter::new(descriptor.clone(), Arc::clone(&renderer), settings.clone())
                .map(|adapter| Arc::new(adapter) as Arc<dyn SourceAdapter>)
        })
        .collect()
}
