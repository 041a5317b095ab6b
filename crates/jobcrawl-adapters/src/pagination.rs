//! Page-advance state machine shared by every source.

use serde::{Deserialize, Serialize};
use url::Url;

fn default_first_page() -> u32 {
    1
}

/// How a source moves from one listing page to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaginationMode {
    /// One listing page, no advance.
    #[default]
    Single,
    /// Page number carried in a query parameter of the start URL.
    UrlParam {
        param: String,
        #[serde(default = "default_first_page")]
        first: u32,
    },
    /// A "next" control activated in the current session.
    NextButton { selector: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationState {
    Initial,
    HasNext,
    Exhausted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextControl {
    Absent,
    Disabled,
    Enabled,
}

/// What the controller learned from a freshly loaded page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageObservation {
    pub item_count: usize,
    pub next_control: NextControl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Navigate(String),
    Click(String),
}

/// Returns `start_url` with `param` set to `page`, replacing an existing value
/// in place or appending it.
pub fn page_url(start_url: &str, param: &str, page: u32) -> Result<String, url::ParseError> {
    let mut url = Url::parse(start_url)?;
    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let value = page.to_string();
    match pairs.iter_mut().find(|(key, _)| key == param) {
        Some(pair) => pair.1 = value,
        None => pairs.push((param.to_string(), value)),
    }
    url.query_pairs_mut().clear().extend_pairs(pairs);
    Ok(url.to_string())
}

/// Drives one session's walk through listing pages.
///
/// The first advance loads the start page; every further advance is allowed
/// only while fewer than `max_pages` pages have been loaded.
#[derive(Debug, Clone)]
pub struct PaginationController {
    mode: PaginationMode,
    start_url: String,
    max_pages: u32,
    pages_loaded: u32,
    state: PaginationState,
}

impl PaginationController {
    pub fn new(mode: PaginationMode, start_url: impl Into<String>, max_pages: u32) -> Self {
        let state = if max_pages == 0 {
            PaginationState::Exhausted
        } else {
            PaginationState::Initial
        };
        Self {
            mode,
            start_url: start_url.into(),
            max_pages,
            pages_loaded: 0,
            state,
        }
    }

    pub fn state(&self) -> PaginationState {
        self.state
    }

    pub fn pages_loaded(&self) -> u32 {
        self.pages_loaded
    }

    pub fn next_advance(&self) -> Result<Option<Advance>, url::ParseError> {
        match self.state {
            PaginationState::Exhausted | PaginationState::Failed => return Ok(None),
            _ if self.pages_loaded >= self.max_pages => return Ok(None),
            PaginationState::Initial => {
                let url = match &self.mode {
                    PaginationMode::UrlParam { param, first } => {
                        page_url(&self.start_url, param, *first)?
                    }
                    _ => self.start_url.clone(),
                };
                return Ok(Some(Advance::Navigate(url)));
            }
            PaginationState::HasNext => {}
        }

        match &self.mode {
            PaginationMode::Single => Ok(None),
            PaginationMode::UrlParam { param, first } => {
                let page = first.saturating_add(self.pages_loaded);
                Ok(Some(Advance::Navigate(page_url(&self.start_url, param, page)?)))
            }
            PaginationMode::NextButton { selector } => Ok(Some(Advance::Click(selector.clone()))),
        }
    }

    /// Records a successfully loaded page and decides whether another exists.
    pub fn record(&mut self, observation: PageObservation) {
        if matches!(self.state, PaginationState::Exhausted | PaginationState::Failed) {
            return;
        }
        self.pages_loaded += 1;

        let more = match &self.mode {
            PaginationMode::Single => false,
            PaginationMode::UrlParam { .. } => observation.item_count > 0,
            PaginationMode::NextButton { .. } => observation.next_control == NextControl::Enabled,
        };
        self.state = if more && self.pages_loaded < self.max_pages {
            PaginationState::HasNext
        } else {
            PaginationState::Exhausted
        };
    }

    /// The next control exists but cannot be activated: the last page was
    /// already recorded.
    pub fn exhaust(&mut self) {
        if self.state != PaginationState::Failed {
            self.state = PaginationState::Exhausted;
        }
    }

    /// An advance or load step failed; items already collected stay valid.
    pub fn fail(&mut self) {
        self.state = PaginationState::Failed;
    }
}
