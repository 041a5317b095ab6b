//! Turns rendered markup into raw postings using a compiled [`SourceDescriptor`].
//!
//! Everything here is synchronous: a parsed `Html` never lives across an
//! await point.

use std::sync::OnceLock;

use jobcrawl_core::RawPosting;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::descriptor::{DetailRule, FieldSpec, SourceDescriptor};
use crate::pagination::{NextControl, PaginationMode};
use crate::{AdapterError, ExtractionError};

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("valid placeholder regex"))
}

fn heading_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| {
        Selector::parse("h1, h2, h3, h4, h5, h6, div, p, span, strong")
            .expect("valid heading selector")
    })
}

fn body_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| Selector::parse("body").expect("valid body selector"))
}

pub(crate) fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<String>())
}

fn next_element_sibling(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    el.next_siblings().find_map(ElementRef::wrap)
}

pub(crate) fn is_disabled(el: ElementRef<'_>) -> bool {
    let value = el.value();
    value.attr("disabled").is_some()
        || value.attr("aria-disabled") == Some("true")
        || value.classes().any(|c| c.eq_ignore_ascii_case("disabled"))
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, String> {
    Selector::parse(selector).map_err(|e| format!("invalid selector `{selector}`: {e}"))
}

#[derive(Debug, Default, Clone)]
struct TemplateValues {
    native_id: String,
    title: String,
}

#[derive(Debug)]
struct CompiledField {
    selector: Option<Selector>,
    nth: usize,
    containing: Option<String>,
    matching: Option<Regex>,
    longest: bool,
    sibling: bool,
    attr: Option<String>,
    template: Option<String>,
    capture: Option<Regex>,
    word: Option<usize>,
    strip: Vec<String>,
    fallback: Option<Box<CompiledField>>,
}

impl CompiledField {
    fn compile(spec: &FieldSpec) -> Result<Self, String> {
        let selector = spec.selector.as_deref().map(parse_selector).transpose()?;
        let matching = spec
            .matching
            .as_deref()
            .map(|p| Regex::new(p).map_err(|e| format!("invalid pattern `{p}`: {e}")))
            .transpose()?;
        let capture = spec
            .capture
            .as_deref()
            .map(|p| Regex::new(p).map_err(|e| format!("invalid pattern `{p}`: {e}")))
            .transpose()?;
        if let Some(template) = &spec.template {
            for caps in placeholder_re().captures_iter(template) {
                let name = &caps[1];
                if !matches!(name, "native_id" | "title" | "title_slug") {
                    return Err(format!("unknown template placeholder `{{{name}}}`"));
                }
            }
        }
        let fallback = spec
            .fallback
            .as_deref()
            .map(CompiledField::compile)
            .transpose()?
            .map(Box::new);

        Ok(Self {
            selector,
            nth: spec.nth.unwrap_or(0),
            containing: spec.containing.clone(),
            matching,
            longest: spec.longest,
            sibling: spec.sibling,
            attr: spec.attr.clone(),
            template: spec.template.clone(),
            capture,
            word: spec.word,
            strip: spec.strip.clone(),
            fallback,
        })
    }

    fn extract(&self, scope: ElementRef<'_>, values: &TemplateValues) -> String {
        let value = self.post_process(self.raw_value(scope, values));
        if value.is_empty() {
            if let Some(fallback) = &self.fallback {
                return fallback.extract(scope, values);
            }
        }
        value
    }

    fn raw_value(&self, scope: ElementRef<'_>, values: &TemplateValues) -> String {
        if let Some(template) = &self.template {
            return render_template(template, values);
        }
        let Some(mut target) = self.pick(scope) else {
            return String::new();
        };
        if self.sibling {
            match next_element_sibling(target) {
                Some(sibling) => target = sibling,
                None => return String::new(),
            }
        }
        match &self.attr {
            Some(attr) => target
                .value()
                .attr(attr)
                .map(collapse_whitespace)
                .unwrap_or_default(),
            None => element_text(target),
        }
    }

    fn pick<'a>(&self, scope: ElementRef<'a>) -> Option<ElementRef<'a>> {
        let candidates: Vec<ElementRef<'a>> = match &self.selector {
            Some(selector) => scope.select(selector).collect(),
            None => vec![scope],
        };

        if let Some(needle) = &self.containing {
            return candidates
                .into_iter()
                .find(|el| element_text(*el).contains(needle.as_str()));
        }
        if let Some(pattern) = &self.matching {
            return candidates
                .into_iter()
                .find(|el| pattern.is_match(&element_text(*el)));
        }
        if self.longest {
            // First of equally long candidates wins.
            let mut best: Option<(usize, ElementRef<'a>)> = None;
            for el in candidates {
                let len = element_text(el).len();
                if len > 0 && best.map_or(true, |(best_len, _)| len > best_len) {
                    best = Some((len, el));
                }
            }
            return best.map(|(_, el)| el);
        }
        candidates.into_iter().nth(self.nth)
    }

    fn post_process(&self, mut value: String) -> String {
        if let Some(capture) = &self.capture {
            value = match capture.captures(&value) {
                Some(caps) => caps
                    .get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
                None => String::new(),
            };
        }
        if let Some(index) = self.word {
            value = value
                .split_whitespace()
                .nth(index)
                .unwrap_or_default()
                .to_string();
        }
        for needle in &self.strip {
            if !needle.is_empty() {
                value = value.replace(needle.as_str(), "");
            }
        }
        collapse_whitespace(&value)
    }
}

fn render_template(template: &str, values: &TemplateValues) -> String {
    let referenced_missing = placeholder_re().captures_iter(template).any(|caps| {
        match &caps[1] {
            "native_id" => values.native_id.is_empty(),
            _ => values.title.is_empty(),
        }
    });
    if referenced_missing {
        return String::new();
    }
    let slug = values.title.split_whitespace().collect::<Vec<_>>().join("-");
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| match &caps[1] {
            "native_id" => values.native_id.clone(),
            "title" => values.title.clone(),
            _ => slug.clone(),
        })
        .into_owned()
}

fn resolve_link(base: Option<&Url>, link: &str) -> Result<String, ExtractionError> {
    let resolved = match base {
        Some(base) => base.join(link),
        None => Url::parse(link),
    };
    resolved
        .map(|u| u.to_string())
        .map_err(|e| ExtractionError::InvalidLink {
            link: link.to_string(),
            reason: e.to_string(),
        })
}

#[derive(Debug)]
struct CompiledFields {
    title: CompiledField,
    location: CompiledField,
    date: CompiledField,
    description: CompiledField,
    link: CompiledField,
    native_id: Option<CompiledField>,
}

#[derive(Debug)]
enum CompiledDetail {
    Section { heading: String, stop_at: Vec<String> },
    Field(CompiledField),
}

/// Whether the listing container is present and how many items it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentProbe {
    pub container_present: bool,
    pub item_count: usize,
}

#[derive(Debug, Default)]
pub struct ListingExtraction {
    pub postings: Vec<RawPosting>,
    /// Items that could not be turned into a posting.
    pub skipped: Vec<ExtractionError>,
    /// Items carrying neither a title nor a link.
    pub dropped: usize,
    pub item_count: usize,
}

/// Source-specific rules compiled once per adapter.
#[derive(Debug)]
pub struct ExtractionEngine {
    source_id: String,
    company: Option<String>,
    list: Selector,
    item: Selector,
    fields: CompiledFields,
    next: Option<Selector>,
    detail_ready: Option<Selector>,
    detail: Option<CompiledDetail>,
}

impl ExtractionEngine {
    pub fn compile(descriptor: &SourceDescriptor) -> Result<Self, AdapterError> {
        let invalid = |reason: String| AdapterError::Descriptor {
            source_id: descriptor.source_id.clone(),
            reason,
        };
        let field = |spec: &FieldSpec| CompiledField::compile(spec).map_err(invalid);

        let fields = CompiledFields {
            title: field(&descriptor.fields.title)?,
            location: field(&descriptor.fields.location)?,
            date: field(&descriptor.fields.date)?,
            description: field(&descriptor.fields.description)?,
            link: field(&descriptor.fields.link)?,
            native_id: descriptor.fields.native_id.as_ref().map(field).transpose()?,
        };
        let next = match &descriptor.pagination {
            PaginationMode::NextButton { selector } => Some(parse_selector(selector).map_err(invalid)?),
            _ => None,
        };
        let (detail_ready, detail) = match &descriptor.detail {
            Some(spec) => {
                let ready = parse_selector(&spec.ready_selector).map_err(invalid)?;
                let rule = match &spec.description {
                    DetailRule::Section { heading, stop_at } => CompiledDetail::Section {
                        heading: heading.clone(),
                        stop_at: stop_at.clone(),
                    },
                    DetailRule::Field { field: rule } => CompiledDetail::Field(field(rule)?),
                };
                (Some(ready), Some(rule))
            }
            None => (None, None),
        };

        Ok(Self {
            source_id: descriptor.source_id.clone(),
            company: descriptor.company.clone(),
            list: parse_selector(&descriptor.list_selector).map_err(invalid)?,
            item: parse_selector(&descriptor.item_selector).map_err(invalid)?,
            fields,
            next,
            detail_ready,
            detail,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn has_detail(&self) -> bool {
        self.detail.is_some()
    }

    pub fn probe(&self, html: &str) -> ContentProbe {
        let document = Html::parse_document(html);
        let mut containers = document.select(&self.list).peekable();
        let container_present = containers.peek().is_some();
        let item_count = containers.map(|c| c.select(&self.item).count()).sum();
        ContentProbe {
            container_present,
            item_count,
        }
    }

    /// State of the "next page" control; `Absent` for modes without one.
    pub fn next_control(&self, html: &str) -> NextControl {
        let Some(next) = &self.next else {
            return NextControl::Absent;
        };
        let document = Html::parse_document(html);
        match document.select(next).next() {
            None => NextControl::Absent,
            Some(el) if is_disabled(el) => NextControl::Disabled,
            Some(_) => NextControl::Enabled,
        }
    }

    /// Extracts every item on a listing page. A failing item is reported in
    /// `skipped` and never aborts the page.
    pub fn extract_listing(&self, html: &str, page_url: &str) -> ListingExtraction {
        let document = Html::parse_document(html);
        let base = Url::parse(page_url).ok();
        let mut out = ListingExtraction::default();

        for container in document.select(&self.list) {
            for item in container.select(&self.item) {
                out.item_count += 1;
                match self.extract_item(item, base.as_ref()) {
                    Ok(Some(posting)) => out.postings.push(posting),
                    Ok(None) => out.dropped += 1,
                    Err(err) => out.skipped.push(err),
                }
            }
        }
        out
    }

    fn extract_item(
        &self,
        item: ElementRef<'_>,
        base: Option<&Url>,
    ) -> Result<Option<RawPosting>, ExtractionError> {
        let mut values = TemplateValues::default();
        if let Some(native_id) = &self.fields.native_id {
            values.native_id = native_id.extract(item, &values);
        }
        let title = self.fields.title.extract(item, &values);
        values.title = title.clone();

        let location = self.fields.location.extract(item, &values);
        let raw_date = self.fields.date.extract(item, &values);
        let description = self.fields.description.extract(item, &values);
        let raw_link = self.fields.link.extract(item, &values);
        let link = if raw_link.is_empty() {
            String::new()
        } else {
            resolve_link(base, &raw_link)?
        };

        let posting = RawPosting {
            source_id: self.source_id.clone(),
            title,
            location,
            raw_date,
            description,
            link,
            native_id: (!values.native_id.is_empty()).then_some(values.native_id),
            company: self.company.clone(),
        };
        Ok(posting.has_identity().then_some(posting))
    }

    pub fn detail_ready(&self, html: &str) -> bool {
        match &self.detail_ready {
            Some(ready) => Html::parse_document(html).select(ready).next().is_some(),
            None => true,
        }
    }

    /// Description text from a detail page; empty when the rule finds nothing.
    pub fn extract_detail(&self, html: &str) -> String {
        let document = Html::parse_document(html);
        match &self.detail {
            None => String::new(),
            Some(CompiledDetail::Field(field)) => {
                field.extract(document.root_element(), &TemplateValues::default())
            }
            Some(CompiledDetail::Section { heading, stop_at }) => {
                section_text(&document, heading, stop_at)
            }
        }
    }
}

fn section_text(document: &Html, heading: &str, stop_at: &[String]) -> String {
    let Some(heading_el) = document
        .select(heading_selector())
        .find(|el| element_text(*el) == heading)
    else {
        return String::new();
    };

    let following = next_element_sibling(heading_el)
        .map(element_text)
        .unwrap_or_default();
    if !following.is_empty() {
        return following;
    }

    let body = document
        .select(body_selector())
        .next()
        .map(element_text)
        .unwrap_or_default();
    let Some(start) = body.find(heading) else {
        return String::new();
    };
    let rest = &body[start + heading.len()..];
    stop_at
        .iter()
        .filter_map(|stop| rest.find(stop.as_str()))
        .min()
        .map(|end| rest[..end].trim().to_string())
        .unwrap_or_default()
}
