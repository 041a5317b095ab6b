//! Declarative per-source configuration consumed by the generic adapter.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::pagination::PaginationMode;

const BUILTIN_SOURCES: &str = include_str!("../../../sources.yaml");

/// How one field is located inside a listing item (or a detail document).
///
/// Every key is optional. With nothing set the rule yields an empty string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FieldSpec {
    /// CSS selector relative to the item; absent means the item itself.
    pub selector: Option<String>,
    pub nth: Option<usize>,
    /// First match whose text contains this literal.
    pub containing: Option<String>,
    /// First match whose text matches this regex.
    pub matching: Option<String>,
    /// Match with the longest non-empty text.
    pub longest: bool,
    /// Read the next element sibling of the match.
    pub sibling: bool,
    pub attr: Option<String>,
    /// Built from other fields: `{native_id}`, `{title}`, `{title_slug}`.
    pub template: Option<String>,
    /// Regex applied to the value; group 1 when present, else the whole match.
    pub capture: Option<String>,
    /// Keep only the n-th whitespace-separated token.
    pub word: Option<usize>,
    pub strip: Vec<String>,
    pub fallback: Option<Box<FieldSpec>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FieldMap {
    pub title: FieldSpec,
    pub location: FieldSpec,
    pub date: FieldSpec,
    pub description: FieldSpec,
    pub link: FieldSpec,
    pub native_id: Option<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetailRule {
    /// Text following a heading; falls back to the body text between the
    /// heading and the earliest stop heading.
    Section {
        heading: String,
        #[serde(default)]
        stop_at: Vec<String>,
    },
    Field { field: FieldSpec },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetailSpec {
    #[serde(default = "default_ready_selector")]
    pub ready_selector: String,
    pub description: DetailRule,
}

fn default_ready_selector() -> String {
    "body".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceDescriptor {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Employer name when the source is a single company's site.
    #[serde(default)]
    pub company: Option<String>,
    pub start_url: String,
    pub list_selector: String,
    pub item_selector: String,
    /// Controls activated before extraction ("read more" toggles).
    #[serde(default)]
    pub expand_selector: Option<String>,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub pagination: PaginationMode,
    #[serde(default)]
    pub detail: Option<DetailSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceDescriptor>,
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        let registry: SourceRegistry =
            serde_yaml::from_str(text).context("parsing source registry")?;
        let mut seen = HashSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id `{}` in registry", source.source_id);
            }
        }
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Registry compiled into the binary from the workspace `sources.yaml`.
    pub fn builtin() -> Result<Self> {
        Self::parse(BUILTIN_SOURCES).context("loading built-in sources.yaml")
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceDescriptor> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}
