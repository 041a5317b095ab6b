//! Core domain model, date normalization and natural-key identity for jobcrawl.

use std::sync::{Mutex, OnceLock};

use chrono::{
    DateTime, Duration, FixedOffset, Local, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_PAGE_LIMIT: u32 = 10;
pub const MAX_PAGE_LIMIT: u32 = 50;

/// Posting as pulled out of rendered markup, before any normalization.
///
/// Every text field is empty rather than absent when the page did not
/// provide it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawPosting {
    pub source_id: String,
    pub title: String,
    pub location: String,
    pub raw_date: String,
    pub description: String,
    pub link: String,
    pub native_id: Option<String>,
    pub company: Option<String>,
}

impl RawPosting {
    /// Title and link together carry identity; an item with neither is noise.
    pub fn has_identity(&self) -> bool {
        !self.title.is_empty() || !self.link.is_empty()
    }
}

/// Posting with a resolved company and an absolute posting timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedPosting {
    pub source_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub posted_at: DateTime<Utc>,
    /// False when the raw date text was unparseable and `posted_at` fell back to now.
    pub date_resolved: bool,
    pub source_url: String,
    pub native_id: Option<String>,
}

impl NormalizedPosting {
    pub fn from_raw(raw: RawPosting, now: DateTime<Utc>, dates: &DateNormalizer) -> Self {
        let company = match raw.company.as_deref().map(str::trim) {
            Some(explicit) if !explicit.is_empty() => explicit.to_string(),
            _ => infer_company(&raw.link).to_string(),
        };
        let resolved = dates.normalize(&raw.raw_date, now);
        Self {
            source_id: raw.source_id,
            title: raw.title,
            company,
            location: raw.location,
            description: raw.description,
            posted_at: resolved.unwrap_or(now),
            date_resolved: resolved.is_some(),
            source_url: raw.link,
            native_id: raw.native_id,
        }
    }

    pub fn identity_key(&self) -> String {
        identity_key(&self.title, &self.company, &self.location)
    }
}

/// Durable job record as exposed by the persistence layer and the query API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: Uuid,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub posted_at: DateTime<Utc>,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn identity_key(&self) -> String {
        identity_key(&self.title, &self.company, &self.location)
    }
}

/// Trim, lowercase and collapse internal whitespace runs.
pub fn normalize_key_fragment(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Case- and whitespace-insensitive natural key over (title, company, location).
pub fn identity_key(title: &str, company: &str, location: &str) -> String {
    [title, company, location]
        .iter()
        .map(|part| normalize_key_fragment(part))
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Guess the employer from the posting link when the source did not name it.
pub fn infer_company(link: &str) -> &'static str {
    let lower = link.to_ascii_lowercase();
    if lower.contains("amazon") {
        "Amazon"
    } else if lower.contains("google") {
        "Google"
    } else if lower.contains("microsoft") {
        "Microsoft"
    } else {
        "Unknown"
    }
}

fn days_ago_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(\d+)\+?\s*days?\s+ago").expect("days-ago pattern is valid")
    })
}

fn month_day_year_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("M/D/YYYY pattern is valid")
    })
}

/// Where calendar dates without a time of day are anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CalendarZone {
    Fixed(FixedOffset),
    /// Host time zone, resolved per date so DST transitions are honoured.
    Local,
}

/// Resolves the three date dialects seen on career sites into absolute instants.
///
/// Rules are tried in order and the first match wins:
/// `today`, `<N> day(s) ago`, `M/D/YYYY`, then a generic timestamp parse.
/// Calendar dates without a time are placed at midnight in the configured zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateNormalizer {
    zone: CalendarZone,
}

impl Default for DateNormalizer {
    fn default() -> Self {
        Self::utc()
    }
}

impl DateNormalizer {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            zone: CalendarZone::Fixed(offset),
        }
    }

    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    /// Local midnight of each calendar date in the host's time zone.
    pub fn local() -> Self {
        Self {
            zone: CalendarZone::Local,
        }
    }

    pub fn normalize(&self, text: &str, reference_now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        if text.to_lowercase().contains("today") {
            return Some(reference_now);
        }

        if let Some(caps) = days_ago_pattern().captures(text) {
            let days: i64 = caps[1].parse().ok()?;
            return Duration::try_days(days).and_then(|d| reference_now.checked_sub_signed(d));
        }

        if let Some(caps) = month_day_year_pattern().captures(text) {
            let month: u32 = caps[1].parse().ok()?;
            let day: u32 = caps[2].parse().ok()?;
            let year: i32 = caps[3].parse().ok()?;
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                return self.at_local_midnight(date);
            }
        }

        self.parse_generic(text)
    }

    fn at_local_midnight(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        let naive = date.and_hms_opt(0, 0, 0)?;
        self.in_offset(naive)
    }

    /// Ambiguous wall-clock times take the earlier instant; skipped ones are
    /// unresolvable.
    fn in_offset(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self.zone {
            CalendarZone::Fixed(offset) => offset
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
            CalendarZone::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }

    fn parse_generic(&self, text: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
            return Some(dt.with_timezone(&Utc));
        }
        for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                return self.in_offset(naive);
            }
        }
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|date| self.at_local_midnight(date))
    }
}

/// Normalize with calendar dates interpreted in UTC.
pub fn normalize_date(text: &str, reference_now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    DateNormalizer::utc().normalize(text, reference_now)
}

/// Source of "now" for a scrape cycle; injected so cycles are reproducible.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Lenient page/limit pair; out-of-range input is corrected, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl PageRequest {
    /// A missing or zero limit means the default; anything else is clamped to `[1, 50]`.
    pub fn new(page: Option<i64>, limit: Option<i64>) -> Self {
        let page = page.unwrap_or(1).clamp(1, u32::MAX as i64) as u32;
        let limit = match limit {
            None | Some(0) => DEFAULT_PAGE_LIMIT,
            Some(v) => v.clamp(1, MAX_PAGE_LIMIT as i64) as u32,
        };
        Self { page, limit }
    }

    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.limit as u64
    }

    pub fn paginate(&self, total: u64) -> Pagination {
        Pagination {
            total,
            page: self.page,
            limit: self.limit,
            total_pages: total.div_ceil(self.limit as u64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<JobRecord>,
    pub pagination: Pagination,
}

/// Optional predicates for the filtered listing. Empty strings count as absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub company: Option<String>,
    pub location: Option<String>,
    pub from_date: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn new(
        company: Option<String>,
        location: Option<String>,
        from_date: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            company: company.filter(|s| !s.is_empty()),
            location: location.filter(|s| !s.is_empty()),
            from_date,
        }
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        if let Some(company) = &self.company {
            if &record.company != company {
                return false;
            }
        }
        if let Some(location) = &self.location {
            if &record.location != location {
                return false;
            }
        }
        if let Some(from) = self.from_date {
            if record.posted_at < from {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 15, 30, 0).single().unwrap()
    }

    #[test]
    fn today_resolves_to_reference_now() {
        assert_eq!(normalize_date("today", now()), Some(now()));
        assert_eq!(normalize_date("Posted Today", now()), Some(now()));
    }

    #[test]
    fn days_ago_subtracts_from_reference_now() {
        assert_eq!(
            normalize_date("3 days ago", now()),
            Some(now() - Duration::days(3))
        );
        assert_eq!(
            normalize_date("1 DAY AGO", now()),
            Some(now() - Duration::days(1))
        );
        assert_eq!(
            normalize_date("30+ days ago", now()),
            Some(now() - Duration::days(30))
        );
    }

    #[test]
    fn month_day_year_is_independent_of_now() {
        let expected = Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).single().unwrap();
        assert_eq!(normalize_date("2/15/2024", now()), Some(expected));
        let later = now() + Duration::days(400);
        assert_eq!(normalize_date("2/15/2024", later), Some(expected));
    }

    #[test]
    fn month_day_year_uses_configured_offset() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let normalizer = DateNormalizer::new(offset);
        let expected = Utc.with_ymd_and_hms(2024, 2, 14, 22, 0, 0).single().unwrap();
        assert_eq!(normalizer.normalize("2/15/2024", now()), Some(expected));
    }

    #[test]
    fn local_midnight_is_resolved_per_date() {
        let normalizer = DateNormalizer::local();
        for (text, date) in [
            ("1/15/2026", NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()),
            ("7/15/2026", NaiveDate::from_ymd_opt(2026, 7, 15).unwrap()),
        ] {
            let midnight = date.and_hms_opt(0, 0, 0).unwrap();
            let expected = Local
                .from_local_datetime(&midnight)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc));
            assert_eq!(normalizer.normalize(text, now()), expected, "{text}");
        }
    }

    #[test]
    fn generic_timestamps_are_accepted() {
        let expected = Utc.with_ymd_and_hms(2025, 11, 2, 8, 0, 0).single().unwrap();
        assert_eq!(normalize_date("2025-11-02T08:00:00Z", now()), Some(expected));
        assert_eq!(normalize_date("2025-11-02 08:00:00", now()), Some(expected));
        assert_eq!(
            normalize_date("2025-11-02", now()),
            Some(Utc.with_ymd_and_hms(2025, 11, 2, 0, 0, 0).single().unwrap())
        );
    }

    #[test]
    fn unparseable_text_is_unknown() {
        assert_eq!(normalize_date("not a date", now()), None);
        assert_eq!(normalize_date("", now()), None);
        assert_eq!(normalize_date("2/30/2024", now()), None);
    }

    #[test]
    fn normalized_posting_falls_back_to_now_and_infers_company() {
        let raw = RawPosting {
            source_id: "google".into(),
            title: "SRE".into(),
            raw_date: "sometime".into(),
            link: "https://www.google.com/about/careers/applications/jobs/results/1".into(),
            ..Default::default()
        };
        let posting = NormalizedPosting::from_raw(raw, now(), &DateNormalizer::utc());
        assert_eq!(posting.company, "Google");
        assert_eq!(posting.posted_at, now());
        assert!(!posting.date_resolved);
    }

    #[test]
    fn explicit_company_wins_over_inference() {
        let raw = RawPosting {
            title: "SDE".into(),
            link: "https://amazon.jobs/en/jobs/1".into(),
            company: Some("AWS".into()),
            ..Default::default()
        };
        let posting = NormalizedPosting::from_raw(raw, now(), &DateNormalizer::utc());
        assert_eq!(posting.company, "AWS");
        assert_eq!(infer_company("https://example.org/jobs"), "Unknown");
        assert_eq!(infer_company("https://jobs.careers.MICROSOFT.com/x"), "Microsoft");
    }

    #[test]
    fn identity_key_ignores_case_and_whitespace_drift() {
        assert_eq!(
            identity_key("  Software   Engineer ", "Google", "Mountain View, CA"),
            identity_key("software engineer", "GOOGLE", "mountain view,  ca")
        );
        assert_ne!(
            identity_key("Engineer", "Google", "NYC"),
            identity_key("Engineer", "Google", "SF")
        );
    }

    #[test]
    fn page_request_is_lenient() {
        assert_eq!(PageRequest::new(None, None), PageRequest { page: 1, limit: 10 });
        assert_eq!(PageRequest::new(Some(-4), Some(500)), PageRequest { page: 1, limit: 50 });
        assert_eq!(PageRequest::new(Some(3), Some(-1)), PageRequest { page: 3, limit: 1 });
        assert_eq!(PageRequest::new(Some(2), Some(0)).limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(PageRequest::new(Some(3), Some(20)).offset(), 40);
        assert_eq!(PageRequest::new(None, Some(20)).paginate(41).total_pages, 3);
    }

    #[test]
    fn filter_from_date_is_inclusive() {
        let d = now();
        let record = |posted_at| JobRecord {
            id: Uuid::new_v4(),
            title: "t".into(),
            company: "Amazon".into(),
            location: "Seattle".into(),
            description: String::new(),
            posted_at,
            source_url: String::new(),
            created_at: d,
            updated_at: d,
        };
        let filter = JobFilter::new(Some(String::new()), None, Some(d));
        assert!(filter.company.is_none());
        assert!(filter.matches(&record(d)));
        assert!(!filter.matches(&record(d - Duration::nanoseconds(1))));
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(now());
        clock.advance(Duration::hours(1));
        assert_eq!(clock.now(), now() + Duration::hours(1));
    }
}
