//! Postgres-backed [`JobStore`] with a storage-level unique natural key.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobcrawl_core::{JobFilter, JobPage, JobRecord, NormalizedPosting, PageRequest};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::{JobStore, StoreError, UpsertOutcome};

const RECORD_COLUMNS: &str =
    "id, title, company, location, description, posted_at, source_url, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("jobs schema migrated");
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<JobRecord, sqlx::Error> {
    Ok(JobRecord {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        location: row.try_get("location")?,
        description: row.try_get("description")?,
        posted_at: row.try_get("posted_at")?,
        source_url: row.try_get("source_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    let mut separator = " WHERE ";
    if let Some(company) = &filter.company {
        qb.push(separator).push("company = ").push_bind(company.clone());
        separator = " AND ";
    }
    if let Some(location) = &filter.location {
        qb.push(separator).push("location = ").push_bind(location.clone());
        separator = " AND ";
    }
    if let Some(from_date) = filter.from_date {
        qb.push(separator).push("posted_at >= ").push_bind(from_date);
    }
}

fn count_query(filter: &JobFilter) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM jobs");
    push_filter(&mut qb, filter);
    qb
}

/// Newest first; ties broken by insertion order, then id, so pages are stable.
fn page_query(filter: &JobFilter, page: PageRequest) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("SELECT {RECORD_COLUMNS} FROM jobs"));
    push_filter(&mut qb, filter);
    qb.push(" ORDER BY posted_at DESC, created_at DESC, id DESC LIMIT ")
        .push_bind(page.limit as i64)
        .push(" OFFSET ")
        .push_bind(page.offset() as i64);
    qb
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn upsert(
        &self,
        posting: &NormalizedPosting,
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        // xmax is zero only for a row version created by this INSERT.
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (id, identity_key, title, company, location, description,
                              posted_at, source_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            ON CONFLICT (identity_key) DO UPDATE
               SET description = EXCLUDED.description,
                   posted_at = EXCLUDED.posted_at,
                   updated_at = EXCLUDED.updated_at
            RETURNING id, title, company, location, description, posted_at, source_url,
                      created_at, updated_at, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(posting.identity_key())
        .bind(&posting.title)
        .bind(&posting.company)
        .bind(&posting.location)
        .bind(&posting.description)
        .bind(posting.posted_at)
        .bind(&posting.source_url)
        .bind(seen_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(UpsertOutcome {
            record: record_from_row(&row)?,
            created: row.try_get("inserted")?,
        })
    }

    async fn list_filtered(
        &self,
        filter: &JobFilter,
        page: PageRequest,
    ) -> Result<JobPage, StoreError> {
        let total: i64 = count_query(filter)
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut select = page_query(filter, page);
        let rows = select.build().fetch_all(&self.pool).await?;

        let jobs = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(JobPage {
            jobs,
            pagination: page.paginate(total.max(0) as u64),
        })
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(total.max(0) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ORDER: &str = " ORDER BY posted_at DESC, created_at DESC, id DESC";

    #[test]
    fn unfiltered_page_binds_limit_then_offset() {
        let qb = page_query(&JobFilter::default(), PageRequest::new(Some(3), Some(20)));
        assert_eq!(
            qb.sql(),
            format!("SELECT {RECORD_COLUMNS} FROM jobs{ORDER} LIMIT $1 OFFSET $2")
        );
    }

    #[test]
    fn every_filter_joins_with_and_in_bind_order() {
        let from = Utc.with_ymd_and_hms(2026, 1, 8, 0, 0, 0).single().unwrap();
        let filter = JobFilter::new(Some("Google".into()), Some("Seattle".into()), Some(from));
        let qb = page_query(&filter, PageRequest::default());
        assert_eq!(
            qb.sql(),
            format!(
                "SELECT {RECORD_COLUMNS} FROM jobs WHERE company = $1 AND location = $2 \
                 AND posted_at >= $3{ORDER} LIMIT $4 OFFSET $5"
            )
        );
    }

    #[test]
    fn partial_filter_starts_with_where() {
        let from = Utc.with_ymd_and_hms(2026, 1, 8, 0, 0, 0).single().unwrap();
        let filter = JobFilter::new(None, Some("Seattle".into()), Some(from));
        assert_eq!(
            count_query(&filter).sql(),
            "SELECT COUNT(*) FROM jobs WHERE location = $1 AND posted_at >= $2"
        );
        assert_eq!(
            count_query(&JobFilter::new(Some("Amazon".into()), None, None)).sql(),
            "SELECT COUNT(*) FROM jobs WHERE company = $1"
        );
        assert_eq!(count_query(&JobFilter::default()).sql(), "SELECT COUNT(*) FROM jobs");
    }
}
