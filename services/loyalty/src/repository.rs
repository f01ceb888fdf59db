use crate::config::DatabaseConfig;
use crate::loyalty;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Loyalty program member
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Member {
    pub id: Uuid,
    /// Display name, used for the derived document file name
    pub name: String,
    pub phone: String,
    pub age: Option<i32>,
    /// Accumulated loyalty points; mutated only by result bookkeeping
    pub points: f64,
    /// Current tier, if the member has been assigned one
    pub tier_id: Option<i64>,
}

/// Tier reference data. Ids double as ordinals: a higher id is a higher tier.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TierDefinition {
    pub id: i64,
    pub title: String,
    pub description: String,
    /// Personal conversion rate (percent): points granted per unit of cost
    pub pcr: f64,
    /// Referral conversion rate (percent)
    pub rcr: f64,
    /// Points threshold at which a member qualifies for this tier
    pub min_points: f64,
}

/// Test type reference data
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TestType {
    pub id: Uuid,
    pub title: String,
}

/// A committed test-result fact
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TestResultRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub type_id: Uuid,
    pub cost: f64,
    /// Object store key of the result document
    pub file_path: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A test-result fact pending insertion
#[derive(Debug, Clone)]
pub struct NewResult {
    pub user_id: Uuid,
    pub type_id: Uuid,
    pub cost: f64,
    pub file_path: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of the bookkeeping transaction
#[derive(Debug, Clone, Copy)]
pub struct RecordedResult {
    pub fact_id: Uuid,
    pub new_points_total: f64,
    pub tier_upgraded: bool,
}

/// Member projection used by the statistics aggregator
#[derive(Debug, Clone, FromRow)]
pub struct MemberRollup {
    pub id: Uuid,
    pub points: f64,
    pub tier_id: Option<i64>,
}

/// Fact projection used by the statistics aggregator
#[derive(Debug, Clone, FromRow)]
pub struct FactRollup {
    pub type_id: Uuid,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

/// Query parameters for the result listing
#[derive(Debug, Clone, Default)]
pub struct ResultQuery {
    /// Filter by member
    pub user_id: Option<Uuid>,
    /// Restrict to facts created on this calendar day (UTC)
    pub date: Option<NaiveDate>,
    /// 1-based page number; values below 1 are treated as 1
    pub page: i64,
    /// Page size; 0 falls back to the default of 10
    pub per_page: i64,
}

impl ResultQuery {
    const DEFAULT_PER_PAGE: i64 = 10;
    const MAX_PER_PAGE: i64 = 100;

    fn page(&self) -> i64 {
        self.page.max(1)
    }

    fn per_page(&self) -> i64 {
        match self.per_page {
            n if n <= 0 => Self::DEFAULT_PER_PAGE,
            n => n.min(Self::MAX_PER_PAGE),
        }
    }

    fn offset(&self) -> i64 {
        (self.page() - 1) * self.per_page()
    }

    fn day_bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.date.map(|d| {
            let start = d.and_time(NaiveTime::MIN).and_utc();
            (start, start + Duration::days(1))
        })
    }
}

/// A page of test-result facts
#[derive(Debug, Clone, Serialize)]
pub struct ResultPage {
    pub results: Vec<TestResultRecord>,
    pub total_count: i64,
    pub page: i64,
    pub total_pages: i64,
}

/// Relational storage boundary for members, tiers, test types and facts.
///
/// `record_result` is the single atomic bookkeeping unit of the ingestion
/// pipeline; everything else is plain reads.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get_member(&self, id: Uuid) -> Result<Option<Member>>;
    async fn get_test_type(&self, id: Uuid) -> Result<Option<TestType>>;
    async fn get_tier(&self, id: i64) -> Result<Option<TierDefinition>>;

    /// Insert the fact, grant the points delta and apply any due tier
    /// promotion, all in one transaction.
    async fn record_result(&self, fact: NewResult, points_added: f64) -> Result<RecordedResult>;

    async fn list_results(&self, query: &ResultQuery) -> Result<ResultPage>;

    async fn member_rollups(&self) -> Result<Vec<MemberRollup>>;
    async fn tiers(&self) -> Result<Vec<TierDefinition>>;
    async fn fact_rollups(&self) -> Result<Vec<FactRollup>>;
    async fn test_types(&self) -> Result<Vec<TestType>>;

    /// Cheap connectivity probe for readiness checks.
    async fn ping(&self) -> Result<()>;
}

/// PostgreSQL-backed ledger
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Create a new ledger with a connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(std::time::Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn get_member(&self, id: Uuid) -> Result<Option<Member>> {
        sqlx::query_as::<_, Member>(
            "SELECT id, name, phone, age, points, tier_id FROM member WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query member")
    }

    async fn get_test_type(&self, id: Uuid) -> Result<Option<TestType>> {
        sqlx::query_as::<_, TestType>("SELECT id, title FROM test_type WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query test type")
    }

    async fn get_tier(&self, id: i64) -> Result<Option<TierDefinition>> {
        sqlx::query_as::<_, TierDefinition>(
            "SELECT id, title, description, pcr, rcr, min_points FROM tier WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query tier")
    }

    #[instrument(skip(self, fact), fields(user_id = %fact.user_id, file_path = %fact.file_path))]
    async fn record_result(&self, fact: NewResult, points_added: f64) -> Result<RecordedResult> {
        let fact_id = Uuid::new_v4();

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO test_result (id, user_id, type_id, cost, file_path, notes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(fact_id)
        .bind(fact.user_id)
        .bind(fact.type_id)
        .bind(fact.cost)
        .bind(&fact.file_path)
        .bind(&fact.notes)
        .bind(fact.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert test result")?;

        // Atomic increment; concurrent ingestions for the same member
        // serialize on the row lock instead of racing a read-modify-write.
        let (new_points_total, current_tier): (f64, Option<i64>) = sqlx::query_as(
            "UPDATE member SET points = points + $1 WHERE id = $2 RETURNING points, tier_id",
        )
        .bind(points_added)
        .bind(fact.user_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to update member points")?;

        let tiers: Vec<TierDefinition> = sqlx::query_as(
            "SELECT id, title, description, pcr, rcr, min_points FROM tier ORDER BY id",
        )
        .fetch_all(&mut *tx)
        .await
        .context("Failed to load tier definitions")?;

        let tier_upgraded = match loyalty::advance_tier(&tiers, current_tier, new_points_total) {
            Some(tier_id) => {
                sqlx::query("UPDATE member SET tier_id = $1 WHERE id = $2")
                    .bind(tier_id)
                    .bind(fact.user_id)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to update member tier")?;
                true
            }
            None => false,
        };

        tx.commit().await.context("Failed to commit transaction")?;

        debug!(
            fact_id = %fact_id,
            points_added = points_added,
            tier_upgraded = tier_upgraded,
            "Test result recorded"
        );

        metrics::counter!("loyalty.results.recorded").increment(1);

        Ok(RecordedResult {
            fact_id,
            new_points_total,
            tier_upgraded,
        })
    }

    #[instrument(skip(self))]
    async fn list_results(&self, query: &ResultQuery) -> Result<ResultPage> {
        let day_bounds = query.day_bounds();

        let mut sql = String::from(
            r#"
            SELECT id, user_id, type_id, cost, file_path, notes, created_at
            FROM test_result
            WHERE 1=1
            "#,
        );

        let mut param_count = 0;

        if query.user_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND user_id = ${}", param_count));
        }

        if day_bounds.is_some() {
            sql.push_str(&format!(
                " AND created_at >= ${} AND created_at < ${}",
                param_count + 1,
                param_count + 2
            ));
            param_count += 2;
        }

        sql.push_str(" ORDER BY created_at DESC");
        sql.push_str(&format!(
            " LIMIT ${} OFFSET ${}",
            param_count + 1,
            param_count + 2
        ));

        let mut query_builder = sqlx::query_as::<_, TestResultRecord>(&sql);

        if let Some(user_id) = query.user_id {
            query_builder = query_builder.bind(user_id);
        }
        if let Some((start, end)) = day_bounds {
            query_builder = query_builder.bind(start).bind(end);
        }
        query_builder = query_builder.bind(query.per_page()).bind(query.offset());

        let results = query_builder
            .fetch_all(&self.pool)
            .await
            .context("Failed to query test results")?;

        let (total_count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM test_result
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::timestamptz IS NULL OR (created_at >= $2 AND created_at < $3))
            "#,
        )
        .bind(query.user_id)
        .bind(day_bounds.map(|(s, _)| s))
        .bind(day_bounds.map(|(_, e)| e))
        .fetch_one(&self.pool)
        .await
        .context("Failed to count test results")?;

        Ok(ResultPage {
            results,
            total_count,
            page: query.page(),
            total_pages: page_count(total_count, query.per_page()),
        })
    }

    async fn member_rollups(&self) -> Result<Vec<MemberRollup>> {
        sqlx::query_as::<_, MemberRollup>("SELECT id, points, tier_id FROM member")
            .fetch_all(&self.pool)
            .await
            .context("Failed to query member rollups")
    }

    async fn tiers(&self) -> Result<Vec<TierDefinition>> {
        sqlx::query_as::<_, TierDefinition>(
            "SELECT id, title, description, pcr, rcr, min_points FROM tier ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to query tiers")
    }

    async fn fact_rollups(&self) -> Result<Vec<FactRollup>> {
        sqlx::query_as::<_, FactRollup>("SELECT type_id, cost, created_at FROM test_result")
            .fetch_all(&self.pool)
            .await
            .context("Failed to query fact rollups")
    }

    async fn test_types(&self) -> Result<Vec<TestType>> {
        sqlx::query_as::<_, TestType>("SELECT id, title FROM test_type ORDER BY title")
            .fetch_all(&self.pool)
            .await
            .context("Failed to query test types")
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }
}

fn page_count(total: i64, per_page: i64) -> i64 {
    if total == 0 {
        0
    } else {
        (total + per_page - 1) / per_page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_paging_defaults() {
        let query = ResultQuery::default();
        assert_eq!(query.page(), 1);
        assert_eq!(query.per_page(), 10);
        assert_eq!(query.offset(), 0);
    }

    #[test]
    fn test_query_paging_offsets() {
        let query = ResultQuery {
            page: 3,
            per_page: 25,
            ..Default::default()
        };
        assert_eq!(query.offset(), 50);

        let clamped = ResultQuery {
            page: -2,
            per_page: 1000,
            ..Default::default()
        };
        assert_eq!(clamped.page(), 1);
        assert_eq!(clamped.per_page(), 100);
    }

    #[test]
    fn test_day_bounds_cover_one_day() {
        let query = ResultQuery {
            date: Some(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()),
            ..Default::default()
        };
        let (start, end) = query.day_bounds().unwrap();
        assert_eq!(end - start, Duration::days(1));
        assert_eq!(start.to_rfc3339(), "2024-03-09T00:00:00+00:00");
    }

    #[test]
    fn test_page_count() {
        assert_eq!(page_count(0, 10), 0);
        assert_eq!(page_count(1, 10), 1);
        assert_eq!(page_count(10, 10), 1);
        assert_eq!(page_count(11, 10), 2);
    }
}
