//! PostgreSQL-backed [`MatchStore`].

use crate::models::{
    AccountScope, LocalRange, Match, MatchOrigin, NewMatch, Page, PageRequest, RawTransaction,
    Report, ReportStats, Side, TimeRange,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{MatchStore, UnmatchWrite};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::error::ErrorKind;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{FromRow, Postgres};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, instrument, warn};

const MATCH_COLUMNS: &str = "match_id, report_id, side_a_id, side_b_id, time_difference_secs, \
     gross_expense, gross_income, gross_profit, profit_percentage, origin, created_by, created_utc";

#[derive(Debug, FromRow)]
struct ReportRow {
    report_id: i64,
    profile: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    version: i64,
    total_matches: i64,
    total_expense: Decimal,
    total_income: Decimal,
    total_profit: Decimal,
    average_expense: Decimal,
    average_income: Decimal,
    average_profit: Decimal,
    success_rate: Decimal,
    total_profit_percentage: Decimal,
}

#[derive(Debug, FromRow)]
struct AccountRow {
    account_id: String,
    side: String,
    effective_start: Option<DateTime<Utc>>,
    effective_end: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct MatchRow {
    match_id: i64,
    report_id: i64,
    side_a_id: i64,
    side_b_id: i64,
    time_difference_secs: i64,
    gross_expense: Decimal,
    gross_income: Decimal,
    gross_profit: Decimal,
    profit_percentage: Decimal,
    origin: String,
    created_by: String,
    created_utc: DateTime<Utc>,
}

impl TryFrom<MatchRow> for Match {
    type Error = AppError;

    fn try_from(r: MatchRow) -> Result<Self, AppError> {
        let origin = MatchOrigin::parse(&r.origin).ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "Match {} has unknown origin '{}'",
                r.match_id,
                r.origin
            ))
        })?;
        Ok(Self {
            match_id: r.match_id,
            report_id: r.report_id,
            side_a_id: r.side_a_id,
            side_b_id: r.side_b_id,
            time_difference_secs: r.time_difference_secs,
            gross_expense: r.gross_expense,
            gross_income: r.gross_income,
            gross_profit: r.gross_profit,
            profit_percentage: r.profit_percentage,
            origin,
            created_by: r.created_by,
            created_utc: r.created_utc,
        })
    }
}

fn to_matches(rows: Vec<MatchRow>) -> Result<Vec<Match>, AppError> {
    rows.into_iter().map(Match::try_from).collect()
}

/// Classify a sqlx failure. Only connection-level and unknown failures map to
/// the retryable [`AppError::DatabaseError`].
fn db_error(context: &str, e: sqlx::Error) -> AppError {
    let message = anyhow::anyhow!("{}: {}", context, e);
    match &e {
        sqlx::Error::Database(db) => match db.kind() {
            ErrorKind::UniqueViolation => AppError::Conflict(message),
            ErrorKind::ForeignKeyViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::CheckViolation => AppError::BadRequest(message),
            _ => AppError::DatabaseError(message),
        },
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => AppError::InternalError(message),
        _ => AppError::DatabaseError(message),
    }
}

/// Versioned stats write shared by recompute and unmatch.
fn stats_update(
    report_id: i64,
    stats: &ReportStats,
    expected_version: i64,
) -> Query<'static, Postgres, PgArguments> {
    sqlx::query(
        r#"
        UPDATE reports
        SET total_matches = $3, total_expense = $4, total_income = $5, total_profit = $6,
            average_expense = $7, average_income = $8, average_profit = $9,
            success_rate = $10, total_profit_percentage = $11,
            version = version + 1, stats_updated_utc = NOW()
        WHERE report_id = $1 AND version = $2
        "#,
    )
    .bind(report_id)
    .bind(expected_version)
    .bind(stats.total_matches)
    .bind(stats.total_expense)
    .bind(stats.total_income)
    .bind(stats.total_profit)
    .bind(stats.average_expense)
    .bind(stats.average_income)
    .bind(stats.average_profit)
    .bind(stats.success_rate)
    .bind(stats.total_profit_percentage)
}

fn side_column(side: Side) -> &'static str {
    match side {
        Side::A => "side_a_id",
        Side::B => "side_b_id",
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "matching-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn report_exists(&self, report_id: i64) -> Result<bool, AppError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM reports WHERE report_id = $1)")
            .bind(report_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("Failed to check report", e))
    }
}

#[async_trait]
impl MatchStore for Database {
    // =========================================================================
    // Report Operations
    // =========================================================================

    #[instrument(skip(self), fields(report_id = %report_id))]
    async fn get_report(&self, report_id: i64) -> Result<Option<Report>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_report"])
            .start_timer();

        let row = sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT report_id, profile, period_start, period_end, version,
                   total_matches, total_expense, total_income, total_profit,
                   average_expense, average_income, average_profit,
                   success_rate, total_profit_percentage
            FROM reports
            WHERE report_id = $1
            "#,
        )
        .bind(report_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get report", e))?;

        let Some(row) = row else {
            timer.observe_duration();
            return Ok(None);
        };

        let accounts = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT account_id, side, effective_start, effective_end
            FROM report_accounts
            WHERE report_id = $1
            ORDER BY side, account_id
            "#,
        )
        .bind(report_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get report accounts", e))?;

        timer.observe_duration();

        let mut scope = Vec::with_capacity(accounts.len());
        for a in accounts {
            let side = Side::parse(&a.side).ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "Report {} account {} has unknown side '{}'",
                    report_id,
                    a.account_id,
                    a.side
                ))
            })?;
            scope.push(AccountScope {
                account_id: a.account_id,
                side,
                effective_start: a.effective_start,
                effective_end: a.effective_end,
            });
        }

        Ok(Some(Report {
            report_id: row.report_id,
            profile: row.profile,
            period: TimeRange {
                start: row.period_start,
                end: row.period_end,
            },
            scope,
            stats: ReportStats {
                total_matches: row.total_matches,
                total_expense: row.total_expense,
                total_income: row.total_income,
                total_profit: row.total_profit,
                average_expense: row.average_expense,
                average_income: row.average_income,
                average_profit: row.average_profit,
                success_rate: row.success_rate,
                total_profit_percentage: row.total_profit_percentage,
            },
            version: row.version,
        }))
    }

    #[instrument(skip(self, stats), fields(report_id = %report_id, expected_version = %expected_version))]
    async fn update_report_stats(
        &self,
        report_id: i64,
        stats: &ReportStats,
        expected_version: i64,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_report_stats"])
            .start_timer();

        let result = stats_update(report_id, stats, expected_version)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to update report stats", e))?;

        timer.observe_duration();

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.report_exists(report_id).await? {
            warn!(report_id = %report_id, "Report version moved during stats update");
            Ok(false)
        } else {
            Err(AppError::NotFound(anyhow::anyhow!(
                "Report {} not found",
                report_id
            )))
        }
    }

    // =========================================================================
    // Source Transaction Operations
    // =========================================================================

    #[instrument(skip(self), fields(source = %source, transaction_id = %transaction_id))]
    async fn get_transaction(
        &self,
        source: &str,
        transaction_id: i64,
    ) -> Result<Option<RawTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let transaction = sqlx::query_as::<_, RawTransaction>(
            r#"
            SELECT transaction_id, source, account_id, recorded_at, amount, payload
            FROM source_transactions
            WHERE source = $1 AND transaction_id = $2
            "#,
        )
        .bind(source)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get transaction", e))?;

        timer.observe_duration();
        Ok(transaction)
    }

    #[instrument(skip(self, accounts, exclude), fields(source = %source, accounts = accounts.len(), excluded = exclude.len()))]
    async fn fetch_unmatched(
        &self,
        source: &str,
        accounts: &[String],
        range: &LocalRange,
        exclude: &HashSet<i64>,
    ) -> Result<Vec<RawTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["fetch_unmatched"])
            .start_timer();

        let excluded: Vec<i64> = exclude.iter().copied().collect();

        let transactions = sqlx::query_as::<_, RawTransaction>(
            r#"
            SELECT transaction_id, source, account_id, recorded_at, amount, payload
            FROM source_transactions
            WHERE source = $1
              AND account_id = ANY($2)
              AND recorded_at BETWEEN $3 AND $4
              AND NOT (transaction_id = ANY($5))
            ORDER BY recorded_at, transaction_id
            "#,
        )
        .bind(source)
        .bind(accounts)
        .bind(range.start)
        .bind(range.end)
        .bind(&excluded)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch unmatched transactions", e))?;

        timer.observe_duration();
        Ok(transactions)
    }

    // =========================================================================
    // Match Operations
    // =========================================================================

    #[instrument(skip(self), fields(report_id = %report_id, side = %side))]
    async fn matched_transaction_ids(
        &self,
        report_id: i64,
        side: Side,
    ) -> Result<HashSet<i64>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["matched_transaction_ids"])
            .start_timer();

        let ids = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT {} FROM matches WHERE report_id = $1",
            side_column(side)
        ))
        .bind(report_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get matched ids", e))?;

        timer.observe_duration();
        Ok(ids.into_iter().collect())
    }

    #[instrument(skip(self), fields(report_id = %report_id, side = %side, transaction_id = %transaction_id))]
    async fn find_match_by_transaction(
        &self,
        report_id: i64,
        side: Side,
        transaction_id: i64,
    ) -> Result<Option<Match>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_match_by_transaction"])
            .start_timer();

        let row = sqlx::query_as::<_, MatchRow>(&format!(
            "SELECT {} FROM matches WHERE report_id = $1 AND {} = $2",
            MATCH_COLUMNS,
            side_column(side)
        ))
        .bind(report_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find match", e))?;

        timer.observe_duration();
        row.map(Match::try_from).transpose()
    }

    #[instrument(skip(self, matches), fields(count = matches.len()))]
    async fn bulk_insert_matches(&self, matches: &[NewMatch]) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["bulk_insert_matches"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let mut inserted = 0;
        for m in matches {
            let result = sqlx::query(
                r#"
                INSERT INTO matches (report_id, side_a_id, side_b_id, time_difference_secs,
                                     gross_expense, gross_income, gross_profit, profit_percentage,
                                     origin, created_by)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(m.report_id)
            .bind(m.side_a_id)
            .bind(m.side_b_id)
            .bind(m.time_difference_secs)
            .bind(m.financials.gross_expense)
            .bind(m.financials.gross_income)
            .bind(m.financials.gross_profit)
            .bind(m.financials.profit_percentage)
            .bind(m.origin.as_str())
            .bind(&m.created_by)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to insert match", e))?;

            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(|e| db_error("Failed to commit transaction", e))?;

        timer.observe_duration();

        let skipped = matches.len() as u64 - inserted;
        if skipped > 0 {
            warn!(skipped = skipped, "Skipped conflicting matches");
        }
        info!(inserted = inserted, "Matches inserted");

        Ok(inserted)
    }

    #[instrument(skip(self, new_match), fields(report_id = %new_match.report_id, side_a_id = %new_match.side_a_id, side_b_id = %new_match.side_b_id))]
    async fn insert_match(&self, new_match: &NewMatch) -> Result<Option<Match>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_match"])
            .start_timer();

        let row = sqlx::query_as::<_, MatchRow>(&format!(
            r#"
            INSERT INTO matches (report_id, side_a_id, side_b_id, time_difference_secs,
                                 gross_expense, gross_income, gross_profit, profit_percentage,
                                 origin, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            RETURNING {}
            "#,
            MATCH_COLUMNS
        ))
        .bind(new_match.report_id)
        .bind(new_match.side_a_id)
        .bind(new_match.side_b_id)
        .bind(new_match.time_difference_secs)
        .bind(new_match.financials.gross_expense)
        .bind(new_match.financials.gross_income)
        .bind(new_match.financials.gross_profit)
        .bind(new_match.financials.profit_percentage)
        .bind(new_match.origin.as_str())
        .bind(&new_match.created_by)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert match", e))?;

        timer.observe_duration();
        row.map(Match::try_from).transpose()
    }

    #[instrument(skip(self, page), fields(report_id = %report_id, page = page.page, page_size = page.page_size))]
    async fn fetch_matches(
        &self,
        report_id: i64,
        page: &PageRequest,
    ) -> Result<Page<Match>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["fetch_matches"])
            .start_timer();

        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM matches WHERE report_id = $1")
            .bind(report_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("Failed to count matches", e))?;

        let rows = sqlx::query_as::<_, MatchRow>(&format!(
            "SELECT {} FROM matches WHERE report_id = $1 ORDER BY {} LIMIT $2 OFFSET $3",
            MATCH_COLUMNS,
            page.sort.order_by()
        ))
        .bind(report_id)
        .bind(page.page_size as i64)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list matches", e))?;

        timer.observe_duration();

        Ok(Page {
            items: to_matches(rows)?,
            page: page.page,
            page_size: page.page_size,
            total,
        })
    }

    #[instrument(skip(self), fields(report_id = %report_id))]
    async fn all_matches(&self, report_id: i64) -> Result<Vec<Match>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["all_matches"])
            .start_timer();

        let rows = sqlx::query_as::<_, MatchRow>(&format!(
            "SELECT {} FROM matches WHERE report_id = $1 ORDER BY match_id",
            MATCH_COLUMNS
        ))
        .bind(report_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load matches", e))?;

        timer.observe_duration();
        to_matches(rows)
    }

    #[instrument(skip(self), fields(match_id = %match_id, report_id = %report_id))]
    async fn delete_match(&self, match_id: i64, report_id: i64) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_match"])
            .start_timer();

        let result = sqlx::query("DELETE FROM matches WHERE match_id = $1 AND report_id = $2")
            .bind(match_id)
            .bind(report_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to delete match", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, stats), fields(match_id = %match_id, report_id = %report_id, expected_version = %expected_version))]
    async fn delete_match_with_stats(
        &self,
        match_id: i64,
        report_id: i64,
        stats: &ReportStats,
        expected_version: i64,
    ) -> Result<UnmatchWrite, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_match_with_stats"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let updated = stats_update(report_id, stats, expected_version)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to update report stats", e))?;

        if updated.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back unmatch", e))?;
            timer.observe_duration();
            if self.report_exists(report_id).await? {
                warn!(report_id = %report_id, "Report version moved during unmatch");
                return Ok(UnmatchWrite::VersionMoved);
            }
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Report {} not found",
                report_id
            )));
        }

        let deleted = sqlx::query("DELETE FROM matches WHERE match_id = $1 AND report_id = $2")
            .bind(match_id)
            .bind(report_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete match", e))?;

        if deleted.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back unmatch", e))?;
            timer.observe_duration();
            return Ok(UnmatchWrite::MatchMissing);
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit unmatch", e))?;

        timer.observe_duration();
        Ok(UnmatchWrite::Deleted)
    }
}
