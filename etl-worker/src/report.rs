//! Post-load reporting: summary tables, quality counters and notifications.
//!
//! Everything in this module is advisory. The batch is already committed by
//! the time reporting runs, so failures here are logged and absorbed rather
//! than failing the job.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use etl_common::schema;

/// The facts of a completed load, one per batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadNotification {
    pub batch_id: Uuid,
    pub source: String,
    pub record_count: i32,
    pub valid_count: i32,
    pub invalid_count: i32,
    pub inserted: i32,
    pub updated: i32,
    pub skipped: i32,
}

/// Whether a notification reached its destination. Delivery is best-effort,
/// so this is a value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    Delivered,
    Failed,
}

impl NotificationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationOutcome::Delivered => "delivered",
            NotificationOutcome::Failed => "failed",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &LoadNotification) -> NotificationOutcome;
}

/// Notifier that only writes to the log. The default when no webhook is
/// configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &LoadNotification) -> NotificationOutcome {
        info!(
            batch_id = %notification.batch_id,
            source = %notification.source,
            record_count = notification.record_count,
            valid = notification.valid_count,
            invalid = notification.invalid_count,
            inserted = notification.inserted,
            updated = notification.updated,
            skipped = notification.skipped,
            "batch loaded"
        );
        NotificationOutcome::Delivered
    }
}

pub fn build_http_client(request_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("ETL Load Notifier")
        .timeout(request_timeout)
        .build()
}

/// Notifier that POSTs the notification as JSON to a configured URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, request_timeout: Duration) -> Self {
        let client = build_http_client(request_timeout)
            .expect("failed to construct reqwest client for webhook notifier");

        Self {
            client,
            url: url.to_owned(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &LoadNotification) -> NotificationOutcome {
        match self.client.post(&self.url).json(notification).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(batch_id = %notification.batch_id, "delivered load notification");
                NotificationOutcome::Delivered
            }
            Ok(response) => {
                warn!(
                    batch_id = %notification.batch_id,
                    status = %response.status(),
                    "load notification was refused"
                );
                NotificationOutcome::Failed
            }
            Err(error) => {
                warn!(
                    batch_id = %notification.batch_id,
                    %error,
                    "load notification could not be sent"
                );
                NotificationOutcome::Failed
            }
        }
    }
}

/// Recompute the summary tables for the given sale dates.
///
/// Summaries are derived data: the touched dates are deleted and rebuilt
/// from the warehouse inside one transaction, so overlapping batches and
/// replays converge on the same numbers.
pub async fn refresh_summaries(pool: &PgPool, dates: &[NaiveDate]) -> Result<(), sqlx::Error> {
    if dates.is_empty() {
        return Ok(());
    }

    let mut txn = pool.begin().await?;

    sqlx::query("DELETE FROM daily_sales_summary WHERE sale_date = ANY($1)")
        .bind(dates)
        .execute(&mut *txn)
        .await?;
    sqlx::query(
        r#"
INSERT INTO daily_sales_summary
    (sale_date, unique_products, total_records, total_sales, total_revenue,
     avg_price, min_price, max_price, avg_discount_percent, avg_rating, generated_at)
SELECT
    sale_date,
    COUNT(DISTINCT product_id),
    COUNT(*),
    SUM(sales_count),
    SUM(revenue),
    AVG(price),
    MIN(price),
    MAX(price),
    AVG(discount_percent),
    AVG(rating),
    NOW()
FROM cleaned_sales_data
WHERE sale_date = ANY($1)
GROUP BY sale_date
"#,
    )
    .bind(dates)
    .execute(&mut *txn)
    .await?;

    sqlx::query("DELETE FROM category_sales_summary WHERE sale_date = ANY($1)")
        .bind(dates)
        .execute(&mut *txn)
        .await?;
    sqlx::query(
        r#"
INSERT INTO category_sales_summary
    (sale_date, category, total_records, total_sales, total_revenue, generated_at)
SELECT
    sale_date,
    category,
    COUNT(*),
    SUM(sales_count),
    SUM(revenue),
    NOW()
FROM cleaned_sales_data
WHERE sale_date = ANY($1)
GROUP BY sale_date, category
"#,
    )
    .bind(dates)
    .execute(&mut *txn)
    .await?;

    txn.commit().await?;

    Ok(())
}

/// Warehouse invariant counters, all expected to be zero on a healthy
/// warehouse except `duplicate_keys` under an insert-only policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityReport {
    pub negative_prices: i64,
    pub blank_keys: i64,
    pub duplicate_keys: i64,
}

impl QualityReport {
    pub fn is_clean(&self) -> bool {
        *self == QualityReport::default()
    }
}

/// Count warehouse rows violating the pipeline's invariants. Violations are
/// counted, not repaired; deduplication belongs to the janitor. `key` comes
/// from the validated pipeline settings.
pub async fn quality_checks(pool: &PgPool, key: &str) -> Result<QualityReport, sqlx::Error> {
    let negative_prices: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {} WHERE price < 0",
        schema::WAREHOUSE_TABLE
    ))
    .fetch_one(pool)
    .await?;

    let blank_keys: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {table} WHERE {key} IS NULL OR TRIM({key}) = ''",
        table = schema::WAREHOUSE_TABLE,
    ))
    .fetch_one(pool)
    .await?;

    let duplicate_keys: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM (SELECT {key} FROM {table} GROUP BY {key} HAVING COUNT(*) > 1) AS groups",
        table = schema::WAREHOUSE_TABLE,
    ))
    .fetch_one(pool)
    .await?;

    Ok(QualityReport {
        negative_prices,
        blank_keys,
        duplicate_keys,
    })
}
