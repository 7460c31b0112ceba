//! Warehouse load: set-based insert and merge of canonical records.
//!
//! All writes for a batch happen through a caller-owned transaction, so the
//! load either lands atomically or not at all. Records whose merge key is
//! already in the warehouse are collapsed last-wins and merged with a single
//! set-based UPDATE; everything else is bulk inserted through UNNEST.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use sqlx::{Postgres, Transaction};

use etl_common::batch::LoadResult;
use etl_common::schema;

use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::transform::CanonicalRecord;

/// What to do with a record whose merge key already exists in the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Leave the existing row alone and count the record as skipped.
    InsertOnly,
    /// Merge the record into the existing row.
    Upsert,
}

impl LoadPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadPolicy::InsertOnly => "insert_only",
            LoadPolicy::Upsert => "upsert",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLoadPolicyError;

impl FromStr for LoadPolicy {
    type Err = ParseLoadPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert_only" => Ok(LoadPolicy::InsertOnly),
            "upsert" => Ok(LoadPolicy::Upsert),
            _ => Err(ParseLoadPolicyError),
        }
    }
}

/// Load a batch of canonical records into the warehouse.
///
/// Every input record is accounted for exactly once in the returned
/// `LoadResult`: `inserted + updated + skipped` always equals the batch
/// size. Records sharing a merge key with an existing row collapse
/// last-wins before merging, so redelivering the same batch converges on
/// the same warehouse state.
pub async fn apply(
    txn: &mut Transaction<'_, Postgres>,
    records: &[CanonicalRecord],
    settings: &PipelineSettings,
) -> Result<LoadResult, PipelineError> {
    if records.is_empty() {
        return Ok(LoadResult::default());
    }

    let keys = records
        .iter()
        .map(|record| merge_key(record, &settings.unique_key))
        .collect::<Result<Vec<_>, _>>()?;
    let existing = existing_keys(&mut **txn, &settings.unique_key, &keys).await?;

    let mut result = LoadResult::default();
    let mut fresh: Vec<&CanonicalRecord> = Vec::new();
    let mut merges: HashMap<&str, &CanonicalRecord> = HashMap::new();
    let mut merge_order: Vec<&str> = Vec::new();

    for (record, key) in records.iter().zip(&keys) {
        if !existing.contains(key) {
            // New keys are never deduplicated: the warehouse keeps every
            // fresh row and the janitor owns any later deduplication.
            fresh.push(record);
            continue;
        }

        match settings.load_policy {
            LoadPolicy::InsertOnly => result.skipped += 1,
            LoadPolicy::Upsert => {
                if merges.insert(key, record).is_some() {
                    result.skipped += 1;
                } else {
                    merge_order.push(key);
                }
            }
        }
    }

    if !fresh.is_empty() {
        bulk_insert(&mut **txn, &fresh).await?;
        result.inserted = fresh.len() as i32;
    }

    if !merge_order.is_empty() {
        let rows: Vec<&CanonicalRecord> = merge_order.iter().map(|key| merges[key]).collect();
        bulk_update(&mut **txn, &merge_order, &rows, settings).await?;
        result.updated = rows.len() as i32;
    }

    Ok(result)
}

/// Extract the merge key value from a record. The key name was validated
/// against the schema allowlist at startup, so a miss here is a defect.
fn merge_key(record: &CanonicalRecord, key: &str) -> Result<String, PipelineError> {
    match key {
        "product_id" => Ok(record.product_id.clone()),
        "product_name" => Ok(record.product_name.clone()),
        "category" => Ok(record.category.clone()),
        "stock_status" => Ok(record.stock_status.as_str().to_owned()),
        other => Err(PipelineError::LogicDefect(format!(
            "'{other}' is not a merge key column"
        ))),
    }
}

/// Fetch the subset of `values` that already exist in the warehouse under
/// the given key column.
async fn existing_keys<'c, E>(
    executor: E,
    key: &str,
    values: &[String],
) -> Result<HashSet<String>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let statement = format!(
        "SELECT DISTINCT {key} FROM {} WHERE {key} = ANY($1)",
        schema::WAREHOUSE_TABLE
    );
    let found: Vec<String> = sqlx::query_scalar(&statement)
        .bind(values)
        .fetch_all(executor)
        .await?;

    Ok(found.into_iter().collect())
}

async fn bulk_insert<'c, E>(executor: E, records: &[&CanonicalRecord]) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    // Flatten the records into parallel arrays PG can unnest into rows.
    let mut product_ids = Vec::with_capacity(records.len());
    let mut product_names = Vec::with_capacity(records.len());
    let mut categories = Vec::with_capacity(records.len());
    let mut prices = Vec::with_capacity(records.len());
    let mut original_prices = Vec::with_capacity(records.len());
    let mut discount_percents = Vec::with_capacity(records.len());
    let mut discount_prices = Vec::with_capacity(records.len());
    let mut sales_counts = Vec::with_capacity(records.len());
    let mut revenues = Vec::with_capacity(records.len());
    let mut ratings = Vec::with_capacity(records.len());
    let mut review_counts = Vec::with_capacity(records.len());
    let mut stocks = Vec::with_capacity(records.len());
    let mut stock_statuses = Vec::with_capacity(records.len());
    let mut seller_names = Vec::with_capacity(records.len());
    let mut seller_locations = Vec::with_capacity(records.len());
    let mut sale_dates = Vec::with_capacity(records.len());
    let mut ingestion_dates = Vec::with_capacity(records.len());

    for record in records {
        product_ids.push(record.product_id.clone());
        product_names.push(record.product_name.clone());
        categories.push(record.category.clone());
        prices.push(record.price);
        original_prices.push(record.original_price);
        discount_percents.push(record.discount_percent);
        discount_prices.push(record.discount_price);
        sales_counts.push(record.sales_count);
        revenues.push(record.revenue);
        ratings.push(record.rating);
        review_counts.push(record.review_count);
        stocks.push(record.stock);
        stock_statuses.push(record.stock_status.as_str().to_owned());
        seller_names.push(record.seller_name.clone());
        seller_locations.push(record.seller_location.clone());
        sale_dates.push(record.sale_date);
        ingestion_dates.push(record.ingestion_date);
    }

    sqlx::query(
        r#"
INSERT INTO cleaned_sales_data
    (
        product_id,
        product_name,
        category,
        price,
        original_price,
        discount_percent,
        discount_price,
        sales_count,
        revenue,
        rating,
        review_count,
        stock,
        stock_status,
        seller_name,
        seller_location,
        sale_date,
        ingestion_date
    )
SELECT *
FROM UNNEST(
        $1::text[],
        $2::text[],
        $3::text[],
        $4::float8[],
        $5::float8[],
        $6::float8[],
        $7::float8[],
        $8::int8[],
        $9::float8[],
        $10::float8[],
        $11::int8[],
        $12::int8[],
        $13::text[],
        $14::text[],
        $15::text[],
        $16::date[],
        $17::timestamptz[]
    )
"#,
    )
    .bind(product_ids)
    .bind(product_names)
    .bind(categories)
    .bind(prices)
    .bind(original_prices)
    .bind(discount_percents)
    .bind(discount_prices)
    .bind(sales_counts)
    .bind(revenues)
    .bind(ratings)
    .bind(review_counts)
    .bind(stocks)
    .bind(stock_statuses)
    .bind(seller_names)
    .bind(seller_locations)
    .bind(sale_dates)
    .bind(ingestion_dates)
    .execute(executor)
    .await?;

    Ok(())
}

/// Merge records into existing warehouse rows with one set-based UPDATE.
/// The column list is dynamic but drawn from the validated settings, never
/// from the records themselves.
async fn bulk_update<'c, E>(
    executor: E,
    keys: &[&str],
    records: &[&CanonicalRecord],
    settings: &PipelineSettings,
) -> Result<(), PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let mut set_clauses = Vec::with_capacity(settings.update_columns.len());
    let mut unnest_args = vec!["$1::text[]".to_owned()];
    let mut alias_columns = vec!["merge_key".to_owned()];

    for (position, column) in settings.update_columns.iter().enumerate() {
        set_clauses.push(format!("{column} = u.{column}"));
        unnest_args.push(format!("${}::{}", position + 2, array_type(column)?));
        alias_columns.push(column.clone());
    }

    let statement = format!(
        "UPDATE {table} AS w SET {sets} FROM UNNEST({args}) AS u({columns}) WHERE w.{key} = u.merge_key",
        table = schema::WAREHOUSE_TABLE,
        sets = set_clauses.join(", "),
        args = unnest_args.join(", "),
        columns = alias_columns.join(", "),
        key = settings.unique_key,
    );

    let mut query = sqlx::query(&statement).bind(keys.to_vec());
    for column in &settings.update_columns {
        query = match column.as_str() {
            "product_name" => query.bind(collect_text(records, |r| Some(r.product_name.clone()))),
            "category" => query.bind(collect_text(records, |r| Some(r.category.clone()))),
            "price" => query.bind(collect(records, |r| r.price)),
            "original_price" => query.bind(collect(records, |r| r.original_price)),
            "discount_percent" => query.bind(collect(records, |r| r.discount_percent)),
            "discount_price" => query.bind(collect(records, |r| r.discount_price)),
            "sales_count" => query.bind(collect(records, |r| r.sales_count)),
            "revenue" => query.bind(collect(records, |r| r.revenue)),
            "rating" => query.bind(collect(records, |r| r.rating)),
            "review_count" => query.bind(collect(records, |r| r.review_count)),
            "stock" => query.bind(collect(records, |r| r.stock)),
            "stock_status" => {
                query.bind(collect_text(records, |r| {
                    Some(r.stock_status.as_str().to_owned())
                }))
            }
            "seller_name" => query.bind(collect_text(records, |r| r.seller_name.clone())),
            "seller_location" => query.bind(collect_text(records, |r| r.seller_location.clone())),
            other => {
                return Err(PipelineError::LogicDefect(format!(
                    "column '{other}' has no merge binding"
                )))
            }
        };
    }

    query.execute(executor).await?;

    Ok(())
}

fn array_type(column: &str) -> Result<&'static str, PipelineError> {
    match column {
        "price" | "original_price" | "discount_percent" | "discount_price" | "revenue"
        | "rating" => Ok("float8[]"),
        "sales_count" | "review_count" | "stock" => Ok("int8[]"),
        "product_name" | "category" | "stock_status" | "seller_name" | "seller_location" => {
            Ok("text[]")
        }
        other => Err(PipelineError::LogicDefect(format!(
            "column '{other}' has no array type"
        ))),
    }
}

fn collect<T>(records: &[&CanonicalRecord], field: impl Fn(&CanonicalRecord) -> T) -> Vec<T> {
    records.iter().map(|record| field(record)).collect()
}

fn collect_text(
    records: &[&CanonicalRecord],
    field: impl Fn(&CanonicalRecord) -> Option<String>,
) -> Vec<Option<String>> {
    collect(records, field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::StockStatus;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use sqlx::PgPool;

    fn settings(load_policy: LoadPolicy) -> PipelineSettings {
        PipelineSettings {
            unique_key: "product_id".to_owned(),
            load_policy,
            update_columns: [
                "price",
                "original_price",
                "discount_percent",
                "discount_price",
                "sales_count",
                "revenue",
                "rating",
                "review_count",
                "stock",
                "stock_status",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            min_valid_fraction: 0.0,
        }
    }

    fn ingested_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 12, 8, 0, 0).single().unwrap()
    }

    fn record(product_id: &str, price: f64) -> CanonicalRecord {
        CanonicalRecord {
            product_id: product_id.to_owned(),
            product_name: "Kopi Arabika".to_owned(),
            category: "MAKANAN".to_owned(),
            price,
            original_price: None,
            discount_percent: Some(20.0),
            discount_price: (price * 0.8 * 100.0).round() / 100.0,
            sales_count: 5,
            revenue: price * 5.0,
            rating: Some(4.2),
            review_count: Some(11),
            stock: Some(40),
            stock_status: StockStatus::InStock,
            seller_name: Some("Toko Sinar Jaya".to_owned()),
            seller_location: Some("Bandung".to_owned()),
            sale_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            ingestion_date: ingested_at(),
        }
    }

    async fn apply_batch(
        db: &PgPool,
        records: &[CanonicalRecord],
        settings: &PipelineSettings,
    ) -> LoadResult {
        let mut txn = db.begin().await.unwrap();
        let result = apply(&mut txn, records, settings).await.unwrap();
        txn.commit().await.unwrap();
        result
    }

    async fn warehouse_count(db: &PgPool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM cleaned_sales_data")
            .fetch_one(db)
            .await
            .unwrap()
    }

    async fn price_of(db: &PgPool, product_id: &str) -> f64 {
        sqlx::query_scalar("SELECT price FROM cleaned_sales_data WHERE product_id = $1")
            .bind(product_id)
            .fetch_one(db)
            .await
            .unwrap()
    }

    #[test]
    fn test_load_policy_parses_from_str() {
        assert_eq!("upsert".parse(), Ok(LoadPolicy::Upsert));
        assert_eq!("insert_only".parse(), Ok(LoadPolicy::InsertOnly));
        assert_eq!(
            "replace".parse::<LoadPolicy>(),
            Err(ParseLoadPolicyError)
        );
        assert_eq!(LoadPolicy::Upsert.as_str(), "upsert");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_fresh_records_are_inserted(db: PgPool) {
        let batch = vec![record("PROD00001", 100.0), record("PROD00002", 45000.5)];

        let result = apply_batch(&db, &batch, &settings(LoadPolicy::Upsert)).await;

        assert_eq!(
            result,
            LoadResult {
                inserted: 2,
                updated: 0,
                skipped: 0
            }
        );
        assert_eq!(warehouse_count(&db).await, 2);
        assert_eq!(price_of(&db, "PROD00002").await, 45000.5);

        let discount_price: f64 =
            sqlx::query_scalar("SELECT discount_price FROM cleaned_sales_data WHERE product_id = $1")
                .bind("PROD00001")
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(discount_price, 80.0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_empty_batch_is_a_noop(db: PgPool) {
        let result = apply_batch(&db, &[], &settings(LoadPolicy::Upsert)).await;

        assert_eq!(result, LoadResult::default());
        assert_eq!(warehouse_count(&db).await, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_upsert_merges_into_existing_rows(db: PgPool) {
        let first = vec![record("PROD00001", 100.0)];
        apply_batch(&db, &first, &settings(LoadPolicy::Upsert)).await;

        let mut replayed = record("PROD00001", 150.0);
        replayed.sale_date = NaiveDate::from_ymd_opt(2024, 6, 9).unwrap();
        replayed.ingestion_date = Utc.with_ymd_and_hms(2024, 6, 13, 8, 0, 0).single().unwrap();
        let second = vec![replayed, record("PROD00002", 200.0)];

        let result = apply_batch(&db, &second, &settings(LoadPolicy::Upsert)).await;

        assert_eq!(
            result,
            LoadResult {
                inserted: 1,
                updated: 1,
                skipped: 0
            }
        );
        assert_eq!(warehouse_count(&db).await, 2);
        assert_eq!(price_of(&db, "PROD00001").await, 150.0);

        // sale_date and ingestion_date are not update columns: the original
        // row keeps its provenance.
        let (sale_date, ingestion_date): (NaiveDate, DateTime<Utc>) = sqlx::query_as(
            "SELECT sale_date, ingestion_date FROM cleaned_sales_data WHERE product_id = $1",
        )
        .bind("PROD00001")
        .fetch_one(&db)
        .await
        .unwrap();
        assert_eq!(sale_date, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(ingestion_date, ingested_at());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_insert_only_skips_existing_rows(db: PgPool) {
        apply_batch(
            &db,
            &[record("PROD00001", 100.0)],
            &settings(LoadPolicy::InsertOnly),
        )
        .await;

        let second = vec![record("PROD00001", 999.0), record("PROD00002", 200.0)];
        let result = apply_batch(&db, &second, &settings(LoadPolicy::InsertOnly)).await;

        assert_eq!(
            result,
            LoadResult {
                inserted: 1,
                updated: 0,
                skipped: 1
            }
        );
        assert_eq!(warehouse_count(&db).await, 2);
        assert_eq!(price_of(&db, "PROD00001").await, 100.0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_upsert_replay_converges(db: PgPool) {
        let batch = vec![record("PROD00001", 100.0), record("PROD00002", 200.0)];
        let merge = settings(LoadPolicy::Upsert);

        let first = apply_batch(&db, &batch, &merge).await;
        let second = apply_batch(&db, &batch, &merge).await;

        assert_eq!(first.inserted, 2);
        assert_eq!(
            second,
            LoadResult {
                inserted: 0,
                updated: 2,
                skipped: 0
            }
        );
        assert_eq!(warehouse_count(&db).await, 2);
        assert_eq!(price_of(&db, "PROD00001").await, 100.0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_duplicates_of_an_existing_key_collapse_last_wins(db: PgPool) {
        apply_batch(
            &db,
            &[record("PROD00001", 100.0)],
            &settings(LoadPolicy::Upsert),
        )
        .await;

        let batch = vec![record("PROD00001", 120.0), record("PROD00001", 150.0)];
        let result = apply_batch(&db, &batch, &settings(LoadPolicy::Upsert)).await;

        assert_eq!(
            result,
            LoadResult {
                inserted: 0,
                updated: 1,
                skipped: 1
            }
        );
        assert_eq!(warehouse_count(&db).await, 1);
        assert_eq!(price_of(&db, "PROD00001").await, 150.0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_duplicates_of_a_new_key_all_insert(db: PgPool) {
        let batch = vec![record("PROD00001", 100.0), record("PROD00001", 150.0)];

        let result = apply_batch(&db, &batch, &settings(LoadPolicy::Upsert)).await;

        assert_eq!(
            result,
            LoadResult {
                inserted: 2,
                updated: 0,
                skipped: 0
            }
        );
        assert_eq!(warehouse_count(&db).await, 2);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_every_record_is_accounted_for(db: PgPool) {
        apply_batch(
            &db,
            &[record("PROD00001", 100.0)],
            &settings(LoadPolicy::Upsert),
        )
        .await;

        let batch = vec![
            record("PROD00001", 110.0),
            record("PROD00001", 120.0),
            record("PROD00002", 200.0),
            record("PROD00003", 300.0),
        ];
        let result = apply_batch(&db, &batch, &settings(LoadPolicy::Upsert)).await;

        assert_eq!(
            result.inserted + result.updated + result.skipped,
            batch.len() as i32
        );
        assert_eq!(
            result,
            LoadResult {
                inserted: 2,
                updated: 1,
                skipped: 1
            }
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_merge_key_can_be_another_allowlisted_column(db: PgPool) {
        let merge = PipelineSettings {
            unique_key: "category".to_owned(),
            load_policy: LoadPolicy::Upsert,
            update_columns: vec!["price".to_owned(), "sales_count".to_owned()],
            min_valid_fraction: 0.0,
        };

        apply_batch(&db, &[record("PROD00001", 100.0)], &merge).await;

        let mut refreshed = record("PROD00002", 75.5);
        refreshed.sales_count = 9;
        let result = apply_batch(&db, &[refreshed], &merge).await;

        assert_eq!(
            result,
            LoadResult {
                inserted: 0,
                updated: 1,
                skipped: 0
            }
        );
        assert_eq!(warehouse_count(&db).await, 1);

        // The existing MAKANAN row was merged: price and sales_count moved,
        // the untouched columns (including product_id) stayed.
        let (product_id, price, sales_count): (String, f64, i64) = sqlx::query_as(
            "SELECT product_id, price, sales_count FROM cleaned_sales_data WHERE category = $1",
        )
        .bind("MAKANAN")
        .fetch_one(&db)
        .await
        .unwrap();
        assert_eq!(product_id, "PROD00001");
        assert_eq!(price, 75.5);
        assert_eq!(sales_count, 9);
    }
}
