//! Shared metadata about the `cleaned_sales_data` warehouse table.
//!
//! The merge key and the update column list are operator configuration, so
//! both the worker and the janitor validate them against these lists instead
//! of interpolating raw input into SQL.

/// The warehouse table every batch is merged into.
pub const WAREHOUSE_TABLE: &str = "cleaned_sales_data";

/// Columns a record carries after transformation, in insert order.
pub const CANONICAL_COLUMNS: [&str; 17] = [
    "product_id",
    "product_name",
    "category",
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
    "seller_name",
    "seller_location",
    "sale_date",
    "ingestion_date",
];

/// Columns allowed as the merge key. They are NOT NULL text columns, so
/// key-existence checks never have to reason about SQL NULL equality.
pub const KEY_CANDIDATE_COLUMNS: [&str; 4] =
    ["product_id", "product_name", "category", "stock_status"];

/// Columns an UPSERT is allowed to overwrite on existing rows. `product_id`,
/// `sale_date` and `ingestion_date` are deliberately absent: `ingestion_date`
/// in particular is stamped once at ingest and must survive redelivery
/// unchanged. The configured merge key is rejected separately at config
/// validation time.
pub const UPDATABLE_COLUMNS: [&str; 14] = [
    "product_name",
    "category",
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
    "seller_name",
    "seller_location",
];

/// Returns whether `column` may serve as the merge key.
pub fn is_key_candidate(column: &str) -> bool {
    KEY_CANDIDATE_COLUMNS.contains(&column)
}

/// Returns whether `column` may appear in an UPSERT update list.
pub fn is_updatable(column: &str) -> bool {
    UPDATABLE_COLUMNS.contains(&column)
}
