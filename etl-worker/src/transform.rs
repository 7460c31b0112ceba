//! Canonicalization of validated records.
//!
//! Transformation is pure: the same candidate and ingestion date always
//! produce the same `CanonicalRecord`, so a redelivered batch computes
//! identical rows.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::validate::CanonicalCandidate;

/// Stock level bucket derived from the raw stock count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockStatus {
    OutOfStock,
    LowStock,
    InStock,
}

impl StockStatus {
    pub fn from_stock(stock: Option<i64>) -> Self {
        match stock {
            Some(0) => StockStatus::OutOfStock,
            Some(n) if n < 10 => StockStatus::LowStock,
            _ => StockStatus::InStock,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::OutOfStock => "OUT_OF_STOCK",
            StockStatus::LowStock => "LOW_STOCK",
            StockStatus::InStock => "IN_STOCK",
        }
    }
}

/// A fully canonicalized record, shaped exactly like a warehouse row.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub product_id: String,
    pub product_name: String,
    pub category: String,
    pub price: f64,
    pub original_price: Option<f64>,
    pub discount_percent: Option<f64>,
    pub discount_price: f64,
    pub sales_count: i64,
    pub revenue: f64,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub stock: Option<i64>,
    pub stock_status: StockStatus,
    pub seller_name: Option<String>,
    pub seller_location: Option<String>,
    pub sale_date: NaiveDate,
    pub ingestion_date: DateTime<Utc>,
}

/// Canonicalize one candidate. `ingestion_date` is the batch creation time
/// and doubles as the sale date fallback when the record carries no usable
/// timestamp.
pub fn transform(candidate: CanonicalCandidate, ingestion_date: DateTime<Utc>) -> CanonicalRecord {
    let discount = candidate.discount_percent.unwrap_or(0.0);
    let discount_price = round2(candidate.price * (1.0 - discount / 100.0));
    let sales_count = candidate.sales_count.unwrap_or(0);
    let revenue = candidate.price * sales_count as f64;
    let stock_status = StockStatus::from_stock(candidate.stock);

    let sale_date = candidate
        .timestamp
        .as_deref()
        .and_then(parse_sale_date)
        .unwrap_or_else(|| ingestion_date.date_naive());

    CanonicalRecord {
        product_id: candidate.product_id,
        product_name: candidate.product_name,
        category: candidate.category.to_uppercase(),
        price: candidate.price,
        original_price: candidate.original_price,
        discount_percent: candidate.discount_percent,
        discount_price,
        sales_count,
        revenue,
        rating: candidate.rating,
        review_count: candidate.review_count,
        stock: candidate.stock,
        stock_status,
        seller_name: candidate.seller_name,
        seller_location: candidate.seller_location,
        sale_date,
        ingestion_date,
    }
}

/// Parse a sale date out of the raw timestamp, trying RFC 3339 first and
/// falling back to the bare formats upstream sources actually send.
fn parse_sale_date(raw: &str) -> Option<NaiveDate> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.date_naive());
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(parsed.date());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

/// Round to two decimal places, half away from zero.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
