//! Record validation: split a batch into typed candidates and rejections.
//!
//! Validation is total and per-record. A record either coerces cleanly into
//! a `CanonicalCandidate` or is rejected with a single machine-readable
//! reason; one bad record never takes down the rest of the batch.

use std::fmt;

use serde_json::Value;

use etl_common::batch::{RawRecord, Rejection};

/// Fields a record must carry to enter the pipeline.
pub const REQUIRED_FIELDS: [&str; 4] = ["product_id", "product_name", "price", "category"];

/// The reason a record was refused, in the stable format persisted to
/// `rejected_records` and surfaced in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailure {
    MissingField(&'static str),
    TypeCoercionFailed(&'static str),
    DomainViolation(&'static str),
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationFailure::MissingField(field) => write!(f, "MISSING_FIELD({field})"),
            ValidationFailure::TypeCoercionFailed(field) => {
                write!(f, "TYPE_COERCION_FAILED({field})")
            }
            ValidationFailure::DomainViolation(field) => write!(f, "DOMAIN_VIOLATION({field})"),
        }
    }
}

/// A record that passed validation: typed, but not yet transformed.
/// `timestamp` is kept raw; the transformer owns parsing it into a sale date.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalCandidate {
    pub product_id: String,
    pub product_name: String,
    pub category: String,
    pub price: f64,
    pub original_price: Option<f64>,
    pub discount_percent: Option<f64>,
    pub sales_count: Option<i64>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub stock: Option<i64>,
    pub seller_name: Option<String>,
    pub seller_location: Option<String>,
    pub timestamp: Option<String>,
}

/// The outcome of validating a batch: every input record lands on exactly
/// one side.
#[derive(Debug)]
pub struct Validated {
    pub candidates: Vec<CanonicalCandidate>,
    pub rejected: Vec<Rejection>,
}

pub fn validate_batch(records: &[RawRecord]) -> Validated {
    let mut candidates = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();

    for record in records {
        match validate_record(&record.body) {
            Ok(candidate) => candidates.push(candidate),
            Err(failure) => rejected.push(Rejection {
                seq: record.seq,
                reason: failure.to_string(),
                body: record.body.clone(),
            }),
        }
    }

    Validated {
        candidates,
        rejected,
    }
}

/// Validate a single raw record.
///
/// Returns the first failure found, checking required fields, then type
/// coercions, then domain rules, so the reason is deterministic for a given
/// record.
pub fn validate_record(body: &Value) -> Result<CanonicalCandidate, ValidationFailure> {
    let product_id =
        text_field(body, "product_id")?.ok_or(ValidationFailure::MissingField("product_id"))?;
    let product_name =
        text_field(body, "product_name")?.ok_or(ValidationFailure::MissingField("product_name"))?;
    let price = float_field(body, "price")?.ok_or(ValidationFailure::MissingField("price"))?;
    let category =
        text_field(body, "category")?.ok_or(ValidationFailure::MissingField("category"))?;

    let original_price = float_field(body, "original_price")?;
    let discount_percent = float_field(body, "discount_percent")?;
    let rating = float_field(body, "rating")?;
    let sales_count = int_field(body, "sales_count")?;
    let review_count = int_field(body, "review_count")?;
    let stock = int_field(body, "stock")?;
    let seller_name = text_field(body, "seller_name")?;
    let seller_location = text_field(body, "seller_location")?;

    // A timestamp that is absent or unusable is not an error: the transformer
    // falls back to the ingestion date.
    let timestamp = match body.get("timestamp") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        _ => None,
    };

    if price <= 0.0 {
        return Err(ValidationFailure::DomainViolation("price"));
    }
    if matches!(sales_count, Some(n) if n < 0) {
        return Err(ValidationFailure::DomainViolation("sales_count"));
    }
    if matches!(discount_percent, Some(d) if !(0.0..=100.0).contains(&d)) {
        return Err(ValidationFailure::DomainViolation("discount_percent"));
    }
    if matches!(rating, Some(r) if !(0.0..=5.0).contains(&r)) {
        return Err(ValidationFailure::DomainViolation("rating"));
    }

    Ok(CanonicalCandidate {
        product_id,
        product_name,
        category,
        price,
        original_price,
        discount_percent,
        sales_count,
        rating,
        review_count,
        stock,
        seller_name,
        seller_location,
        timestamp,
    })
}

/// Coerce a field to trimmed text. Numbers are accepted (upstream sources
/// routinely send numeric ids); blank strings count as absent.
fn text_field(body: &Value, field: &'static str) -> Result<Option<String>, ValidationFailure> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_owned()))
        }
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(ValidationFailure::TypeCoercionFailed(field)),
    }
}

/// Coerce a field to a float. Numeric strings are accepted.
fn float_field(body: &Value, field: &'static str) -> Result<Option<f64>, ValidationFailure> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) => Ok(Some(v)),
            None => Err(ValidationFailure::TypeCoercionFailed(field)),
        },
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<f64>()
                .map(Some)
                .map_err(|_| ValidationFailure::TypeCoercionFailed(field))
        }
        Some(_) => Err(ValidationFailure::TypeCoercionFailed(field)),
    }
}

/// Coerce a field to an integer. Floats with no fractional part are accepted,
/// anything else fails the record.
fn int_field(body: &Value, field: &'static str) -> Result<Option<i64>, ValidationFailure> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_i64() {
                return Ok(Some(v));
            }
            match n.as_f64() {
                Some(v) if v.fract() == 0.0 => Ok(Some(v as i64)),
                _ => Err(ValidationFailure::TypeCoercionFailed(field)),
            }
        }
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<i64>()
                .map(Some)
                .map_err(|_| ValidationFailure::TypeCoercionFailed(field))
        }
        Some(_) => Err(ValidationFailure::TypeCoercionFailed(field)),
    }
}
