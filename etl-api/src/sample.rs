use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};

const CATEGORIES: [&str; 5] = [
    "Elektronik",
    "Fashion",
    "Makanan",
    "Kesehatan",
    "Rumah Tangga",
];

const SELLER_LOCATIONS: [&str; 5] = ["Jakarta", "Bandung", "Surabaya", "Medan", "Semarang"];

/// Generates synthetic sales records for smoke-testing the pipeline end to
/// end. Every generated record passes validation: the generator never emits
/// missing fields or out-of-range values.
pub fn generate_records(count: usize) -> Vec<Value> {
    let mut rng = rand::thread_rng();
    let timestamp = Utc::now().to_rfc3339();

    (0..count)
        .map(|i| {
            json!({
                "product_id": format!("PROD{:05}", i),
                "product_name": format!("Produk {}", i + 1),
                "category": CATEGORIES.choose(&mut rng),
                "price": rng.gen_range(10_000..=500_000),
                "original_price": rng.gen_range(10_000..=500_000),
                "discount_percent": rng.gen_range(0..=50),
                "sales_count": rng.gen_range(0..=1_000),
                "rating": (rng.gen_range(3.0..=5.0_f64) * 10.0).round() / 10.0,
                "review_count": rng.gen_range(0..=500),
                "stock": rng.gen_range(0..=100),
                "seller_name": format!("Seller {}", rng.gen_range(1..=20)),
                "seller_location": SELLER_LOCATIONS.choose(&mut rng),
                "timestamp": timestamp,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_requested_count() {
        assert_eq!(generate_records(0).len(), 0);
        assert_eq!(generate_records(10).len(), 10);
        assert_eq!(generate_records(37).len(), 37);
    }

    #[test]
    fn test_records_are_clean() {
        for record in generate_records(50) {
            let product_id = record["product_id"].as_str().unwrap();
            assert!(product_id.starts_with("PROD"));
            assert_eq!(product_id.len(), 9);

            assert!(!record["product_name"].as_str().unwrap().is_empty());
            assert!(CATEGORIES.contains(&record["category"].as_str().unwrap()));
            assert!(SELLER_LOCATIONS.contains(&record["seller_location"].as_str().unwrap()));

            let price = record["price"].as_i64().unwrap();
            assert!((10_000..=500_000).contains(&price));

            let discount = record["discount_percent"].as_i64().unwrap();
            assert!((0..=50).contains(&discount));

            let rating = record["rating"].as_f64().unwrap();
            assert!((3.0..=5.0).contains(&rating));

            assert!(record["sales_count"].as_i64().unwrap() >= 0);
            assert!(record["stock"].as_i64().unwrap() >= 0);
            assert!(record["timestamp"].as_str().is_some());
        }
    }

    #[test]
    fn test_product_ids_are_sequential() {
        let records = generate_records(3);
        let ids: Vec<&str> = records
            .iter()
            .map(|r| r["product_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["PROD00000", "PROD00001", "PROD00002"]);
    }
}
