pub mod batch;
pub mod database;
pub mod health;
pub mod metrics;
pub mod pgqueue;
pub mod retry;
pub mod schema;
