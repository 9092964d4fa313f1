mod client;
mod config;

pub use client::{InfluxDbClient, classify_status};
pub use config::{InfluxDbConfig, Precision};
