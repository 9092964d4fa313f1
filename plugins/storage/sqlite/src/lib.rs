mod config;
mod store;

pub use config::SqliteStoreConfig;
pub use store::SqliteCacheStore;
