pub mod batch;
pub mod delivery;
pub mod error;
pub mod record;
pub mod store;
