pub mod ingest;
pub mod run;
pub mod status;
