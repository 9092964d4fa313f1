use lpcache_api::error::CacheError;
use lpcache_engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("no {0} configured")]
    NoComponents(&'static str),

    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("drain task: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
