pub mod batch;
pub mod config;
pub mod cursor;
pub mod drain;
pub mod error;
pub mod fanout;
pub mod gauge;
pub mod lock;
pub mod report;
pub mod retry;

pub use batch::BatchAssembler;
pub use config::{BatchLimits, DrainConfig, PermanentFailurePolicy, RetryPolicy, StartPosition};
pub use cursor::PositionTracker;
pub use drain::{DrainLoop, DrainSummary};
pub use error::EngineError;
pub use fanout::FanOutClient;
pub use gauge::BacklogGauge;
pub use lock::ConsumerLock;
pub use report::{DeadLetterFile, DrainStats, LogRejections, Rejection, RejectionSink};
pub use retry::{Backoff, Resolution, RetryController};
