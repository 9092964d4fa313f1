use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::batch::Batch;

/// Classified result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Downstream durably holds every record of the batch.
    Accepted,
    /// Batch is unacceptable as-is; sending it again cannot help.
    RejectedPermanent(String),
    /// Downstream refused for now (throttling, overload); a retry may help.
    RejectedTransient(String),
    /// Downstream could not be reached or the attempt timed out.
    NetworkFailure(String),
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted)
    }

    /// Transient outcomes are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Outcome::RejectedTransient(_) | Outcome::NetworkFailure(_))
    }

    /// Short label for structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::RejectedPermanent(_) => "rejected_permanent",
            Outcome::RejectedTransient(_) => "rejected_transient",
            Outcome::NetworkFailure(_) => "network_failure",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Accepted => None,
            Outcome::RejectedPermanent(r) | Outcome::RejectedTransient(r) | Outcome::NetworkFailure(r) => Some(r),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {reason}", self.label()),
            None => f.write_str(self.label()),
        }
    }
}

/// Sends a batch downstream.
///
/// An attempt must resolve on its own (success, rejection or timeout);
/// the engine never drops a future returned by `deliver` mid-flight.
pub trait DeliveryClient: Send + Sync {
    /// Destination name for logs.
    fn name(&self) -> &str;

    fn deliver<'a>(&'a self, batch: &'a Batch) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>>;
}
