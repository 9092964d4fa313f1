use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::future::join_all;

use lpcache_api::batch::Batch;
use lpcache_api::delivery::{DeliveryClient, Outcome};
use lpcache_api::record::Offset;

/// Which destinations already hold the batch in flight.
#[derive(Debug)]
struct Progress {
    first: Offset,
    last: Offset,
    accepted: Vec<bool>,
}

/// Delivers every batch to several destinations.
///
/// The batch counts as accepted once all destinations accepted it. Retries
/// of the same batch only go to the destinations still missing it, so a
/// healthy destination is not written twice while another one recovers.
pub struct FanOutClient {
    name: String,
    destinations: Vec<Arc<dyn DeliveryClient>>,
    progress: Mutex<Option<Progress>>,
}

impl FanOutClient {
    pub fn new(destinations: Vec<Arc<dyn DeliveryClient>>) -> Self {
        let name = destinations
            .iter()
            .map(|d| d.name())
            .collect::<Vec<_>>()
            .join(",");
        Self {
            name: format!("fanout[{name}]"),
            destinations,
            progress: Mutex::new(None),
        }
    }

    /// Indices of destinations that still need `batch`.
    fn pending(&self, batch: &Batch) -> Vec<usize> {
        let mut progress = self.progress.lock().unwrap_or_else(|p| p.into_inner());
        let same_batch = progress
            .as_ref()
            .is_some_and(|p| p.first == batch.first_offset() && p.last == batch.last_offset());
        if !same_batch {
            *progress = Some(Progress {
                first: batch.first_offset(),
                last: batch.last_offset(),
                accepted: vec![false; self.destinations.len()],
            });
        }
        progress
            .as_ref()
            .map(|p| (0..self.destinations.len()).filter(|&i| !p.accepted[i]).collect())
            .unwrap_or_default()
    }

    fn mark_accepted(&self, index: usize) {
        let mut progress = self.progress.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(p) = progress.as_mut() {
            p.accepted[index] = true;
        }
    }

    fn finish(&self) {
        *self.progress.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

impl DeliveryClient for FanOutClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver<'a>(&'a self, batch: &'a Batch) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let pending = self.pending(batch);
            let attempts = pending.iter().map(|&i| {
                let destination = &self.destinations[i];
                async move { (i, destination.deliver(batch).await) }
            });

            let mut permanent: Option<Outcome> = None;
            let mut transient: Option<Outcome> = None;
            for (i, outcome) in join_all(attempts).await {
                let destination = self.destinations[i].name();
                match outcome {
                    Outcome::Accepted => self.mark_accepted(i),
                    Outcome::RejectedPermanent(reason) => {
                        tracing::warn!(destination, reason = %reason, "destination rejected batch");
                        permanent.get_or_insert(Outcome::RejectedPermanent(format!("{destination}: {reason}")));
                    }
                    Outcome::RejectedTransient(reason) => {
                        transient.get_or_insert(Outcome::RejectedTransient(format!("{destination}: {reason}")));
                    }
                    Outcome::NetworkFailure(reason) => {
                        transient.get_or_insert(Outcome::NetworkFailure(format!("{destination}: {reason}")));
                    }
                }
            }

            match permanent.or(transient) {
                Some(failure) => failure,
                None => {
                    self.finish();
                    Outcome::Accepted
                }
            }
        })
    }
}
