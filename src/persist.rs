//! Response validation and the single queue writer.
//!
//! The orchestrator hands every fetched body to a [`Persister`] through a
//! bounded channel and moves straight on to the next tile. One writer task
//! owns all status transitions; storage runs on the blocking pool. Closing the
//! persister waits until every submitted body has been committed.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{spawn_blocking, JoinHandle};
use tracing::{debug, error, warn};

use crate::queue::{FailureOutcome, RequestQueue};
use crate::Result;

pub const FIELD_SEPARATOR: char = ';';
/// Diagnostic stored with every malformed response.
pub const MALFORMED_RESPONSE: &str = "Invalid CSV response";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Malformed,
}

/// Structural sanity check: at least two lines, and the first two lines carry
/// the same non-zero number of separators.
///
/// Garbled bodies that happen to share separator counts pass.
pub fn classify(body: &str) -> Verdict {
    let mut lines = body.split('\n');
    let (Some(first), Some(second)) = (lines.next(), lines.next()) else {
        return Verdict::Malformed;
    };
    let count = |line: &str| line.matches(FIELD_SEPARATOR).count();
    let separators = count(first);
    if separators > 0 && separators == count(second) {
        Verdict::Valid
    } else {
        Verdict::Malformed
    }
}

#[derive(Debug)]
pub struct PersistJob {
    pub request_id: i64,
    pub body: String,
}

/// What the writer did with the jobs it received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub stored: usize,
    pub malformed: usize,
    /// Malformed responses that moved their request to `Error`.
    pub escalated: usize,
    /// Jobs that could not be written at all.
    pub storage_errors: usize,
}

enum Persisted {
    Stored,
    Rejected(FailureOutcome),
}

fn persist(queue: &RequestQueue, job: &PersistJob) -> Result<Persisted> {
    match classify(&job.body) {
        Verdict::Valid => {
            queue.mark_done(job.request_id, &job.body)?;
            Ok(Persisted::Stored)
        }
        Verdict::Malformed => {
            let outcome = queue.mark_failed(job.request_id, MALFORMED_RESPONSE)?;
            Ok(Persisted::Rejected(outcome))
        }
    }
}

async fn run_writer(queue: Arc<RequestQueue>, mut rx: mpsc::Receiver<PersistJob>) -> PersistStats {
    let mut stats = PersistStats::default();

    while let Some(job) = rx.recv().await {
        let request_id = job.request_id;
        let result = spawn_blocking({
            let queue = queue.clone();
            move || persist(&queue, &job)
        })
        .await;

        match result {
            Ok(Ok(Persisted::Stored)) => {
                debug!(request_id, "stored response");
                stats.stored += 1;
            }
            Ok(Ok(Persisted::Rejected(FailureOutcome::Retained { failures }))) => {
                warn!(request_id, failures, "{MALFORMED_RESPONSE}");
                stats.malformed += 1;
            }
            Ok(Ok(Persisted::Rejected(FailureOutcome::Escalated { failures }))) => {
                error!(request_id, failures, "{MALFORMED_RESPONSE}, giving up on request");
                stats.malformed += 1;
                stats.escalated += 1;
            }
            Ok(Err(e)) => {
                error!(request_id, error = %e, "couldn't save response");
                stats.storage_errors += 1;
            }
            Err(e) => {
                error!(request_id, error = %e, "response writer task failed");
                stats.storage_errors += 1;
            }
        }
    }
    stats
}

pub struct Persister {
    tx: mpsc::Sender<PersistJob>,
    handle: JoinHandle<PersistStats>,
}

impl Persister {
    /// Spawns the writer task. At most `capacity` jobs wait in the channel;
    /// `submit` blocks beyond that.
    pub fn spawn(queue: Arc<RequestQueue>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_writer(queue, rx));
        Self { tx, handle }
    }

    pub async fn submit(&self, request_id: i64, body: String) -> Result<()> {
        self.tx.send(PersistJob { request_id, body }).await?;
        Ok(())
    }

    /// Closes the channel and waits for every queued job to be committed.
    pub async fn finish(self) -> Result<PersistStats> {
        drop(self.tx);
        Ok(self.handle.await?)
    }
}
