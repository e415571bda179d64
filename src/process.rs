use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use tokio::task::spawn_blocking;
use tracing::{debug, error, info, warn};

use crate::dimension::TopicId;
use crate::merge::{combine, normalize_response, write_csv};
use crate::optimize::optimize;
use crate::parse::{parse_dimensions, parse_topics, Catalog};
use crate::persist::{PersistStats, Persister};
use crate::queue::{Request, RequestQueue};
use crate::request::{Connector, Session};
use crate::tile::{enumerate, FilterPayload};
use crate::{info_time, Error, Result};

/// Where a topic run stands in the portal protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    SessionInit,
    TopicSelected,
    PayloadSubmitted,
    SearchTriggered,
    ResultFetched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicReport {
    pub topic: TopicId,
    /// Tiles whose result was fetched and handed to the writer.
    pub fetched: usize,
    pub persisted: PersistStats,
}

#[derive(Debug, Default)]
pub struct CrawlReport {
    pub completed: Vec<TopicReport>,
    /// Topics whose run stopped on a transport failure; their tiles stay pending.
    pub aborted: Vec<(TopicId, Error)>,
}

/// Drives the per-topic protocol over the pending requests of the queue.
pub struct Orchestrator<C: Connector> {
    connector: C,
    queue: Arc<RequestQueue>,
    persist_capacity: usize,
}

impl<C: Connector> Orchestrator<C> {
    pub fn new(connector: C, queue: Arc<RequestQueue>, persist_capacity: usize) -> Self {
        Self {
            connector,
            queue,
            persist_capacity,
        }
    }

    /// Runs every topic that still has pending requests, or only `topics`.
    ///
    /// A transport failure aborts that topic only. Calling this again
    /// re-attempts exactly the requests that are not `Done` yet.
    pub async fn run(&self, topics: Option<&[TopicId]>) -> Result<CrawlReport> {
        let start_time = Local::now();
        let topics = match topics {
            Some(topics) => topics.to_vec(),
            None => {
                let queue = self.queue.clone();
                spawn_blocking(move || queue.topics_with_pending()).await??
            }
        };

        let mut report = CrawlReport::default();
        for topic in topics {
            match self.run_topic(topic).await {
                Ok(topic_report) => report.completed.push(topic_report),
                Err(e @ Error::Transport { .. }) => {
                    warn!(%topic, error = %e, "topic run aborted, pending requests kept");
                    report.aborted.push((topic, e));
                }
                Err(e) => return Err(e),
            }
        }

        info_time!(
            start_time,
            "Finished crawl: {} topics completed, {} aborted",
            report.completed.len(),
            report.aborted.len()
        );
        Ok(report)
    }

    /// Executes all pending requests of `topic` over one session.
    ///
    /// Returns only after every fetched response has been committed, also
    /// when the run is aborted.
    pub async fn run_topic(&self, topic: TopicId) -> Result<TopicReport> {
        let queue = self.queue.clone();
        let pending = spawn_blocking(move || queue.fetch_pending(Some(topic))).await??;
        if pending.is_empty() {
            debug!(%topic, "nothing pending");
            return Ok(TopicReport {
                topic,
                fetched: 0,
                persisted: PersistStats::default(),
            });
        }

        let start_time = Local::now();
        info!(%topic, pending = pending.len(), "starting topic run");

        let session = self.connector.connect()?;
        let persister = Persister::spawn(self.queue.clone(), self.persist_capacity);
        let mut state = SessionState::SessionInit;
        let mut fetched = 0;

        let outcome = drive(&session, topic, &pending, &persister, &mut state, &mut fetched).await;
        let persisted = persister.finish().await?;

        if let Err(e) = outcome {
            error!(%topic, ?state, fetched, error = %e, "topic run failed");
            return Err(e);
        }

        info_time!(
            start_time,
            "Topic {topic}: fetched {fetched}, stored {}, malformed {}",
            persisted.stored,
            persisted.malformed
        );
        Ok(TopicReport {
            topic,
            fetched,
            persisted,
        })
    }
}

/// Walks the session through the protocol for each pending request.
async fn drive<S: Session>(
    session: &S,
    topic: TopicId,
    pending: &[Request],
    persister: &Persister,
    state: &mut SessionState,
    fetched: &mut usize,
) -> Result<()> {
    session.open_catalog().await?;
    session.select_topic(topic).await?;
    *state = SessionState::TopicSelected;

    let total = pending.len();
    for (n, request) in pending.iter().enumerate() {
        debug!(%topic, request_id = request.id, "executing request {}/{total}", n + 1);

        session.submit_filter(&request.payload).await?;
        *state = SessionState::PayloadSubmitted;
        session.trigger_search().await?;
        *state = SessionState::SearchTriggered;
        let body = session.fetch_result().await?;
        *state = SessionState::ResultFetched;

        persister.submit(request.id, body).await?;
        *fetched += 1;
        // The selected topic stays in the session for the next tile.
        *state = SessionState::TopicSelected;
    }
    Ok(())
}

/// Fetches topics and their dimension tables from the portal.
pub async fn fetch_catalog<C: Connector>(connector: &C) -> Result<Catalog> {
    let start_time = Local::now();
    let session = connector.connect()?;
    let html = session.open_catalog().await?;
    let topics = spawn_blocking(move || parse_topics(&html)).await??;

    let mut catalog = Catalog::default();
    for topic in &topics {
        // Fresh session per topic, the selection is session state.
        let session = connector.connect()?;
        session.open_catalog().await?;
        let page = session.select_topic(topic.id).await?;
        let dims = spawn_blocking(move || parse_dimensions(&page)).await?;
        info!(
            topic = %topic.id,
            crime = dims.crime.len(),
            region = dims.region.len(),
            period = dims.period.len(),
            "extracted dimensions"
        );
        catalog.dimensions.insert(topic.id, dims);
    }
    catalog.topics = topics;

    info_time!(start_time, "Fetched catalog of {} topics", catalog.topics.len());
    Ok(catalog)
}

/// Reads the cached catalog at `path`, fetching and caching it when absent.
pub async fn load_catalog<C: Connector>(connector: &C, path: &Path) -> Result<Catalog> {
    if path.exists() {
        debug!(path = %path.display(), "using cached catalog");
        return Catalog::load(path);
    }
    let catalog = fetch_catalog(connector).await?;
    catalog.save(path)?;
    Ok(catalog)
}

#[derive(Debug, Default)]
pub struct PopulateReport {
    /// Requests inserted; tiles already in the queue are not counted.
    pub queued: usize,
    /// Topics that could not be planned, with the reason. Nothing was queued for them.
    pub failed: Vec<(TopicId, Error)>,
}

/// Plans and enqueues the tiles of `topics`.
///
/// With `reset` the queue is wiped first, discarding earlier progress.
/// Otherwise tiles that are already queued are kept as they are. A topic
/// whose dimensions or plan are invalid is skipped and reported; storage
/// errors stop the whole run.
pub fn populate(
    queue: &RequestQueue,
    catalog: &Catalog,
    topics: &[TopicId],
    row_limit: usize,
    reset: bool,
) -> Result<PopulateReport> {
    if reset {
        warn!("resetting request queue");
        queue.reset_all()?;
    }

    let mut report = PopulateReport::default();
    for &topic in topics {
        let payloads = match plan_topic(catalog, topic, row_limit) {
            Ok(payloads) => payloads,
            Err(e) => {
                error!(%topic, error = %e, "couldn't plan topic, skipping");
                report.failed.push((topic, e));
                continue;
            }
        };

        let queued = queue.bulk_enqueue(topic, &payloads)?;
        report.queued += queued;
        info!(%topic, tiles = payloads.len(), queued, "queued requests");
    }
    Ok(report)
}

fn plan_topic(catalog: &Catalog, topic: TopicId, row_limit: usize) -> Result<Vec<FilterPayload>> {
    let dims = catalog.dimension_set(topic)?;
    let plan = optimize(&dims.domain_sizes(), row_limit)?;
    debug!(%topic, rows_per_tile = plan.rows_per_tile(), "planned batch sizes");
    enumerate(&dims, &plan)?
        .iter()
        .map(FilterPayload::from_tile)
        .collect()
}

/// Merges the stored responses of `topic` into one CSV at `output`.
/// Returns the number of data rows written.
pub fn merge_topic(queue: &RequestQueue, topic: TopicId, output: &Path) -> Result<usize> {
    let responses = queue.done_responses(topic)?;
    let tables = responses
        .iter()
        .map(|r| normalize_response(&r.text))
        .collect::<Result<Vec<_>>>()?;
    let merged = combine(&tables)?;

    let file = File::create(output)?;
    write_csv(&merged, BufWriter::new(file))?;
    info!(%topic, responses = responses.len(), rows = merged.rows.len(), "wrote {}", output.display());
    Ok(merged.rows.len())
}
