use std::sync::{Arc, Mutex};

use brascrap::dimension::TopicId;
use brascrap::parse::Catalog;
use brascrap::process::{fetch_catalog, merge_topic, populate, Orchestrator};
use brascrap::queue::{RequestQueue, RequestStatus};
use brascrap::request::{Connector, Session, Step};
use brascrap::tile::FilterPayload;
use brascrap::{Error, Result};

const CATALOG_HTML: &str = r#"
    <ul>
      <li class="menySol"><a href="anmalda/urval/urval?menyid=37"><span class="menytext">Misshandel</span></a></li>
      <li class="menyText">Misshandel per region</li>
    </ul>"#;

const TOPIC_HTML: &str = r#"
    <script>
      arrayNivatva[0]="11*Misshandel inomhus*10";
      arrayNivatva[1]="12*Misshandel utomhus*10";
      arrayNivatva[2]="13*Grov misshandel*10";
      arrayRegionNivaTva[0]="1480*Göteborg*14";
      arrayRegionNivaTva[1]="180*Stockholm*1";
      arrayPeriod[0]="2019*Helår*1*2019, helår";
      arrayPeriod[1]="2020*Helår*1*2020, helår";
    </script>"#;

#[derive(Default)]
struct PortalState {
    connects: usize,
    calls: Vec<String>,
    submits: usize,
    /// The submit with this (1-based) number fails.
    fail_submit: Option<usize>,
    /// Tiles for this crime id get a single-line body.
    malformed_crime: Option<String>,
}

/// In-process stand-in for the portal, tracking the calls it receives.
#[derive(Clone, Default)]
struct Portal {
    state: Arc<Mutex<PortalState>>,
}

impl Portal {
    fn failing_at_submit(n: usize) -> Self {
        let portal = Portal::default();
        portal.state.lock().unwrap().fail_submit = Some(n);
        portal
    }

    fn malformed_for(crime: &str) -> Self {
        let portal = Portal::default();
        portal.state.lock().unwrap().malformed_crime = Some(crime.to_string());
        portal
    }

    fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn submitted(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("submit:").map(str::to_string))
            .collect()
    }

    fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }
}

struct PortalSession {
    portal: Portal,
    selected: Mutex<Option<TopicId>>,
    last_filter: Mutex<Option<FilterPayload>>,
}

impl Connector for Portal {
    type Session = PortalSession;

    fn connect(&self) -> Result<PortalSession> {
        self.state.lock().unwrap().connects += 1;
        Ok(PortalSession {
            portal: self.clone(),
            selected: Mutex::new(None),
            last_filter: Mutex::new(None),
        })
    }
}

impl PortalSession {
    fn record(&self, call: String) {
        self.portal.state.lock().unwrap().calls.push(call);
    }
}

impl Session for PortalSession {
    async fn open_catalog(&self) -> Result<String> {
        self.record("catalog".into());
        Ok(CATALOG_HTML.to_string())
    }

    async fn select_topic(&self, topic: TopicId) -> Result<String> {
        self.record(format!("select:{topic}"));
        *self.selected.lock().unwrap() = Some(topic);
        Ok(TOPIC_HTML.to_string())
    }

    async fn submit_filter(&self, payload: &FilterPayload) -> Result<()> {
        if self.selected.lock().unwrap().is_none() {
            return Err(Error::transport(Step::SubmitFilter, "no topic selected"));
        }
        {
            let mut state = self.portal.state.lock().unwrap();
            state.submits += 1;
            if state.fail_submit == Some(state.submits) {
                return Err(Error::transport(Step::SubmitFilter, "connection reset"));
            }
        }
        self.record(format!("submit:{}", payload.brottstyp_id_string));
        *self.last_filter.lock().unwrap() = Some(payload.clone());
        Ok(())
    }

    async fn trigger_search(&self) -> Result<()> {
        self.record("search".into());
        Ok(())
    }

    async fn fetch_result(&self) -> Result<String> {
        self.record("fetch".into());
        let filter = self.last_filter.lock().unwrap().clone();
        let Some(filter) = filter else {
            return Err(Error::transport(Step::FetchResult, "no search"));
        };
        let malformed = self.portal.state.lock().unwrap().malformed_crime.clone();
        if malformed.as_deref() == Some(filter.brottstyp_id_string.as_str()) {
            return Ok("Inga data".to_string());
        }
        let mut body = String::from("Region;Brott;År;Period;Antal;/100 000 inv;\n");
        for crime in filter.brottstyp_id_string.split('*') {
            for region in filter.region_id_string.split('*') {
                for period in filter.period_id_string.split('*') {
                    body.push_str(&format!("R{region};B{crime};{period};Helår;1;3;\n"));
                }
            }
        }
        Ok(body)
    }
}

fn payload(crime: usize) -> FilterPayload {
    FilterPayload {
        brottstyp_id_string: crime.to_string(),
        region_id_string: "1*2".into(),
        period_id_string: "2020".into(),
        antal: 1,
        antal_100k: 1,
    }
}

fn queue_with(topic: TopicId, n: usize) -> Arc<RequestQueue> {
    let queue = RequestQueue::in_memory().unwrap();
    let payloads: Vec<_> = (0..n).map(payload).collect();
    queue.bulk_enqueue(topic, &payloads).unwrap();
    Arc::new(queue)
}

#[tokio::test]
async fn resume_only_processes_unfinished_requests() {
    let topic = TopicId(37);
    let queue = queue_with(topic, 10);
    let pending = queue.fetch_pending(Some(topic)).unwrap();
    for request in &pending[..6] {
        queue.mark_done(request.id, "earlier;run\nkept;as-is").unwrap();
    }

    let portal = Portal::default();
    let orchestrator = Orchestrator::new(portal.clone(), queue.clone(), 4);
    let report = orchestrator.run(None).await.unwrap();

    assert_eq!(portal.submitted(), ["6", "7", "8", "9"]);
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].fetched, 4);
    assert_eq!(report.completed[0].persisted.stored, 4);

    let counts = queue.status_counts(Some(topic)).unwrap();
    assert_eq!((counts.pending, counts.done), (0, 10));
    let responses = queue.done_responses(topic).unwrap();
    assert!(responses[..6].iter().all(|r| r.text == "earlier;run\nkept;as-is"));
    assert!(responses[6..].iter().all(|r| r.text.starts_with("Region;")));
}

#[tokio::test]
async fn protocol_steps_run_in_order_over_one_session() {
    let topic = TopicId(37);
    let queue = queue_with(topic, 2);
    let portal = Portal::default();

    Orchestrator::new(portal.clone(), queue, 1)
        .run_topic(topic)
        .await
        .unwrap();

    assert_eq!(portal.connects(), 1);
    assert_eq!(
        portal.calls(),
        [
            "catalog", "select:37", "submit:0", "search", "fetch", "submit:1", "search", "fetch"
        ]
    );
}

#[tokio::test]
async fn transport_failure_aborts_topic_and_keeps_rest_pending() {
    let topic = TopicId(37);
    let queue = queue_with(topic, 5);

    let failing = Portal::failing_at_submit(3);
    let report = Orchestrator::new(failing.clone(), queue.clone(), 2)
        .run(None)
        .await
        .unwrap();

    assert!(report.completed.is_empty());
    assert_eq!(report.aborted.len(), 1);
    assert!(matches!(
        report.aborted[0].1,
        Error::Transport {
            step: Step::SubmitFilter,
            ..
        }
    ));
    // Responses fetched before the failure are committed before the run returns.
    let counts = queue.status_counts(Some(topic)).unwrap();
    assert_eq!((counts.done, counts.pending), (2, 3));

    let healthy = Portal::default();
    Orchestrator::new(healthy.clone(), queue.clone(), 2)
        .run(None)
        .await
        .unwrap();
    assert_eq!(healthy.submitted(), ["2", "3", "4"]);
    assert_eq!(queue.status_counts(Some(topic)).unwrap().done, 5);
}

#[tokio::test]
async fn malformed_response_stays_pending_for_next_run() {
    let topic = TopicId(37);
    let queue = queue_with(topic, 3);

    let portal = Portal::malformed_for("1");
    let report = Orchestrator::new(portal, queue.clone(), 2)
        .run(None)
        .await
        .unwrap();
    assert_eq!(report.completed[0].persisted.stored, 2);
    assert_eq!(report.completed[0].persisted.malformed, 1);

    let pending = queue.fetch_pending(Some(topic)).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload.brottstyp_id_string, "1");
    assert_eq!(pending[0].status, RequestStatus::Pending);
    assert_eq!(queue.failures(pending[0].id).unwrap().len(), 1);

    let retry = Portal::default();
    Orchestrator::new(retry.clone(), queue.clone(), 2)
        .run(None)
        .await
        .unwrap();
    assert_eq!(retry.submitted(), ["1"]);
    assert!(queue.fetch_pending(None).unwrap().is_empty());
}

#[tokio::test]
async fn each_topic_gets_its_own_session() {
    let queue = queue_with(TopicId(37), 1);
    queue.bulk_enqueue(TopicId(40), &[payload(9)]).unwrap();
    let portal = Portal::default();

    let report = Orchestrator::new(portal.clone(), queue, 2)
        .run(None)
        .await
        .unwrap();

    assert_eq!(report.completed.len(), 2);
    assert_eq!(portal.connects(), 2);
    let selects: Vec<_> = portal
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("select:"))
        .collect();
    assert_eq!(selects, ["select:37", "select:40"]);
}

#[tokio::test]
async fn catalog_to_csv() {
    let portal = Portal::default();
    let catalog: Catalog = fetch_catalog(&portal).await.unwrap();
    assert_eq!(catalog.topic_ids(), [TopicId(37)]);

    let queue = Arc::new(RequestQueue::in_memory().unwrap());
    // 3 crimes × 2 regions × 2 periods × 2 measures, at most 6 rows per tile.
    let report = populate(&queue, &catalog, &catalog.topic_ids(), 6, true).unwrap();
    assert!(report.failed.is_empty());
    let queued = report.queued;
    assert_eq!(queued, queue.fetch_pending(None).unwrap().len());
    assert!(queued >= 4);

    Orchestrator::new(portal, queue.clone(), 4)
        .run(None)
        .await
        .unwrap();
    assert_eq!(queue.status_counts(None).unwrap().done as usize, queued);

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("topic_37.csv");
    let rows = merge_topic(&queue, TopicId(37), &output).unwrap();
    // Tiles split by measure return the same rows twice; they are merged once.
    assert_eq!(rows, 3 * 2 * 2);
    let csv = std::fs::read_to_string(&output).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("Region,Brott,År,Period,Antal,/100 000 inv"));
    assert_eq!(lines.next(), Some("R1480,B11,2019,Helår,1,3"));
}
