//! Transport to the statistics portal.
//!
//! The portal keeps the current topic and filter selection in the server-side
//! session, so all calls for a topic must go through the same cookie-bearing
//! [`Session`]. A [`Connector`] hands out fresh sessions.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use tracing::warn;

use crate::config::Config;
use crate::dimension::TopicId;
use crate::tile::FilterPayload;
use crate::{Error, Result};

const CATALOG_PATH: &str = "start?menykatalogid=1";
const TOPIC_PATH: &str = "anmalda/urval/urval?menyid=";
const FILTER_PATH: &str = "anmalda/urval/vantapopup";
const SEARCH_PATH: &str = "anmalda/urval/sok";
const RESULT_PATH: &str = "anmalda/resultat/dbfil";

/// One call of the per-topic protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Catalog,
    SelectTopic,
    SubmitFilter,
    TriggerSearch,
    FetchResult,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Catalog => "catalog fetch",
            Step::SelectTopic => "topic selection",
            Step::SubmitFilter => "filter submission",
            Step::TriggerSearch => "search trigger",
            Step::FetchResult => "result fetch",
        };
        f.write_str(name)
    }
}

/// A stateful conversation with the portal.
pub trait Session: Send + Sync {
    /// Loads the topic catalog page, establishing the session.
    fn open_catalog(&self) -> impl Future<Output = Result<String>> + Send;
    /// Selects a topic; returns the topic page with its dimension tables.
    fn select_topic(&self, topic: TopicId) -> impl Future<Output = Result<String>> + Send;
    fn submit_filter(&self, payload: &FilterPayload) -> impl Future<Output = Result<()>> + Send;
    fn trigger_search(&self) -> impl Future<Output = Result<()>> + Send;
    /// Downloads the semicolon-separated result of the last search.
    fn fetch_result(&self) -> impl Future<Output = Result<String>> + Send;
}

pub trait Connector: Send + Sync {
    type Session: Session;

    fn connect(&self) -> Result<Self::Session>;
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    base: String,
}

impl Endpoints {
    pub fn new(base_url: &str) -> Self {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Self { base }
    }

    pub fn catalog(&self) -> String {
        format!("{}{CATALOG_PATH}", self.base)
    }

    pub fn topic(&self, topic: TopicId) -> String {
        format!("{}{TOPIC_PATH}{topic}", self.base)
    }

    pub fn filter(&self) -> String {
        format!("{}{FILTER_PATH}", self.base)
    }

    pub fn search(&self) -> String {
        format!("{}{SEARCH_PATH}", self.base)
    }

    pub fn result(&self) -> String {
        format!("{}{RESULT_PATH}", self.base)
    }
}

/// Builds reqwest sessions from the [`Config`] timeouts and retry policy.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    endpoints: Endpoints,
    request_timeout: Duration,
    connect_timeout: Duration,
    accept_invalid_certs: bool,
    retries: u32,
    backoff: Duration,
}

impl HttpConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            endpoints: Endpoints::new(&config.base_url),
            request_timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
            accept_invalid_certs: config.accept_invalid_certs,
            retries: config.step_retries,
            backoff: config.retry_backoff(),
        }
    }
}

impl Connector for HttpConnector {
    type Session = HttpSession;

    fn connect(&self) -> Result<HttpSession> {
        // A new cookie jar per session.
        let client = Client::builder()
            .cookie_store(true)
            .timeout(self.request_timeout)
            .connect_timeout(self.connect_timeout)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .build()?;
        Ok(HttpSession {
            client,
            endpoints: self.endpoints.clone(),
            retries: self.retries,
            backoff: self.backoff,
        })
    }
}

pub struct HttpSession {
    client: Client,
    endpoints: Endpoints,
    retries: u32,
    backoff: Duration,
}

impl HttpSession {
    /// Sends the request built by `build`, retrying up to `retries` times.
    async fn send<F>(&self, step: Step, build: F) -> Result<String>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            match Self::try_send(build()).await {
                Ok(body) => return Ok(body),
                Err(source) if attempt < self.retries => {
                    attempt += 1;
                    warn!(%step, attempt, error = %source, "retrying portal call");
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(source) => return Err(Error::transport(step, source)),
            }
        }
    }

    async fn try_send(request: RequestBuilder) -> reqwest::Result<String> {
        request.send().await?.error_for_status()?.text().await
    }
}

impl Session for HttpSession {
    async fn open_catalog(&self) -> Result<String> {
        let url = self.endpoints.catalog();
        self.send(Step::Catalog, || self.client.get(&url)).await
    }

    async fn select_topic(&self, topic: TopicId) -> Result<String> {
        let url = self.endpoints.topic(topic);
        self.send(Step::SelectTopic, || self.client.get(&url)).await
    }

    async fn submit_filter(&self, payload: &FilterPayload) -> Result<()> {
        let url = self.endpoints.filter();
        let form = payload.form();
        self.send(Step::SubmitFilter, || self.client.post(&url).form(&form))
            .await?;
        Ok(())
    }

    async fn trigger_search(&self) -> Result<()> {
        let url = self.endpoints.search();
        self.send(Step::TriggerSearch, || self.client.get(&url)).await?;
        Ok(())
    }

    async fn fetch_result(&self) -> Result<String> {
        let url = self.endpoints.result();
        self.send(Step::FetchResult, || self.client.post(&url)).await
    }
}
