use thiserror::Error;
use tokio::sync::mpsc;

use crate::persist::PersistJob;
use crate::request::Step;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("The selector you are trying to scrape for is missing. Selector: {0}")]
    ParseMissingSelector(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No batch sizes keep a tile under the row limit of {limit}")]
    Infeasible { limit: usize },

    #[error("Invalid dimension `{name}`: {reason}")]
    InvalidDimension { name: String, reason: String },
    #[error("Tile is missing the `{0}` dimension")]
    MissingDimension(&'static str),
    #[error("Unknown topic: {0}")]
    UnknownTopic(u32),

    #[error("Transport failure during {step}: {source}")]
    Transport {
        step: Step,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Reqwest Error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Sqlite Error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Request queue lock poisoned")]
    LockPoisoned,
    #[error("No queued request with id {0}")]
    UnknownRequest(i64),
    #[error("Request {0} was given up on and can't be completed")]
    RequestClosed(i64),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Csv Error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Response table is missing the `{0}` column")]
    MissingColumn(String),

    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tokio Join Error, couldn't await a task! {0}")]
    RuntimeJoin(#[from] tokio::task::JoinError),
    #[error("Couldn't send a response to the persister.")]
    RuntimeSendError,
}

impl From<mpsc::error::SendError<PersistJob>> for Error {
    fn from(_value: mpsc::error::SendError<PersistJob>) -> Self {
        Error::RuntimeSendError
    }
}

impl Error {
    pub fn transport(step: Step, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Transport {
            step,
            source: source.into(),
        }
    }

    pub(crate) fn invalid_dimension(name: &str, reason: impl Into<String>) -> Self {
        Error::InvalidDimension {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
