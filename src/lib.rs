//! Resumable scraper for the BRÅ crime statistics portal.
//!
//! The portal returns at most a bounded number of rows per query, so each
//! topic's crime × region × period × measure space is cut into tiles
//! ([`optimize`], [`tile`]) that are queued in SQLite ([`queue`]) and fetched
//! one after another over a single session ([`process`]). Responses are
//! validated and committed by one writer task ([`persist`]); anything not
//! `Done` is picked up again by the next run.

mod error;
mod macros;

pub mod config;
pub mod dimension;
pub mod merge;
pub mod optimize;
pub mod parse;
pub mod persist;
pub mod process;
pub mod queue;
pub mod request;
pub mod tile;

pub use config::Config;
pub use error::{Error, Result};
