#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Band-based incremental crawler.
//!
//! Citation numbers live in a few known disjoint bands. Each crawl cycle
//! recomputes a per-band high-water mark from the store, walks a window
//! around it, fetches what is not yet stored, enriches, persists, and
//! fans out alerts. One worker does everything in sequence; politeness
//! toward the portal matters more than throughput.

pub mod bands;
pub mod cycle;

pub use cycle::{Crawler, CycleSummary, DEFAULT_WINDOW, candidate_ids, crawl_window};

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] ticket_map_store::StoreError),
    #[error(transparent)]
    Portal(#[from] ticket_map_portal::PortalError),
    #[error(transparent)]
    Geocode(#[from] ticket_map_geocoder::GeocodeError),
    #[error("invalid band registry: {message}")]
    BandRegistry { message: String },
}
