#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Client for the city's parking citation portal.
//!
//! The portal is an ASP.NET application: every search POST must carry a
//! `__RequestVerificationToken` scraped from the landing page, paired with
//! the session cookie the landing page sets. [`session::SessionManager`]
//! owns that token, [`fetch::CitationFetcher`] drives the search and
//! details requests, and [`parse`] turns the returned HTML into
//! [`ticket_map_citation_models::CitationRecord`] values.

use std::time::Duration;

use async_trait::async_trait;
use ticket_map_citation_models::CitationRecord;

pub mod fetch;
pub mod parse;
pub mod session;

pub use fetch::CitationFetcher;
pub use session::SessionManager;

/// Request timeout applied to every portal call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("no __RequestVerificationToken found on the portal landing page")]
    TokenMissing,
    #[error("portal markup did not match the expected layout: {message}")]
    Schema { message: String },
    #[error("unparseable portal timestamp: {raw}")]
    Timestamp { raw: String },
}

/// Source of citation records, keyed by citation number.
///
/// `Ok(None)` means the portal affirmatively reported no record for that
/// number; errors mean the lookup itself failed and may be retried later.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, citation_number: u64) -> Result<Option<CitationRecord>, PortalError>;
}

/// Builds the shared HTTP client used for all portal traffic.
///
/// The cookie store is required: the verification token is only valid
/// together with the cookie issued alongside it.
///
/// # Errors
///
/// * If the TLS backend cannot be initialised
pub fn build_client() -> Result<reqwest::Client, PortalError> {
    Ok(reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .cookie_store(true)
        .user_agent(concat!("ticket-map/", env!("CARGO_PKG_VERSION")))
        .build()?)
}
