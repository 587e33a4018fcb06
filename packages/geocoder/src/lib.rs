#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Location resolution for citations.
//!
//! Resolution order is fixed: coordinates already stored for the exact
//! location string, then the alias registry for strings the external
//! geocoder cannot handle, then the external geocoder itself. The
//! external hop is rate limited and only ever reached when both local
//! sources miss.

use async_trait::async_trait;

pub mod aliases;
pub mod nominatim;
pub mod resolve;

pub use aliases::{AliasRegistry, AliasResolution};
pub use nominatim::NominatimGeocoder;
pub use resolve::GeocodeResolver;

#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("geocoding service rate limited the request")]
    RateLimited,
    #[error("unexpected geocoder response: {message}")]
    Parse { message: String },
    #[error(transparent)]
    Store(#[from] ticket_map_store::StoreError),
}

/// External geocoding service. Implementations resolve a free-form query
/// to a coordinate pair, `None` when the service has no match.
#[async_trait]
pub trait ExternalGeocoder: Send + Sync {
    async fn geocode(&self, query: &str) -> Result<Option<(f64, f64)>, GeocodeError>;
}
