//! Nominatim / OpenStreetMap geocoder client.
//!
//! Nominatim has strict rate limits; [`crate::resolve::GeocodeResolver`]
//! spaces out calls, this module only speaks the wire format.
//!
//! See <https://nominatim.org/release-docs/develop/api/Search/>

use async_trait::async_trait;

use crate::{ExternalGeocoder, GeocodeError};

pub const DEFAULT_BASE_URL: &str = "https://nominatim.openstreetmap.org/search";

/// Free-form Nominatim search, first match only.
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
}

impl NominatimGeocoder {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_owned(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl ExternalGeocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<(f64, f64)>, GeocodeError> {
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("q", query),
                ("countrycodes", "us"),
                ("format", "json"),
                ("limit", "1"),
            ])
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GeocodeError::RateLimited);
        }

        let body: serde_json::Value = resp.error_for_status()?.json().await?;
        parse_response(&body)
    }
}

fn parse_response(body: &serde_json::Value) -> Result<Option<(f64, f64)>, GeocodeError> {
    let results = body.as_array().ok_or_else(|| GeocodeError::Parse {
        message: "response is not an array".to_owned(),
    })?;

    let Some(first) = results.first() else {
        return Ok(None);
    };

    let coordinate = |key: &str| {
        first[key]
            .as_str()
            .and_then(|x| x.parse::<f64>().ok())
            .ok_or_else(|| GeocodeError::Parse {
                message: format!("missing {key} in response"),
            })
    };

    Ok(Some((coordinate("lat")?, coordinate("lon")?)))
}
