//! Portal session handling.
//!
//! The landing page embeds a `__RequestVerificationToken` hidden input that
//! must accompany every search POST. Tokens go stale quickly, so a cached
//! token is reused for at most [`TOKEN_TTL`] before a fresh landing page is
//! fetched.

use std::time::Duration;

use scraper::{Html, Selector};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::PortalError;

/// How long a scraped verification token is trusted before re-fetching.
pub const TOKEN_TTL: Duration = Duration::from_secs(60);

struct CachedToken {
    value: String,
    fetched_at: Instant,
}

/// Owns the verification token for one portal session.
///
/// The token lives behind an async mutex so concurrent callers never race a
/// refresh; whichever caller wins the lock refreshes, the rest reuse the
/// result.
pub struct SessionManager {
    client: reqwest::Client,
    base_url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            cached: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns a verification token, refreshing it when missing or older
    /// than [`TOKEN_TTL`].
    ///
    /// # Errors
    ///
    /// * If the landing page cannot be fetched
    /// * If the landing page carries no token input ([`PortalError::TokenMissing`])
    pub async fn token(&self) -> Result<String, PortalError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.fetched_at.elapsed() < TOKEN_TTL
        {
            return Ok(token.value.clone());
        }

        let value = self.fetch_token().await?;
        *cached = Some(CachedToken {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        Ok(value)
    }

    /// Drops the cached token so the next [`Self::token`] call re-fetches.
    /// Called after a search the portal rejected.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn fetch_token(&self) -> Result<String, PortalError> {
        log::debug!("refreshing verification token from {}", self.base_url);
        let body = self
            .client
            .get(&self.base_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        extract_token(&body)
    }
}

/// Pulls the verification token out of landing-page HTML.
///
/// # Errors
///
/// * [`PortalError::TokenMissing`] if no token input is present
pub fn extract_token(html: &str) -> Result<String, PortalError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("input[name=\"__RequestVerificationToken\"]")
        .map_err(|e| PortalError::Schema {
            message: format!("invalid token selector: {e}"),
        })?;

    document
        .select(&selector)
        .find_map(|input| input.value().attr("value"))
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .ok_or(PortalError::TokenMissing)
}

#[cfg(test)]
mod tests {
    use super::extract_token;

    #[test]
    fn extracts_hidden_token_input() {
        let html = r#"
            <html><body><form action="/Citation/Search">
                <input name="__RequestVerificationToken" type="hidden" value="CfDJ8abc123" />
            </form></body></html>
        "#;
        assert_eq!(extract_token(html).unwrap(), "CfDJ8abc123");
    }

    #[test]
    fn missing_token_is_an_error() {
        let html = "<html><body><form></form></body></html>";
        assert!(matches!(
            extract_token(html),
            Err(crate::PortalError::TokenMissing)
        ));
    }

    #[test]
    fn empty_token_value_is_an_error() {
        let html = r#"<input name="__RequestVerificationToken" value="" />"#;
        assert!(extract_token(html).is_err());
    }
}
