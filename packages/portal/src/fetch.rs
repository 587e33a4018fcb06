//! Network driver for citation lookups.
//!
//! Every outbound request is preceded by a randomised politeness delay so
//! the crawler never hammers the portal, no matter which code path issues
//! the request.

use std::ops::RangeInclusive;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng as _;
use ticket_map_citation_models::CitationRecord;

use crate::session::SessionManager;
use crate::{PortalError, RecordSource, parse};

/// Politeness delay range, applied before every portal request.
pub const POLITENESS_DELAY_MS: RangeInclusive<u64> = 400..=1100;

/// Fetches citations from the portal search endpoint, optionally following
/// each result's detail page for violations, images, and agency fields.
pub struct CitationFetcher {
    client: reqwest::Client,
    session: SessionManager,
    fetch_details: bool,
}

impl CitationFetcher {
    #[must_use]
    pub const fn new(client: reqwest::Client, session: SessionManager) -> Self {
        Self {
            client,
            session,
            fetch_details: true,
        }
    }

    /// Disables the follow-up detail page request, leaving only the search
    /// row fields on each record.
    #[must_use]
    pub const fn without_details(mut self) -> Self {
        self.fetch_details = false;
        self
    }

    async fn politeness_delay() {
        let ms = {
            let mut rng = rand::thread_rng();
            rng.gen_range(POLITENESS_DELAY_MS)
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn search(&self, citation_number: u64) -> Result<reqwest::Response, PortalError> {
        let url = format!("{}/Citation/Search", self.session.base_url());
        let term = citation_number.to_string();

        Self::politeness_delay().await;
        let token = self.session.token().await?;
        let response = self
            .client
            .post(&url)
            .form(&search_form(&token, &term))
            .send()
            .await?;

        // An antiforgery rejection means the token aged out mid-flight.
        // Invalidate and retry once with a fresh one. Other client errors
        // (404, 413, ...) would fail identically on retry.
        if stale_token_status(response.status()) {
            log::debug!(
                "search for {citation_number} rejected with {}, refreshing token",
                response.status()
            );
            self.session.invalidate().await;

            Self::politeness_delay().await;
            let token = self.session.token().await?;
            let retried = self
                .client
                .post(&url)
                .form(&search_form(&token, &term))
                .send()
                .await?;
            return Ok(retried.error_for_status()?);
        }

        Ok(response.error_for_status()?)
    }

    async fn fetch_detail_page(&self, url: &str) -> Result<String, PortalError> {
        Self::politeness_delay().await;
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?)
    }
}

/// Statuses the portal's antiforgery filter issues for an expired or
/// mismatched token.
fn stale_token_status(status: reqwest::StatusCode) -> bool {
    matches!(
        status,
        reqwest::StatusCode::BAD_REQUEST | reqwest::StatusCode::FORBIDDEN
    )
}

fn search_form<'a>(token: &'a str, term: &'a str) -> [(&'static str, &'a str); 4] {
    [
        ("__RequestVerificationToken", token),
        ("Type", "NumberStrict"),
        ("Term", term),
        ("AdditionalTerm", ""),
    ]
}

#[async_trait]
impl RecordSource for CitationFetcher {
    async fn fetch(&self, citation_number: u64) -> Result<Option<CitationRecord>, PortalError> {
        let body = self.search(citation_number).await?.text().await?;
        let Some(mut record) = parse::parse_search_results(&body, self.session.base_url())?
        else {
            return Ok(None);
        };

        if record.citation_number != citation_number {
            log::warn!(
                "searched for {citation_number} but the portal returned {}",
                record.citation_number
            );
        }

        if self.fetch_details
            && let Some(url) = record.more_info_url.clone()
        {
            // Detail fields are a bonus; a failed detail fetch never loses
            // the search row.
            match self.fetch_detail_page(&url).await {
                Ok(html) => {
                    let details = parse::parse_details(&html, self.session.base_url())?;
                    parse::merge_details(&mut record, details);
                }
                Err(e) => {
                    log::warn!("detail fetch for {citation_number} failed: {e:?}");
                }
            }
        }

        Ok(Some(record))
    }
}
