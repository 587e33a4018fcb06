#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Citation persistence.
//!
//! [`CitationStore`] is the seam between the crawl pipeline and storage.
//! Every write path merges field-by-field: a present incoming value wins,
//! an absent one leaves the stored value alone. That makes re-scans and
//! enrichment passes idempotent and order-independent. [`SqliteStore`] is
//! the production implementation; [`MemoryStore`] backs tests.

use std::collections::BTreeSet;

use async_trait::async_trait;
use ticket_map_citation_models::{CitationRecord, Subscription, coalesce_text};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("citation number {0} exceeds the storable range")]
    IdOutOfRange(u64),
    #[error("{0}")]
    Unavailable(String),
}

/// Result of a bulk upsert. Individual row failures are collected rather
/// than aborting the batch.
#[derive(Debug, Default)]
pub struct BulkUpsertOutcome {
    pub success_count: usize,
    pub failed_count: usize,
    pub errors: Vec<(u64, String)>,
}

/// Persistence seam for citations, subscriptions, and the scrape-attempt
/// log. All range bounds are inclusive.
#[async_trait]
pub trait CitationStore: Send + Sync {
    async fn upsert_citation(&self, record: &CitationRecord) -> Result<(), StoreError>;

    async fn bulk_upsert_citations(
        &self,
        records: &[CitationRecord],
    ) -> Result<BulkUpsertOutcome, StoreError>;

    async fn existing_ids_in_range(
        &self,
        min: u64,
        max: u64,
    ) -> Result<BTreeSet<u64>, StoreError>;

    async fn max_id_in_range(&self, min: u64, max: u64) -> Result<Option<u64>, StoreError>;

    /// First coordinates ever resolved for this exact location string, if any.
    async fn cached_coordinates_for_location(
        &self,
        location: &str,
    ) -> Result<Option<(f64, f64)>, StoreError>;

    async fn update_coordinates(
        &self,
        citation_number: u64,
        latitude: f64,
        longitude: f64,
    ) -> Result<(), StoreError>;

    /// Citations that carry a location string but no coordinates yet.
    async fn ungeocoded_locations(&self, limit: usize)
    -> Result<Vec<(u64, String)>, StoreError>;

    /// Citations with stored images but no officer fields, for OCR backfill.
    async fn citations_missing_officer_info(
        &self,
        limit: usize,
    ) -> Result<Vec<CitationRecord>, StoreError>;

    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    async fn log_scrape_attempt(
        &self,
        citation_number: u64,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), StoreError>;
}

/// Field-level merge used by every upsert path. Present incoming values win,
/// absent ones leave the stored row untouched, so re-scans and enrichment
/// passes compose in any order.
pub fn merge_citation(existing: &mut CitationRecord, incoming: &CitationRecord) {
    coalesce_text(&mut existing.location, incoming.location.as_deref());
    coalesce_text(&mut existing.plate_state, incoming.plate_state.as_deref());
    coalesce_text(&mut existing.plate_number, incoming.plate_number.as_deref());
    coalesce_text(&mut existing.vin, incoming.vin.as_deref());
    coalesce_text(&mut existing.status, incoming.status.as_deref());
    coalesce_text(&mut existing.more_info_url, incoming.more_info_url.as_deref());
    coalesce_text(&mut existing.issuing_agency, incoming.issuing_agency.as_deref());
    coalesce_text(&mut existing.comments, incoming.comments.as_deref());
    coalesce_text(&mut existing.officer_badge, incoming.officer_badge.as_deref());
    coalesce_text(&mut existing.officer_name, incoming.officer_name.as_deref());
    coalesce_text(&mut existing.officer_beat, incoming.officer_beat.as_deref());

    if incoming.issue_date.is_some() {
        existing.issue_date = incoming.issue_date;
    }
    if incoming.due_date.is_some() {
        existing.due_date = incoming.due_date;
    }
    if incoming.amount_due.is_some() {
        existing.amount_due = incoming.amount_due;
    }
    if !incoming.violations.is_empty() {
        existing.violations = incoming.violations.clone();
    }
    if !incoming.image_urls.is_empty() {
        existing.image_urls = incoming.image_urls.clone();
    }
    if incoming.latitude.is_some() && incoming.longitude.is_some() {
        existing.latitude = incoming.latitude;
        existing.longitude = incoming.longitude;
        existing.geocoded_at = incoming.geocoded_at;
    }
}
