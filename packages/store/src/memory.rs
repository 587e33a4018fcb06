use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use ticket_map_citation_models::{CitationRecord, Subscription};

use crate::{BulkUpsertOutcome, CitationStore, StoreError, merge_citation};

/// Attempt row kept by the in-memory scrape log.
#[derive(Debug, Clone)]
pub struct ScrapeAttempt {
    pub citation_number: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// In-memory store, primarily for tests and one-off dry runs.
#[derive(Default)]
pub struct MemoryStore {
    citations: Mutex<BTreeMap<u64, CitationRecord>>,
    subscriptions: Mutex<Vec<Subscription>>,
    attempts: Mutex<Vec<ScrapeAttempt>>,
    fail_next_bulk: AtomicBool,
    fail_next_max_id: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subscription(&self, subscription: Subscription) {
        self.subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(subscription);
    }

    /// Makes the next `bulk_upsert_citations` call fail outright, to
    /// exercise the caller's per-record fallback path.
    pub fn fail_next_bulk(&self) {
        self.fail_next_bulk.store(true, Ordering::SeqCst);
    }

    /// Makes the next `max_id_in_range` call fail outright, to exercise
    /// the caller's handling of a band whose window cannot be computed.
    pub fn fail_next_max_id(&self) {
        self.fail_next_max_id.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn citation(&self, citation_number: u64) -> Option<CitationRecord> {
        self.citations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&citation_number)
            .cloned()
    }

    #[must_use]
    pub fn citation_count(&self) -> usize {
        self.citations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn attempts(&self) -> Vec<ScrapeAttempt> {
        self.attempts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn merge_in(&self, record: &CitationRecord) {
        let mut citations = self
            .citations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match citations.get_mut(&record.citation_number) {
            Some(existing) => merge_citation(existing, record),
            None => {
                citations.insert(record.citation_number, record.clone());
            }
        }
    }
}

#[async_trait]
impl CitationStore for MemoryStore {
    async fn upsert_citation(&self, record: &CitationRecord) -> Result<(), StoreError> {
        self.merge_in(record);
        Ok(())
    }

    async fn bulk_upsert_citations(
        &self,
        records: &[CitationRecord],
    ) -> Result<BulkUpsertOutcome, StoreError> {
        if self.fail_next_bulk.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("bulk writes disabled".into()));
        }
        for record in records {
            self.merge_in(record);
        }
        Ok(BulkUpsertOutcome {
            success_count: records.len(),
            failed_count: 0,
            errors: vec![],
        })
    }

    async fn existing_ids_in_range(
        &self,
        min: u64,
        max: u64,
    ) -> Result<BTreeSet<u64>, StoreError> {
        Ok(self
            .citations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .range(min..=max)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn max_id_in_range(&self, min: u64, max: u64) -> Result<Option<u64>, StoreError> {
        if self.fail_next_max_id.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("range queries disabled".into()));
        }
        Ok(self
            .citations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .range(min..=max)
            .next_back()
            .map(|(id, _)| *id))
    }

    async fn cached_coordinates_for_location(
        &self,
        location: &str,
    ) -> Result<Option<(f64, f64)>, StoreError> {
        Ok(self
            .citations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|x| x.location.as_deref() == Some(location))
            .find_map(|x| x.latitude.zip(x.longitude)))
    }

    async fn update_coordinates(
        &self,
        citation_number: u64,
        latitude: f64,
        longitude: f64,
    ) -> Result<(), StoreError> {
        if let Some(record) = self
            .citations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_mut(&citation_number)
        {
            record.latitude = Some(latitude);
            record.longitude = Some(longitude);
            record.geocoded_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn ungeocoded_locations(
        &self,
        limit: usize,
    ) -> Result<Vec<(u64, String)>, StoreError> {
        Ok(self
            .citations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|x| x.latitude.is_none())
            .filter_map(|x| x.location.clone().map(|loc| (x.citation_number, loc)))
            .take(limit)
            .collect())
    }

    async fn citations_missing_officer_info(
        &self,
        limit: usize,
    ) -> Result<Vec<CitationRecord>, StoreError> {
        Ok(self
            .citations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|x| {
                !x.image_urls.is_empty()
                    && x.officer_badge.is_none()
                    && x.officer_name.is_none()
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    async fn log_scrape_attempt(
        &self,
        citation_number: u64,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.attempts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(ScrapeAttempt {
                citation_number,
                success,
                error: error.map(ToOwned::to_owned),
            });
        Ok(())
    }
}
