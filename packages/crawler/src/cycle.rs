//! Band crawl cycles.
//!
//! Each cycle looks at one band: recompute the high-water mark from the
//! store, enumerate the window around it, skip numbers already stored,
//! fetch the rest, enrich, persist, and fan alerts out for anything new.
//! A failing citation never sinks its cycle, and a failing band never
//! sinks the run.

use std::collections::BTreeSet;
use std::sync::Arc;

use ticket_map_citation_models::{Band, CitationRecord};
use ticket_map_geocoder::GeocodeResolver;
use ticket_map_notify::Notifier;
use ticket_map_ocr::{CitationEnricher, EnrichOutcome};
use ticket_map_portal::RecordSource;
use ticket_map_store::CitationStore;

use crate::CrawlError;

/// Half-width of the crawl window around the band's high-water mark.
pub const DEFAULT_WINDOW: u64 = 100;

/// How many records accumulate before a bulk flush.
const FLUSH_BATCH: usize = 25;

/// Per-band counters reported at the end of a cycle.
#[derive(Debug, Default, Clone)]
pub struct CycleSummary {
    pub band: String,
    /// High-water mark the window was anchored on, when the band had one.
    pub high_water_mark: Option<u64>,
    /// Citation numbers attempted (including affirmative misses).
    pub processed: usize,
    /// Window members skipped because the store already held them.
    pub skipped_existing: usize,
    /// Records the portal returned.
    pub found: usize,
    /// Lookups that failed outright.
    pub errors: usize,
    /// Alerts delivered.
    pub notified: usize,
}

/// Inclusive crawl window around a high-water mark. Deliberately not
/// clamped to the band: discovery past the band edge is how band bounds
/// get corrected.
#[must_use]
pub const fn crawl_window(high_water_mark: u64, window: u64) -> (u64, u64) {
    (
        high_water_mark.saturating_sub(window),
        high_water_mark.saturating_add(window),
    )
}

/// Citation numbers to fetch: the inclusive window minus what the store
/// already holds.
#[must_use]
pub fn candidate_ids(window: (u64, u64), existing: &BTreeSet<u64>) -> Vec<u64> {
    let (lo, hi) = window;
    (lo..=hi).filter(|id| !existing.contains(id)).collect()
}

pub struct Crawler {
    source: Arc<dyn RecordSource>,
    store: Arc<dyn CitationStore>,
    resolver: Option<Arc<GeocodeResolver>>,
    enricher: Option<Arc<CitationEnricher>>,
    notifier: Option<Arc<dyn Notifier>>,
    window: u64,
}

impl Crawler {
    #[must_use]
    pub fn new(source: Arc<dyn RecordSource>, store: Arc<dyn CitationStore>) -> Self {
        Self {
            source,
            store,
            resolver: None,
            enricher: None,
            notifier: None,
            window: DEFAULT_WINDOW,
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<GeocodeResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn with_enricher(mut self, enricher: Arc<CitationEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub const fn with_window(mut self, window: u64) -> Self {
        self.window = window;
        self
    }

    /// Runs one cycle over every band. A band that errors is logged and
    /// reported with its error counted; the remaining bands still run.
    pub async fn run_all_bands(&self, bands: &[Band]) -> Vec<CycleSummary> {
        let mut summaries = Vec::with_capacity(bands.len());
        for band in bands {
            match self.run_band_cycle(band).await {
                Ok(summary) => {
                    log::info!(
                        "band '{}': processed={} found={} errors={} notified={}",
                        summary.band,
                        summary.processed,
                        summary.found,
                        summary.errors,
                        summary.notified
                    );
                    summaries.push(summary);
                }
                Err(e) => {
                    log::error!("band '{}' cycle failed: {e:?}", band.name);
                    // A failed band still shows up in the run's summaries.
                    summaries.push(CycleSummary {
                        band: band.name.clone(),
                        errors: 1,
                        ..CycleSummary::default()
                    });
                }
            }
        }
        summaries
    }

    /// Runs one crawl cycle over a single band.
    ///
    /// # Errors
    ///
    /// * If the store cannot be queried for the high-water mark or skip set.
    ///   Individual citation failures are counted, not returned.
    pub async fn run_band_cycle(&self, band: &Band) -> Result<CycleSummary, CrawlError> {
        let mut summary = CycleSummary {
            band: band.name.clone(),
            ..CycleSummary::default()
        };

        let band_max = band.end.saturating_sub(1);
        let Some(high_water_mark) = self.store.max_id_in_range(band.start, band_max).await?
        else {
            log::debug!("band '{}' has no stored citations yet, skipping", band.name);
            return Ok(summary);
        };

        summary.high_water_mark = Some(high_water_mark);
        let window = crawl_window(high_water_mark, self.window);
        let existing = self.store.existing_ids_in_range(window.0, window.1).await?;
        let candidates = candidate_ids(window, &existing);
        summary.skipped_existing = existing.len();
        log::info!(
            "band '{}': window [{}, {}], {} candidates",
            band.name,
            window.0,
            window.1,
            candidates.len()
        );

        let mut pending: Vec<CitationRecord> = Vec::new();
        for citation_number in candidates {
            summary.processed += 1;
            match self.source.fetch(citation_number).await {
                Ok(Some(record)) => {
                    self.record_attempt(citation_number, true, None).await;
                    summary.found += 1;
                    pending.push(self.enrich(record).await);
                }
                Ok(None) => {
                    self.record_attempt(citation_number, true, None).await;
                }
                Err(e) => {
                    log::warn!("fetch of citation {citation_number} failed: {e:?}");
                    self.record_attempt(citation_number, false, Some(&e.to_string()))
                        .await;
                    summary.errors += 1;
                }
            }

            if pending.len() >= FLUSH_BATCH {
                let flushed = std::mem::take(&mut pending);
                summary.notified += self.flush(&flushed, &mut summary.errors).await;
            }
        }

        if !pending.is_empty() {
            let flushed = std::mem::take(&mut pending);
            summary.notified += self.flush(&flushed, &mut summary.errors).await;
        }

        Ok(summary)
    }

    /// A broken attempt log must not take the crawl down with it.
    async fn record_attempt(&self, citation_number: u64, success: bool, error: Option<&str>) {
        if let Err(e) = self
            .store
            .log_scrape_attempt(citation_number, success, error)
            .await
        {
            log::warn!("recording scrape attempt for {citation_number} failed: {e:?}");
        }
    }

    /// Applies OCR enrichment to a freshly fetched record. Best-effort.
    async fn enrich(&self, mut record: CitationRecord) -> CitationRecord {
        if let Some(enricher) = &self.enricher {
            match enricher.enrich(&record).await {
                EnrichOutcome::Enriched(overrides) => record.apply_overrides(&overrides),
                EnrichOutcome::Degraded(reason) => {
                    log::debug!(
                        "citation {} not OCR-enriched: {reason:?}",
                        record.citation_number
                    );
                }
            }
        }
        record
    }

    /// Persists a batch. A failed bulk write falls back to per-record
    /// upserts so one poisoned row cannot drop its whole batch. Geocoding
    /// and alerts run only for records that actually stored.
    async fn flush(&self, records: &[CitationRecord], errors: &mut usize) -> usize {
        let mut stored: Vec<&CitationRecord> = Vec::with_capacity(records.len());

        match self.store.bulk_upsert_citations(records).await {
            Ok(outcome) => {
                *errors += outcome.failed_count;
                for (citation_number, message) in &outcome.errors {
                    log::warn!("storing citation {citation_number} failed: {message}");
                }
                let failed: BTreeSet<u64> =
                    outcome.errors.iter().map(|(id, _)| *id).collect();
                stored.extend(
                    records
                        .iter()
                        .filter(|x| !failed.contains(&x.citation_number)),
                );
            }
            Err(e) => {
                log::warn!("bulk upsert failed, retrying per record: {e:?}");
                for record in records {
                    match self.store.upsert_citation(record).await {
                        Ok(()) => stored.push(record),
                        Err(e) => {
                            log::warn!(
                                "storing citation {} failed: {e:?}",
                                record.citation_number
                            );
                            *errors += 1;
                        }
                    }
                }
            }
        }

        self.geocode_stored(&stored).await;
        self.fan_out(&stored).await
    }

    /// Resolves coordinates for records a flush has already persisted.
    /// Runs after the batch write so a slow or failing geocoder never
    /// holds a record's persistence hostage.
    async fn geocode_stored(&self, stored: &[&CitationRecord]) {
        let Some(resolver) = &self.resolver else {
            return;
        };

        for record in stored {
            if record.latitude.is_some() && record.longitude.is_some() {
                continue;
            }
            let Some(location) = &record.location else {
                continue;
            };
            if let Err(e) = resolver
                .resolve_and_store(record.citation_number, location)
                .await
            {
                log::warn!(
                    "geocoding citation {} failed: {e:?}",
                    record.citation_number
                );
            }
        }
    }

    async fn fan_out(&self, stored: &[&CitationRecord]) -> usize {
        let Some(notifier) = &self.notifier else {
            return 0;
        };
        if stored.is_empty() {
            return 0;
        }

        let subscriptions = match self.store.active_subscriptions().await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                log::warn!("loading subscriptions failed, skipping fan-out: {e:?}");
                return 0;
            }
        };
        if subscriptions.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for record in stored {
            delivered += ticket_map_notify::dispatch(notifier.as_ref(), record, &subscriptions)
                .await;
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use ticket_map_citation_models::{Band, CitationRecord, NotifyTarget, Subscription};
    use ticket_map_geocoder::{AliasRegistry, ExternalGeocoder, GeocodeError, GeocodeResolver};
    use ticket_map_portal::{PortalError, RecordSource};
    use ticket_map_store::{CitationStore, MemoryStore};

    use super::{Crawler, candidate_ids, crawl_window};

    /// Source that answers every lookup at or below a cap and counts its
    /// calls.
    struct CountingSource {
        calls: AtomicUsize,
        hit_every: u64,
        max_hit: u64,
    }

    impl CountingSource {
        fn new(hit_every: u64) -> Arc<Self> {
            Self::capped(hit_every, u64::MAX)
        }

        fn capped(hit_every: u64, max_hit: u64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                hit_every,
                max_hit,
            })
        }
    }

    #[async_trait]
    impl RecordSource for CountingSource {
        async fn fetch(
            &self,
            citation_number: u64,
        ) -> Result<Option<CitationRecord>, PortalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if citation_number % self.hit_every == 0 && citation_number <= self.max_hit {
                let mut record = CitationRecord::new(citation_number);
                record.plate_state = Some("MI".into());
                record.plate_number = Some("ABC1234".into());
                record.location = Some("123 S Main St".into());
                Ok(Some(record))
            } else {
                Ok(None)
            }
        }
    }

    /// Source that fails every lookup.
    struct FailingSource;

    #[async_trait]
    impl RecordSource for FailingSource {
        async fn fetch(&self, _: u64) -> Result<Option<CitationRecord>, PortalError> {
            Err(PortalError::TokenMissing)
        }
    }

    fn third_band() -> Band {
        Band {
            name: "third".into(),
            start: 1_000_000,
            end: 1_020_000,
        }
    }

    #[test]
    fn window_is_symmetric_and_inclusive() {
        assert_eq!(crawl_window(1_123_108, 50), (1_123_058, 1_123_158));
        // Saturates near zero rather than wrapping.
        assert_eq!(crawl_window(30, 100), (0, 130));
    }

    #[test]
    fn skip_set_excludes_exactly_the_known_ids() {
        let window = crawl_window(1_123_108, 50);
        let existing: BTreeSet<u64> = [1_123_100, 1_123_101].into_iter().collect();

        let candidates = candidate_ids(window, &existing);

        assert_eq!(candidates.len(), 99);
        assert!(!candidates.contains(&1_123_100));
        assert!(!candidates.contains(&1_123_101));
        assert_eq!(candidates.first(), Some(&1_123_058));
        assert_eq!(candidates.last(), Some(&1_123_158));
    }

    #[tokio::test]
    async fn empty_band_is_skipped_without_fetches() {
        let source = CountingSource::new(1);
        let store = Arc::new(MemoryStore::new());
        let crawler = Crawler::new(Arc::clone(&source) as Arc<dyn RecordSource>, store);

        let summary = crawler.run_band_cycle(&third_band()).await.unwrap();

        assert_eq!(summary.processed, 0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cycle_fetches_window_minus_existing() {
        let source = CountingSource::new(2);
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_citation(&CitationRecord::new(1_010_000))
            .await
            .unwrap();

        let crawler = Crawler::new(
            Arc::clone(&source) as Arc<dyn RecordSource>,
            Arc::clone(&store) as Arc<dyn CitationStore>,
        )
        .with_window(10);
        let summary = crawler.run_band_cycle(&third_band()).await.unwrap();

        // Window [1_009_990, 1_010_010] holds 21 ids, one already stored.
        assert_eq!(summary.processed, 20);
        assert_eq!(source.calls.load(Ordering::SeqCst), 20);
        // Even ids hit: 1_009_990..=1_010_010 has 11 evens, minus the stored one.
        assert_eq!(summary.found, 10);
        assert_eq!(summary.errors, 0);
        assert_eq!(store.citation_count(), 11);
    }

    #[tokio::test]
    async fn rerunning_a_cycle_is_idempotent() {
        // No citations exist past the first window, so a second pass has
        // no new origin data to discover.
        let source = CountingSource::capped(2, 1_010_010);
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_citation(&CitationRecord::new(1_010_000))
            .await
            .unwrap();

        let crawler =
            Crawler::new(source, Arc::clone(&store) as Arc<dyn CitationStore>).with_window(10);
        crawler.run_band_cycle(&third_band()).await.unwrap();
        let count_after_first = store.citation_count();

        let summary = crawler.run_band_cycle(&third_band()).await.unwrap();

        // Second pass skips everything already stored and re-finds nothing
        // new; the store and the high-water mark do not change.
        assert_eq!(store.citation_count(), count_after_first);
        assert_eq!(summary.found, 0);
        assert_eq!(summary.high_water_mark, Some(1_010_010));
    }

    #[tokio::test]
    async fn fetch_failures_are_counted_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_citation(&CitationRecord::new(1_010_000))
            .await
            .unwrap();

        let crawler = Crawler::new(
            Arc::new(FailingSource),
            Arc::clone(&store) as Arc<dyn CitationStore>,
        )
        .with_window(5);
        let summary = crawler.run_band_cycle(&third_band()).await.unwrap();

        assert_eq!(summary.errors, 10);
        assert_eq!(summary.found, 0);
        let attempts = store.attempts();
        assert_eq!(attempts.len(), 10);
        assert!(attempts.iter().all(|x| !x.success));
    }

    #[tokio::test]
    async fn bulk_failure_falls_back_to_per_record_writes() {
        let source = CountingSource::new(1);
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_citation(&CitationRecord::new(1_010_000))
            .await
            .unwrap();
        store.fail_next_bulk();

        let crawler =
            Crawler::new(source, Arc::clone(&store) as Arc<dyn CitationStore>).with_window(3);
        let summary = crawler.run_band_cycle(&third_band()).await.unwrap();

        // All 6 candidates hit and every record still lands via the
        // per-record fallback.
        assert_eq!(summary.found, 6);
        assert_eq!(summary.errors, 0);
        assert_eq!(store.citation_count(), 7);
    }

    #[tokio::test]
    async fn new_records_fan_out_to_matching_subscriptions() {
        struct CountingNotifier(AtomicUsize);

        #[async_trait]
        impl ticket_map_notify::Notifier for CountingNotifier {
            async fn notify(
                &self,
                _alert: &ticket_map_notify::TicketAlert,
                _target: &NotifyTarget,
            ) -> Result<(), ticket_map_notify::NotifyError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let store = Arc::new(MemoryStore::new());
        store
            .upsert_citation(&CitationRecord::new(1_010_000))
            .await
            .unwrap();
        store.add_subscription(Subscription {
            id: 1,
            plate_state: Some("MI".into()),
            plate_number: Some("ABC1234".into()),
            target: NotifyTarget::Webhook {
                url: "https://hooks.example.test".into(),
            },
        });

        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        let crawler = Crawler::new(
            CountingSource::new(2),
            Arc::clone(&store) as Arc<dyn CitationStore>,
        )
        .with_window(10)
        .with_notifier(Arc::clone(&notifier) as Arc<dyn ticket_map_notify::Notifier>);

        let summary = crawler.run_band_cycle(&third_band()).await.unwrap();

        assert_eq!(summary.found, 10);
        assert_eq!(summary.notified, 10);
        assert_eq!(notifier.0.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn a_failing_band_does_not_sink_the_run() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_citation(&CitationRecord::new(1_010_000))
            .await
            .unwrap();
        store
            .upsert_citation(&CitationRecord::new(2_085_000))
            .await
            .unwrap();

        let bands = vec![
            third_band(),
            Band {
                name: "nc".into(),
                start: 2_080_000,
                end: 2_100_000,
            },
        ];

        let crawler = Crawler::new(Arc::new(FailingSource), store).with_window(2);
        let summaries = crawler.run_all_bands(&bands).await;

        // Both bands produce a summary despite every fetch failing.
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().all(|x| x.errors > 0));
    }

    #[tokio::test]
    async fn a_band_whose_window_fails_still_gets_a_summary() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_citation(&CitationRecord::new(1_010_000))
            .await
            .unwrap();
        store.fail_next_max_id();

        let bands = vec![
            third_band(),
            Band {
                name: "nc".into(),
                start: 2_080_000,
                end: 2_100_000,
            },
        ];

        let crawler = Crawler::new(
            CountingSource::new(2),
            Arc::clone(&store) as Arc<dyn CitationStore>,
        )
        .with_window(2);
        let summaries = crawler.run_all_bands(&bands).await;

        // The failed band shows up in the summaries with its error
        // counted, and the next band still runs.
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].band, "third");
        assert_eq!(summaries[0].errors, 1);
        assert_eq!(summaries[0].processed, 0);
        assert_eq!(summaries[1].band, "nc");
        assert_eq!(summaries[1].errors, 0);
    }

    struct FixedGeocoder;

    #[async_trait]
    impl ExternalGeocoder for FixedGeocoder {
        async fn geocode(&self, _query: &str) -> Result<Option<(f64, f64)>, GeocodeError> {
            Ok(Some((42.28, -83.74)))
        }
    }

    struct BrokenGeocoder;

    #[async_trait]
    impl ExternalGeocoder for BrokenGeocoder {
        async fn geocode(&self, _query: &str) -> Result<Option<(f64, f64)>, GeocodeError> {
            Err(GeocodeError::Parse {
                message: "service unusable".into(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn coordinates_land_after_records_persist() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_citation(&CitationRecord::new(1_010_000))
            .await
            .unwrap();

        let resolver = Arc::new(GeocodeResolver::new(
            Arc::clone(&store) as Arc<dyn CitationStore>,
            Arc::new(FixedGeocoder),
            AliasRegistry::default(),
        ));
        let crawler = Crawler::new(
            CountingSource::new(2),
            Arc::clone(&store) as Arc<dyn CitationStore>,
        )
        .with_window(2)
        .with_resolver(resolver);

        let summary = crawler.run_band_cycle(&third_band()).await.unwrap();

        assert_eq!(summary.found, 2);
        for id in [1_009_998, 1_010_002] {
            let stored = store.citation(id).unwrap();
            assert_eq!(stored.latitude, Some(42.28));
            assert_eq!(stored.longitude, Some(-83.74));
            assert!(stored.geocoded_at.is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn geocode_failures_never_block_persistence() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_citation(&CitationRecord::new(1_010_000))
            .await
            .unwrap();

        let resolver = Arc::new(GeocodeResolver::new(
            Arc::clone(&store) as Arc<dyn CitationStore>,
            Arc::new(BrokenGeocoder),
            AliasRegistry::default(),
        ));
        let crawler = Crawler::new(
            CountingSource::new(1),
            Arc::clone(&store) as Arc<dyn CitationStore>,
        )
        .with_window(2)
        .with_resolver(resolver);

        let summary = crawler.run_band_cycle(&third_band()).await.unwrap();

        // Every fetched record stores even though geocoding errors out.
        assert_eq!(summary.found, 4);
        assert_eq!(summary.errors, 0);
        assert_eq!(store.citation_count(), 5);
        assert!(store.citation(1_009_999).unwrap().latitude.is_none());
    }
}
