//! Resolution chain: stored coordinates, alias registry, external service.

use std::sync::Arc;
use std::time::Duration;

use ticket_map_store::CitationStore;

use crate::aliases::{AliasRegistry, AliasResolution};
use crate::{ExternalGeocoder, GeocodeError};

/// Pause before every external geocoder call. Nominatim's usage policy
/// caps clients at one request per second; this stays well under it.
pub const EXTERNAL_CALL_DELAY: Duration = Duration::from_millis(2000);

const CITY_SUFFIX: &str = "Ann Arbor, MI";

pub struct GeocodeResolver {
    store: Arc<dyn CitationStore>,
    external: Arc<dyn ExternalGeocoder>,
    aliases: AliasRegistry,
}

impl GeocodeResolver {
    #[must_use]
    pub fn new(
        store: Arc<dyn CitationStore>,
        external: Arc<dyn ExternalGeocoder>,
        aliases: AliasRegistry,
    ) -> Self {
        Self {
            store,
            external,
            aliases,
        }
    }

    /// Resolves a location string to coordinates.
    ///
    /// Checks stored coordinates for the exact string first, then the
    /// alias registry, and only then the external geocoder. A cache or
    /// alias-coordinate hit makes zero external calls.
    ///
    /// # Errors
    ///
    /// * If the store lookup fails
    /// * If the external geocoder fails (misses are `Ok(None)`)
    pub async fn resolve(&self, location: &str) -> Result<Option<(f64, f64)>, GeocodeError> {
        if let Some(hit) = self.store.cached_coordinates_for_location(location).await? {
            log::debug!("geocode cache hit for '{location}'");
            return Ok(Some(hit));
        }

        let query = match self.aliases.resolve(location) {
            Some(AliasResolution::Coordinates(latitude, longitude)) => {
                log::debug!("alias pinned '{location}'");
                return Ok(Some((latitude, longitude)));
            }
            Some(AliasResolution::Address(substitute)) => substitute,
            None => location.to_owned(),
        };

        for variant in query_variants(&query) {
            tokio::time::sleep(EXTERNAL_CALL_DELAY).await;
            log::debug!("external geocode attempt: '{variant}'");
            if let Some(hit) = self.external.geocode(&variant).await? {
                return Ok(Some(hit));
            }
        }

        log::info!("no geocode result for '{location}'");
        Ok(None)
    }

    /// Resolves a citation's location and persists the coordinates.
    ///
    /// # Errors
    ///
    /// * As [`Self::resolve`], plus store write failures
    pub async fn resolve_and_store(
        &self,
        citation_number: u64,
        location: &str,
    ) -> Result<Option<(f64, f64)>, GeocodeError> {
        let Some((latitude, longitude)) = self.resolve(location).await? else {
            return Ok(None);
        };
        self.store
            .update_coordinates(citation_number, latitude, longitude)
            .await?;
        Ok(Some((latitude, longitude)))
    }
}

/// Deterministic query variants, tried in order: the city-qualified query
/// as-is, then with abbreviated street types expanded.
#[must_use]
pub fn query_variants(address: &str) -> Vec<String> {
    let qualified = qualify(address);
    let expanded = qualify(&expand_street_types(address));

    let mut variants = vec![qualified];
    if !variants.contains(&expanded) {
        variants.push(expanded);
    }
    variants
}

fn qualify(address: &str) -> String {
    if address.to_lowercase().contains("ann arbor") {
        address.to_owned()
    } else {
        format!("{address}, {CITY_SUFFIX}")
    }
}

const STREET_TYPE_EXPANSIONS: &[(&str, &str)] = &[
    ("St", "Street"),
    ("Ave", "Avenue"),
    ("Rd", "Road"),
    ("Blvd", "Boulevard"),
    ("Dr", "Drive"),
    ("Ln", "Lane"),
    ("Ct", "Court"),
    ("Pl", "Place"),
    ("Cir", "Circle"),
];

fn expand_street_types(address: &str) -> String {
    address
        .split_whitespace()
        .map(|token| {
            STREET_TYPE_EXPANSIONS
                .iter()
                .find(|(abbr, _)| token.eq_ignore_ascii_case(abbr))
                .map_or(token, |(_, full)| *full)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use ticket_map_citation_models::CitationRecord;
    use ticket_map_store::{CitationStore as _, MemoryStore};

    use super::{GeocodeResolver, query_variants};
    use crate::aliases::AliasRegistry;
    use crate::{ExternalGeocoder, GeocodeError};

    struct CountingGeocoder {
        calls: AtomicUsize,
        answer: Option<(f64, f64)>,
    }

    impl CountingGeocoder {
        fn new(answer: Option<(f64, f64)>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                answer,
            })
        }
    }

    #[async_trait]
    impl ExternalGeocoder for CountingGeocoder {
        async fn geocode(&self, _query: &str) -> Result<Option<(f64, f64)>, GeocodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hit_makes_zero_external_calls() {
        let store = Arc::new(MemoryStore::new());
        let mut record = CitationRecord::new(1);
        record.location = Some("123 S Main St".into());
        store.upsert_citation(&record).await.unwrap();
        store.update_coordinates(1, 42.28, -83.74).await.unwrap();

        let external = CountingGeocoder::new(Some((0.0, 0.0)));
        let resolver = GeocodeResolver::new(
            store,
            Arc::clone(&external) as Arc<dyn ExternalGeocoder>,
            AliasRegistry::default(),
        );

        let hit = resolver.resolve("123 S Main St").await.unwrap();
        assert_eq!(hit, Some((42.28, -83.74)));
        assert_eq!(external.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn alias_coordinates_make_zero_external_calls() {
        let external = CountingGeocoder::new(Some((0.0, 0.0)));
        let resolver = GeocodeResolver::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&external) as Arc<dyn ExternalGeocoder>,
            AliasRegistry::embedded(),
        );

        let hit = resolver.resolve("MAYNARD STRUCTURE").await.unwrap();
        assert!(hit.is_some());
        assert_eq!(external.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn external_miss_tries_each_variant_once() {
        let external = CountingGeocoder::new(None);
        let resolver = GeocodeResolver::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&external) as Arc<dyn ExternalGeocoder>,
            AliasRegistry::default(),
        );

        let hit = resolver.resolve("700 Packard Rd").await.unwrap();
        assert_eq!(hit, None);
        assert_eq!(external.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_and_store_persists_coordinates() {
        let store = Arc::new(MemoryStore::new());
        let mut record = CitationRecord::new(9);
        record.location = Some("700 Packard Rd".into());
        store.upsert_citation(&record).await.unwrap();

        let external = CountingGeocoder::new(Some((42.27, -83.73)));
        let resolver = GeocodeResolver::new(
            Arc::clone(&store) as Arc<dyn ticket_map_store::CitationStore>,
            external,
            AliasRegistry::default(),
        );

        resolver
            .resolve_and_store(9, "700 Packard Rd")
            .await
            .unwrap();
        let stored = store.citation(9).unwrap();
        assert_eq!(stored.latitude, Some(42.27));
        assert_eq!(stored.longitude, Some(-83.73));
    }

    #[test]
    fn variants_qualify_and_expand_street_types() {
        let variants = query_variants("123 S Main St");
        assert_eq!(
            variants,
            vec![
                "123 S Main St, Ann Arbor, MI".to_owned(),
                "123 S Main Street, Ann Arbor, MI".to_owned(),
            ]
        );

        // Already qualified and unabbreviated: a single variant.
        assert_eq!(
            query_variants("Maynard Street, Ann Arbor, MI"),
            vec!["Maynard Street, Ann Arbor, MI".to_owned()]
        );
    }
}
