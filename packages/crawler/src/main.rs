#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the citation crawler.
//!
//! Subcommands cover the scheduled crawl cycle plus the one-off
//! maintenance passes: range backfill, geocoding rows that never
//! resolved, and OCR enrichment of rows scraped before OCR existed.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ticket_map_citation_models::Band;
use ticket_map_crawler::bands::{all_bands, bands_from_path};
use ticket_map_crawler::{CrawlError, Crawler, DEFAULT_WINDOW};
use ticket_map_geocoder::{AliasRegistry, GeocodeResolver, NominatimGeocoder};
use ticket_map_notify::WebhookNotifier;
use ticket_map_ocr::{CitationEnricher, EnrichOutcome, TesseractCli};
use ticket_map_portal::{CitationFetcher, SessionManager};
use ticket_map_store::{CitationStore, SqliteStore};

const DEFAULT_PORTAL_URL: &str = "https://annarbor.citationportal.com";

/// Ann Arbor parking citation crawler.
#[derive(Parser)]
#[command(name = "ticket-map")]
#[command(about = "Crawl, enrich, and persist parking citations")]
struct Cli {
    /// Path to the SQLite citation database.
    #[arg(long, default_value = "data/citations.db")]
    db_path: PathBuf,

    /// Portal base URL.
    #[arg(long, default_value = DEFAULT_PORTAL_URL)]
    portal_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one crawl cycle over every band.
    Crawl {
        /// Half-width of the window around each band's high-water mark.
        #[arg(long, default_value_t = DEFAULT_WINDOW)]
        window: u64,

        /// Skip the per-citation detail page fetch.
        #[arg(long)]
        no_details: bool,

        /// Skip OCR enrichment even if tesseract is installed.
        #[arg(long)]
        no_ocr: bool,

        /// Skip geocoding.
        #[arg(long)]
        no_geocode: bool,

        /// Skip notification fan-out.
        #[arg(long)]
        no_notify: bool,

        /// Band registry TOML; defaults to the embedded registry.
        #[arg(long)]
        bands_file: Option<PathBuf>,

        /// Alias registry TOML; defaults to the embedded registry.
        #[arg(long)]
        aliases_file: Option<PathBuf>,
    },

    /// Fetch and store an explicit citation number range, inclusive.
    Backfill {
        #[arg(long)]
        start: u64,

        #[arg(long)]
        end: u64,

        /// Skip the per-citation detail page fetch.
        #[arg(long)]
        no_details: bool,
    },

    /// Geocode stored citations that have a location but no coordinates.
    GeocodeMissing {
        #[arg(long, default_value_t = 100)]
        limit: usize,

        /// Alias registry TOML; defaults to the embedded registry.
        #[arg(long)]
        aliases_file: Option<PathBuf>,
    },

    /// OCR-enrich stored citations that have images but no officer info.
    OcrBackfill {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Print the band registry.
    Bands,
}

fn open_store(path: &PathBuf) -> Result<Arc<SqliteStore>, CrawlError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Arc::new(SqliteStore::open(path)?))
}

fn build_fetcher(portal_url: &str, no_details: bool) -> Result<CitationFetcher, CrawlError> {
    let client = ticket_map_portal::build_client()?;
    let session = SessionManager::new(client.clone(), portal_url);
    let fetcher = CitationFetcher::new(client, session);
    Ok(if no_details {
        fetcher.without_details()
    } else {
        fetcher
    })
}

fn build_resolver(
    store: Arc<dyn CitationStore>,
    aliases_file: Option<&PathBuf>,
) -> Result<Arc<GeocodeResolver>, CrawlError> {
    let aliases = match aliases_file {
        Some(path) => AliasRegistry::from_path(path)?,
        None => AliasRegistry::embedded(),
    };
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .user_agent(concat!("ticket-map/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(ticket_map_geocoder::GeocodeError::Http)?;
    let external = Arc::new(NominatimGeocoder::new(client));
    Ok(Arc::new(GeocodeResolver::new(store, external, aliases)))
}

/// Builds the OCR enricher if tesseract is runnable, `None` otherwise.
async fn build_enricher() -> Option<Arc<CitationEnricher>> {
    let engine = TesseractCli::new();
    if let Err(e) = engine.probe().await {
        log::warn!("OCR disabled: {e}");
        return None;
    }
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .ok()?;
    Some(Arc::new(CitationEnricher::new(client, Arc::new(engine))))
}

fn load_bands(bands_file: Option<&PathBuf>) -> Result<Vec<Band>, CrawlError> {
    match bands_file {
        Some(path) => bands_from_path(path),
        None => Ok(all_bands()),
    }
}

#[allow(clippy::too_many_lines)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Crawl {
            window,
            no_details,
            no_ocr,
            no_geocode,
            no_notify,
            bands_file,
            aliases_file,
        } => {
            let bands = load_bands(bands_file.as_ref())?;
            let store = open_store(&cli.db_path)?;
            let fetcher = build_fetcher(&cli.portal_url, no_details)?;

            let mut crawler = Crawler::new(
                Arc::new(fetcher),
                Arc::clone(&store) as Arc<dyn CitationStore>,
            )
            .with_window(window);

            if !no_geocode {
                crawler = crawler.with_resolver(build_resolver(
                    Arc::clone(&store) as Arc<dyn CitationStore>,
                    aliases_file.as_ref(),
                )?);
            }
            if !no_ocr && let Some(enricher) = build_enricher().await {
                crawler = crawler.with_enricher(enricher);
            }
            if !no_notify {
                crawler = crawler.with_notifier(Arc::new(WebhookNotifier::new()?));
            }

            let summaries = crawler.run_all_bands(&bands).await;
            let (processed, found, errors): (usize, usize, usize) = summaries.iter().fold(
                (0, 0, 0),
                |(p, f, e), x| (p + x.processed, f + x.found, e + x.errors),
            );
            log::info!(
                "cycle complete: {} bands, processed={processed} found={found} errors={errors}",
                summaries.len()
            );
        }
        Commands::Backfill {
            start,
            end,
            no_details,
        } => {
            if start > end {
                return Err("--start must not exceed --end".into());
            }
            let store = open_store(&cli.db_path)?;
            let fetcher = build_fetcher(&cli.portal_url, no_details)?;

            let mut found = 0_usize;
            for citation_number in start..=end {
                match ticket_map_portal::RecordSource::fetch(&fetcher, citation_number).await {
                    Ok(Some(record)) => {
                        store.upsert_citation(&record).await?;
                        store.log_scrape_attempt(citation_number, true, None).await?;
                        found += 1;
                    }
                    Ok(None) => {
                        store.log_scrape_attempt(citation_number, true, None).await?;
                    }
                    Err(e) => {
                        log::warn!("backfill fetch of {citation_number} failed: {e:?}");
                        store
                            .log_scrape_attempt(citation_number, false, Some(&e.to_string()))
                            .await?;
                    }
                }
            }
            log::info!("backfill complete: {found} records in [{start}, {end}]");
        }
        Commands::GeocodeMissing {
            limit,
            aliases_file,
        } => {
            let store = open_store(&cli.db_path)?;
            let resolver = build_resolver(
                Arc::clone(&store) as Arc<dyn CitationStore>,
                aliases_file.as_ref(),
            )?;

            let pending = store.ungeocoded_locations(limit).await?;
            log::info!("{} citations awaiting geocoding", pending.len());
            let mut resolved = 0_usize;
            for (citation_number, location) in pending {
                match resolver.resolve_and_store(citation_number, &location).await {
                    Ok(Some(_)) => resolved += 1,
                    Ok(None) => {
                        log::info!("no geocode result for citation {citation_number}");
                    }
                    Err(e) => {
                        log::warn!("geocoding citation {citation_number} failed: {e:?}");
                    }
                }
            }
            log::info!("geocoded {resolved} citations");
        }
        Commands::OcrBackfill { limit } => {
            let store = open_store(&cli.db_path)?;
            let Some(enricher) = build_enricher().await else {
                return Err("OCR backfill requires a working tesseract install".into());
            };

            let pending = store.citations_missing_officer_info(limit).await?;
            log::info!("{} citations awaiting OCR enrichment", pending.len());
            let mut enriched = 0_usize;
            for mut record in pending {
                match enricher.enrich(&record).await {
                    EnrichOutcome::Enriched(overrides) => {
                        record.apply_overrides(&overrides);
                        store.upsert_citation(&record).await?;
                        enriched += 1;
                    }
                    EnrichOutcome::Degraded(reason) => {
                        log::debug!(
                            "citation {} not enriched: {reason:?}",
                            record.citation_number
                        );
                    }
                }
            }
            log::info!("OCR-enriched {enriched} citations");
        }
        Commands::Bands => {
            for band in load_bands(None)? {
                println!("{:<10} [{}, {})", band.name, band.start, band.end);
            }
        }
    }

    Ok(())
}
