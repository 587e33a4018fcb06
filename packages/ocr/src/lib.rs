#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! OCR enrichment of citation records.
//!
//! The last image on every citation is the printed receipt, which carries
//! officer and location details the portal fields omit. This crate
//! downloads that receipt, prepares region crops, runs them through an
//! [`engine::OcrEngine`], and extracts field overrides. Enrichment is
//! strictly best-effort: any failure degrades the record rather than the
//! crawl.

use std::sync::Arc;

use ticket_map_citation_models::{CitationRecord, FieldOverrides};

pub mod engine;
pub mod extract;
pub mod preprocess;

pub use engine::{OcrEngine, TesseractCli};

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("OCR engine unavailable: {message}")]
    EngineUnavailable { message: String },
    #[error("OCR engine failed: {message}")]
    EngineFailed { message: String },
}

/// Why enrichment produced nothing for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradeReason {
    NoImages,
    DownloadFailed,
    DecodeFailed,
    EngineUnavailable,
    NothingExtracted,
}

/// Outcome of one enrichment attempt. Degraded outcomes are ordinary
/// results, not errors; the crawl keeps the un-enriched record.
#[derive(Debug)]
pub enum EnrichOutcome {
    Enriched(FieldOverrides),
    Degraded(DegradeReason),
}

/// The receipt photo is always uploaded last.
#[must_use]
pub fn receipt_image_url(image_urls: &[String]) -> Option<&str> {
    image_urls.last().map(String::as_str)
}

/// Drives the download, preprocess, recognise, extract pipeline.
pub struct CitationEnricher {
    client: reqwest::Client,
    engine: Arc<dyn OcrEngine>,
}

impl CitationEnricher {
    #[must_use]
    pub fn new(client: reqwest::Client, engine: Arc<dyn OcrEngine>) -> Self {
        Self { client, engine }
    }

    /// Attempts to enrich one record from its receipt image. Per-record
    /// failures come back as [`EnrichOutcome::Degraded`], never as a panic
    /// or error.
    pub async fn enrich(&self, record: &CitationRecord) -> EnrichOutcome {
        let Some(url) = receipt_image_url(&record.image_urls) else {
            return EnrichOutcome::Degraded(DegradeReason::NoImages);
        };

        let bytes = match self.download(url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!(
                    "receipt download failed for citation {}: {e:?}",
                    record.citation_number
                );
                return EnrichOutcome::Degraded(DegradeReason::DownloadFailed);
            }
        };

        let receipt = match preprocess::prepare(&bytes) {
            Ok(receipt) => receipt,
            Err(e) => {
                log::warn!(
                    "receipt decode failed for citation {}: {e:?}",
                    record.citation_number
                );
                return EnrichOutcome::Degraded(DegradeReason::DecodeFailed);
            }
        };

        let officer_text = match self.recognize_region(&preprocess::officer_region(&receipt)).await
        {
            Ok(text) => text,
            Err(OcrError::EngineUnavailable { message }) => {
                log::warn!("OCR engine unavailable: {message}");
                return EnrichOutcome::Degraded(DegradeReason::EngineUnavailable);
            }
            Err(e) => {
                log::warn!(
                    "officer region OCR failed for citation {}: {e:?}",
                    record.citation_number
                );
                String::new()
            }
        };

        let address_text = match self.recognize_region(&preprocess::address_region(&receipt)).await
        {
            Ok(text) => text,
            Err(e) => {
                log::warn!(
                    "address region OCR failed for citation {}: {e:?}",
                    record.citation_number
                );
                String::new()
            }
        };

        let fields = extract::extract_fields(&officer_text, &address_text);
        if fields.is_empty() {
            EnrichOutcome::Degraded(DegradeReason::NothingExtracted)
        } else {
            EnrichOutcome::Enriched(fields)
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, OcrError> {
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?
            .to_vec())
    }

    async fn recognize_region(&self, region: &image::RgbImage) -> Result<String, OcrError> {
        let encoded = preprocess::encode_png(region)?;
        self.engine.recognize(&encoded).await
    }
}
