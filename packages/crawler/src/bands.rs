//! Compile-time registry of citation number bands.
//!
//! The portal assigns citation numbers from a handful of disjoint ranges.
//! Each band is crawled independently around its own high-water mark. The
//! default registry is embedded at compile time; deployments can load a
//! different one from disk.

use std::path::Path;

use serde::Deserialize;
use ticket_map_citation_models::Band;

use crate::CrawlError;

#[derive(Debug, Deserialize)]
struct BandFile {
    #[serde(default, rename = "band")]
    bands: Vec<Band>,
}

const EMBEDDED_BANDS: &str = include_str!("../bands/ann_arbor.toml");

/// Returns the embedded band registry, validated.
///
/// # Panics
///
/// Panics if the embedded TOML is malformed or contains overlapping
/// bands; both are caught by the registry tests.
#[must_use]
pub fn all_bands() -> Vec<Band> {
    let file: BandFile =
        toml::de::from_str(EMBEDDED_BANDS).expect("embedded band registry parses");
    validate(&file.bands).expect("embedded band registry is valid");
    file.bands
}

/// Loads and validates a band registry from disk.
///
/// # Errors
///
/// * If the file cannot be read or parsed
/// * If any band is empty or bands overlap
pub fn bands_from_path(path: impl AsRef<Path>) -> Result<Vec<Band>, CrawlError> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let file: BandFile = toml::de::from_str(&raw).map_err(|e| CrawlError::BandRegistry {
        message: format!("parsing {}: {e}", path.as_ref().display()),
    })?;
    validate(&file.bands)?;
    Ok(file.bands)
}

/// Finds a band by name, case-insensitively.
#[must_use]
pub fn band_by_name<'a>(bands: &'a [Band], name: &str) -> Option<&'a Band> {
    bands.iter().find(|x| x.name.eq_ignore_ascii_case(name))
}

fn validate(bands: &[Band]) -> Result<(), CrawlError> {
    for band in bands {
        if band.start >= band.end {
            return Err(CrawlError::BandRegistry {
                message: format!("band '{}' is empty or inverted", band.name),
            });
        }
    }
    for (i, a) in bands.iter().enumerate() {
        for b in &bands[i + 1..] {
            if a.overlaps(b) {
                return Err(CrawlError::BandRegistry {
                    message: format!("bands '{}' and '{}' overlap", a.name, b.name),
                });
            }
        }
    }
    Ok(())
}
