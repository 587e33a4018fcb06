//! Alias registry for locations the external geocoder cannot resolve.
//!
//! Parking structures and abbreviated street strings often have no
//! geocodable address. Each alias either pins the location to known
//! coordinates outright or substitutes a cleaner address for the external
//! query. A default registry is embedded at compile time; deployments can
//! load their own from disk.

use std::path::Path;

use serde::Deserialize;

use crate::GeocodeError;

/// One alias entry from TOML. Exactly one of `address` or the coordinate
/// pair is expected; coordinates win when both are present.
#[derive(Debug, Clone, Deserialize)]
pub struct AliasEntry {
    /// Location string exactly as the portal prints it.
    pub location: String,
    /// Substitute address to geocode instead.
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// How an alias resolves a location.
#[derive(Debug, Clone, PartialEq)]
pub enum AliasResolution {
    Coordinates(f64, f64),
    Address(String),
}

#[derive(Debug, Clone, Deserialize)]
struct AliasFile {
    #[serde(default, rename = "alias")]
    aliases: Vec<AliasEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct AliasRegistry {
    entries: Vec<AliasEntry>,
}

const EMBEDDED_ALIASES: &str = include_str!("../aliases/ann_arbor.toml");

impl AliasRegistry {
    /// Registry embedded at compile time.
    ///
    /// # Panics
    ///
    /// Panics if the embedded TOML is malformed; this is caught by the
    /// registry tests.
    #[must_use]
    pub fn embedded() -> Self {
        let file: AliasFile =
            toml::de::from_str(EMBEDDED_ALIASES).expect("embedded alias registry parses");
        Self {
            entries: file.aliases,
        }
    }

    /// Loads a registry from a TOML file on disk.
    ///
    /// # Errors
    ///
    /// * If the file cannot be read or parsed
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, GeocodeError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| GeocodeError::Parse {
            message: format!("reading {}: {e}", path.as_ref().display()),
        })?;
        let file: AliasFile = toml::de::from_str(&raw).map_err(|e| GeocodeError::Parse {
            message: format!("parsing {}: {e}", path.as_ref().display()),
        })?;
        Ok(Self {
            entries: file.aliases,
        })
    }

    /// Case-insensitive lookup on the portal's location string.
    #[must_use]
    pub fn resolve(&self, location: &str) -> Option<AliasResolution> {
        let wanted = location.trim().to_uppercase();
        let entry = self
            .entries
            .iter()
            .find(|x| x.location.trim().to_uppercase() == wanted)?;

        if let (Some(latitude), Some(longitude)) = (entry.latitude, entry.longitude) {
            Some(AliasResolution::Coordinates(latitude, longitude))
        } else {
            entry.address.clone().map(AliasResolution::Address)
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
