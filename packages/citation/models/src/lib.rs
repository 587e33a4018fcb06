#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Core data types for the ticket-map discovery pipeline.
//!
//! Defines the canonical [`CitationRecord`] shape shared across the portal
//! scraper, OCR enrichment, geocoding, and persistence layers, the numeric
//! [`Band`] abstraction the crawl controller tracks, and the coalesce-merge
//! rules that make independent enrichment passes compose safely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One discovered parking citation, keyed by its portal citation number.
///
/// `citation_number` is immutable once created; every other field is
/// overwrite-on-reconcile (last successful fetch wins) at fetch time and
/// coalesce-merged at enrichment time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationRecord {
    /// Unique positive citation number, used as the crawl key.
    pub citation_number: u64,
    /// Free-text address where the citation was issued. May be replaced by
    /// a cleaner OCR-extracted address.
    pub location: Option<String>,
    /// Two-letter license plate state.
    pub plate_state: Option<String>,
    /// License plate number.
    pub plate_number: Option<String>,
    /// Vehicle identification number, when the portal exposes it.
    pub vin: Option<String>,
    /// When the citation was issued (UTC).
    pub issue_date: Option<DateTime<Utc>>,
    /// Payment due date (UTC).
    pub due_date: Option<DateTime<Utc>>,
    /// Portal status string (e.g. "Open", "Paid").
    pub status: Option<String>,
    /// Outstanding amount in dollars.
    pub amount_due: Option<f64>,
    /// Permalink to the portal details page.
    pub more_info_url: Option<String>,
    /// Issuing agency from the details page.
    pub issuing_agency: Option<String>,
    /// Officer comments from the details page.
    pub comments: Option<String>,
    /// Ordered violation descriptions. Order matters for display only.
    pub violations: Vec<String>,
    /// Ordered image links from the details page. By observed convention
    /// the last entry is the printed receipt.
    pub image_urls: Vec<String>,
    /// Issuing officer's badge number (OCR-derived).
    pub officer_badge: Option<String>,
    /// Issuing officer's name (OCR-derived).
    pub officer_name: Option<String>,
    /// Issuing officer's beat (OCR-derived).
    pub officer_beat: Option<String>,
    /// Latitude (WGS84), once geocoded.
    pub latitude: Option<f64>,
    /// Longitude (WGS84), once geocoded.
    pub longitude: Option<f64>,
    /// When coordinates were resolved.
    pub geocoded_at: Option<DateTime<Utc>>,
}

impl CitationRecord {
    /// Creates an empty record for the given citation number.
    #[must_use]
    pub const fn new(citation_number: u64) -> Self {
        Self {
            citation_number,
            location: None,
            plate_state: None,
            plate_number: None,
            vin: None,
            issue_date: None,
            due_date: None,
            status: None,
            amount_due: None,
            more_info_url: None,
            issuing_agency: None,
            comments: None,
            violations: Vec::new(),
            image_urls: Vec::new(),
            officer_badge: None,
            officer_name: None,
            officer_beat: None,
            latitude: None,
            longitude: None,
            geocoded_at: None,
        }
    }

    /// Applies OCR field overrides with coalesce semantics: a field is only
    /// overwritten when the incoming value is present and non-empty, so two
    /// independent enrichment passes compose in either order.
    pub fn apply_overrides(&mut self, overrides: &FieldOverrides) {
        coalesce_text(&mut self.location, overrides.location.as_deref());
        coalesce_text(&mut self.officer_badge, overrides.officer_badge.as_deref());
        coalesce_text(&mut self.officer_name, overrides.officer_name.as_deref());
        coalesce_text(&mut self.officer_beat, overrides.officer_beat.as_deref());
    }
}

/// Overwrites `dst` only when `src` is present and non-blank.
pub fn coalesce_text(dst: &mut Option<String>, src: Option<&str>) {
    if let Some(value) = src {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            *dst = Some(trimmed.to_owned());
        }
    }
}

/// Field-level overrides produced by the OCR enrichment stage.
///
/// Only non-empty fields are ever applied; an all-empty override set is a
/// no-op against any record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOverrides {
    /// Cleaner street address extracted from the receipt image.
    pub location: Option<String>,
    /// Officer badge number.
    pub officer_badge: Option<String>,
    /// Officer name.
    pub officer_name: Option<String>,
    /// Officer beat.
    pub officer_beat: Option<String>,
}

impl FieldOverrides {
    /// `true` when no field carries a usable value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        [
            &self.location,
            &self.officer_badge,
            &self.officer_name,
            &self.officer_beat,
        ]
        .iter()
        .all(|f| f.as_deref().is_none_or(|v| v.trim().is_empty()))
    }
}

/// A named, disjoint numeric interval of the citation ID space known to
/// contain live records. Bounds are inclusive-exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    /// Short band name (e.g. "Third", "AA").
    pub name: String,
    /// Inclusive lower bound of the ID interval.
    pub start: u64,
    /// Exclusive upper bound of the ID interval.
    pub end: u64,
}

impl Band {
    /// `true` when `id` falls inside this band's interval.
    #[must_use]
    pub const fn contains(&self, id: u64) -> bool {
        id >= self.start && id < self.end
    }

    /// `true` when the two bands share any ID.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Delivery target for a subscription match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifyTarget {
    /// Email address of the subscriber.
    Email {
        /// Destination address.
        address: String,
    },
    /// Webhook endpoint to POST the alert payload to.
    Webhook {
        /// Destination URL.
        url: String,
    },
}

/// An active subscriber interest, matched against newly discovered records.
///
/// A subscription with neither plate field set matches every new record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Store row ID.
    pub id: i64,
    /// Plate state to match, if any.
    pub plate_state: Option<String>,
    /// Plate number to match, if any.
    pub plate_number: Option<String>,
    /// Where to deliver the alert.
    pub target: NotifyTarget,
}

impl Subscription {
    /// `true` when this subscription's plate filter matches the record.
    /// Comparison is case-insensitive on both components.
    #[must_use]
    pub fn matches(&self, record: &CitationRecord) -> bool {
        let state_ok = match (&self.plate_state, &record.plate_state) {
            (Some(want), Some(have)) => want.eq_ignore_ascii_case(have),
            (Some(_), None) => false,
            (None, _) => true,
        };
        let number_ok = match (&self.plate_number, &record.plate_number) {
            (Some(want), Some(have)) => want.eq_ignore_ascii_case(have),
            (Some(_), None) => false,
            (None, _) => true,
        };
        state_ok && number_ok
    }
}
