//! HTML parsing for portal search results and citation detail pages.
//!
//! Everything here is pure: HTML strings in, records out. Network access
//! lives in [`crate::fetch`].

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, TimeZone as _, Utc};
use chrono_tz::America::Detroit;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use ticket_map_citation_models::CitationRecord;

use crate::PortalError;

/// Column layout of the search results grid. The portal renders a Kendo
/// grid whose first cell is the citation number; the rest follow this
/// order.
mod col {
    pub const CITATION_NUMBER: usize = 0;
    pub const LOCATION: usize = 1;
    pub const PLATE_STATE: usize = 2;
    pub const PLATE_NUMBER: usize = 3;
    pub const VIN: usize = 4;
    pub const ISSUE_DATE: usize = 5;
    pub const DUE_DATE: usize = 6;
    pub const STATUS: usize = 7;
    pub const AMOUNT: usize = 8;

    /// Rows with fewer cells indicate the grid layout changed.
    pub const MIN_CELLS: usize = 9;
}

static AMOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+\.?\d*)").expect("valid amount regex"));

/// Timestamp format the portal renders, e.g. `07/09/2024 06:12 PM`.
const PORTAL_TIMESTAMP_FORMAT: &str = "%m/%d/%Y %I:%M %p";

fn selector(css: &str) -> Result<Selector, PortalError> {
    Selector::parse(css).map_err(|e| PortalError::Schema {
        message: format!("invalid CSS selector '{css}': {e}"),
    })
}

/// Collects the text of an element into one whitespace-normalised string.
/// `<br>` breaks become single spaces.
fn cell_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses a search results page.
///
/// Returns `Ok(None)` when the portal shows its no-records template, the
/// first result row otherwise.
///
/// # Errors
///
/// * [`PortalError::Schema`] when neither a result row nor the no-records
///   template is present, or a row has fewer cells than the known layout
/// * [`PortalError::Timestamp`] when a date cell cannot be parsed
pub fn parse_search_results(
    html: &str,
    base_url: &str,
) -> Result<Option<CitationRecord>, PortalError> {
    let document = Html::parse_document(html);

    let no_records = selector("div.k-grid-norecords-template")?;
    if document
        .select(&no_records)
        .any(|x| cell_text(x).contains("No results found"))
    {
        return Ok(None);
    }

    let row_selector = selector("tr.k-table-row.k-master-row")?;
    let Some(row) = document.select(&row_selector).next() else {
        return Err(PortalError::Schema {
            message: "neither a result row nor the no-records template present".to_owned(),
        });
    };

    let cell_selector = selector("td.k-table-td")?;
    let cells: Vec<ElementRef<'_>> = row.select(&cell_selector).collect();
    if cells.len() < col::MIN_CELLS {
        return Err(PortalError::Schema {
            message: format!(
                "result row has {} cells, expected at least {}",
                cells.len(),
                col::MIN_CELLS
            ),
        });
    }

    let number_text = cell_text(cells[col::CITATION_NUMBER]);
    let citation_number = number_text
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>()
        .parse::<u64>()
        .map_err(|_| PortalError::Schema {
            message: format!("unparseable citation number cell: '{number_text}'"),
        })?;

    let mut record = CitationRecord::new(citation_number);
    record.location = non_empty(cell_text(cells[col::LOCATION]));
    record.plate_state = non_empty(cell_text(cells[col::PLATE_STATE]));
    record.plate_number = non_empty(cell_text(cells[col::PLATE_NUMBER]));
    record.vin = non_empty(cell_text(cells[col::VIN]));
    record.issue_date = parse_optional_timestamp(&cell_text(cells[col::ISSUE_DATE]))?;
    record.due_date = parse_optional_timestamp(&cell_text(cells[col::DUE_DATE]))?;
    record.status = non_empty(cell_text(cells[col::STATUS]));
    record.amount_due = parse_amount(&cell_text(cells[col::AMOUNT]));

    let link_selector = selector("a[href]")?;
    record.more_info_url = row
        .select(&link_selector)
        .find_map(|a| a.value().attr("href"))
        .map(|href| absolutize(base_url, href));

    Ok(Some(record))
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.trim().to_owned())
    }
}

/// Extracts a dollar amount, e.g. `$45.00` from `"$45.00 (Unpaid)"`.
#[must_use]
pub fn parse_amount(text: &str) -> Option<f64> {
    AMOUNT_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn parse_optional_timestamp(raw: &str) -> Result<Option<DateTime<Utc>>, PortalError> {
    if raw.trim().is_empty() {
        Ok(None)
    } else {
        parse_local_timestamp(raw).map(Some)
    }
}

/// Parses a portal timestamp, interpreting it as Detroit local time and
/// converting to UTC. Ambiguous wall-clock times during the fall-back DST
/// transition resolve to the earlier instant.
///
/// # Errors
///
/// * [`PortalError::Timestamp`] when the string does not match the portal
///   format or falls in the spring-forward DST gap
pub fn parse_local_timestamp(raw: &str) -> Result<DateTime<Utc>, PortalError> {
    let trimmed = raw.trim();
    let naive = NaiveDateTime::parse_from_str(trimmed, PORTAL_TIMESTAMP_FORMAT).map_err(|_| {
        PortalError::Timestamp {
            raw: trimmed.to_owned(),
        }
    })?;

    Detroit
        .from_local_datetime(&naive)
        .earliest()
        .map(|x| x.with_timezone(&Utc))
        .ok_or_else(|| PortalError::Timestamp {
            raw: trimmed.to_owned(),
        })
}

/// Fields scraped from a citation detail page. These only ever fill gaps
/// in the search result; search values win on conflict.
#[derive(Debug, Default)]
pub struct CitationDetails {
    pub location: Option<String>,
    pub status: Option<String>,
    pub issuing_agency: Option<String>,
    pub comments: Option<String>,
    pub violations: Vec<String>,
    pub image_urls: Vec<String>,
}

/// Parses a citation detail page.
///
/// The information box is a list of `span.key` / `span.value` pairs; the
/// violation entry nests its own list. Plate details are skipped since the
/// search row already carries them. Image links are absolutized against
/// the portal base URL.
///
/// # Errors
///
/// * [`PortalError::Schema`] only for internally invalid selectors; an
///   unexpected page shape yields an empty [`CitationDetails`] instead
pub fn parse_details(html: &str, base_url: &str) -> Result<CitationDetails, PortalError> {
    let document = Html::parse_document(html);
    let mut details = CitationDetails::default();

    let item_selector = selector(".citation-information-box ul.list-unstyled > li")?;
    let key_selector = selector("span.key")?;
    let value_selector = selector("span.value")?;
    let violation_selector = selector("ul.value li")?;

    for item in document.select(&item_selector) {
        let Some(key) = item.select(&key_selector).next() else {
            continue;
        };
        let key = cell_text(key)
            .trim_end_matches(':')
            .trim()
            .to_lowercase();

        let violations: Vec<String> = item
            .select(&violation_selector)
            .map(cell_text)
            .filter(|x| !x.is_empty())
            .collect();
        if !violations.is_empty() {
            details.violations = violations;
            continue;
        }

        let value = item.select(&value_selector).next().map(cell_text);
        let Some(value) = value.and_then(non_empty) else {
            continue;
        };

        match key.as_str() {
            "location" => details.location = Some(value),
            "status" => details.status = Some(value),
            "issuing agency" => details.issuing_agency = Some(value),
            "comments" => details.comments = Some(value),
            // The search row is authoritative for plate details.
            "plate" => {}
            _ => log::trace!("ignoring detail field '{key}'"),
        }
    }

    let image_selector = selector("#imageLinks a[href]")?;
    details.image_urls = document
        .select(&image_selector)
        .filter_map(|a| a.value().attr("href"))
        .map(|href| absolutize(base_url, href))
        .collect();

    Ok(details)
}

/// Overlays detail-page fields onto a search result. Search values win;
/// details only fill fields the search row left empty. Violation and image
/// lists only exist on the detail page so they always copy over.
pub fn merge_details(record: &mut CitationRecord, details: CitationDetails) {
    fill_if_absent(&mut record.location, details.location);
    fill_if_absent(&mut record.status, details.status);
    fill_if_absent(&mut record.issuing_agency, details.issuing_agency);
    fill_if_absent(&mut record.comments, details.comments);
    if !details.violations.is_empty() {
        record.violations = details.violations;
    }
    if !details.image_urls.is_empty() {
        record.image_urls = details.image_urls;
    }
}

fn fill_if_absent(dst: &mut Option<String>, src: Option<String>) {
    if dst.is_none() {
        *dst = src;
    }
}

fn absolutize(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_owned()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            href.trim_start_matches('/')
        )
    }
}
