//! Text extraction from OCR output.
//!
//! Receipt OCR comes back with inconsistent spacing, so each field has an
//! ordered list of patterns tried most-specific first, and the recovered
//! street text goes through a token-spacing repair before use.

use std::sync::LazyLock;

use regex::Regex;
use ticket_map_citation_models::FieldOverrides;

/// Street type suffixes as printed on receipts.
const STREET_SUFFIX: &str =
    "St|Street|Ave|Avenue|Rd|Road|Blvd|Boulevard|Dr|Drive|Ln|Lane|Ct|Court|Pl|Place|Way|Cir|Circle";

/// Address patterns, most specific first. OCR frequently drops the spaces
/// around the LOCATION label and inside the street name.
static ADDRESS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(&format!(
            r"LOCATION\s*:?\s*(\d+)\s*([A-Za-z]+(?:{STREET_SUFFIX}))"
        ))
        .expect("valid labelled address pattern"),
        Regex::new(&format!(r"\b(\d+)\s*([A-Za-z]+(?:{STREET_SUFFIX}))\b"))
            .expect("valid bare address pattern"),
    ]
});

static OFFICER_NAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"OFFICER\s*NAME\s*:?\s*([A-Z][A-Z .'\-]+)")
            .expect("valid officer name pattern"),
        Regex::new(r"OFFICER\s*:\s*([A-Z][A-Z .'\-]+)").expect("valid officer pattern"),
    ]
});

static BADGE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"BADGE\s*#?\s*:?\s*([A-Z0-9]{2,})").expect("valid badge pattern"),
        Regex::new(r"OFFICER\s*#\s*(\d+)").expect("valid officer number pattern"),
    ]
});

static BEAT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![Regex::new(r"BEAT\s*:?\s*([A-Z0-9]+)").expect("valid beat pattern")]
});

/// Re-inserts the spaces OCR dropped between address tokens.
///
/// A space goes before an uppercase letter that follows a lowercase letter
/// or digit, and between two uppercase letters when the second starts a
/// capitalized word, so `123SMainSt` becomes `123 S Main St` while all-caps
/// runs stay intact.
#[must_use]
pub fn insert_token_spaces(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    for (i, &c) in chars.iter().enumerate() {
        if i > 0 && c.is_ascii_uppercase() {
            let prev = chars[i - 1];
            let starts_word = prev.is_ascii_uppercase()
                && chars.get(i + 1).is_some_and(char::is_ascii_lowercase);
            if prev.is_ascii_lowercase() || prev.is_ascii_digit() || starts_word {
                out.push(' ');
            }
        }
        out.push(c);
    }
    out
}

/// Pulls a street address out of the address-region OCR text.
#[must_use]
pub fn extract_address(text: &str) -> Option<String> {
    for pattern in ADDRESS_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(text) {
            let number = captures.get(1)?.as_str();
            let street = insert_token_spaces(captures.get(2)?.as_str());
            let street = street.split_whitespace().collect::<Vec<_>>().join(" ");
            return Some(format!("{number} {street}"));
        }
    }
    None
}

fn first_capture(patterns: &[Regex], text: &str) -> Option<String> {
    patterns.iter().find_map(|pattern| {
        pattern
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_owned())
            .filter(|x| !x.is_empty())
    })
}

/// Combines the officer-region and address-region OCR text into field
/// overrides. Unmatched fields stay empty.
#[must_use]
pub fn extract_fields(officer_text: &str, address_text: &str) -> FieldOverrides {
    FieldOverrides {
        location: extract_address(address_text),
        officer_name: first_capture(&OFFICER_NAME_PATTERNS, officer_text),
        officer_badge: first_capture(&BADGE_PATTERNS, officer_text),
        officer_beat: first_capture(&BEAT_PATTERNS, officer_text),
    }
}

#[cfg(test)]
mod tests {
    use super::{extract_address, extract_fields, insert_token_spaces};

    #[test]
    fn token_spacing_repairs_camel_case() {
        assert_eq!(insert_token_spaces("MainSt"), "Main St");
        assert_eq!(insert_token_spaces("SMainSt"), "S Main St");
        assert_eq!(insert_token_spaces("EWashingtonSt"), "E Washington St");
        assert_eq!(insert_token_spaces("123SMainSt"), "123 S Main St");
        assert_eq!(insert_token_spaces("700NUniversityAve"), "700 N University Ave");
    }

    #[test]
    fn token_spacing_keeps_all_caps_runs_intact() {
        assert_eq!(insert_token_spaces("SMITH"), "SMITH");
        assert_eq!(insert_token_spaces("BEAT D2"), "BEAT D2");
    }

    #[test]
    fn token_spacing_leaves_spaced_text_alone() {
        assert_eq!(insert_token_spaces("S Main St"), "S Main St");
    }

    #[test]
    fn labelled_location_wins_over_bare_match() {
        let text = "PAID 500 LOCATION123SMainSt TOTAL";
        assert_eq!(extract_address(text), Some("123 S Main St".to_owned()));
    }

    #[test]
    fn bare_address_fallback() {
        assert_eq!(
            extract_address("receipt 456PackardRd thank you"),
            Some("456 Packard Rd".to_owned())
        );
    }

    #[test]
    fn no_address_yields_none() {
        assert_eq!(extract_address("THANK YOU COME AGAIN"), None);
    }

    #[test]
    fn officer_fields_extract_from_receipt_header() {
        let officer = "CITATION\nOFFICER: J SMITH\nBADGE # 1217\nBEAT D2\n";
        let fields = extract_fields(officer, "");

        assert_eq!(fields.officer_name.as_deref(), Some("J SMITH"));
        assert_eq!(fields.officer_badge.as_deref(), Some("1217"));
        assert_eq!(fields.officer_beat.as_deref(), Some("D2"));
        assert!(fields.location.is_none());
    }

    #[test]
    fn unmatched_officer_text_yields_empty_fields() {
        let fields = extract_fields("PAY WITHIN 30 DAYS", "");
        assert!(fields.is_empty());
    }
}
