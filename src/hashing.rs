//! Three-tier hashing of normalized document text.
//!
//! - **content**: SHA-256 of the text exactly as stored.
//! - **structural**: SHA-256 after whitespace, quote, dash and punctuation
//!   spacing are canonicalized. Layout-only edits collapse here.
//! - **fingerprint**: SHA-256 after the structural pass plus removal of
//!   dates, version labels, copyright years and "last updated" labels.
//!   Only wording changes survive to this tier.
//!
//! Each tier is at least as coarse as the previous one: equal content
//! implies equal structural form, which implies equal fingerprint form.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::models::Fingerprint;

const MONTH: &str = r"(?:jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)";

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static SPACE_BEFORE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" ([,.;:!?)\]])").unwrap());
static SPACE_AFTER_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([(\[]) ").unwrap());
static PUNCT_THEN_LETTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([,.;:!?])(\p{L})").unwrap());

static COPYRIGHT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:copyright|\(c\)|©)\s*(?:©\s*)?\d{4}(?:\s*[-,]\s*\d{4})*").unwrap()
});

const ISO_DATE: &str =
    r"\d{4}-\d{1,2}-\d{1,2}(?:T\d{1,2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?)?";
const NUMERIC_DATE: &str =
    r"(?:\d{1,2}[/-]\d{1,2}[/-]\d{2,4}|\d{4}/\d{1,2}/\d{1,2}|\d{2}\.\d{2}\.\d{4})";

fn written_dates() -> String {
    let month_day_year = format!(r"{MONTH}\.?\s+\d{{1,2}}(?:st|nd|rd|th)?,?\s+\d{{4}}");
    let day_month_year = format!(r"\d{{1,2}}(?:st|nd|rd|th)?\s+(?:of\s+)?{MONTH}\.?,?\s+\d{{4}}");
    format!("{month_day_year}|{day_month_year}")
}

/// A "last updated" style keyword together with the date it introduces.
/// Wording that follows the date on the same line is left alone.
static UPDATED_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:last\s+(?:updated|modified|revised|changed)|updated|modified|revised|effective(?:\s+(?:date|as\s+of|from|on))?)\s*:?\s*(?:on\s+)?(?:{ISO_DATE}|{NUMERIC_DATE}|{})\b",
        written_dates()
    ))
    .unwrap()
});
static DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:{ISO_DATE}|{NUMERIC_DATE}|{})\b",
        written_dates()
    ))
    .unwrap()
});
static VERSION_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bversion\s*:?\s*v?\d+(?:\.\d+)*\b").unwrap());
static VERSION_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bv\d+(?:\.\d+)*(?:-[0-9a-z]+(?:\.[0-9a-z]+)*)?\b").unwrap()
});

/// Lowercase hex SHA-256.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compute all three tiers for `text`.
pub fn fingerprint(text: &str) -> Fingerprint {
    let structural = structural_form(text);
    Fingerprint {
        content_hash: sha256_hex(text),
        structural_hash: sha256_hex(&structural),
        fingerprint_hash: sha256_hex(&strip_volatile(&structural)),
    }
}

/// Canonical layout: typographic punctuation folded to ASCII, invisible
/// characters removed, whitespace collapsed and punctuation spacing fixed.
pub fn structural_form(text: &str) -> String {
    tidy(&fold_typography(text))
}

/// Fold curly quotes, dash variants and the ellipsis to ASCII and drop
/// zero-width characters and soft hyphens.
pub fn fold_typography(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}' => {}
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' | '\u{00AB}'
            | '\u{00BB}' => folded.push('"'),
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => folded.push('\''),
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}'
            | '\u{2212}' => folded.push('-'),
            '\u{2026}' => folded.push_str("..."),
            _ => folded.push(c),
        }
    }
    folded
}

/// Structural form with volatile markers (dates, versions, copyright
/// years, "last updated" labels) stripped.
pub fn fingerprint_form(text: &str) -> String {
    strip_volatile(&structural_form(text))
}

// Input is already in structural form, so texts with equal structural
// forms always get equal fingerprint forms.
fn strip_volatile(structural: &str) -> String {
    let mut s = UPDATED_MARKER.replace_all(structural, "").into_owned();
    s = COPYRIGHT.replace_all(&s, "copyright").into_owned();
    s = DATE.replace_all(&s, "").into_owned();
    s = VERSION_LABEL.replace_all(&s, "").into_owned();
    s = VERSION_TAG.replace_all(&s, "").into_owned();
    tidy(&s)
}

fn tidy(text: &str) -> String {
    let s = WHITESPACE.replace_all(text, " ");
    let s = SPACE_BEFORE_PUNCT.replace_all(&s, "$1");
    let s = SPACE_AFTER_OPEN.replace_all(&s, "$1");
    let s = PUNCT_THEN_LETTER.replace_all(&s, "$1 $2");
    s.trim().to_string()
}
