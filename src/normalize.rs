//! Page text cleanup applied before hashing and storage.
//!
//! The normalizer turns extracted page text into the stable, line-oriented
//! form that gets stored as `content.txt`:
//!
//! 1. Line endings unified, typography folded (see
//!    [`fold_typography`](crate::hashing::fold_typography)).
//! 2. Whitespace inside each line collapsed, lines trimmed.
//! 3. Short boilerplate lines dropped: cookie banners, share and subscribe
//!    prompts, "skip to content", JavaScript notices and the like. The
//!    phrases are only removed as whole short lines, never from inside a
//!    paragraph, so a policy that talks about its cookie policy keeps
//!    that sentence.
//! 4. Navigation-only, punctuation-only and very short lines dropped.
//! 5. Bullets standardized to `• `.
//! 6. Runs of blank lines collapsed to one.
//!
//! Dates are kept as-is. Ignoring date bumps is the job of the fingerprint
//! hash tier, not of the stored text.

use std::sync::LazyLock;

use regex::{Regex, RegexSet};

use crate::hashing::fold_typography;

/// Boilerplate lines are at most this many characters long.
const BOILERPLATE_MAX_LEN: usize = 80;

const NAV_WORDS: &[&str] = &[
    "home", "menu", "back", "next", "previous", "top", "skip", "close", "search", "login",
    "log in", "sign in", "sign up",
];

static BOILERPLATE: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)skip\s+to\s+(?:main\s+)?content",
        r"(?i)^table\s+of\s+contents?$",
        r"(?i)jump\s+to\s+(?:navigation|section)",
        r"(?i)^breadcrumbs?$",
        r"(?i)^you\s+are\s+here:?",
        r"(?i)share\s+(?:this\s+)?(?:on|via)\s+(?:facebook|twitter|x|linkedin|social)",
        r"(?i)follow\s+us\s+on\s+(?:facebook|twitter|x|linkedin|instagram)",
        r"(?i)share\s+this\s+(?:page|article|post)",
        r"(?i)subscribe\s+to\s+(?:our\s+)?newsletter",
        r"(?i)sign\s+up\s+for\s+(?:updates|alerts|(?:our\s+)?newsletter)",
        r"(?i)this\s+(?:website|site)\s+uses\s+cookies",
        r"(?i)^accept\s+(?:all\s+)?cookies?$",
        r"(?i)^(?:reject|decline)\s+(?:all\s+)?cookies?$",
        r"(?i)manage\s+cookie\s+(?:preferences|settings)",
        r"(?i)^cookie\s+(?:settings|preferences|banner|consent)$",
        r"(?i)^print\s+(?:this\s+)?(?:page|document|article)$",
        r"(?i)^download\s+(?:as\s+)?(?:pdf|word|doc)$",
        r"(?i)^advertisement$",
        r"(?i)^(?:change|select)\s+language$",
        r"(?i)all\s+rights\s+reserved\.?$",
        r"(?i)^loading\.{3,}$",
        r"(?i)please\s+enable\s+javascript",
        r"(?i)javascript\s+(?:is\s+)?(?:required|disabled)",
        r"(?i)this\s+(?:page|content)\s+requires\s+javascript",
    ])
    .unwrap()
});
static INLINE_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\S\n]+").unwrap());
static PUNCT_ONLY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[^\w\s]*$").unwrap());
static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[•·▪▫‣⁃◦]\s*|[-*+]\s+)").unwrap());

/// Turns extracted page text into stored snapshot content.
///
/// Implementations must be pure: the same input always yields the same
/// output.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, raw: &str) -> String;
}

/// The default [`Normalizer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TextNormalizer;

impl Normalizer for TextNormalizer {
    fn normalize(&self, raw: &str) -> String {
        let text = fold_typography(&raw.replace("\r\n", "\n").replace('\r', "\n"));

        let mut out: Vec<String> = Vec::new();
        for line in text.lines() {
            let line = INLINE_SPACE.replace_all(line, " ");
            let line = line.trim();

            if line.is_empty() {
                if out.last().is_some_and(|l| !l.is_empty()) {
                    out.push(String::new());
                }
                continue;
            }
            if keep_line(line) {
                out.push(BULLET.replace(line, "• ").into_owned());
            }
        }

        while out.last().is_some_and(|l| l.is_empty()) {
            out.pop();
        }
        out.join("\n")
    }
}

fn keep_line(line: &str) -> bool {
    if line.chars().count() < 3 {
        return false;
    }
    if PUNCT_ONLY.is_match(line) {
        return false;
    }
    let lower = line.to_lowercase();
    if NAV_WORDS.contains(&lower.as_str()) {
        return false;
    }
    !(line.chars().count() <= BOILERPLATE_MAX_LEN && BOILERPLATE.is_match(line))
}
