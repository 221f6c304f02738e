//! Bot-mitigation interstitial detection.
//!
//! The phrase and marker lists are intentionally small and conservative;
//! growing them is a tuning decision. Markers are checked against actual
//! attribute values of parsed elements, never against raw HTML text.

use scraper::Html;

/// Title substrings of known challenge interstitials, lowercase.
const TITLE_PHRASES: [&str; 5] = [
    "just a moment",
    "attention required",
    "checking your browser",
    "verifying you are",
    "security check",
];

/// Class/id/attribute-value substrings associated with mitigation pages.
const DOM_MARKERS: [&str; 6] = [
    "cf-browser-verification",
    "cf-challenge",
    "cf-turnstile",
    "px-captcha",
    "challenge-form",
    "ddos-protection",
];

/// Statuses commonly served alongside an interstitial.
#[must_use]
pub fn challenge_prone_status(status: u16) -> bool {
    matches!(status, 503 | 429)
}

#[must_use]
pub fn title_is_challenge(title: &str) -> bool {
    let title = title.to_lowercase();
    TITLE_PHRASES.iter().any(|p| title.contains(p))
}

/// True when any element carries a challenge marker in its `class`, `id`
/// or other attribute values.
#[must_use]
pub fn dom_has_challenge_marker(dom: &str) -> bool {
    let doc = Html::parse_document(dom);
    for el in doc.root_element().descendants() {
        let Some(el) = el.value().as_element() else {
            continue;
        };
        for (_, value) in el.attrs() {
            let value = value.to_lowercase();
            if DOM_MARKERS.iter().any(|m| value.contains(m)) {
                return true;
            }
        }
    }
    false
}

/// Overall verdict for one captured page state: any of the three signals
/// (status code, title phrase, DOM marker) flags the page.
#[must_use]
pub fn detect_challenge(status: u16, title: &str, dom: &str) -> bool {
    challenge_prone_status(status) || title_is_challenge(title) || dom_has_challenge_marker(dom)
}
