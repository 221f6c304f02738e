//! Accessibility signal extraction, tiered by render mode.
//!
//! The base tier works on any DOM. Prerender adds the form-label audit and
//! focus order (structural, but only trustworthy once scripts have run).
//! Full mode adds the runtime contrast audit over computed styles and the
//! aggregated WCAG data blob.

use scraper::{ElementRef, Html};
use std::collections::BTreeMap;

use super::page_facts::PageFacts;
use super::sel;
use crate::records::{
    AccessibilityRecord, ContrastViolation, FocusOrderEntry, FormLabelSummary, Landmarks,
    RenderMode,
};
use crate::renderer::RawTextNodeStyle;

const MISSING_ALT_SOURCES_CAP: usize = 50;
const CONTRAST_NORMAL: f64 = 4.5;
const CONTRAST_LARGE: f64 = 3.0;

pub fn extract_accessibility(
    doc: &Html,
    page_url: &str,
    mode: RenderMode,
    computed_styles: &[RawTextNodeStyle],
    facts: &PageFacts,
) -> AccessibilityRecord {
    let missing_alt_sources: Vec<String> = doc
        .select(&sel("img"))
        .filter(|img| {
            img.value()
                .attr("alt")
                .map_or(true, |alt| alt.trim().is_empty())
        })
        .filter_map(|img| img.value().attr("src").map(str::to_string))
        .take(MISSING_ALT_SOURCES_CAP)
        .collect();

    let heading_sequence: Vec<u8> = facts.headings.iter().map(|h| h.level).collect();

    let landmarks = Landmarks {
        header: doc.select(&sel("header")).next().is_some(),
        nav: doc.select(&sel("nav")).next().is_some(),
        main: doc.select(&sel("main")).next().is_some(),
        footer: doc.select(&sel("footer")).next().is_some(),
        aside: doc.select(&sel("aside")).next().is_some(),
    };

    let mut role_histogram: BTreeMap<String, u32> = BTreeMap::new();
    for el in doc.select(&sel("[role]")) {
        if let Some(role) = el.value().attr("role") {
            let role = role.trim().to_lowercase();
            if !role.is_empty() {
                *role_histogram.entry(role).or_default() += 1;
            }
        }
    }

    let (form_labels, focus_order) = if mode >= RenderMode::Prerender {
        (Some(audit_form_labels(doc)), Some(focus_order(doc)))
    } else {
        (None, None)
    };

    let (contrast_violations, wcag_data) = if mode == RenderMode::Full {
        let violations = contrast_audit(computed_styles);
        let blob = wcag_blob(facts, &landmarks, &violations, form_labels.as_ref());
        (Some(violations), Some(blob))
    } else {
        (None, None)
    };

    AccessibilityRecord {
        page_url: page_url.to_string(),
        language: facts.language.clone(),
        missing_alt_count: facts.missing_alt_count,
        missing_alt_sources,
        heading_sequence,
        landmarks,
        role_histogram,
        form_labels,
        focus_order,
        contrast_violations,
        wcag_data,
    }
}

/// Does every form control carry an accessible name?
fn audit_form_labels(doc: &Html) -> FormLabelSummary {
    let labelled_for: Vec<String> = doc
        .select(&sel("label[for]"))
        .filter_map(|l| l.value().attr("for").map(str::to_string))
        .collect();

    let mut summary = FormLabelSummary::default();
    for control in doc.select(&sel("input, select, textarea")) {
        if control
            .value()
            .attr("type")
            .is_some_and(|t| matches!(t, "hidden" | "submit" | "button" | "reset"))
        {
            continue;
        }
        summary.controls += 1;

        let by_for = control
            .value()
            .id()
            .is_some_and(|id| labelled_for.iter().any(|f| f == id));
        let by_aria = control
            .value()
            .attr("aria-label")
            .is_some_and(|v| !v.trim().is_empty())
            || control.value().attr("aria-labelledby").is_some();
        let by_wrap = has_label_ancestor(&control);

        if by_for || by_aria || by_wrap {
            summary.labelled += 1;
        } else {
            summary
                .unlabelled_selectors
                .push(super::selector_hint(&control));
        }
    }
    summary
}

fn has_label_ancestor(el: &ElementRef<'_>) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| a.value().name() == "label")
}

/// Focusable elements in document order with their tabindex.
fn focus_order(doc: &Html) -> Vec<FocusOrderEntry> {
    doc.select(&sel(
        "a[href], button, input, select, textarea, [tabindex]",
    ))
    .filter_map(|el| {
        let tabindex = el
            .value()
            .attr("tabindex")
            .and_then(|t| t.trim().parse::<i32>().ok())
            .unwrap_or(0);
        if tabindex < 0 {
            return None;
        }
        Some(FocusOrderEntry {
            selector: super::selector_hint(&el),
            tabindex,
        })
    })
    .collect()
}

/// WCAG AA contrast check over the renderer's computed text styles.
fn contrast_audit(styles: &[RawTextNodeStyle]) -> Vec<ContrastViolation> {
    let mut violations = Vec::new();
    for style in styles {
        let (Some(fg), Some(bg)) = (
            style.color.as_deref().and_then(parse_css_color),
            style.background_color.as_deref().and_then(parse_css_color),
        ) else {
            continue;
        };
        let ratio = contrast_ratio(fg, bg);
        let large = style.font_size.unwrap_or(0.0) >= 24.0
            || (style.font_size.unwrap_or(0.0) >= 18.66
                && style.font_weight.unwrap_or(400) >= 700);
        let required = if large { CONTRAST_LARGE } else { CONTRAST_NORMAL };
        if ratio < required {
            violations.push(ContrastViolation {
                selector: style.selector.clone(),
                foreground: style.color.clone().unwrap_or_default(),
                background: style.background_color.clone().unwrap_or_default(),
                ratio: (ratio * 100.0).round() / 100.0,
                required_ratio: required,
            });
        }
    }
    violations
}

fn wcag_blob(
    facts: &PageFacts,
    landmarks: &Landmarks,
    violations: &[ContrastViolation],
    form_labels: Option<&FormLabelSummary>,
) -> serde_json::Value {
    let labels_ok = form_labels.map_or(true, |f| f.labelled == f.controls);
    serde_json::json!({
        "1.1.1": { "criterion": "non-text content", "missingAlt": facts.missing_alt_count },
        "1.3.1": {
            "criterion": "info and relationships",
            "landmarks": landmarks,
            "headingLevels": facts.headings.iter().map(|h| h.level).collect::<Vec<_>>(),
        },
        "1.4.3": { "criterion": "contrast (minimum)", "violations": violations.len() },
        "2.4.2": { "criterion": "page titled", "pass": facts.title.is_some() },
        "3.1.1": { "criterion": "language of page", "pass": facts.language.is_some() },
        "3.3.2": { "criterion": "labels or instructions", "pass": labels_ok },
    })
}

/// Parse `#rrggbb`, `rgb(...)` and `rgba(...)`. Fully transparent
/// backgrounds return `None`; the contrast cannot be resolved statically.
fn parse_css_color(value: &str) -> Option<(u8, u8, u8)> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix('#') {
        if hex.len() == 6 {
            let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
            let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
            let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
            return Some((r, g, b));
        }
        if hex.len() == 3 {
            let r = u8::from_str_radix(&hex[0..1], 16).ok()?;
            let g = u8::from_str_radix(&hex[1..2], 16).ok()?;
            let b = u8::from_str_radix(&hex[2..3], 16).ok()?;
            return Some((r * 17, g * 17, b * 17));
        }
        return None;
    }
    let inner = value
        .strip_prefix("rgba(")
        .or_else(|| value.strip_prefix("rgb("))?
        .strip_suffix(')')?;
    let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return None;
    }
    if parts.len() == 4 {
        let alpha: f64 = parts[3].parse().ok()?;
        if alpha == 0.0 {
            return None;
        }
    }
    Some((
        parts[0].parse().ok()?,
        parts[1].parse().ok()?,
        parts[2].parse().ok()?,
    ))
}

fn relative_luminance((r, g, b): (u8, u8, u8)) -> f64 {
    fn channel(c: u8) -> f64 {
        let c = f64::from(c) / 255.0;
        if c <= 0.03928 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    }
    0.2126 * channel(r) + 0.7152 * channel(g) + 0.0722 * channel(b)
}

fn contrast_ratio(fg: (u8, u8, u8), bg: (u8, u8, u8)) -> f64 {
    let l1 = relative_luminance(fg);
    let l2 = relative_luminance(bg);
    let (hi, lo) = if l1 > l2 { (l1, l2) } else { (l2, l1) };
    (hi + 0.05) / (lo + 0.05)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_extractor::extract_page_facts;
    use url::Url;

    fn facts_for(doc: &Html) -> PageFacts {
        let base = Url::parse("https://a.test/").unwrap();
        extract_page_facts(doc, &base, None)
    }

    #[test]
    fn base_tier_signals() {
        let d = Html::parse_document(
            r#"<html lang="fr"><body>
                <header></header><nav></nav><main>
                    <h1>One</h1><h3>Skipped</h3>
                    <img src="no-alt.png">
                    <div role="button"></div><div role="button"></div><span role="status"></span>
                </main>
            </body></html>"#,
        );
        let facts = facts_for(&d);
        let rec = extract_accessibility(&d, "https://a.test/", RenderMode::Raw, &[], &facts);

        assert_eq!(rec.language.as_deref(), Some("fr"));
        assert_eq!(rec.missing_alt_count, 1);
        assert_eq!(rec.missing_alt_sources, vec!["no-alt.png"]);
        assert_eq!(rec.heading_sequence, vec![1, 3]);
        assert!(rec.landmarks.header && rec.landmarks.nav && rec.landmarks.main);
        assert!(!rec.landmarks.footer);
        assert_eq!(rec.role_histogram.get("button"), Some(&2));
        assert_eq!(rec.role_histogram.get("status"), Some(&1));
        // Raw mode carries no prerender or full tiers.
        assert!(rec.form_labels.is_none());
        assert!(rec.focus_order.is_none());
        assert!(rec.contrast_violations.is_none());
    }

    #[test]
    fn form_label_audit_counts_all_association_kinds() {
        let d = Html::parse_document(
            r#"<body><form>
                <label for="a">A</label><input id="a" type="text">
                <input type="text" aria-label="B">
                <label>C<input type="text"></label>
                <input type="text" id="unlabelled">
                <input type="hidden" name="csrf">
            </form></body>"#,
        );
        let facts = facts_for(&d);
        let rec =
            extract_accessibility(&d, "https://a.test/", RenderMode::Prerender, &[], &facts);
        let labels = rec.form_labels.unwrap();
        assert_eq!(labels.controls, 4);
        assert_eq!(labels.labelled, 3);
        assert_eq!(labels.unlabelled_selectors.len(), 1);
        assert!(labels.unlabelled_selectors[0].contains("unlabelled"));
    }

    #[test]
    fn focus_order_skips_negative_tabindex() {
        let d = Html::parse_document(
            r#"<body>
                <a href="/x">x</a>
                <button tabindex="2">b</button>
                <div tabindex="-1">skip</div>
            </body>"#,
        );
        let facts = facts_for(&d);
        let rec =
            extract_accessibility(&d, "https://a.test/", RenderMode::Prerender, &[], &facts);
        let order = rec.focus_order.unwrap();
        assert_eq!(order.len(), 2);
        assert_eq!(order[1].tabindex, 2);
    }

    #[test]
    fn contrast_flags_low_ratio_text() {
        let styles = vec![
            RawTextNodeStyle {
                selector: "p.low".into(),
                text: "dim".into(),
                font_size: Some(14.0),
                font_weight: Some(400),
                color: Some("rgb(200, 200, 200)".into()),
                background_color: Some("rgb(255, 255, 255)".into()),
                line_height: None,
            },
            RawTextNodeStyle {
                selector: "p.ok".into(),
                text: "crisp".into(),
                font_size: Some(14.0),
                font_weight: Some(400),
                color: Some("#000000".into()),
                background_color: Some("#ffffff".into()),
                line_height: None,
            },
        ];
        let d = Html::parse_document("<body><p>x</p></body>");
        let facts = facts_for(&d);
        let rec = extract_accessibility(&d, "https://a.test/", RenderMode::Full, &styles, &facts);
        let violations = rec.contrast_violations.unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].selector, "p.low");
        assert!(violations[0].ratio < 4.5);
        assert!(rec.wcag_data.is_some());
    }

    #[test]
    fn large_text_uses_relaxed_threshold() {
        let styles = vec![RawTextNodeStyle {
            selector: "h1".into(),
            text: "big".into(),
            font_size: Some(32.0),
            font_weight: Some(400),
            // Ratio ~3.5: fails normal text, passes large text.
            color: Some("rgb(130, 130, 130)".into()),
            background_color: Some("#ffffff".into()),
            line_height: None,
        }];
        let d = Html::parse_document("<body><h1>x</h1></body>");
        let facts = facts_for(&d);
        let rec = extract_accessibility(&d, "https://a.test/", RenderMode::Full, &styles, &facts);
        assert!(rec.contrast_violations.unwrap().is_empty());
    }

    #[test]
    fn transparent_background_is_skipped() {
        assert!(parse_css_color("rgba(0, 0, 0, 0)").is_none());
        assert_eq!(parse_css_color("#fff"), Some((255, 255, 255)));
        assert_eq!(parse_css_color("rgb(1, 2, 3)"), Some((1, 2, 3)));
        assert!(parse_css_color("oklch(0.5 0.1 200)").is_none());
    }
}
