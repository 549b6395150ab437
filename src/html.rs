//! Listing-table extraction built on `scraper`.
//!
//! This is the only place that knows how the remote annotation table is laid out. Every other
//! module works with [`AnnotationRecord`] values.

use crate::record::AnnotationRecord;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;

const MIN_CELLS: usize = 8;

struct Selectors {
    body_rows: Selector,
    any_rows: Selector,
    preview: Selector,
    region: Selector,
    badge: Selector,
}

fn selectors() -> &'static Selectors {
    static SELECTORS: OnceLock<Selectors> = OnceLock::new();
    SELECTORS.get_or_init(|| Selectors {
        body_rows: parse_selector("tbody tr"),
        any_rows: parse_selector("tr"),
        preview: parse_selector("td img[src*='preview']"),
        region: parse_selector(".text-bg-region"),
        badge: parse_selector(".badge"),
    })
}

fn parse_selector(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|err| panic!("static selector {css:?} is invalid: {err}"))
}

/// Dotted region numbers, optionally followed by a `units` suffix.
fn region_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(\d+(?:\.\d+)*)(\s*units\b)?").expect("static region pattern compiles")
    })
}

/// Extracts every annotation row present in a rendered table fragment.
pub fn parse_table(table_html: &str) -> Vec<AnnotationRecord> {
    if table_html.trim().is_empty() {
        return Vec::new();
    }
    let document = Html::parse_fragment(table_html);
    let sel = selectors();
    let mut rows: Vec<ElementRef<'_>> = document.select(&sel.body_rows).collect();
    if rows.is_empty() {
        rows = document.select(&sel.any_rows).collect();
    }
    rows.into_iter()
        .filter(|tr| tr.select(&sel.preview).next().is_some())
        .filter_map(parse_row)
        .collect()
}

/// True when the fragment contains at least one body row, rendered or not.
pub fn has_body_rows(table_html: &str) -> bool {
    !table_html.trim().is_empty()
        && Html::parse_fragment(table_html)
            .select(&selectors().body_rows)
            .next()
            .is_some()
}

/// Converts one `<tr>` into a record; rows with fewer than eight cells are ignored.
pub fn parse_row(tr: ElementRef<'_>) -> Option<AnnotationRecord> {
    let cells: Vec<ElementRef<'_>> = tr
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "td")
        .collect();
    if cells.len() < MIN_CELLS {
        return None;
    }

    let sel = selectors();
    let mut region_values = Vec::new();
    let mut region_units = Vec::new();
    for span in cells[5].select(&sel.region) {
        let text = cell_text(span, " ");
        for caps in region_pattern().captures_iter(&text) {
            match caps.get(2) {
                Some(_) => region_units.push(caps[0].trim().to_string()),
                None => region_values.push(caps[1].to_string()),
            }
        }
    }

    let mut uniprot = None;
    let mut pfam_ids = Vec::new();
    for badge in cells[6].select(&sel.badge) {
        let text = cell_text(badge, " ");
        let Some(first) = text.split_whitespace().next() else {
            continue;
        };
        if text.contains("UniProt") {
            uniprot = Some(first.to_string());
        } else if text.contains("Pfam") {
            pfam_ids.push(first.to_string());
        }
    }

    Some(AnnotationRecord {
        row_index: cell_text(cells[0], ""),
        entity_id: cell_text(cells[2], ""),
        chain: cell_text(cells[3], ""),
        source: cell_text(cells[4], " "),
        region_values,
        region_units,
        uniprot,
        pfam_ids,
        status: cell_text(cells[7], ""),
    })
}

fn cell_text(el: ElementRef<'_>, separator: &str) -> String {
    el.text()
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}
