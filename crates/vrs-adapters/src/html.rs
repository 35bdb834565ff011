//! Review-block parsing for captured Maps listing pages.

use chrono::{DateTime, Duration, Utc};
use scraper::{ElementRef, Html, Selector};
use vrs_core::RawReview;

use crate::ExtractionError;

const BLOCK_SELECTOR: &str = "div.jftiEf";
const AUTHOR_SELECTOR: &str = "div.d4r55";
const BODY_SELECTOR: &str = "span.wiI7pd";
const DATE_SELECTOR: &str = "span.rsqaWe";
const RATING_SELECTOR: &str = "span[role=\"img\"]";

const NUMBER_WORDS: &[(&str, i64)] = &[
    ("un", 1),
    ("una", 1),
    ("uno", 1),
    ("a", 1),
    ("an", 1),
    ("dos", 2),
    ("tres", 3),
    ("cuatro", 4),
    ("cinco", 5),
    ("seis", 6),
    ("siete", 7),
    ("ocho", 8),
    ("nueve", 9),
    ("diez", 10),
    ("once", 11),
    ("doce", 12),
];

fn selector(css: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|e| ExtractionError::Fatal(format!("selector {css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn select_first_text(block: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    block
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Reads "4 estrellas", "Rated 4.0 out of 5", "4,5 estrellas" style labels.
fn rating_from_label(label: &str) -> Option<f64> {
    let lower = label.to_lowercase();
    if !(lower.contains("estrella") || lower.contains("star")) {
        return None;
    }
    let start = lower.find(|c: char| c.is_ascii_digit())?;
    let number: String = lower[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    number
        .trim_end_matches(['.', ','])
        .replace(',', ".")
        .parse()
        .ok()
}

/// Converts Maps relative dates ("Hace 3 meses", "una semana atrás", "2 hours ago")
/// into an approximate `YYYY-MM-DD` relative to `reference`.
///
/// Months count as 30 days and years as 365.
pub fn parse_relative_date(text: &str, reference: DateTime<Utc>) -> Option<String> {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }

    let tokens = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>();
    let amount = match tokens.iter().find(|t| t.chars().all(|c| c.is_ascii_digit())) {
        Some(digits) => digits.parse::<i64>().ok()?,
        None => tokens
            .iter()
            .find_map(|t| {
                NUMBER_WORDS
                    .iter()
                    .find(|(word, _)| word == t)
                    .map(|(_, n)| *n)
            })
            .unwrap_or(1),
    };

    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    let offset = if has(&["día", "dia", "day"]) {
        Duration::try_days(amount)
    } else if has(&["semana", "week"]) {
        Duration::try_weeks(amount)
    } else if has(&["mes", "month"]) {
        amount.checked_mul(30).and_then(Duration::try_days)
    } else if has(&["año", "year"]) {
        amount.checked_mul(365).and_then(Duration::try_days)
    } else if has(&["hora", "hour"]) {
        Duration::try_hours(amount)
    } else if has(&["minuto", "minute"]) {
        Duration::try_minutes(amount)
    } else {
        return None;
    }?;

    // Out-of-range amounts leave the date underived; the raw text still identifies the review.
    reference
        .checked_sub_signed(offset)
        .map(|date| date.format("%Y-%m-%d").to_string())
}

/// Parses every review block of a captured listing page, newest first as rendered.
///
/// A block without an author stays author-less so identity generation rejects it.
pub fn parse_review_blocks(
    html: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<RawReview>, ExtractionError> {
    let document = Html::parse_document(html);
    let block_sel = selector(BLOCK_SELECTOR)?;
    let author_sel = selector(AUTHOR_SELECTOR)?;
    let body_sel = selector(BODY_SELECTOR)?;
    let date_sel = selector(DATE_SELECTOR)?;
    let rating_sel = selector(RATING_SELECTOR)?;

    let mut reviews = Vec::new();
    for block in document.select(&block_sel) {
        let published_raw = select_first_text(&block, &date_sel);
        let published_at = published_raw
            .as_deref()
            .and_then(|raw| parse_relative_date(raw, fetched_at));
        let rating = block
            .select(&rating_sel)
            .filter_map(|n| n.value().attr("aria-label"))
            .find_map(rating_from_label);

        reviews.push(RawReview {
            author: select_first_text(&block, &author_sel),
            rating,
            body: select_first_text(&block, &body_sel),
            published_at,
            published_raw,
        });
    }
    Ok(reviews)
}
