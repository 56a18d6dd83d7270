//! Portal page parsing
//!
//! Normalizes the portal's HTML pages into typed values. The portal has no
//! API; everything the system knows about friends and scores comes from
//! these selectors.

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// One normalized row of a friend-comparison page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub title: String,
    /// Level label as displayed (e.g. "13+")
    pub level: String,
    /// Own achievement in basis points of a percent (99.5421% -> 995421)
    pub self_achievement: Option<u32>,
    /// Rival (target) achievement in basis points of a percent
    pub rival_achievement: Option<u32>,
    /// Own deluxe score
    pub self_dx_score: Option<u32>,
    /// Rival deluxe score
    pub rival_dx_score: Option<u32>,
}

fn selector(css: &str) -> Selector {
    // Selectors are compile-time constants in spirit; a parse failure is a bug.
    Selector::parse(css).unwrap_or_else(|_| panic!("invalid selector: {}", css))
}

/// Extract friend codes from a friend list, sent-request or
/// pending-acceptance page.
///
/// Each entry is a `div.friend_block` carrying the code in `data-idx`.
pub fn parse_friend_codes(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let block = selector("div.friend_block");

    document
        .select(&block)
        .filter_map(|element| element.value().attr("data-idx"))
        .map(str::to_string)
        .collect()
}

/// Parse a friend-code search page; returns the player name on a hit.
pub fn parse_search_hit(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let hit = selector("div.search_result[data-idx]");

    document
        .select(&hit)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
}

/// Parse the logged-in account's own friend code from its profile page.
pub fn parse_own_friend_code(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let code = selector("div.my_code[data-idx]");

    document
        .select(&code)
        .next()
        .and_then(|element| element.value().attr("data-idx"))
        .map(str::to_string)
}

/// Parse an achievement label like "99.5421%" into basis points of a
/// percent (995421). A dash or empty cell means the chart is unplayed.
pub fn parse_achievement(label: &str) -> Option<u32> {
    let trimmed = label.trim().trim_end_matches('%');
    if trimmed.is_empty() || trimmed == "-" || trimmed == "―" {
        return None;
    }

    let (whole, frac) = match trimmed.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (trimmed, ""),
    };

    let whole: u32 = whole.parse().ok()?;
    let mut frac = frac.to_string();
    if frac.len() > 4 {
        return None;
    }
    while frac.len() < 4 {
        frac.push('0');
    }
    let frac: u32 = frac.parse().ok()?;

    Some(whole * 10_000 + frac)
}

fn parse_dx_score(label: &str) -> Option<u32> {
    let trimmed = label.trim().replace(',', "");
    if trimmed.is_empty() || trimmed == "-" {
        return None;
    }
    trimmed.parse().ok()
}

/// Normalize one friend-comparison page into score rows.
///
/// Row structure:
/// ```text
/// div.vs_row
///   .title          song title
///   .level          level label
///   .self .achievement / .self .dx_score
///   .rival .achievement / .rival .dx_score
/// ```
///
/// # Errors
/// Returns an upstream error if the page has no comparison container at
/// all, which means the portal served something unexpected.
pub fn parse_comparison_rows(html: &str) -> Result<Vec<ScoreRow>, AppError> {
    let document = Html::parse_document(html);
    let container = selector("div.vs_container");
    let row = selector("div.vs_row");
    let title = selector(".title");
    let level = selector(".level");
    let self_achievement = selector(".self .achievement");
    let rival_achievement = selector(".rival .achievement");
    let self_dx = selector(".self .dx_score");
    let rival_dx = selector(".rival .dx_score");

    if document.select(&container).next().is_none() {
        return Err(AppError::Upstream(
            "comparison page is missing its score container".to_string(),
        ));
    }

    let text_of = |element: scraper::ElementRef<'_>, sel: &Selector| {
        element
            .select(sel)
            .next()
            .map(|node| node.text().collect::<String>().trim().to_string())
    };

    let mut rows = Vec::new();
    for element in document.select(&row) {
        let Some(title) = text_of(element, &title) else {
            continue;
        };

        rows.push(ScoreRow {
            title,
            level: text_of(element, &level).unwrap_or_default(),
            self_achievement: text_of(element, &self_achievement)
                .as_deref()
                .and_then(parse_achievement),
            rival_achievement: text_of(element, &rival_achievement)
                .as_deref()
                .and_then(parse_achievement),
            self_dx_score: text_of(element, &self_dx).as_deref().and_then(parse_dx_score),
            rival_dx_score: text_of(element, &rival_dx)
                .as_deref()
                .and_then(parse_dx_score),
        });
    }

    Ok(rows)
}
