//! Deterministic ranking of name-match candidates.
//!
//! Scores are built from three bounded components so that no lower-priority
//! criterion can ever flip a higher-priority one: name-match tier, layout
//! penalty, collector-number tiebreak.

use crate::card_store::{CardRecord, FACE_SEPARATOR};
use std::cmp::Ordering;

/// Exact case-insensitive name equality.
pub const EXACT_MATCH_SCORE: f64 = 1000.0;
/// Query equals the front face of a multi-faced name.
pub const FRONT_FACE_SCORE: f64 = 500.0;
/// Art-series/emblem printings rank below playable ones of the same tier.
/// Strictly smaller than the tier gap, so it never inverts the name tier:
/// a penalized exact match (750) still beats any front-face match.
pub const PRESENTATION_PENALTY: f64 = 250.0;
/// Ceiling of the collector-number tiebreak; the realized value is at most
/// half of this, keeping it below the layout penalty.
pub const COLLECTOR_TIEBREAK_CEILING: f64 = 100.0;

/// Numeric prefix of a collector number ("129a" -> 129, "★" -> 0).
fn collector_numeric(collector_number: &str) -> u64 {
    let digits: String = collector_number
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

/// Score one candidate against a free-text name query. Higher is better;
/// zero means the candidate does not match the query at all.
pub fn score_candidate(card: &CardRecord, query: &str) -> f64 {
    let name_score = if card.name.eq_ignore_ascii_case(query) {
        EXACT_MATCH_SCORE
    } else if is_front_face_match(&card.name, query) {
        FRONT_FACE_SCORE
    } else {
        return 0.0;
    };

    let layout_penalty = if card.layout.is_presentation_only() {
        PRESENTATION_PENALTY
    } else {
        0.0
    };

    // Smaller collector number = earlier in the set = primary printing.
    let n = collector_numeric(&card.collector_number);
    let tiebreak = COLLECTOR_TIEBREAK_CEILING / (n as f64 + 2.0);

    name_score - layout_penalty + tiebreak
}

fn is_front_face_match(card_name: &str, query: &str) -> bool {
    let Some(front) = card_name.split(FACE_SEPARATOR).next() else {
        return false;
    };
    card_name.contains(FACE_SEPARATOR) && front.eq_ignore_ascii_case(query)
}

/// Pick the best-scoring candidate. The ordering is total — score, then
/// numeric collector number, then collector string, then id — so the result
/// does not depend on the order candidates were supplied in.
pub fn pick_best_match<'a>(candidates: &'a [CardRecord], query: &str) -> Option<&'a CardRecord> {
    candidates
        .iter()
        .map(|card| (score_candidate(card, query), card))
        .filter(|(score, _)| *score > 0.0)
        .min_by(|(score_a, a), (score_b, b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(Ordering::Equal)
                .then_with(|| collector_numeric(&a.collector_number).cmp(&collector_numeric(&b.collector_number)))
                .then_with(|| a.collector_number.cmp(&b.collector_number))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|(_, card)| card)
}
