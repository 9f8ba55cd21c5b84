//! Card models for SQLite-backed storage.
//!
//! These mirror the upstream catalog's card objects closely enough that a
//! record written by either the bulk importer or an on-demand fetch reads
//! back identically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Enumerations
// =============================================================================

/// Presentation layout of a printing.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Layout {
    Normal,
    Split,
    Flip,
    Transform,
    ModalDfc,
    Meld,
    Adventure,
    Token,
    DoubleFacedToken,
    Emblem,
    ArtSeries,
    Unknown,
}

impl Layout {
    /// Convert from database string representation
    pub fn from_db_str(s: &str) -> Self {
        match s {
            "normal" => Layout::Normal,
            "split" => Layout::Split,
            "flip" => Layout::Flip,
            "transform" => Layout::Transform,
            "modal_dfc" => Layout::ModalDfc,
            "meld" => Layout::Meld,
            "adventure" => Layout::Adventure,
            "token" => Layout::Token,
            "double_faced_token" => Layout::DoubleFacedToken,
            "emblem" => Layout::Emblem,
            "art_series" => Layout::ArtSeries,
            _ => Layout::Unknown,
        }
    }

    /// Convert to database string representation
    pub fn to_db_str(&self) -> &'static str {
        match self {
            Layout::Normal => "normal",
            Layout::Split => "split",
            Layout::Flip => "flip",
            Layout::Transform => "transform",
            Layout::ModalDfc => "modal_dfc",
            Layout::Meld => "meld",
            Layout::Adventure => "adventure",
            Layout::Token => "token",
            Layout::DoubleFacedToken => "double_faced_token",
            Layout::Emblem => "emblem",
            Layout::ArtSeries => "art_series",
            Layout::Unknown => "unknown",
        }
    }

    /// Layouts that are presentation-only variants (art cards, emblems)
    /// rather than playable printings. Penalized during name scoring.
    pub fn is_presentation_only(&self) -> bool {
        matches!(self, Layout::ArtSeries | Layout::Emblem)
    }

    /// Layouts whose printings are tokens.
    pub fn is_token(&self) -> bool {
        matches!(self, Layout::Token | Layout::DoubleFacedToken)
    }
}

// =============================================================================
// Core Entities
// =============================================================================

/// One face of a multi-faced card.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CardFace {
    pub name: String,
    #[serde(default)]
    pub mana_cost: Option<String>,
    #[serde(default)]
    pub type_line: Option<String>,
    #[serde(default)]
    pub image_uris: BTreeMap<String, String>,
}

/// A linked secondary object (token, meld part, combo piece) attached to a
/// card, as reported by the upstream catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelatedPart {
    pub id: String,
    pub name: String,
    /// Component kind, e.g. "token", "meld_part", "combo_piece".
    pub component: String,
    #[serde(default)]
    pub uri: Option<String>,
}

/// Canonical identity of one card printing.
///
/// `related_parts` is tri-state: `None` means the parts list has never been
/// fetched for this record, `Some(vec![])` means it was fetched and the card
/// has none. Lookups that must not hand out identity-incomplete records
/// treat `None` as a miss.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CardRecord {
    pub id: String,
    pub oracle_id: String,
    pub name: String,
    pub set_code: String,
    pub collector_number: String,
    pub language: String,
    #[serde(default)]
    pub released_at: Option<String>,
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default)]
    pub mana_cost: Option<String>,
    #[serde(default)]
    pub mana_value: f64,
    pub type_line: String,
    pub rarity: String,
    pub layout: Layout,
    #[serde(default)]
    pub image_uris: BTreeMap<String, String>,
    #[serde(default)]
    pub card_faces: Vec<CardFace>,
    pub related_parts: Option<Vec<RelatedPart>>,
}

/// Separator between face names in a multi-faced card's combined name.
pub const FACE_SEPARATOR: &str = " // ";

impl CardRecord {
    /// Name of the front face, for multi-faced cards whose combined name is
    /// "Front // Back". Falls back to the full name.
    pub fn front_face_name(&self) -> &str {
        self.name
            .split(FACE_SEPARATOR)
            .next()
            .unwrap_or(&self.name)
    }

    /// Whether the parts list has been fetched at least once.
    pub fn is_identity_complete(&self) -> bool {
        self.related_parts.is_some()
    }
}

/// A lightweight reference to a related object, used as input to token
/// resolution. Either `id` or `name` may be the only usable handle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenPart {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub uri: Option<String>,
}

/// Minimal well-formed record for tests.
#[cfg(test)]
pub(crate) fn test_card(id: &str, name: &str) -> CardRecord {
    CardRecord {
        id: id.to_string(),
        oracle_id: format!("oracle-{id}"),
        name: name.to_string(),
        set_code: "tst".to_string(),
        collector_number: "1".to_string(),
        language: "en".to_string(),
        released_at: Some("2020-01-01".to_string()),
        colors: vec![],
        mana_cost: None,
        mana_value: 0.0,
        type_line: "Artifact".to_string(),
        rarity: "uncommon".to_string(),
        layout: Layout::Normal,
        image_uris: BTreeMap::new(),
        card_faces: vec![],
        related_parts: Some(vec![]),
    }
}
