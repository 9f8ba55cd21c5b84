//! HTTP client for the live upstream catalog API (Scryfall-compatible).
//!
//! All outbound calls go through a shared rate limiter and carry an
//! identifying client header, per the upstream API's published etiquette.

use super::rate_limit::RateLimiter;
use super::ResolveError;
use crate::card_store::{CardFace, CardRecord, Layout, RelatedPart, SqliteCardStore};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const CLIENT_USER_AGENT: &str = concat!("cardex-engine/", env!("CARGO_PKG_VERSION"));

// =============================================================================
// Wire Types
// =============================================================================

/// Card object as the upstream API serializes it, both in single-card
/// responses and in the bulk dump.
#[derive(Debug, Deserialize)]
pub(crate) struct UpstreamCard {
    pub id: String,
    #[serde(default)]
    pub oracle_id: Option<String>,
    pub name: String,
    pub set: String,
    pub collector_number: String,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub released_at: Option<String>,
    #[serde(default)]
    pub colors: Option<Vec<String>>,
    #[serde(default)]
    pub mana_cost: Option<String>,
    #[serde(default)]
    pub cmc: Option<f64>,
    #[serde(default)]
    pub type_line: Option<String>,
    #[serde(default)]
    pub rarity: Option<String>,
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(default)]
    pub image_uris: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub card_faces: Option<Vec<UpstreamCardFace>>,
    #[serde(default)]
    pub all_parts: Option<Vec<UpstreamRelatedPart>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpstreamCardFace {
    pub name: String,
    #[serde(default)]
    pub mana_cost: Option<String>,
    #[serde(default)]
    pub type_line: Option<String>,
    #[serde(default)]
    pub image_uris: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpstreamRelatedPart {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamList {
    #[serde(default)]
    data: Vec<UpstreamCard>,
}

#[derive(Debug, Deserialize)]
struct AutocompleteResponse {
    #[serde(default)]
    data: Vec<String>,
}

/// Locator for the full bulk dump, obtained from a small metadata call.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkDumpInfo {
    pub download_uri: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// A fetch from upstream always yields a fetched parts state: an absent
/// `all_parts` means "fetched, has none", never "unknown".
pub(crate) fn convert_upstream_card(raw: UpstreamCard) -> CardRecord {
    let related_parts = raw
        .all_parts
        .unwrap_or_default()
        .into_iter()
        .map(|part| RelatedPart {
            id: part.id,
            name: part.name,
            component: part.component.unwrap_or_else(|| "token".to_string()),
            uri: part.uri,
        })
        .collect();
    let card_faces = raw
        .card_faces
        .unwrap_or_default()
        .into_iter()
        .map(|face| CardFace {
            name: face.name,
            mana_cost: face.mana_cost,
            type_line: face.type_line,
            image_uris: face.image_uris.unwrap_or_default(),
        })
        .collect();

    CardRecord {
        id: raw.id,
        oracle_id: raw.oracle_id.unwrap_or_default(),
        name: raw.name,
        set_code: raw.set,
        collector_number: raw.collector_number,
        language: raw.lang.unwrap_or_else(|| "en".to_string()),
        released_at: raw.released_at,
        colors: raw.colors.unwrap_or_default(),
        mana_cost: raw.mana_cost,
        mana_value: raw.cmc.unwrap_or(0.0),
        type_line: raw.type_line.unwrap_or_default(),
        rarity: raw.rarity.unwrap_or_default(),
        layout: Layout::from_db_str(raw.layout.as_deref().unwrap_or("normal")),
        image_uris: raw.image_uris.unwrap_or_default(),
        card_faces,
        related_parts: Some(related_parts),
    }
}

// =============================================================================
// Client Trait
// =============================================================================

/// Live upstream catalog API. `Ok(None)` is a clean "not found";
/// `Err(ResolveError::Upstream)` is reachable-but-failing and retryable.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn named_exact(&self, name: &str) -> Result<Option<CardRecord>, ResolveError>;

    async fn named_fuzzy(&self, name: &str) -> Result<Option<CardRecord>, ResolveError>;

    async fn by_set_number(
        &self,
        set_code: &str,
        collector_number: &str,
        language: &str,
    ) -> Result<Option<CardRecord>, ResolveError>;

    async fn by_id(&self, id: &str) -> Result<Option<CardRecord>, ResolveError>;

    /// All printings sharing an oracle identity.
    async fn printings_by_oracle_id(
        &self,
        oracle_id: &str,
    ) -> Result<Vec<CardRecord>, ResolveError>;

    async fn autocomplete(&self, partial: &str) -> Result<Vec<String>, ResolveError>;

    async fn bulk_dump_locator(&self) -> Result<BulkDumpInfo, ResolveError>;

    /// Stream the dump body to `dest`, returning the byte count.
    async fn fetch_dump(&self, download_uri: &str, dest: &Path) -> Result<u64, ResolveError>;
}

// =============================================================================
// reqwest Implementation
// =============================================================================

pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    limiter: RateLimiter,
    request_timeout: Duration,
    /// Response cache for list-shaped queries, if a store is attached.
    cache_store: Option<Arc<SqliteCardStore>>,
    cache_ttl: Duration,
}

impl UpstreamClient {
    pub fn new(
        base_url: String,
        min_call_spacing: Duration,
        request_timeout: Duration,
        cache_store: Option<Arc<SqliteCardStore>>,
        cache_ttl: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(CLIENT_USER_AGENT)
            .build()
            .expect("Failed to create HTTP client");

        let base_url = base_url.trim_end_matches('/').to_string();

        Self {
            client,
            base_url,
            limiter: RateLimiter::new(min_call_spacing),
            request_timeout,
            cache_store,
            cache_ttl,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One rate-limited GET, mapped into the resolver error taxonomy.
    /// A 404 becomes `Ok(None)`.
    async fn get_text(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<String>, ResolveError> {
        self.limiter.acquire().await;

        let response = self
            .client
            .get(url)
            .query(query)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| ResolveError::Upstream(format!("request to {url} failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ResolveError::Upstream(format!(
                "{url} returned status {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ResolveError::Upstream(format!("failed reading body from {url}: {e}")))?;
        Ok(Some(body))
    }

    async fn get_card(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<CardRecord>, ResolveError> {
        match self.get_text(url, query).await? {
            Some(body) => {
                let raw: UpstreamCard = serde_json::from_str(&body)
                    .map_err(|e| ResolveError::Parse(format!("bad card payload: {e}")))?;
                Ok(Some(convert_upstream_card(raw)))
            }
            None => Ok(None),
        }
    }

    /// Cache-through text fetch for list-shaped queries: the response cache
    /// is keyed by `(endpoint, normalized query)` and only valid entries are
    /// returned.
    async fn get_text_cached(
        &self,
        endpoint: &str,
        cache_key: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<String>, ResolveError> {
        let cache_key = cache_key.to_lowercase();
        let now = chrono::Utc::now().timestamp();

        if let Some(store) = &self.cache_store {
            match store.get_cached_response(endpoint, &cache_key, now) {
                Ok(Some(payload)) => {
                    debug!("Response cache hit for {endpoint} {cache_key}");
                    return Ok(Some(payload));
                }
                Ok(None) => {}
                Err(e) => debug!("Response cache read failed: {e:#}"),
            }
        }

        let body = self.get_text(url, query).await?;
        if let (Some(store), Some(body)) = (&self.cache_store, &body) {
            let expires_at = now + self.cache_ttl.as_secs() as i64;
            if let Err(e) = store.put_cached_response(endpoint, &cache_key, body, expires_at) {
                debug!("Response cache write failed: {e:#}");
            }
        }
        Ok(body)
    }
}

#[async_trait]
impl UpstreamApi for UpstreamClient {
    async fn named_exact(&self, name: &str) -> Result<Option<CardRecord>, ResolveError> {
        let url = format!("{}/cards/named", self.base_url);
        self.get_card(&url, &[("exact", name)]).await
    }

    async fn named_fuzzy(&self, name: &str) -> Result<Option<CardRecord>, ResolveError> {
        let url = format!("{}/cards/named", self.base_url);
        self.get_card(&url, &[("fuzzy", name)]).await
    }

    async fn by_set_number(
        &self,
        set_code: &str,
        collector_number: &str,
        language: &str,
    ) -> Result<Option<CardRecord>, ResolveError> {
        let url = format!(
            "{}/cards/{}/{}/{}",
            self.base_url,
            set_code.to_lowercase(),
            collector_number,
            language.to_lowercase()
        );
        self.get_card(&url, &[]).await
    }

    async fn by_id(&self, id: &str) -> Result<Option<CardRecord>, ResolveError> {
        let url = format!("{}/cards/{}", self.base_url, id);
        self.get_card(&url, &[]).await
    }

    async fn printings_by_oracle_id(
        &self,
        oracle_id: &str,
    ) -> Result<Vec<CardRecord>, ResolveError> {
        let url = format!("{}/cards/search", self.base_url);
        let q = format!("oracleid:{oracle_id}");
        let body = self
            .get_text_cached(
                "search",
                &q,
                &url,
                &[("q", q.as_str()), ("unique", "prints"), ("order", "released")],
            )
            .await?;
        match body {
            Some(body) => {
                let list: UpstreamList = serde_json::from_str(&body)
                    .map_err(|e| ResolveError::Parse(format!("bad search payload: {e}")))?;
                Ok(list.data.into_iter().map(convert_upstream_card).collect())
            }
            None => Ok(vec![]),
        }
    }

    async fn autocomplete(&self, partial: &str) -> Result<Vec<String>, ResolveError> {
        let url = format!("{}/cards/autocomplete", self.base_url);
        let body = self
            .get_text_cached("autocomplete", partial, &url, &[("q", partial)])
            .await?;
        match body {
            Some(body) => {
                let parsed: AutocompleteResponse = serde_json::from_str(&body)
                    .map_err(|e| ResolveError::Parse(format!("bad autocomplete payload: {e}")))?;
                Ok(parsed.data)
            }
            None => Ok(vec![]),
        }
    }

    async fn bulk_dump_locator(&self) -> Result<BulkDumpInfo, ResolveError> {
        let url = format!("{}/bulk-data/default-cards", self.base_url);
        let body = self
            .get_text(&url, &[])
            .await?
            .ok_or_else(|| ResolveError::Upstream("bulk dump metadata not found".to_string()))?;
        serde_json::from_str(&body)
            .map_err(|e| ResolveError::Parse(format!("bad bulk metadata payload: {e}")))
    }

    async fn fetch_dump(&self, download_uri: &str, dest: &Path) -> Result<u64, ResolveError> {
        self.limiter.acquire().await;

        let response = self
            .client
            .get(download_uri)
            .send()
            .await
            .map_err(|e| ResolveError::Upstream(format!("dump download failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ResolveError::Upstream(format!(
                "dump download returned status {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| ResolveError::Upstream(format!("cannot create dump file: {e}")))?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| ResolveError::Upstream(format!("dump download failed: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ResolveError::Upstream(format!("cannot write dump file: {e}")))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| ResolveError::Upstream(format!("cannot flush dump file: {e}")))?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_minimal_card() {
        let raw: UpstreamCard = serde_json::from_str(
            r#"{"id":"abc","name":"Sol Ring","set":"cmd","collector_number":"129"}"#,
        )
        .unwrap();
        let card = convert_upstream_card(raw);
        assert_eq!(card.language, "en");
        assert_eq!(card.layout, Layout::Normal);
        // an upstream fetch always yields a fetched parts state
        assert_eq!(card.related_parts, Some(vec![]));
    }

    #[test]
    fn test_convert_full_card() {
        let raw: UpstreamCard = serde_json::from_str(
            r#"{
                "id": "abc",
                "oracle_id": "o-1",
                "name": "Krenko, Mob Boss",
                "set": "m13",
                "collector_number": "139",
                "lang": "en",
                "released_at": "2012-07-13",
                "colors": ["R"],
                "mana_cost": "{2}{R}{R}",
                "cmc": 4.0,
                "type_line": "Legendary Creature — Goblin Warrior",
                "rarity": "rare",
                "layout": "normal",
                "image_uris": {"normal": "https://img.example/n.jpg"},
                "all_parts": [
                    {"id": "tok", "name": "Goblin", "component": "token",
                     "uri": "https://api.example/cards/tok"}
                ]
            }"#,
        )
        .unwrap();
        let card = convert_upstream_card(raw);
        assert_eq!(card.oracle_id, "o-1");
        assert_eq!(card.mana_value, 4.0);
        let parts = card.related_parts.unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].component, "token");
    }

    #[test]
    fn test_convert_multi_faced_card() {
        let raw: UpstreamCard = serde_json::from_str(
            r#"{
                "id": "dfc",
                "oracle_id": "o-2",
                "name": "Delver of Secrets // Insectile Aberration",
                "set": "isd",
                "collector_number": "51",
                "layout": "transform",
                "card_faces": [
                    {"name": "Delver of Secrets",
                     "image_uris": {"normal": "https://img.example/front.jpg"}},
                    {"name": "Insectile Aberration"}
                ]
            }"#,
        )
        .unwrap();
        let card = convert_upstream_card(raw);
        assert_eq!(card.layout, Layout::Transform);
        assert_eq!(card.card_faces.len(), 2);
        assert_eq!(card.front_face_name(), "Delver of Secrets");
        assert!(card.card_faces[1].image_uris.is_empty());
    }
}
