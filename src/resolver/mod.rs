//! Tiered card resolution: accelerator service, local store, live upstream.
//!
//! Tier-internal failures are swallowed and recorded; the caller only ever
//! sees a record, a clean "not found", a retryable upstream error, or its
//! own cancellation.

pub mod accelerator;
pub mod rate_limit;
pub mod upstream;

pub use accelerator::{AcceleratorClient, AcceleratorTier};
pub use rate_limit::RateLimiter;
pub use upstream::{BulkDumpInfo, UpstreamApi, UpstreamClient};

use crate::card_store::{CardRecord, SqliteCardStore};
use crate::hot_cache::{name_key, HotCache};
use crate::metrics::ResolverMetrics;
use crate::scoring::pick_best_match;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Terminal failures a resolution can surface. "Not found" is not an error;
/// it is the `Ok(None)` outcome.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The live tier was reached but failed (network error or 5xx). Retryable.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Malformed data from a tier or from the bulk dump.
    #[error("malformed data: {0}")]
    Parse(String),

    /// Caller-initiated abort. Not a failure; never logged as one.
    #[error("cancelled")]
    Cancelled,
}

/// The two supported identity query shapes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CardQuery {
    ByName {
        name: String,
        language: String,
    },
    BySetNumber {
        set_code: String,
        collector_number: String,
        language: String,
    },
}

impl CardQuery {
    pub fn by_name(name: &str, language: &str) -> Self {
        CardQuery::ByName {
            name: name.to_string(),
            language: language.to_string(),
        }
    }

    pub fn by_set_number(set_code: &str, collector_number: &str, language: &str) -> Self {
        CardQuery::BySetNumber {
            set_code: set_code.to_string(),
            collector_number: collector_number.to_string(),
            language: language.to_string(),
        }
    }

    fn endpoint(&self) -> &'static str {
        match self {
            CardQuery::ByName { .. } => "card_by_name",
            CardQuery::BySetNumber { .. } => "card_by_set_number",
        }
    }
}

/// Orchestrates the fallback chain for single and batched lookups.
pub struct CardResolver {
    store: Arc<SqliteCardStore>,
    hot_cache: Arc<HotCache>,
    accelerator: Option<Arc<dyn AcceleratorTier>>,
    upstream: Arc<dyn UpstreamApi>,
    metrics: Arc<ResolverMetrics>,
}

impl CardResolver {
    pub fn new(
        store: Arc<SqliteCardStore>,
        accelerator: Option<Arc<dyn AcceleratorTier>>,
        upstream: Arc<dyn UpstreamApi>,
        metrics: Arc<ResolverMetrics>,
    ) -> Self {
        let hot_cache = store.hot_cache();
        Self {
            store,
            hot_cache,
            accelerator,
            upstream,
            metrics,
        }
    }

    pub fn metrics(&self) -> Arc<ResolverMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn store(&self) -> Arc<SqliteCardStore> {
        Arc::clone(&self.store)
    }

    pub fn upstream(&self) -> Arc<dyn UpstreamApi> {
        Arc::clone(&self.upstream)
    }

    /// Resolve one identity query through the cheapest healthy tier.
    pub async fn resolve(
        &self,
        query: &CardQuery,
        cancel: &CancellationToken,
    ) -> Result<Option<CardRecord>, ResolveError> {
        self.check_cancel(cancel)?;

        if self.accelerator_ready().await {
            if let Some(card) = self.try_accelerator(query).await {
                return Ok(Some(card));
            }
        }
        self.check_cancel(cancel)?;

        if let Some(card) = self.try_store(query) {
            return Ok(Some(card));
        }
        self.check_cancel(cancel)?;

        self.try_upstream(query).await
    }

    /// Resolve N identities, passing only genuine misses down each tier.
    /// Output order matches input order.
    pub async fn resolve_batch(
        &self,
        queries: &[CardQuery],
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<CardRecord>>, ResolveError> {
        let mut results: Vec<Option<CardRecord>> = vec![None; queries.len()];
        let mut misses: Vec<usize> = (0..queries.len()).collect();

        // One health decision per batch, then only misses fall through.
        if self.accelerator_ready().await {
            let mut still_missing = Vec::new();
            for idx in misses {
                self.check_cancel(cancel)?;
                match self.try_accelerator(&queries[idx]).await {
                    Some(card) => results[idx] = Some(card),
                    None => still_missing.push(idx),
                }
            }
            misses = still_missing;
        }

        let mut still_missing = Vec::new();
        for idx in misses {
            self.check_cancel(cancel)?;
            match self.try_store(&queries[idx]) {
                Some(card) => results[idx] = Some(card),
                None => still_missing.push(idx),
            }
        }
        misses = still_missing;

        for idx in misses {
            self.check_cancel(cancel)?;
            results[idx] = self.try_upstream(&queries[idx]).await?;
        }

        Ok(results)
    }

    fn check_cancel(&self, cancel: &CancellationToken) -> Result<(), ResolveError> {
        if cancel.is_cancelled() {
            Err(ResolveError::Cancelled)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Tier 1: remote accelerator
    // =========================================================================

    /// Whether the accelerator should be attempted at all: configured,
    /// currently healthy per metrics, and answering its probe.
    async fn accelerator_ready(&self) -> bool {
        let Some(accelerator) = &self.accelerator else {
            return false;
        };
        if self.metrics.is_degraded() {
            debug!("Skipping accelerator tier: metrics mark it degraded");
            return false;
        }

        let start = Instant::now();
        match accelerator.probe().await {
            Ok(()) => {
                self.metrics
                    .record_success("health", start.elapsed().as_millis() as u64, None);
                true
            }
            Err(e) => {
                debug!("Accelerator probe failed: {e:#}");
                self.metrics.record_failure("health", "unreachable");
                false
            }
        }
    }

    async fn try_accelerator(&self, query: &CardQuery) -> Option<CardRecord> {
        let accelerator = self.accelerator.as_ref()?;
        let endpoint = query.endpoint();
        let start = Instant::now();
        let outcome = match query {
            CardQuery::ByName { name, language } => {
                accelerator.find_by_name(name, language).await
            }
            CardQuery::BySetNumber {
                set_code,
                collector_number,
                language,
            } => {
                accelerator
                    .find_by_set_number(set_code, collector_number, language)
                    .await
            }
        };
        let latency = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Some(card)) => {
                self.metrics.record_success(endpoint, latency, Some(true));
                Some(card)
            }
            Ok(None) => {
                self.metrics.record_success(endpoint, latency, Some(false));
                None
            }
            Err(e) => {
                debug!("Accelerator lookup failed: {e:#}");
                self.metrics.record_failure(endpoint, "lookup_failed");
                None
            }
        }
    }

    // =========================================================================
    // Tier 2: persistent store (through the hot cache)
    // =========================================================================

    /// Store errors are operational, not "not found": they are logged and
    /// treated as a tier miss so the live tier still gets a chance.
    fn try_store(&self, query: &CardQuery) -> Option<CardRecord> {
        match query {
            CardQuery::BySetNumber {
                set_code,
                collector_number,
                language,
            } => match self
                .store
                .find_by_set_number_lang(set_code, collector_number, language)
            {
                Ok(found) => found,
                Err(e) => {
                    warn!("Card store lookup failed, falling through: {e:#}");
                    None
                }
            },
            CardQuery::ByName { name, language } => {
                let key = name_key(name, language);
                if let Some(card) = self.hot_cache.get_best_match(&key) {
                    return Some(card);
                }
                let candidates = match self.store.find_by_name(name, language) {
                    Ok(candidates) => candidates,
                    Err(e) => {
                        warn!("Card store name lookup failed, falling through: {e:#}");
                        return None;
                    }
                };
                let best = pick_best_match(&candidates, name)?.clone();
                self.hot_cache.put_best_match(key, best.clone());
                Some(best)
            }
        }
    }

    // =========================================================================
    // Tier 3: live upstream
    // =========================================================================

    async fn try_upstream(&self, query: &CardQuery) -> Result<Option<CardRecord>, ResolveError> {
        let found = match query {
            CardQuery::BySetNumber {
                set_code,
                collector_number,
                language,
            } => {
                self.upstream
                    .by_set_number(set_code, collector_number, language)
                    .await?
            }
            CardQuery::ByName { name, .. } => match self.upstream.named_exact(name).await? {
                Some(card) => Some(card),
                None => self.upstream.named_fuzzy(name).await?,
            },
        };

        if let Some(card) = &found {
            // Best-effort write-back; the store is a cache, not the source of
            // truth, so a failed write must not fail the resolution.
            if let Err(e) = self.store.upsert(card) {
                warn!("Failed to cache upstream result {}: {e:#}", card.id);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card_store::models::test_card;
    use crate::hot_cache::printing_key;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeAccelerator {
        healthy: bool,
        cards: HashMap<String, CardRecord>,
        lookups: AtomicUsize,
    }

    impl FakeAccelerator {
        fn with_card(card: CardRecord) -> Self {
            let key = printing_key(&card.set_code, &card.collector_number, &card.language);
            Self {
                healthy: true,
                cards: [(key, card)].into_iter().collect(),
                lookups: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AcceleratorTier for FakeAccelerator {
        async fn probe(&self) -> anyhow::Result<()> {
            if self.healthy {
                Ok(())
            } else {
                Err(anyhow!("connection refused"))
            }
        }

        async fn find_by_name(
            &self,
            name: &str,
            _language: &str,
        ) -> anyhow::Result<Option<CardRecord>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.cards.values().find(|c| c.name == name).cloned())
        }

        async fn find_by_set_number(
            &self,
            set_code: &str,
            collector_number: &str,
            language: &str,
        ) -> anyhow::Result<Option<CardRecord>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let key = printing_key(set_code, collector_number, language);
            Ok(self.cards.get(&key).cloned())
        }
    }

    #[derive(Default)]
    struct FakeUpstream {
        cards: HashMap<String, CardRecord>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeUpstream {
        fn with_cards(cards: Vec<CardRecord>) -> Self {
            let cards = cards
                .into_iter()
                .map(|card| {
                    let key =
                        printing_key(&card.set_code, &card.collector_number, &card.language);
                    (key, card)
                })
                .collect();
            Self {
                cards,
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn check(&self) -> Result<(), ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ResolveError::Upstream("503 service unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl UpstreamApi for FakeUpstream {
        async fn named_exact(&self, name: &str) -> Result<Option<CardRecord>, ResolveError> {
            self.check()?;
            Ok(self.cards.values().find(|c| c.name == name).cloned())
        }

        async fn named_fuzzy(&self, _name: &str) -> Result<Option<CardRecord>, ResolveError> {
            self.check()?;
            Ok(None)
        }

        async fn by_set_number(
            &self,
            set_code: &str,
            collector_number: &str,
            language: &str,
        ) -> Result<Option<CardRecord>, ResolveError> {
            self.check()?;
            let key = printing_key(set_code, collector_number, language);
            Ok(self.cards.get(&key).cloned())
        }

        async fn by_id(&self, id: &str) -> Result<Option<CardRecord>, ResolveError> {
            self.check()?;
            Ok(self.cards.values().find(|c| c.id == id).cloned())
        }

        async fn printings_by_oracle_id(
            &self,
            oracle_id: &str,
        ) -> Result<Vec<CardRecord>, ResolveError> {
            self.check()?;
            Ok(self
                .cards
                .values()
                .filter(|c| c.oracle_id == oracle_id)
                .cloned()
                .collect())
        }

        async fn autocomplete(&self, _partial: &str) -> Result<Vec<String>, ResolveError> {
            self.check()?;
            Ok(vec![])
        }

        async fn bulk_dump_locator(&self) -> Result<BulkDumpInfo, ResolveError> {
            Err(ResolveError::Upstream("no bulk data in fake".to_string()))
        }

        async fn fetch_dump(
            &self,
            _download_uri: &str,
            _dest: &Path,
        ) -> Result<u64, ResolveError> {
            Err(ResolveError::Upstream("no bulk data in fake".to_string()))
        }
    }

    struct Harness {
        resolver: CardResolver,
        accelerator: Arc<FakeAccelerator>,
        upstream: Arc<FakeUpstream>,
        _dir: TempDir,
    }

    fn make_resolver(
        accelerator: Option<FakeAccelerator>,
        upstream: FakeUpstream,
        seed: Vec<CardRecord>,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteCardStore::open(dir.path().join("cards.db")).unwrap());
        if !seed.is_empty() {
            store.upsert_batch(&seed).unwrap();
        }
        let accelerator = Arc::new(accelerator.unwrap_or_default());
        let upstream = Arc::new(upstream);
        let accel_tier: Option<Arc<dyn AcceleratorTier>> = if accelerator.healthy {
            Some(Arc::clone(&accelerator) as Arc<dyn AcceleratorTier>)
        } else {
            None
        };
        let resolver = CardResolver::new(
            store,
            accel_tier,
            Arc::clone(&upstream) as Arc<dyn UpstreamApi>,
            Arc::new(ResolverMetrics::new()),
        );
        Harness {
            resolver,
            accelerator,
            upstream,
            _dir: dir,
        }
    }

    fn printing(id: &str, name: &str, set: &str, number: &str) -> CardRecord {
        let mut card = test_card(id, name);
        card.set_code = set.to_string();
        card.collector_number = number.to_string();
        card
    }

    #[tokio::test]
    async fn test_store_hit_skips_upstream() {
        let seed = vec![printing("a", "Sol Ring", "cmd", "129")];
        let h = make_resolver(None, FakeUpstream::default(), seed);

        let found = h
            .resolver
            .resolve(
                &CardQuery::by_set_number("cmd", "129", "en"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, "a");
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_upstream_fallback_writes_back() {
        let upstream = FakeUpstream::with_cards(vec![printing("u", "Mana Vault", "2ed", "268")]);
        let h = make_resolver(None, upstream, vec![]);
        let cancel = CancellationToken::new();
        let query = CardQuery::by_set_number("2ed", "268", "en");

        let found = h.resolver.resolve(&query, &cancel).await.unwrap();
        assert_eq!(found.unwrap().id, "u");
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 1);

        // the result was cached: a second resolve stays local
        let found = h.resolver.resolve(&query, &cancel).await.unwrap();
        assert_eq!(found.unwrap().id, "u");
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_tiers_miss_is_not_found() {
        let h = make_resolver(None, FakeUpstream::default(), vec![]);
        let found = h
            .resolver
            .resolve(
                &CardQuery::by_name("No Such Card", "en"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_upstream_error_is_retryable_failure() {
        let h = make_resolver(None, FakeUpstream::failing(), vec![]);
        let result = h
            .resolver
            .resolve(
                &CardQuery::by_set_number("cmd", "129", "en"),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ResolveError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_cancellation_stops_tier_attempts() {
        let h = make_resolver(None, FakeUpstream::default(), vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h
            .resolver
            .resolve(&CardQuery::by_set_number("cmd", "129", "en"), &cancel)
            .await;
        assert!(matches!(result, Err(ResolveError::Cancelled)));
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_degraded_metrics_skip_accelerator() {
        let card = printing("fast", "Sol Ring", "cmd", "129");
        let h = make_resolver(
            Some(FakeAccelerator::with_card(card.clone())),
            FakeUpstream::default(),
            vec![card],
        );

        // poison the health verdict
        h.resolver.metrics().record_failure("card_by_name", "timeout");

        let found = h
            .resolver
            .resolve(
                &CardQuery::by_set_number("cmd", "129", "en"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(found.is_some());
        assert_eq!(h.accelerator.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_accelerator_hit_returns_immediately() {
        let card = printing("fast", "Sol Ring", "cmd", "129");
        let h = make_resolver(
            Some(FakeAccelerator::with_card(card)),
            FakeUpstream::default(),
            vec![],
        );

        let found = h
            .resolver
            .resolve(
                &CardQuery::by_set_number("cmd", "129", "en"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, "fast");
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 0);

        let snapshot = h.resolver.metrics().summarize();
        assert!(snapshot.success_count >= 2); // probe + lookup
        assert_eq!(snapshot.cache_hit_rate, Some(1.0));
    }

    #[tokio::test]
    async fn test_batch_forwards_only_misses() {
        let accel_card = printing("fast", "Sol Ring", "cmd", "129");
        let upstream = FakeUpstream::with_cards(vec![
            printing("u1", "Mana Vault", "2ed", "268"),
            printing("u2", "Mana Crypt", "emn", "271"),
        ]);
        let h = make_resolver(Some(FakeAccelerator::with_card(accel_card)), upstream, vec![]);

        let queries = vec![
            CardQuery::by_set_number("cmd", "129", "en"),
            CardQuery::by_set_number("2ed", "268", "en"),
            CardQuery::by_set_number("emn", "271", "en"),
        ];
        let results = h
            .resolver
            .resolve_batch(&queries, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_some()));
        assert_eq!(results[0].as_ref().unwrap().id, "fast");

        // all three hit the accelerator; exactly the two misses reached upstream
        assert_eq!(h.accelerator.lookups.load(Ordering::SeqCst), 3);
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_name_scoring_cache_invalidated_by_write() {
        let mut late = printing("late", "Sol Ring", "c21", "289");
        late.collector_number = "289".to_string();
        let h = make_resolver(None, FakeUpstream::default(), vec![late]);
        let cancel = CancellationToken::new();
        let query = CardQuery::by_name("Sol Ring", "en");

        let first = h.resolver.resolve(&query, &cancel).await.unwrap().unwrap();
        assert_eq!(first.id, "late");

        // learning a better-matching printing must invalidate the cached winner
        let better = printing("early", "Sol Ring", "cmd", "129");
        h.resolver.store().upsert(&better).unwrap();

        let second = h.resolver.resolve(&query, &cancel).await.unwrap().unwrap();
        assert_eq!(second.id, "early");
    }

    #[tokio::test]
    async fn test_unreachable_accelerator_recorded_and_skipped() {
        let card = printing("a", "Sol Ring", "cmd", "129");
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteCardStore::open(dir.path().join("cards.db")).unwrap());
        store.upsert(&card).unwrap();

        let accelerator = Arc::new(FakeAccelerator {
            healthy: false,
            ..Default::default()
        });
        let upstream = Arc::new(FakeUpstream::default());
        let resolver = CardResolver::new(
            store,
            Some(Arc::clone(&accelerator) as Arc<dyn AcceleratorTier>),
            Arc::clone(&upstream) as Arc<dyn UpstreamApi>,
            Arc::new(ResolverMetrics::new()),
        );

        let found = resolver
            .resolve(
                &CardQuery::by_set_number("cmd", "129", "en"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(found.is_some());
        assert_eq!(accelerator.lookups.load(Ordering::SeqCst), 0);

        let snapshot = resolver.metrics().summarize();
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.top_errors[0].0, "unreachable");
    }
}
