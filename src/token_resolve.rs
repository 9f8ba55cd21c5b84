//! Resolution of related-part references to their latest printings.
//!
//! Decklists and card faces reference tokens by whatever printing the source
//! happened to know about; consumers want exactly one, current printing per
//! distinct identity.

use crate::card_store::{CardRecord, TokenPart};
use crate::resolver::{CardQuery, CardResolver, ResolveError};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Map each part to the most recent printing of its oracle identity,
/// deduplicating parts that share one. Output keeps first-appearance order;
/// parts that cannot be resolved at all are dropped.
pub async fn resolve_latest_printings(
    resolver: &CardResolver,
    parts: &[TokenPart],
    cancel: &CancellationToken,
) -> Result<Vec<CardRecord>, ResolveError> {
    let store = resolver.store();
    let upstream = resolver.upstream();
    let mut seen: HashSet<String> = HashSet::new();
    let mut resolved = Vec::new();

    for part in parts {
        if cancel.is_cancelled() {
            return Err(ResolveError::Cancelled);
        }

        let card = match resolve_identity(resolver, part, cancel).await? {
            Some(card) => card,
            None => {
                warn!("Could not resolve related part '{}', skipping", part.name);
                continue;
            }
        };

        // Cards without an oracle identity dedupe on their own id.
        let identity = if card.oracle_id.is_empty() {
            card.id.clone()
        } else {
            card.oracle_id.clone()
        };
        if !seen.insert(identity) {
            continue;
        }

        let mut printings = match store.find_by_oracle_id(&card.oracle_id) {
            Ok(printings) => printings,
            Err(e) => {
                warn!("Printings lookup failed for {}: {e:#}", card.oracle_id);
                vec![]
            }
        };
        if printings.is_empty() && !card.oracle_id.is_empty() {
            match upstream.printings_by_oracle_id(&card.oracle_id).await {
                Ok(fetched) => printings = fetched,
                Err(e) => {
                    debug!("Upstream printings fetch failed for {}: {e}", card.oracle_id);
                }
            }
        }

        resolved.push(latest_printing(printings).unwrap_or(card));
    }

    Ok(resolved)
}

/// Identity lookup for one part: the embedded id first (store, then
/// upstream); if that is absent or fails, a name resolution through the
/// full tier chain.
async fn resolve_identity(
    resolver: &CardResolver,
    part: &TokenPart,
    cancel: &CancellationToken,
) -> Result<Option<CardRecord>, ResolveError> {
    if let Some(id) = &part.id {
        match resolver.store().find_by_id(id) {
            Ok(Some(card)) => return Ok(Some(card)),
            Ok(None) => {}
            Err(e) => warn!("Store id lookup failed for {id}: {e:#}"),
        }
        match resolver.upstream().by_id(id).await {
            Ok(Some(card)) => return Ok(Some(card)),
            Ok(None) => {}
            Err(e) => debug!("Upstream id lookup failed for {id}, trying by name: {e}"),
        }
    }

    resolver
        .resolve(&CardQuery::by_name(&part.name, "en"), cancel)
        .await
}

/// The printing with the greatest release date; missing dates sort oldest,
/// ties break on id so the choice is stable.
fn latest_printing(printings: Vec<CardRecord>) -> Option<CardRecord> {
    printings
        .into_iter()
        .max_by(|a, b| {
            a.released_at
                .cmp(&b.released_at)
                .then_with(|| a.id.cmp(&b.id))
        })
}
