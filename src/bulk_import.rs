//! Streaming bulk ingestion of the upstream card dump.
//!
//! The dump is one very large JSON array. It is streamed to a temp file and
//! parsed one record at a time, so the full array is never held in memory;
//! writes happen in fixed-size transactional batches.

use crate::card_store::{CardRecord, SqliteCardStore, FACE_SEPARATOR};
use crate::resolver::upstream::{convert_upstream_card, UpstreamCard};
use crate::resolver::{ResolveError, UpstreamApi};
use serde::Deserialize;
use std::collections::HashSet;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Records per transactional batch.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;
/// Metadata key holding the unix timestamp of the last successful import.
pub const LAST_IMPORT_KEY: &str = "last_bulk_import_at";
/// A successful import is considered fresh for this long.
pub const IMPORT_FRESHNESS: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum ImportError {
    /// The dump locator could not be fetched; nothing was written.
    #[error("failed to fetch dump locator: {0}")]
    Locator(String),

    #[error("failed to download dump: {0}")]
    Download(String),

    /// Malformed dump data. Aborts the whole import; already-committed
    /// batches stay (they are whole records), the next scheduled run
    /// retries from scratch.
    #[error("malformed dump: {0}")]
    Parse(String),

    #[error("store write failed: {0}")]
    Store(#[from] anyhow::Error),

    /// Caller-initiated abort; not a failure.
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Default, Clone)]
pub struct ImportStats {
    pub records: usize,
    pub batches: usize,
    pub downloaded_bytes: u64,
}

pub struct BulkImporter {
    store: Arc<SqliteCardStore>,
    upstream: Arc<dyn UpstreamApi>,
    batch_size: usize,
}

impl BulkImporter {
    pub fn new(store: Arc<SqliteCardStore>, upstream: Arc<dyn UpstreamApi>) -> Self {
        Self::with_batch_size(store, upstream, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(
        store: Arc<SqliteCardStore>,
        upstream: Arc<dyn UpstreamApi>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            upstream,
            batch_size,
        }
    }

    /// Whether an import should run: no successful import recorded yet, or
    /// the last one is older than the freshness window.
    pub fn needs_refresh(&self) -> bool {
        let last = match self.store.get_metadata(LAST_IMPORT_KEY) {
            Ok(Some(value)) => value.parse::<i64>().ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("Could not read import timestamp, assuming stale: {e:#}");
                None
            }
        };
        match last {
            Some(ts) => {
                let age = chrono::Utc::now().timestamp().saturating_sub(ts);
                age > IMPORT_FRESHNESS.as_secs() as i64
            }
            None => true,
        }
    }

    /// Fetch and ingest the full dump. Aborts before any writes if the
    /// locator fetch fails; records the import timestamp only on success.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ImportStats, ImportError> {
        let locator = self.upstream.bulk_dump_locator().await.map_err(|e| match e {
            ResolveError::Cancelled => ImportError::Cancelled,
            ResolveError::Parse(msg) => ImportError::Parse(msg),
            ResolveError::Upstream(msg) => ImportError::Locator(msg),
        })?;
        info!(
            "Bulk dump at {} ({} bytes expected)",
            locator.download_uri,
            locator.size.unwrap_or(0)
        );

        let dump_file = tempfile::NamedTempFile::new()
            .map_err(|e| ImportError::Download(format!("cannot create temp file: {e}")))?;
        let downloaded_bytes = self
            .upstream
            .fetch_dump(&locator.download_uri, dump_file.path())
            .await
            .map_err(|e| ImportError::Download(e.to_string()))?;
        if let Some(expected) = locator.size {
            if expected != downloaded_bytes {
                warn!(
                    "Dump size mismatch: expected {} bytes, got {}",
                    expected, downloaded_bytes
                );
            }
        }
        info!("Downloaded dump: {} bytes, ingesting...", downloaded_bytes);

        if cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }

        // Parsing and inserting are blocking work (std io + rusqlite).
        let store = self.store.clone();
        let batch_size = self.batch_size;
        let cancel = cancel.clone();
        let (records, batches) = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(dump_file.path())
                .map_err(|e| ImportError::Download(format!("cannot reopen dump file: {e}")))?;
            let reader = std::io::BufReader::new(file);
            import_stream(reader, &store, batch_size, &cancel)
        })
        .await
        .map_err(|e| ImportError::Store(anyhow::anyhow!("import worker died: {e}")))??;

        let now = chrono::Utc::now().timestamp();
        self.store.set_metadata(LAST_IMPORT_KEY, &now.to_string())?;

        let stats = ImportStats {
            records,
            batches,
            downloaded_bytes,
        };
        info!(
            "Bulk import complete: {} records in {} batches",
            stats.records, stats.batches
        );
        Ok(stats)
    }
}

/// Structural type tokens of a type line: the words left of the long-dash
/// separator, per face, lowercased. "Legendary Creature — Goblin" yields
/// "legendary" and "creature".
fn derive_type_tokens(type_line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for face_types in type_line.split(FACE_SEPARATOR) {
        let left = face_types.split('—').next().unwrap_or(face_types);
        for word in left.split_whitespace() {
            tokens.push(word.to_lowercase());
        }
    }
    tokens
}

fn is_token_card(card: &CardRecord) -> bool {
    card.layout.is_token() || derive_type_tokens(&card.type_line).iter().any(|t| t == "token")
}

/// Walk a JSON array incrementally, deserializing one card object at a time.
/// A parse error aborts the whole import.
fn import_stream<R: BufRead>(
    mut reader: R,
    store: &SqliteCardStore,
    batch_size: usize,
    cancel: &CancellationToken,
) -> Result<(usize, usize), ImportError> {
    let mut batch: Vec<CardRecord> = Vec::with_capacity(batch_size);
    let mut type_tokens: HashSet<String> = HashSet::new();
    let mut token_names: HashSet<String> = HashSet::new();
    let mut records = 0usize;
    let mut batches = 0usize;

    let flush = |batch: &mut Vec<CardRecord>,
                 type_tokens: &mut HashSet<String>,
                 token_names: &mut HashSet<String>,
                 batches: &mut usize|
     -> Result<(), ImportError> {
        if batch.is_empty() {
            return Ok(());
        }
        store.upsert_batch(batch)?;
        store.upsert_card_types(type_tokens)?;
        store.upsert_token_names(token_names)?;
        batch.clear();
        type_tokens.clear();
        token_names.clear();
        *batches += 1;
        Ok(())
    };

    skip_whitespace(&mut reader)?;
    match next_byte(&mut reader)? {
        Some(b'[') => {}
        other => {
            return Err(ImportError::Parse(format!(
                "expected array start, got {:?}",
                other.map(char::from)
            )))
        }
    }

    loop {
        skip_whitespace(&mut reader)?;
        match peek_byte(&mut reader)? {
            None => return Err(ImportError::Parse("unexpected end of dump".to_string())),
            Some(b']') => {
                reader.consume(1);
                break;
            }
            Some(b',') => {
                reader.consume(1);
                continue;
            }
            Some(_) => {
                if cancel.is_cancelled() {
                    return Err(ImportError::Cancelled);
                }
                let mut de = serde_json::Deserializer::from_reader(&mut reader);
                let raw = UpstreamCard::deserialize(&mut de)
                    .map_err(|e| ImportError::Parse(format!("record {records}: {e}")))?;
                let card = convert_upstream_card(raw);

                type_tokens.extend(derive_type_tokens(&card.type_line));
                if is_token_card(&card) {
                    for face_name in card.name.split(FACE_SEPARATOR) {
                        token_names.insert(face_name.trim().to_string());
                    }
                }

                batch.push(card);
                records += 1;
                if batch.len() >= batch_size {
                    flush(&mut batch, &mut type_tokens, &mut token_names, &mut batches)?;
                    info!("Imported {} records so far", records);
                }
            }
        }
    }

    flush(&mut batch, &mut type_tokens, &mut token_names, &mut batches)?;
    Ok((records, batches))
}

fn peek_byte<R: BufRead>(reader: &mut R) -> Result<Option<u8>, ImportError> {
    let buf = reader
        .fill_buf()
        .map_err(|e| ImportError::Parse(format!("read failed: {e}")))?;
    Ok(buf.first().copied())
}

fn next_byte<R: BufRead>(reader: &mut R) -> Result<Option<u8>, ImportError> {
    let byte = peek_byte(reader)?;
    if byte.is_some() {
        reader.consume(1);
    }
    Ok(byte)
}

fn skip_whitespace<R: BufRead>(reader: &mut R) -> Result<(), ImportError> {
    while let Some(byte) = peek_byte(reader)? {
        if byte.is_ascii_whitespace() {
            reader.consume(1);
        } else {
            break;
        }
    }
    Ok(())
}
