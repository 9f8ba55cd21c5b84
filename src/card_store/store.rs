//! SQLite-backed card store implementation.
//!
//! This is the durable middle tier of the resolution chain: a cache, not the
//! source of truth. Callers treat write failures as soft failures and lookup
//! errors as tier misses.

use super::models::{CardFace, CardRecord, Layout, RelatedPart, FACE_SEPARATOR};
use super::schema::migrate_if_needed;
use crate::hot_cache::{printing_key, HotCache};
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

const CARD_COLUMNS: &str = "id, oracle_id, name, set_code, collector_number, language, \
     released_at, colors, mana_cost, mana_value, type_line, rarity, layout, \
     image_uris, card_faces, related_parts";

/// SQLite-backed store for card records, metadata and response caching.
#[derive(Clone)]
pub struct SqliteCardStore {
    read_pool: Vec<Arc<Mutex<Connection>>>,
    write_conn: Arc<Mutex<Connection>>,
    read_index: Arc<AtomicUsize>,
    hot_cache: Arc<HotCache>,
}

/// Raw row with JSON columns still serialized; decoded outside the rusqlite
/// row closure so serde errors carry context.
struct RawCardRow {
    id: String,
    oracle_id: String,
    name: String,
    set_code: String,
    collector_number: String,
    language: String,
    released_at: Option<String>,
    colors: String,
    mana_cost: Option<String>,
    mana_value: f64,
    type_line: String,
    rarity: String,
    layout: String,
    image_uris: String,
    card_faces: String,
    related_parts: Option<String>,
}

fn read_raw_card_row(row: &rusqlite::Row) -> rusqlite::Result<RawCardRow> {
    Ok(RawCardRow {
        id: row.get(0)?,
        oracle_id: row.get(1)?,
        name: row.get(2)?,
        set_code: row.get(3)?,
        collector_number: row.get(4)?,
        language: row.get(5)?,
        released_at: row.get(6)?,
        colors: row.get(7)?,
        mana_cost: row.get(8)?,
        mana_value: row.get(9)?,
        type_line: row.get(10)?,
        rarity: row.get(11)?,
        layout: row.get(12)?,
        image_uris: row.get(13)?,
        card_faces: row.get(14)?,
        related_parts: row.get(15)?,
    })
}

impl RawCardRow {
    fn into_record(self) -> Result<CardRecord> {
        let colors: Vec<String> =
            serde_json::from_str(&self.colors).context("Bad colors column")?;
        let image_uris: BTreeMap<String, String> =
            serde_json::from_str(&self.image_uris).context("Bad image_uris column")?;
        let card_faces: Vec<CardFace> =
            serde_json::from_str(&self.card_faces).context("Bad card_faces column")?;
        let related_parts: Option<Vec<RelatedPart>> = match self.related_parts {
            Some(json) => Some(serde_json::from_str(&json).context("Bad related_parts column")?),
            None => None,
        };
        Ok(CardRecord {
            id: self.id,
            oracle_id: self.oracle_id,
            name: self.name,
            set_code: self.set_code,
            collector_number: self.collector_number,
            language: self.language,
            released_at: self.released_at,
            colors,
            mana_cost: self.mana_cost,
            mana_value: self.mana_value,
            type_line: self.type_line,
            rarity: self.rarity,
            layout: Layout::from_db_str(&self.layout),
            image_uris,
            card_faces,
            related_parts,
        })
    }
}

impl SqliteCardStore {
    /// Open (and create/migrate if needed) the card database.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        Self::open_with_pool(db_path, 4)
    }

    pub fn open_with_pool<P: AsRef<Path>>(db_path: P, read_pool_size: usize) -> Result<Self> {
        let db_path_ref = db_path.as_ref();

        let mut write_conn = Connection::open_with_flags(
            db_path_ref,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open card database")?;

        migrate_if_needed(&mut write_conn)?;
        write_conn.pragma_update(None, "journal_mode", "WAL")?;

        let card_count: i64 = write_conn
            .query_row("SELECT COUNT(*) FROM cards", [], |r| r.get(0))
            .unwrap_or(0);
        info!("Opened card cache: {} printings", card_count);

        let mut read_pool = Vec::with_capacity(read_pool_size);
        for _ in 0..read_pool_size {
            let read_conn = Connection::open_with_flags(
                db_path_ref,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            read_conn.pragma_update(None, "journal_mode", "WAL")?;
            read_pool.push(Arc::new(Mutex::new(read_conn)));
        }

        Ok(SqliteCardStore {
            write_conn: Arc::new(Mutex::new(write_conn)),
            read_pool,
            read_index: Arc::new(AtomicUsize::new(0)),
            hot_cache: Arc::new(HotCache::new()),
        })
    }

    fn get_read_conn(&self) -> Arc<Mutex<Connection>> {
        let index = self.read_index.fetch_add(1, Ordering::SeqCst) % self.read_pool.len();
        self.read_pool[index].clone()
    }

    /// The in-process hot cache tied to this store's invalidation.
    pub fn hot_cache(&self) -> Arc<HotCache> {
        Arc::clone(&self.hot_cache)
    }

    fn insert_card(conn: &Connection, card: &CardRecord) -> Result<()> {
        let colors = serde_json::to_string(&card.colors)?;
        let image_uris = serde_json::to_string(&card.image_uris)?;
        let card_faces = serde_json::to_string(&card.card_faces)?;
        let related_parts = match &card.related_parts {
            Some(parts) => Some(serde_json::to_string(parts)?),
            None => None,
        };

        let mut stmt = conn.prepare_cached(
            "INSERT OR REPLACE INTO cards (id, oracle_id, name, set_code, collector_number,
             language, released_at, colors, mana_cost, mana_value, type_line, rarity,
             layout, image_uris, card_faces, related_parts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )?;
        stmt.execute(params![
            &card.id,
            &card.oracle_id,
            &card.name,
            &card.set_code,
            &card.collector_number,
            &card.language,
            &card.released_at,
            colors,
            &card.mana_cost,
            card.mana_value,
            &card.type_line,
            &card.rarity,
            card.layout.to_db_str(),
            image_uris,
            card_faces,
            related_parts,
        ])?;
        Ok(())
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Insert-or-replace one record by id. Replacement is always whole-record.
    pub fn upsert(&self, card: &CardRecord) -> Result<()> {
        {
            let conn = self.write_conn.lock().unwrap();
            Self::insert_card(&conn, card)?;
        }
        self.hot_cache.clear();
        Ok(())
    }

    /// Insert-or-replace N records inside one transaction. All-or-nothing;
    /// used by the bulk importer for throughput.
    pub fn upsert_batch(&self, cards: &[CardRecord]) -> Result<()> {
        {
            let conn = self.write_conn.lock().unwrap();
            conn.execute("BEGIN IMMEDIATE", [])?;

            let result = (|| -> Result<()> {
                for card in cards {
                    Self::insert_card(&conn, card)?;
                }
                Ok(())
            })();

            match result {
                Ok(()) => {
                    conn.execute("COMMIT", [])?;
                }
                Err(e) => {
                    let _ = conn.execute("ROLLBACK", []);
                    return Err(e);
                }
            }
        }
        self.hot_cache.clear();
        Ok(())
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn find_by_id(&self, id: &str) -> Result<Option<CardRecord>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CARD_COLUMNS} FROM cards WHERE id = ?1"
        ))?;
        match stmt.query_row(params![id], read_raw_card_row) {
            Ok(raw) => Ok(Some(raw.into_record()?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Exact printing lookup, case-insensitive. Records whose parts list has
    /// never been fetched are reported as misses so callers refresh them.
    pub fn find_by_set_number_lang(
        &self,
        set_code: &str,
        collector_number: &str,
        language: &str,
    ) -> Result<Option<CardRecord>> {
        let key = printing_key(set_code, collector_number, language);
        if let Some(card) = self.hot_cache.get_card(&key) {
            return Ok(Some(card));
        }

        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CARD_COLUMNS} FROM cards
             WHERE set_code = ?1 AND collector_number = ?2 AND language = ?3
               AND related_parts IS NOT NULL"
        ))?;
        let card = match stmt.query_row(params![set_code, collector_number, language], read_raw_card_row)
        {
            Ok(raw) => raw.into_record()?,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        self.hot_cache.put_card(key, card.clone());
        Ok(Some(card))
    }

    /// Candidate records for a name query: exact case-insensitive matches
    /// first; if there are none, multi-faced cards whose front face equals
    /// the query. Identity-incomplete records are filtered out entirely.
    pub fn find_by_name(&self, name: &str, language: &str) -> Result<Vec<CardRecord>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();

        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CARD_COLUMNS} FROM cards
             WHERE name = ?1 AND language = ?2 AND related_parts IS NOT NULL"
        ))?;
        let exact = Self::collect_cards(&mut stmt, params![name, language])?;
        if !exact.is_empty() {
            return Ok(exact);
        }

        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CARD_COLUMNS} FROM cards
             WHERE name LIKE ?1 AND language = ?2 AND related_parts IS NOT NULL"
        ))?;
        let pattern = format!("{}{}%", name, FACE_SEPARATOR);
        Self::collect_cards(&mut stmt, params![pattern, language])
    }

    pub fn find_by_oracle_id(&self, oracle_id: &str) -> Result<Vec<CardRecord>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CARD_COLUMNS} FROM cards
             WHERE oracle_id = ?1 AND related_parts IS NOT NULL"
        ))?;
        Self::collect_cards(&mut stmt, params![oracle_id])
    }

    fn collect_cards(
        stmt: &mut rusqlite::CachedStatement,
        params: impl rusqlite::Params,
    ) -> Result<Vec<CardRecord>> {
        let raws = stmt
            .query_map(params, read_raw_card_row)?
            .collect::<rusqlite::Result<Vec<RawCardRow>>>()?;
        raws.into_iter().map(RawCardRow::into_record).collect()
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn count(&self) -> usize {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM cards", [], |r| r.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }

    pub fn size_bytes(&self) -> u64 {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let page_count: i64 = conn
            .query_row("PRAGMA page_count", [], |r| r.get(0))
            .unwrap_or(0);
        let page_size: i64 = conn
            .query_row("PRAGMA page_size", [], |r| r.get(0))
            .unwrap_or(0);
        (page_count * page_size) as u64
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        match conn.query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |r| r.get(0),
        ) {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.write_conn.lock().unwrap();
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               updated_at = cast(strftime('%s','now') as int)",
            params![key, value],
        )?;
        Ok(())
    }

    // =========================================================================
    // Response Cache
    // =========================================================================

    /// A cached response is valid only while `now < expires_at`; anything
    /// else is a miss.
    pub fn get_cached_response(
        &self,
        endpoint: &str,
        query_hash: &str,
        now: i64,
    ) -> Result<Option<String>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT payload FROM response_cache
             WHERE endpoint = ?1 AND query_hash = ?2 AND expires_at > ?3",
        )?;
        match stmt.query_row(params![endpoint, query_hash, now], |r| r.get(0)) {
            Ok(payload) => Ok(Some(payload)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_cached_response(
        &self,
        endpoint: &str,
        query_hash: &str,
        payload: &str,
        expires_at: i64,
    ) -> Result<()> {
        let conn = self.write_conn.lock().unwrap();
        conn.execute(
            "INSERT INTO response_cache (endpoint, query_hash, payload, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(endpoint, query_hash) DO UPDATE SET
               payload = excluded.payload,
               expires_at = excluded.expires_at",
            params![endpoint, query_hash, payload, expires_at],
        )?;
        Ok(())
    }

    // =========================================================================
    // Vocabularies
    // =========================================================================

    pub fn upsert_card_types(&self, names: &HashSet<String>) -> Result<()> {
        self.upsert_vocabulary("card_types", names)
    }

    pub fn upsert_token_names(&self, names: &HashSet<String>) -> Result<()> {
        self.upsert_vocabulary("token_names", names)
    }

    fn upsert_vocabulary(&self, table: &str, names: &HashSet<String>) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let conn = self.write_conn.lock().unwrap();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            let mut stmt = conn
                .prepare_cached(&format!("INSERT OR IGNORE INTO {table} (name) VALUES (?1)"))?;
            for name in names {
                stmt.execute(params![name])?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Whether a free-text query names a known token-type card.
    pub fn is_known_token_name(&self, name: &str) -> Result<bool> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let found: bool = conn
            .query_row(
                "SELECT 1 FROM token_names WHERE name = ?1 COLLATE NOCASE",
                params![name],
                |_| Ok(true),
            )
            .unwrap_or(false);
        Ok(found)
    }

    pub fn card_type_count(&self) -> usize {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM card_types", [], |r| r.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }
}
