//! SQLite schema for the card cache database.
//!
//! Tables are declared statically and created through a small versioned-schema
//! layer so future migrations can be appended without touching call sites.

use anyhow::Result;
use rusqlite::{params, Connection};
use tracing::info;

pub const DEFAULT_TIMESTAMP: &str = "(cast(strftime('%s','now') as int))";

#[macro_export]
macro_rules! sqlite_column {
    ($name:expr, $sql_type:expr $(, $field:ident = $value:expr)*) => {
        {
            // Allow unused_mut because the variable is only mutated when
            // optional field assignments are passed to the macro
            #[allow(unused_mut)]
            let mut column = Column {
                name: $name,
                sql_type: $sql_type,
                is_primary_key: false,
                non_null: false,
                default_value: None,
                collate: None,
            };
            $(
                column.$field = $value;
            )*
            column
        }
    };
}

#[derive(Debug, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Real,
}

pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static SqlType,
    pub is_primary_key: bool,
    pub non_null: bool,
    pub default_value: Option<&'static str>,
    pub collate: Option<&'static str>,
}

pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub indices: &'static [(&'static str, &'static str)],
    pub unique_constraints: &'static [&'static [&'static str]],
}

impl Table {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        let mut create_sql = format!("CREATE TABLE {} (", self.name);
        for (column_index, column) in self.columns.iter().enumerate() {
            if column_index > 0 {
                create_sql.push_str(", ");
            }
            create_sql.push_str(&format!(
                "{} {}",
                column.name,
                match column.sql_type {
                    SqlType::Text => "TEXT",
                    SqlType::Integer => "INTEGER",
                    SqlType::Real => "REAL",
                }
            ));
            if column.is_primary_key {
                create_sql.push_str(" PRIMARY KEY");
            }
            if column.non_null {
                create_sql.push_str(" NOT NULL");
            }
            if let Some(default_value) = column.default_value {
                create_sql.push_str(&format!(" DEFAULT {}", default_value));
            }
            if let Some(collate) = column.collate {
                create_sql.push_str(&format!(" COLLATE {}", collate));
            }
        }
        for unique_constraint in self.unique_constraints {
            create_sql.push_str(&format!(", UNIQUE ({})", unique_constraint.join(", ")));
        }
        create_sql.push_str(");");
        conn.execute(&create_sql, params![])?;

        for (index_name, column_name) in self.indices {
            conn.execute(
                &format!(
                    "CREATE INDEX {} ON {}({});",
                    index_name, self.name, column_name
                ),
                params![],
            )?;
        }
        Ok(())
    }
}

pub struct VersionedSchema {
    pub version: usize,
    pub tables: &'static [Table],
    pub migration: Option<fn(&Connection) -> Result<()>>,
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.create(conn)?;
        }
        conn.execute(&format!("PRAGMA user_version = {}", self.version), [])?;
        Ok(())
    }
}

// =============================================================================
// Tables
// =============================================================================

/// One row per printing; list- and mapping-valued fields are JSON columns.
/// `related_parts` stays NULL until the parts list has been fetched once.
const CARDS_TABLE: Table = Table {
    name: "cards",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("oracle_id", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true, collate = Some("NOCASE")),
        sqlite_column!(
            "set_code",
            &SqlType::Text,
            non_null = true,
            collate = Some("NOCASE")
        ),
        sqlite_column!(
            "collector_number",
            &SqlType::Text,
            non_null = true,
            collate = Some("NOCASE")
        ),
        sqlite_column!(
            "language",
            &SqlType::Text,
            non_null = true,
            collate = Some("NOCASE")
        ),
        sqlite_column!("released_at", &SqlType::Text),
        sqlite_column!("colors", &SqlType::Text, non_null = true),
        sqlite_column!("mana_cost", &SqlType::Text),
        sqlite_column!("mana_value", &SqlType::Real, non_null = true),
        sqlite_column!("type_line", &SqlType::Text, non_null = true),
        sqlite_column!("rarity", &SqlType::Text, non_null = true),
        sqlite_column!("layout", &SqlType::Text, non_null = true),
        sqlite_column!("image_uris", &SqlType::Text, non_null = true),
        sqlite_column!("card_faces", &SqlType::Text, non_null = true),
        sqlite_column!("related_parts", &SqlType::Text),
        sqlite_column!(
            "updated_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[
        ("idx_cards_name", "name"),
        ("idx_cards_oracle", "oracle_id"),
    ],
    unique_constraints: &[&["set_code", "collector_number", "language"]],
};

/// Generic key/value metadata, e.g. the last bulk-import timestamp.
const METADATA_TABLE: Table = Table {
    name: "metadata",
    columns: &[
        sqlite_column!("key", &SqlType::Text, is_primary_key = true),
        sqlite_column!("value", &SqlType::Text, non_null = true),
        sqlite_column!(
            "updated_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[],
    unique_constraints: &[],
};

/// Time-bounded cache of serialized upstream responses.
const RESPONSE_CACHE_TABLE: Table = Table {
    name: "response_cache",
    columns: &[
        sqlite_column!("endpoint", &SqlType::Text, non_null = true),
        sqlite_column!("query_hash", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("expires_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_response_cache_expiry", "expires_at")],
    unique_constraints: &[&["endpoint", "query_hash"]],
};

/// Vocabulary of structural type tokens seen in type lines.
const CARD_TYPES_TABLE: Table = Table {
    name: "card_types",
    columns: &[sqlite_column!("name", &SqlType::Text, is_primary_key = true)],
    indices: &[],
    unique_constraints: &[],
};

/// Names of token-type printings, used for free-text disambiguation.
const TOKEN_NAMES_TABLE: Table = Table {
    name: "token_names",
    columns: &[sqlite_column!("name", &SqlType::Text, is_primary_key = true)],
    indices: &[],
    unique_constraints: &[],
};

pub const CARD_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        CARDS_TABLE,
        METADATA_TABLE,
        RESPONSE_CACHE_TABLE,
        CARD_TYPES_TABLE,
        TOKEN_NAMES_TABLE,
    ],
    migration: None,
}];

/// Create the schema on a fresh database, or run any pending migrations.
pub fn migrate_if_needed(conn: &mut Connection) -> Result<()> {
    let latest_version = CARD_VERSIONED_SCHEMAS.len() - 1;
    let latest_schema = &CARD_VERSIONED_SCHEMAS[latest_version];

    let table_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);

    if table_count == 0 {
        info!("Creating card db schema at version {}", latest_version);
        latest_schema.create(conn)?;
        return Ok(());
    }

    let db_version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    let mut current_version = db_version as usize;
    if current_version >= latest_version {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for schema in CARD_VERSIONED_SCHEMAS.iter().skip(current_version + 1) {
        if let Some(migration_fn) = schema.migration {
            info!(
                "Migrating card db from version {} to {}",
                current_version, schema.version
            );
            migration_fn(&tx)?;
            current_version = schema.version;
        }
    }
    tx.pragma_update(None, "user_version", current_version)?;
    tx.commit()?;
    Ok(())
}
