//! Durable card storage: models, schema and the SQLite store.

pub mod models;
pub mod schema;
mod store;

pub use models::{CardFace, CardRecord, Layout, RelatedPart, TokenPart, FACE_SEPARATOR};
pub use store::SqliteCardStore;
