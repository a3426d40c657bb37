use rusqlite::{params, OptionalExtension};
use tracing::instrument;

use lumo_core::item::{CreateItemInput, Item, UpdateItemInput};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{get, get_opt, now_timestamp};

const TABLE: &str = "item";
const COLUMNS: &str = "id, name, description, created_at, updated_at";

fn row_to_item(row: &rusqlite::Row<'_>) -> Result<Item, StoreError> {
    Ok(Item {
        id: get(row, 0, TABLE, "id")?,
        name: get(row, 1, TABLE, "name")?,
        description: get_opt(row, 2, TABLE, "description")?,
        created_at: get(row, 3, TABLE, "created_at")?,
        updated_at: get(row, 4, TABLE, "updated_at")?,
    })
}

/// CRUD over the `item` table.
#[derive(Clone)]
pub struct ItemRepo {
    db: Database,
}

impl ItemRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// All items, oldest first.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<Item>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM item ORDER BY created_at ASC, id ASC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(row_to_item(row)?);
            }
            Ok(items)
        })
    }

    #[instrument(skip(self), fields(item_id = id))]
    pub fn get(&self, id: i64) -> Result<Option<Item>, StoreError> {
        self.db.with_conn(|conn| fetch(conn, id))
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub fn create(&self, input: &CreateItemInput) -> Result<Item, StoreError> {
        self.db.with_conn(|conn| {
            let now = now_timestamp();
            conn.execute(
                "INSERT INTO item (name, description, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![input.name, input.description, now],
            )?;
            let id = conn.last_insert_rowid();
            fetch(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("item {id}")))
        })
    }

    /// Apply the provided fields; `updated_at` is always refreshed.
    #[instrument(skip(self, input), fields(item_id = input.id))]
    pub fn update(&self, input: &UpdateItemInput) -> Result<Item, StoreError> {
        self.db.with_conn(|conn| {
            let now = now_timestamp();
            let changed = conn.execute(
                "UPDATE item SET
                    name = COALESCE(?1, name),
                    description = CASE WHEN ?2 THEN ?3 ELSE description END,
                    updated_at = ?4
                 WHERE id = ?5",
                params![
                    input.name,
                    input.description.is_some(),
                    input.description,
                    now,
                    input.id
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("item {}", input.id)));
            }
            fetch(conn, input.id)?.ok_or_else(|| StoreError::NotFound(format!("item {}", input.id)))
        })
    }

    /// Returns whether a row was removed.
    #[instrument(skip(self), fields(item_id = id))]
    pub fn delete(&self, id: i64) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM item WHERE id = ?1", [id])?;
            Ok(removed > 0)
        })
    }
}

fn fetch(conn: &rusqlite::Connection, id: i64) -> Result<Option<Item>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM item WHERE id = ?1"))?;
    let row = stmt.query_row([id], |row| Ok(row_to_item(row))).optional()?;
    row.transpose()
}
