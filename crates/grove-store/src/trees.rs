use grove_core::domain::DEFAULT_TREE_NAME;
use grove_core::ids::{FactoryId, TreeId};
use grove_core::{Tree, TreePatch};
use rusqlite::{Connection, OptionalExtension};
use tracing::{info, instrument};

use crate::database::Database;
use crate::error::StoreError;
use crate::factories;
use crate::row_helpers;

/// Access to the single tree that owns every factory.
pub struct TreeRepo {
    db: Database,
}

impl TreeRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Full snapshot of the current tree, creating `"Default Tree"` if none
    /// exists yet.
    #[instrument(skip(self))]
    pub fn load_default(&self) -> Result<Tree, StoreError> {
        self.db.with_tx(|tx| {
            let id = default_tree_id(tx)?;
            load_tree(tx, &id)
        })
    }

    /// Apply a patch to the current tree and return the committed snapshot.
    #[instrument(skip(self, patch))]
    pub fn update_default(&self, patch: &TreePatch) -> Result<Tree, StoreError> {
        patch.validate()?;
        self.db.with_tx(|tx| {
            let id = default_tree_id(tx)?;
            if let Some(name) = &patch.name {
                tx.execute(
                    "UPDATE trees SET name = ?1 WHERE id = ?2",
                    rusqlite::params![name, id.as_str()],
                )?;
            }
            load_tree(tx, &id)
        })
    }

    /// Delete the current tree together with its factories and children.
    /// The next access creates a fresh default tree.
    #[instrument(skip(self))]
    pub fn delete_default(&self) -> Result<TreeId, StoreError> {
        self.db.with_tx(|tx| {
            let id = find_first_tree(tx)?
                .ok_or_else(|| StoreError::NotFound("Tree".into()))?;
            tx.execute("DELETE FROM trees WHERE id = ?1", [id.as_str()])?;
            info!(tree_id = %id, "tree deleted");
            Ok(id)
        })
    }
}

fn find_first_tree(conn: &Connection) -> Result<Option<TreeId>, StoreError> {
    let id = conn
        .query_row(
            "SELECT id FROM trees ORDER BY created_at, rowid LIMIT 1",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(id.map(TreeId::from_raw))
}

/// Resolve the current tree id inside an open transaction, inserting the
/// default tree on first use.
pub(crate) fn default_tree_id(conn: &Connection) -> Result<TreeId, StoreError> {
    if let Some(id) = find_first_tree(conn)? {
        return Ok(id);
    }

    let id = TreeId::new();
    conn.execute(
        "INSERT INTO trees (id, name, created_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![id.as_str(), DEFAULT_TREE_NAME, row_helpers::now()],
    )?;
    info!(tree_id = %id, "created default tree");
    Ok(id)
}

pub(crate) fn load_tree(conn: &Connection, id: &TreeId) -> Result<Tree, StoreError> {
    let name = conn
        .query_row("SELECT name FROM trees WHERE id = ?1", [id.as_str()], |row| {
            row.get::<_, String>(0)
        })
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("Tree with ID {id}")))?;

    let factory_ids = {
        let mut stmt = conn.prepare(
            "SELECT id FROM factories WHERE tree_id = ?1 ORDER BY created_at, rowid",
        )?;
        let ids = stmt
            .query_map([id.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };

    let mut tree_factories = Vec::with_capacity(factory_ids.len());
    for raw in factory_ids {
        tree_factories.push(factories::load_factory(conn, &FactoryId::from_raw(raw))?);
    }

    Ok(Tree {
        id: id.clone(),
        name,
        factories: tree_factories,
    })
}
