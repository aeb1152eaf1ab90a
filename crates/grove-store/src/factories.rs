use grove_core::ids::{ChildId, FactoryId, TreeId};
use grove_core::{Child, Factory, FactoryPatch, NewFactory};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::trees;

/// Factory persistence. Every mutation runs in one transaction and returns
/// the committed snapshot.
pub struct FactoryRepo {
    db: Database,
}

impl FactoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a factory under the current tree, creating the tree if needed.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub fn create(&self, input: &NewFactory) -> Result<Factory, StoreError> {
        let child_count = input.validate()?;
        let factory = self.db.with_tx(|tx| {
            let tree_id = trees::default_tree_id(tx)?;
            let id = FactoryId::new();
            let now = row_helpers::now();
            tx.execute(
                "INSERT INTO factories (id, tree_id, name, lower_bound, upper_bound, child_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    id.as_str(),
                    tree_id.as_str(),
                    input.name,
                    input.lower_bound,
                    input.upper_bound,
                    child_count,
                    now,
                ],
            )?;
            load_factory(tx, &id)
        })?;
        info!(factory_id = %factory.id, tree_id = %factory.tree_id, "factory created");
        Ok(factory)
    }

    #[instrument(skip(self), fields(factory_id = %id))]
    pub fn get(&self, id: &FactoryId) -> Result<Factory, StoreError> {
        self.db.with_conn(|conn| load_factory(conn, id))
    }

    /// Merge `patch` onto the stored factory. The merged values are validated
    /// as a whole; existing children are kept.
    #[instrument(skip(self, patch), fields(factory_id = %id))]
    pub fn update(&self, id: &FactoryId, patch: &FactoryPatch) -> Result<Factory, StoreError> {
        self.db.with_tx(|tx| {
            let current = load_factory(tx, id)?;
            let merged = patch.apply(&current)?;
            tx.execute(
                "UPDATE factories
                 SET name = ?1, lower_bound = ?2, upper_bound = ?3, child_count = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    merged.name,
                    merged.lower_bound,
                    merged.upper_bound,
                    merged.child_count,
                    row_helpers::now(),
                    id.as_str(),
                ],
            )?;
            load_factory(tx, id)
        })
    }

    /// Remove a factory and its children. Returns the tree it belonged to.
    #[instrument(skip(self), fields(factory_id = %id))]
    pub fn delete(&self, id: &FactoryId) -> Result<TreeId, StoreError> {
        self.db.with_tx(|tx| {
            let tree_id = tx
                .query_row(
                    "SELECT tree_id FROM factories WHERE id = ?1",
                    [id.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .map(TreeId::from_raw)
                .ok_or_else(|| not_found(id))?;
            tx.execute("DELETE FROM factories WHERE id = ?1", [id.as_str()])?;
            info!(tree_id = %tree_id, "factory deleted");
            Ok(tree_id)
        })
    }

    /// Replace the factory's children with `child_count` fresh values drawn
    /// uniformly from `lower_bound..=upper_bound`.
    #[instrument(skip(self, rng), fields(factory_id = %id))]
    pub fn generate_children<R: Rng + ?Sized>(
        &self,
        id: &FactoryId,
        rng: &mut R,
    ) -> Result<Factory, StoreError> {
        self.db.with_tx(|tx| {
            let factory = load_factory(tx, id)?;
            tx.execute("DELETE FROM children WHERE factory_id = ?1", [id.as_str()])?;

            let mut stmt = tx.prepare(
                "INSERT INTO children (id, factory_id, value, position) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for position in 0..factory.child_count {
                let value = rng.gen_range(factory.lower_bound..=factory.upper_bound);
                stmt.execute(params![ChildId::new().as_str(), id.as_str(), value, position])?;
            }
            drop(stmt);

            let regenerated = load_factory(tx, id)?;
            debug!(count = regenerated.children.len(), "children generated");
            Ok(regenerated)
        })
    }
}

fn not_found(id: &FactoryId) -> StoreError {
    StoreError::NotFound(format!("Factory with ID {id}"))
}

pub(crate) fn load_factory(conn: &Connection, id: &FactoryId) -> Result<Factory, StoreError> {
    let factory = {
        let mut stmt = conn.prepare(
            "SELECT id, name, lower_bound, upper_bound, child_count, tree_id
             FROM factories WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id.as_str()])?;
        let found = match rows.next()? {
            Some(row) => Factory {
                id: FactoryId::from_raw(row_helpers::get::<String>(row, 0, "factories", "id")?),
                name: row_helpers::get(row, 1, "factories", "name")?,
                lower_bound: row_helpers::get(row, 2, "factories", "lower_bound")?,
                upper_bound: row_helpers::get(row, 3, "factories", "upper_bound")?,
                child_count: row_helpers::get_u32(row, 4, "factories", "child_count")?,
                tree_id: TreeId::from_raw(row_helpers::get::<String>(row, 5, "factories", "tree_id")?),
                children: Vec::new(),
            },
            None => return Err(not_found(id)),
        };
        found
    };

    Ok(Factory {
        children: load_children(conn, id)?,
        ..factory
    })
}

fn load_children(conn: &Connection, factory_id: &FactoryId) -> Result<Vec<Child>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, value FROM children WHERE factory_id = ?1 ORDER BY position",
    )?;
    let mut rows = stmt.query([factory_id.as_str()])?;
    let mut children = Vec::new();
    while let Some(row) = rows.next()? {
        children.push(Child {
            id: ChildId::from_raw(row_helpers::get::<String>(row, 0, "children", "id")?),
            value: row_helpers::get(row, 1, "children", "value")?,
            factory_id: factory_id.clone(),
        });
    }
    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_core::ValidationError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn repo() -> FactoryRepo {
        FactoryRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let created = repo.create(&NewFactory::new("Primes", 1, 10, 4)).unwrap();
        assert!(created.id.as_str().starts_with("fac_"));
        assert!(created.children.is_empty());

        let fetched = repo.get(&created.id).unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.child_count, 4);
    }

    #[test]
    fn create_rejects_invalid_input() {
        let repo = repo();
        let err = repo.create(&NewFactory::new("x", 10, 5, 3)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Invalid(ValidationError::BoundsInverted { .. })
        ));
        let err = repo.create(&NewFactory::new("x", 1, 5, 16)).unwrap_err();
        assert_eq!(err.to_string(), "Child count must be between 1 and 15");
    }

    #[test]
    fn get_missing_is_not_found() {
        let err = repo().get(&FactoryId::from_raw("fac_nope")).unwrap_err();
        assert_eq!(err.to_string(), "Factory with ID fac_nope not found");
    }

    #[test]
    fn update_merges_fields() {
        let repo = repo();
        let created = repo.create(&NewFactory::new("a", 1, 10, 3)).unwrap();
        let updated = repo
            .update(
                &created.id,
                &FactoryPatch {
                    name: Some("b".into()),
                    child_count: Some(7),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "b");
        assert_eq!(updated.lower_bound, 1);
        assert_eq!(updated.upper_bound, 10);
        assert_eq!(updated.child_count, 7);
    }

    #[test]
    fn update_rejects_inverted_result_and_keeps_row() {
        let repo = repo();
        let created = repo.create(&NewFactory::new("a", 1, 10, 3)).unwrap();
        let err = repo
            .update(
                &created.id,
                &FactoryPatch {
                    upper_bound: Some(0),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(repo.get(&created.id).unwrap().upper_bound, 10);
    }

    #[test]
    fn update_missing_is_not_found() {
        let err = repo()
            .update(&FactoryId::from_raw("fac_nope"), &FactoryPatch::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn delete_returns_tree_and_removes_row() {
        let repo = repo();
        let created = repo.create(&NewFactory::new("a", 1, 10, 3)).unwrap();
        let tree_id = repo.delete(&created.id).unwrap();
        assert_eq!(tree_id, created.tree_id);
        assert!(matches!(repo.get(&created.id), Err(StoreError::NotFound(_))));
        assert!(matches!(repo.delete(&created.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn generated_children_respect_bounds_and_count() {
        let repo = repo();
        let created = repo.create(&NewFactory::new("a", 3, 9, 15)).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let factory = repo.generate_children(&created.id, &mut rng).unwrap();

        assert_eq!(factory.children.len(), 15);
        for child in &factory.children {
            assert!((3..=9).contains(&child.value));
            assert_eq!(child.factory_id, created.id);
            assert!(child.id.as_str().starts_with("child_"));
        }
        assert_eq!(repo.get(&created.id).unwrap().children, factory.children);
    }

    #[test]
    fn generation_replaces_previous_children() {
        let repo = repo();
        let created = repo.create(&NewFactory::new("a", 1, 1000, 5)).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let first = repo.generate_children(&created.id, &mut rng).unwrap();
        let second = repo.generate_children(&created.id, &mut rng).unwrap();

        assert_eq!(second.children.len(), 5);
        assert!(first
            .children
            .iter()
            .all(|c| second.children.iter().all(|d| d.id != c.id)));
    }

    #[test]
    fn generation_is_deterministic_for_a_seed() {
        let repo = repo();
        let created = repo.create(&NewFactory::new("a", 1, 100, 6)).unwrap();
        let a = repo
            .generate_children(&created.id, &mut StdRng::seed_from_u64(42))
            .unwrap();
        let b = repo
            .generate_children(&created.id, &mut StdRng::seed_from_u64(42))
            .unwrap();
        let values = |f: &Factory| f.children.iter().map(|c| c.value).collect::<Vec<_>>();
        assert_eq!(values(&a), values(&b));
    }

    #[test]
    fn generate_for_missing_factory_is_not_found() {
        let err = repo()
            .generate_children(&FactoryId::from_raw("fac_nope"), &mut rand::thread_rng())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
