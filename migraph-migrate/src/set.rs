//! Migration sets: the ID → migration view of one revision.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::definition::{Migration, MigrationId};

/// Two independently authored migrations that collided on one ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConflict {
    /// The shared ID.
    pub id: MigrationId,
    /// Definition on the main branch.
    pub main: Migration,
    /// Definition on the local branch.
    pub local: Migration,
}

/// Migrations defined at one revision, keyed by ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSet {
    migrations: BTreeMap<MigrationId, Migration>,
}

impl MigrationSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set; a later entry replaces an earlier one with the same ID.
    pub fn from_migrations(migrations: impl IntoIterator<Item = Migration>) -> Self {
        Self {
            migrations: migrations.into_iter().map(|m| (m.id, m)).collect(),
        }
    }

    /// Build the local set from a working tree that may hold two definitions
    /// for one ID (main's and the branch's, after a rebase).
    ///
    /// For a duplicated ID the entry whose name differs from `main`'s wins.
    pub fn resolve_local(entries: impl IntoIterator<Item = Migration>, main: &MigrationSet) -> Self {
        let mut migrations: BTreeMap<MigrationId, Migration> = BTreeMap::new();

        for entry in entries {
            let main_name = main.get(entry.id).map(|m| m.name.as_str());
            let replace = match migrations.get(&entry.id) {
                None => true,
                Some(existing) => {
                    main_name == Some(existing.name.as_str())
                        && main_name != Some(entry.name.as_str())
                }
            };
            if replace {
                migrations.insert(entry.id, entry);
            }
        }

        Self { migrations }
    }

    /// Insert a migration.
    pub fn insert(&mut self, migration: Migration) {
        self.migrations.insert(migration.id, migration);
    }

    /// Look up a migration.
    pub fn get(&self, id: MigrationId) -> Option<&Migration> {
        self.migrations.get(&id)
    }

    /// Check if an ID is defined.
    pub fn contains(&self, id: MigrationId) -> bool {
        self.migrations.contains_key(&id)
    }

    /// Migrations ordered by ID.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Migration> {
        self.migrations.values()
    }

    /// IDs in ascending order.
    pub fn ids(&self) -> impl DoubleEndedIterator<Item = MigrationId> + '_ {
        self.migrations.keys().copied()
    }

    /// Highest ID, or 0 for an empty set.
    pub fn max_id(&self) -> MigrationId {
        self.migrations.keys().next_back().copied().unwrap_or(0)
    }

    /// Number of migrations.
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl FromIterator<Migration> for MigrationSet {
    fn from_iter<T: IntoIterator<Item = Migration>>(iter: T) -> Self {
        Self::from_migrations(iter)
    }
}

/// IDs defined on both sides under different names, ascending by ID.
pub fn find_conflicting_migrations(
    main: &MigrationSet,
    local: &MigrationSet,
) -> Vec<MigrationConflict> {
    main.iter()
        .filter_map(|main_migration| {
            let local_migration = local.get(main_migration.id)?;
            (local_migration.name != main_migration.name).then(|| MigrationConflict {
                id: main_migration.id,
                main: main_migration.clone(),
                local: local_migration.clone(),
            })
        })
        .collect()
}

/// Migrations defined on main that the local set lacks, ascending by ID.
pub fn find_missing_migrations(main: &MigrationSet, local: &MigrationSet) -> Vec<Migration> {
    main.iter()
        .filter(|m| !local.contains(m.id))
        .cloned()
        .collect()
}
