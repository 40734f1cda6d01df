//! The migration dependency graph of one schema.
//!
//! A [`MigrationGraph`] is a snapshot: it is built from a list of
//! [`Migration`]s, validated once, and never mutated. Changes happen by
//! writing files and loading a new graph.
//!
//! ```text
//!        1 (root)
//!       / \
//!      2   3
//!       \ /
//!        4        <- dominator of the leaves {5, 6}
//!       / \
//!      5   6      <- leaves
//! ```

use std::collections::{BTreeMap, BTreeSet};

use crate::definition::{Migration, MigrationId};
use crate::error::{MigrateResult, MigrationError};

/// Steps needed to move a database from one applied set to a target version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSteps {
    /// IDs to revert, in order.
    pub down: Vec<MigrationId>,
    /// IDs to apply, in order.
    pub up: Vec<MigrationId>,
}

impl MigrationSteps {
    /// Check if there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.down.is_empty() && self.up.is_empty()
    }
}

/// A validated DAG of migrations.
#[derive(Debug, Clone, Default)]
pub struct MigrationGraph {
    migrations: BTreeMap<MigrationId, Migration>,
    children: BTreeMap<MigrationId, BTreeSet<MigrationId>>,
    order: Vec<MigrationId>,
}

impl MigrationGraph {
    /// Build a graph, rejecting duplicate IDs, unknown parents and cycles.
    pub fn new(definitions: impl IntoIterator<Item = Migration>) -> MigrateResult<Self> {
        let mut migrations: BTreeMap<MigrationId, Migration> = BTreeMap::new();
        for migration in definitions {
            if migration.id <= 0 {
                return Err(MigrationError::graph(format!(
                    "migration '{}' has non-positive ID",
                    migration.label()
                )));
            }
            if let Some(existing) = migrations.get(&migration.id) {
                return Err(MigrationError::graph(format!(
                    "duplicate migration ID {}: '{}' and '{}'",
                    migration.id,
                    existing.label(),
                    migration.label()
                )));
            }
            migrations.insert(migration.id, migration);
        }

        let mut children: BTreeMap<MigrationId, BTreeSet<MigrationId>> =
            migrations.keys().map(|id| (*id, BTreeSet::new())).collect();
        for migration in migrations.values() {
            for parent in &migration.parents {
                match children.get_mut(parent) {
                    Some(set) => {
                        set.insert(migration.id);
                    }
                    None => {
                        return Err(MigrationError::graph(format!(
                            "migration '{}' depends on unknown migration {}",
                            migration.label(),
                            parent
                        )));
                    }
                }
            }
        }

        let order = topological_sort(&migrations, &children)?;

        Ok(Self {
            migrations,
            children,
            order,
        })
    }

    /// Look up a migration.
    pub fn get_by_id(&self, id: MigrationId) -> Option<&Migration> {
        self.migrations.get(&id)
    }

    /// All migrations ordered by ID.
    pub fn all(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.values()
    }

    /// All IDs in ascending order.
    pub fn ids(&self) -> Vec<MigrationId> {
        self.migrations.keys().copied().collect()
    }

    /// Number of migrations.
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Check if the graph has no migrations.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Highest ID, if any.
    pub fn max_id(&self) -> Option<MigrationId> {
        self.migrations.keys().next_back().copied()
    }

    /// IDs in dependency order; among ready nodes the lowest ID goes first.
    pub fn topological_order(&self) -> &[MigrationId] {
        &self.order
    }

    /// The unique parentless migration.
    pub fn root(&self) -> MigrateResult<&Migration> {
        let roots: Vec<_> = self
            .migrations
            .values()
            .filter(|m| m.parents.is_empty())
            .collect();

        match roots.as_slice() {
            [root] => Ok(root),
            [] => Err(MigrationError::graph("no root migration")),
            many => Err(MigrationError::graph(format!(
                "multiple root migrations: {:?}",
                many.iter().map(|m| m.id).collect::<Vec<_>>()
            ))),
        }
    }

    /// Migrations without children, ordered by ID.
    pub fn leaves(&self) -> Vec<&Migration> {
        self.children
            .iter()
            .filter(|(_, children)| children.is_empty())
            .filter_map(|(id, _)| self.migrations.get(id))
            .collect()
    }

    /// Induced subgraph over exactly `ids`; parent edges leaving the set are dropped.
    pub fn filter(&self, ids: &[MigrationId]) -> MigrateResult<MigrationGraph> {
        let keep: BTreeSet<_> = ids.iter().copied().collect();
        let mut filtered = Vec::with_capacity(keep.len());

        for id in &keep {
            let migration = self
                .migrations
                .get(id)
                .ok_or_else(|| MigrationError::NotFound(id.to_string()))?;

            let mut migration = migration.clone();
            migration.parents.retain(|parent| keep.contains(parent));
            filtered.push(migration);
        }

        MigrationGraph::new(filtered)
    }

    /// Every migration in `all_ids` that is a proper descendant of any target,
    /// in the order they would be reverted (reverse dependency order).
    pub fn down(
        &self,
        all_ids: &[MigrationId],
        targets: &[MigrationId],
    ) -> MigrateResult<Vec<&Migration>> {
        let mut below = BTreeSet::new();
        for target in targets {
            if !self.migrations.contains_key(target) {
                return Err(MigrationError::NotFound(target.to_string()));
            }
            for child in &self.children[target] {
                below.extend(self.descendants(*child));
            }
        }

        let allowed: BTreeSet<_> = all_ids.iter().copied().collect();
        Ok(self
            .order
            .iter()
            .rev()
            .filter(|id| below.contains(id) && allowed.contains(id))
            .filter_map(|id| self.migrations.get(id))
            .collect())
    }

    /// `id` and everything it depends on, transitively.
    pub fn ancestors(&self, id: MigrationId) -> BTreeSet<MigrationId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(migration) = self.migrations.get(&current) {
                stack.extend(migration.parents.iter().copied());
            }
        }
        seen.retain(|id| self.migrations.contains_key(id));
        seen
    }

    /// `id` and everything depending on it, transitively.
    pub fn descendants(&self, id: MigrationId) -> BTreeSet<MigrationId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(children) = self.children.get(&current) {
                stack.extend(children.iter().copied());
            }
        }
        seen.retain(|id| self.migrations.contains_key(id));
        seen
    }

    /// Dominator set of every node: the nodes lying on every path from a root.
    ///
    /// Each set includes the node itself and always forms a chain.
    pub fn dominators(&self) -> BTreeMap<MigrationId, BTreeSet<MigrationId>> {
        let mut dominators: BTreeMap<MigrationId, BTreeSet<MigrationId>> = BTreeMap::new();

        for id in &self.order {
            let migration = &self.migrations[id];
            let mut set = migration
                .parents
                .iter()
                .map(|parent| dominators[parent].clone())
                .reduce(|acc, next| acc.intersection(&next).copied().collect())
                .unwrap_or_default();
            set.insert(*id);
            dominators.insert(*id, set);
        }

        dominators
    }

    /// The deepest migration dominating every leaf and every extra root.
    ///
    /// Returns `None` when the leaves do not converge on a single migration, or
    /// when an extra root is not part of the graph.
    pub fn leaf_dominator(&self, extra_roots: &[MigrationId]) -> Option<&Migration> {
        let mut targets: Vec<MigrationId> = self.leaves().iter().map(|m| m.id).collect();
        targets.extend_from_slice(extra_roots);
        if targets.is_empty() {
            return None;
        }

        let dominators = self.dominators();
        let mut common: Option<BTreeSet<MigrationId>> = None;
        for target in &targets {
            let set = dominators.get(target)?;
            common = Some(match common {
                None => set.clone(),
                Some(acc) => acc.intersection(set).copied().collect(),
            });
        }

        common?
            .into_iter()
            .max_by_key(|id| dominators[id].len())
            .and_then(|id| self.migrations.get(&id))
    }

    /// Steps to move from `applied` to version `target`: revert every applied
    /// migration above `target`, then apply the missing ancestors of `target`.
    pub fn plan_to(
        &self,
        applied: &BTreeSet<MigrationId>,
        target: MigrationId,
    ) -> MigrateResult<MigrationSteps> {
        if let Some(unknown) = applied.iter().find(|id| !self.migrations.contains_key(id)) {
            return Err(MigrationError::NotFound(unknown.to_string()));
        }

        let down: Vec<_> = self
            .order
            .iter()
            .rev()
            .filter(|id| **id > target && applied.contains(id))
            .copied()
            .collect();

        let up = if self.migrations.contains_key(&target) {
            let needed = self.ancestors(target);
            self.order
                .iter()
                .filter(|id| needed.contains(id) && (!applied.contains(id) || down.contains(id)))
                .copied()
                .collect()
        } else {
            Vec::new()
        };

        Ok(MigrationSteps { down, up })
    }

    /// Every unapplied migration, in dependency order.
    pub fn plan_up(&self, applied: &BTreeSet<MigrationId>) -> Vec<MigrationId> {
        self.order
            .iter()
            .filter(|id| !applied.contains(id))
            .copied()
            .collect()
    }
}

fn topological_sort(
    migrations: &BTreeMap<MigrationId, Migration>,
    children: &BTreeMap<MigrationId, BTreeSet<MigrationId>>,
) -> MigrateResult<Vec<MigrationId>> {
    let mut in_degree: BTreeMap<MigrationId, usize> = migrations
        .values()
        .map(|m| (m.id, m.parents.iter().collect::<BTreeSet<_>>().len()))
        .collect();
    let mut ready: BTreeSet<MigrationId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(migrations.len());
    while let Some(id) = ready.pop_first() {
        order.push(id);
        for child in children.get(&id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(child) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*child);
                }
            }
        }
    }

    if order.len() != migrations.len() {
        let cyclic: Vec<_> = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id)
            .collect();
        return Err(MigrationError::graph(format!(
            "cycle detected among migrations {:?}",
            cyclic
        )));
    }

    Ok(order)
}
