//! Foreign-key graph over a catalog snapshot
//!
//! Catalogs routinely contain reference cycles (mutual references, self
//! references), so every traversal here is iterative with a visited set and
//! terminates on cyclic input.

use std::collections::{BTreeMap, BTreeSet};

use crate::CatalogSnapshot;
use sqlduet_core::TableDescriptor;

/// Directed graph: an edge `a -> b` means table `a` has a foreign key into `b`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForeignKeyGraph {
    /// Outgoing references per table
    references: BTreeMap<String, BTreeSet<String>>,
    /// Incoming references per table
    referenced_by: BTreeMap<String, BTreeSet<String>>,
}

impl ForeignKeyGraph {
    pub fn from_snapshot(snapshot: &CatalogSnapshot) -> Self {
        Self::from_tables(snapshot.iter())
    }

    /// Build from table descriptors. References to tables outside the set are ignored.
    pub fn from_tables<'a>(tables: impl IntoIterator<Item = &'a TableDescriptor>) -> Self {
        let tables: Vec<&TableDescriptor> = tables.into_iter().collect();
        let mut graph = Self::default();
        for table in &tables {
            graph.references.entry(table.catalog_name()).or_default();
            graph.referenced_by.entry(table.catalog_name()).or_default();
        }

        for table in &tables {
            let name = table.catalog_name();
            for fk in &table.foreign_keys {
                if !graph.references.contains_key(&fk.referenced_table) {
                    tracing::debug!(
                        table = %name,
                        referenced = %fk.referenced_table,
                        "foreign key points outside the catalog"
                    );
                    continue;
                }
                graph
                    .references
                    .entry(name.clone())
                    .or_default()
                    .insert(fk.referenced_table.clone());
                graph
                    .referenced_by
                    .entry(fk.referenced_table.clone())
                    .or_default()
                    .insert(name.clone());
            }
        }
        graph
    }

    /// All tables, in name order
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.references.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Tables `table` has foreign keys into
    pub fn references(&self, table: &str) -> Vec<&str> {
        neighbours(&self.references, table)
    }

    /// Tables with foreign keys into `table`
    pub fn referenced_by(&self, table: &str) -> Vec<&str> {
        neighbours(&self.referenced_by, table)
    }

    /// Every table transitively referenced from `table`, excluding `table` itself
    pub fn reachable_from(&self, table: &str) -> Vec<String> {
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<&str> = self.references(table);

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            stack.extend(
                self.references(current)
                    .into_iter()
                    .filter(|next| !visited.contains(next)),
            );
        }

        visited.remove(table);
        visited.into_iter().map(str::to_string).collect()
    }

    /// Groups of tables connected by references in either direction
    pub fn connected_components(&self) -> Vec<Vec<String>> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut components = Vec::new();

        for start in self.tables() {
            if seen.contains(start) {
                continue;
            }
            let mut component = BTreeSet::new();
            let mut stack = vec![start];
            while let Some(current) = stack.pop() {
                if !seen.insert(current) {
                    continue;
                }
                component.insert(current.to_string());
                for next in self
                    .references(current)
                    .into_iter()
                    .chain(self.referenced_by(current))
                {
                    if !seen.contains(next) {
                        stack.push(next);
                    }
                }
            }
            components.push(component.into_iter().collect());
        }
        components
    }

    /// Whether any reference cycle exists. A self reference counts.
    pub fn is_cyclic(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        for root in self.tables() {
            if marks.contains_key(root) {
                continue;
            }
            // (node, index of the next child to visit)
            let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
            marks.insert(root, Mark::InProgress);

            while let Some((node, child)) = stack.last().copied() {
                let children = self.references(node);
                match children.get(child) {
                    Some(&next) => {
                        if let Some(top) = stack.last_mut() {
                            top.1 += 1;
                        }
                        match marks.get(next) {
                            Some(Mark::InProgress) => return true,
                            Some(Mark::Done) => {}
                            None => {
                                marks.insert(next, Mark::InProgress);
                                stack.push((next, 0));
                            }
                        }
                    }
                    None => {
                        marks.insert(node, Mark::Done);
                        stack.pop();
                    }
                }
            }
        }
        false
    }

    /// Layout ordering: referenced tables come before the tables that reference them.
    ///
    /// Layer 0 holds tables that reference nothing (self references ignored).
    /// When only cycles remain, the alphabetically first remaining table is
    /// placed in the next layer to break the cycle, so every table appears in
    /// exactly one layer.
    pub fn layers(&self) -> Vec<Vec<String>> {
        let mut pending: BTreeMap<&str, BTreeSet<&str>> = self
            .references
            .iter()
            .map(|(table, refs)| {
                let refs = refs
                    .iter()
                    .map(String::as_str)
                    .filter(|r| *r != table.as_str())
                    .collect();
                (table.as_str(), refs)
            })
            .collect();

        let mut layers = Vec::new();
        while !pending.is_empty() {
            let mut ready: Vec<&str> = pending
                .iter()
                .filter(|(_, refs)| refs.is_empty())
                .map(|(table, _)| *table)
                .collect();

            if ready.is_empty() {
                // only cycles left
                if let Some(first) = pending.keys().next().copied() {
                    tracing::trace!(table = first, "breaking foreign key cycle for layout");
                    ready.push(first);
                }
            }

            for table in &ready {
                pending.remove(table);
            }
            for refs in pending.values_mut() {
                for table in &ready {
                    refs.remove(table);
                }
            }
            layers.push(ready.into_iter().map(str::to_string).collect());
        }
        layers
    }
}

fn neighbours<'a>(edges: &'a BTreeMap<String, BTreeSet<String>>, table: &str) -> Vec<&'a str> {
    edges
        .get(table)
        .map(|set| set.iter().map(String::as_str).collect())
        .unwrap_or_default()
}
