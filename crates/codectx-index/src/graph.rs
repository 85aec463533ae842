//! File-level import graph.
//!
//! Directed edges from an importing file to the file it imports, or to the
//! raw specifier when it could not be resolved inside the workspace.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::symbols::Symbol;

/// One import statement, resolved or not.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImportEdge {
    /// Importing file, workspace-relative
    pub from: String,
    /// Imported file, or the raw specifier when `external`
    pub to: String,
    pub external: bool,
}

/// Import edges indexed both ways.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportGraph {
    edges: Vec<ImportEdge>,
    #[serde(skip)]
    outgoing: BTreeMap<String, Vec<usize>>,
    #[serde(skip)]
    incoming: BTreeMap<String, Vec<usize>>,
}

impl ImportGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from edges, dropping duplicates.
    pub fn from_edges(edges: impl IntoIterator<Item = ImportEdge>) -> Self {
        let unique: BTreeSet<ImportEdge> = edges.into_iter().collect();
        let mut graph = Self::new();
        for edge in unique {
            graph.add_edge(edge);
        }
        graph
    }

    fn add_edge(&mut self, edge: ImportEdge) {
        let idx = self.edges.len();
        self.outgoing.entry(edge.from.clone()).or_default().push(idx);
        if !edge.external {
            self.incoming.entry(edge.to.clone()).or_default().push(idx);
        }
        self.edges.push(edge);
    }

    pub fn edges(&self) -> &[ImportEdge] {
        &self.edges
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edges leaving a file.
    pub fn imports_of(&self, file: &str) -> Vec<&ImportEdge> {
        self.outgoing
            .get(file)
            .map(|ids| ids.iter().map(|i| &self.edges[*i]).collect())
            .unwrap_or_default()
    }

    /// Files that import this file.
    pub fn importers_of(&self, file: &str) -> Vec<&str> {
        self.incoming
            .get(file)
            .map(|ids| ids.iter().map(|i| self.edges[*i].from.as_str()).collect())
            .unwrap_or_default()
    }

    /// Number of distinct importers per internal file.
    pub fn fan_in(&self) -> BTreeMap<&str, usize> {
        self.incoming
            .iter()
            .map(|(file, ids)| {
                let importers: BTreeSet<&str> =
                    ids.iter().map(|i| self.edges[*i].from.as_str()).collect();
                (file.as_str(), importers.len())
            })
            .collect()
    }

    /// Every file that appears on either end of an internal edge.
    pub fn files(&self) -> BTreeSet<&str> {
        let mut out: BTreeSet<&str> = self.outgoing.keys().map(String::as_str).collect();
        out.extend(self.incoming.keys().map(String::as_str));
        out
    }
}

/// A file's symbols and its immediate import neighbours.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Neighborhood {
    pub file: String,
    pub symbols: Vec<Symbol>,
    pub imports: Vec<ImportEdge>,
    pub imported_by: Vec<String>,
}

impl Neighborhood {
    pub fn build(file: &str, symbols: Vec<Symbol>, graph: &ImportGraph) -> Self {
        let mut imported_by: Vec<String> =
            graph.importers_of(file).into_iter().map(str::to_string).collect();
        imported_by.sort();
        imported_by.dedup();
        Self {
            file: file.to_string(),
            symbols,
            imports: graph.imports_of(file).into_iter().cloned().collect(),
            imported_by,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(from: &str, to: &str, external: bool) -> ImportEdge {
        ImportEdge {
            from: from.to_string(),
            to: to.to_string(),
            external,
        }
    }

    #[test]
    fn test_edges_indexed_both_ways() {
        let graph = ImportGraph::from_edges(vec![
            edge("a.ts", "b.ts", false),
            edge("c.ts", "b.ts", false),
            edge("a.ts", "react", true),
            edge("a.ts", "b.ts", false),
        ]);
        assert_eq!(graph.edge_count(), 3);
        assert_eq!(graph.imports_of("a.ts").len(), 2);
        assert_eq!(graph.importers_of("b.ts"), vec!["a.ts", "c.ts"]);
        assert!(graph.importers_of("react").is_empty());
        assert_eq!(graph.fan_in().get("b.ts"), Some(&2));
    }

    #[test]
    fn test_neighborhood() {
        let graph = ImportGraph::from_edges(vec![
            edge("a.ts", "b.ts", false),
            edge("b.ts", "c.ts", false),
        ]);
        let hood = Neighborhood::build("b.ts", Vec::new(), &graph);
        assert_eq!(hood.imports, vec![edge("b.ts", "c.ts", false)]);
        assert_eq!(hood.imported_by, vec!["a.ts".to_string()]);

        let lonely = Neighborhood::build("z.ts", Vec::new(), &graph);
        assert!(lonely.imports.is_empty() && lonely.imported_by.is_empty());
    }
}
