//! Fetch graphs
//!
//! A fetch graph lists relationship paths (`"books"`, `"books.tags"`) that a
//! query must materialise. Each path may override how it is loaded; paths
//! without an override use the graph defaults (join for to-one edges, one
//! batched `IN` query for to-many edges).

use std::fmt;

/// Per-path loading override
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOverride {
    /// Join into the parent's statement
    Join,
    /// Separate `IN` queries of at most n owners each
    Batch(usize),
    /// One query per owner
    Select,
}

impl fmt::Display for FetchOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchOverride::Join => write!(f, "join"),
            FetchOverride::Batch(n) => write!(f, "batch({})", n),
            FetchOverride::Select => write!(f, "select"),
        }
    }
}

/// One relationship path of a graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphPath {
    pub segments: Vec<String>,
    pub strategy: Option<FetchOverride>,
}

impl GraphPath {
    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }
}

/// Set of relationship paths to load together with the root entities
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchGraph {
    paths: Vec<GraphPath>,
}

impl FetchGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph over the given dotted paths, all using defaults
    pub fn of<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        paths
            .into_iter()
            .fold(Self::new(), |graph, p| graph.path(p.as_ref()))
    }

    #[must_use]
    pub fn path(self, dotted: &str) -> Self {
        self.push(dotted, None)
    }

    #[must_use]
    pub fn path_with(self, dotted: &str, strategy: FetchOverride) -> Self {
        self.push(dotted, Some(strategy))
    }

    fn push(mut self, dotted: &str, strategy: Option<FetchOverride>) -> Self {
        let segments: Vec<String> = dotted
            .split('.')
            .map(str::trim)
            .map(str::to_string)
            .collect();
        if let Some(existing) = self.paths.iter_mut().find(|p| p.segments == segments) {
            if strategy.is_some() {
                existing.strategy = strategy;
            }
        } else {
            self.paths.push(GraphPath { segments, strategy });
        }
        self
    }

    pub fn paths(&self) -> &[GraphPath] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_splits_dotted_paths() {
        let graph = FetchGraph::of(["books", "books.tags"]);
        assert_eq!(graph.paths().len(), 2);
        assert_eq!(graph.paths()[1].segments, vec!["books", "tags"]);
        assert_eq!(graph.paths()[1].dotted(), "books.tags");
    }

    #[test]
    fn test_repeated_path_keeps_last_override() {
        let graph = FetchGraph::new()
            .path("books")
            .path_with("books", FetchOverride::Batch(5));
        assert_eq!(graph.paths().len(), 1);
        assert_eq!(graph.paths()[0].strategy, Some(FetchOverride::Batch(5)));
    }
}
