//! Fetch planning
//!
//! Planning is a pure function of the registry, the session configuration and
//! the request. The resulting tree says, for every relationship that must be
//! materialised, whether it is joined into its parent's statement, loaded in
//! `IN` batches, or loaded one owner at a time.

use std::fmt;

use crate::config::SessionConfig;
use crate::errors::{RelmapError, Result};
use crate::model::{Cardinality, FetchGraph, FetchMode, FetchOverride};
use crate::registry::Registry;

/// What the caller asks to load along with the root entities
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FetchRequest {
    /// Follow the fetch modes declared on the relationships
    #[default]
    Declared,
    /// Declared modes, plus the given dotted paths joined into the root query
    JoinFetch(Vec<String>),
    /// Exactly the paths of the graph; everything else stays lazy
    Graph(FetchGraph),
    /// A graph declared on the root type, by name
    NamedGraph(String),
}

/// How one relationship is materialised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedFetch {
    /// Outer join inside the parent's statement
    Join,
    /// Separate statements with `IN` lists of at most n owners
    Batch(usize),
    /// One statement per owner
    SelectEach,
}

impl fmt::Display for PlannedFetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannedFetch::Join => write!(f, "join"),
            PlannedFetch::Batch(n) => write!(f, "batch({})", n),
            PlannedFetch::SelectEach => write!(f, "select-each"),
        }
    }
}

/// One relationship edge of a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchNode {
    pub owner_type: String,
    pub relationship: String,
    pub target_type: String,
    pub cardinality: Cardinality,
    pub strategy: PlannedFetch,
    pub children: Vec<FetchNode>,
}

impl FetchNode {
    pub fn is_to_many(&self) -> bool {
        self.cardinality.is_to_many()
    }

    /// Child edge by relationship name
    pub fn child(&self, relationship: &str) -> Option<&FetchNode> {
        self.children.iter().find(|c| c.relationship == relationship)
    }
}

/// Plan for one query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    pub root_type: String,
    pub nodes: Vec<FetchNode>,
}

impl FetchPlan {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Human-readable tree, one relationship per line
    pub fn explain(&self) -> String {
        let mut out = self.root_type.clone();
        out.push('\n');
        for node in &self.nodes {
            explain_node(node, 1, &mut out);
        }
        out
    }

    /// Statements needed for `owners` root rows, assuming every to-many
    /// edge yields `children_per_owner` rows. Used by `explain` output.
    pub fn estimated_statements(&self, owners: usize, children_per_owner: usize) -> usize {
        1 + self
            .nodes
            .iter()
            .map(|n| estimate_node(n, owners, children_per_owner))
            .sum::<usize>()
    }
}

fn explain_node(node: &FetchNode, depth: usize, out: &mut String) {
    out.push_str(&"  ".repeat(depth));
    out.push_str(&format!(
        "{} ({} -> {}): {}\n",
        node.relationship, node.cardinality, node.target_type, node.strategy
    ));
    for child in &node.children {
        explain_node(child, depth + 1, out);
    }
}

fn estimate_node(node: &FetchNode, owners: usize, per_owner: usize) -> usize {
    let targets = if node.is_to_many() {
        owners * per_owner
    } else {
        owners
    };
    let own = match node.strategy {
        PlannedFetch::Join => 0,
        PlannedFetch::Batch(n) => owners.div_ceil(n.max(1)),
        PlannedFetch::SelectEach => owners,
    };
    own + node
        .children
        .iter()
        .map(|c| estimate_node(c, targets, per_owner))
        .sum::<usize>()
}

/// Builds fetch plans against a validated registry
pub struct FetchPlanner<'r> {
    registry: &'r Registry,
    config: &'r SessionConfig,
}

impl<'r> FetchPlanner<'r> {
    pub fn new(registry: &'r Registry, config: &'r SessionConfig) -> Self {
        Self { registry, config }
    }

    /// Plan a query rooted at `root_type`
    ///
    /// # Errors
    ///
    /// `UnsupportedFetchGraph` for paths that do not resolve, for batch sizes
    /// of zero and for statements that would join more than one collection.
    pub fn plan(&self, root_type: &str, request: &FetchRequest) -> Result<FetchPlan> {
        self.registry.entity(root_type)?;
        let nodes = match request {
            FetchRequest::Declared => self.declared(root_type)?,
            FetchRequest::JoinFetch(paths) => {
                let mut nodes = self.declared(root_type)?;
                for path in paths {
                    let segments: Vec<String> =
                        path.split('.').map(|s| s.trim().to_string()).collect();
                    self.overlay(root_type, &mut nodes, &segments, Some(PlannedFetch::Join))?;
                }
                nodes
            }
            FetchRequest::Graph(graph) => self.graph(root_type, graph)?,
            FetchRequest::NamedGraph(name) => {
                let graph = self.registry.named_graph(root_type, name).ok_or_else(|| {
                    RelmapError::UnsupportedFetchGraph {
                        entity_type: root_type.to_string(),
                        path: name.clone(),
                        reason: "no such named graph".to_string(),
                    }
                })?;
                self.graph(root_type, graph)?
            }
        };
        let plan = FetchPlan {
            root_type: root_type.to_string(),
            nodes,
        };
        check_single_collection_join(root_type, &plan.nodes, &mut Vec::new())?;
        Ok(plan)
    }

    /// Nodes for the eager and joined relationships declared on `entity_type`
    pub fn declared(&self, entity_type: &str) -> Result<Vec<FetchNode>> {
        self.declared_from(entity_type, &mut Vec::new())
    }

    fn declared_from(
        &self,
        entity_type: &str,
        path: &mut Vec<(String, String)>,
    ) -> Result<Vec<FetchNode>> {
        let meta = self.registry.entity(entity_type)?;
        let mut nodes = Vec::new();
        for rel in meta.relationships.values() {
            let strategy = match rel.descriptor.fetch {
                FetchMode::Eager => PlannedFetch::SelectEach,
                FetchMode::Joined => PlannedFetch::Join,
                FetchMode::Lazy | FetchMode::Batched(_) => continue,
            };
            let edge = (entity_type.to_string(), rel.name().to_string());
            if path.contains(&edge) {
                continue;
            }
            path.push(edge);
            let children = self.declared_from(rel.target(), path)?;
            path.pop();
            nodes.push(FetchNode {
                owner_type: entity_type.to_string(),
                relationship: rel.name().to_string(),
                target_type: rel.target().to_string(),
                cardinality: rel.descriptor.cardinality,
                strategy,
                children,
            });
        }
        Ok(nodes)
    }

    fn graph(&self, root_type: &str, graph: &FetchGraph) -> Result<Vec<FetchNode>> {
        let mut nodes = Vec::new();
        for path in graph.paths() {
            let strategy = match path.strategy {
                None => None,
                Some(FetchOverride::Join) => Some(PlannedFetch::Join),
                Some(FetchOverride::Select) => Some(PlannedFetch::SelectEach),
                Some(FetchOverride::Batch(0)) => {
                    return Err(RelmapError::UnsupportedFetchGraph {
                        entity_type: root_type.to_string(),
                        path: path.dotted(),
                        reason: "batch size must be at least 1".to_string(),
                    })
                }
                Some(FetchOverride::Batch(n)) => {
                    Some(PlannedFetch::Batch(self.config.chunk_size(Some(n))))
                }
            };
            self.overlay(root_type, &mut nodes, &path.segments, strategy)?;
        }
        Ok(nodes)
    }

    /// Default strategy of a graph edge without override
    fn graph_default(&self, to_many: bool) -> PlannedFetch {
        if to_many {
            PlannedFetch::Batch(self.config.chunk_size(self.config.default_batch_size))
        } else {
            PlannedFetch::Join
        }
    }

    /// Insert `segments` into `nodes`, creating intermediate edges with
    /// default strategies. `strategy` applies to the last segment only.
    fn overlay(
        &self,
        root_type: &str,
        nodes: &mut Vec<FetchNode>,
        segments: &[String],
        strategy: Option<PlannedFetch>,
    ) -> Result<()> {
        let resolved = self
            .registry
            .resolve_path(root_type, segments)
            .map_err(|reason| RelmapError::UnsupportedFetchGraph {
                entity_type: root_type.to_string(),
                path: segments.join("."),
                reason,
            })?;

        let mut level = nodes;
        let mut owner_type = root_type.to_string();
        for (depth, rel) in resolved.iter().enumerate() {
            let is_last = depth + 1 == resolved.len();
            let wanted = if is_last { strategy } else { None };
            let position = level.iter().position(|n| n.relationship == rel.name());
            let index = match position {
                Some(i) => {
                    if let Some(s) = wanted {
                        level[i].strategy = s;
                    }
                    i
                }
                None => {
                    level.push(FetchNode {
                        owner_type: owner_type.clone(),
                        relationship: rel.name().to_string(),
                        target_type: rel.target().to_string(),
                        cardinality: rel.descriptor.cardinality,
                        strategy: wanted.unwrap_or_else(|| self.graph_default(rel.is_to_many())),
                        children: Vec::new(),
                    });
                    level.len() - 1
                }
            };
            owner_type = rel.target().to_string();
            level = &mut level[index].children;
        }
        Ok(())
    }
}

/// Reject statements that would join more than one collection
///
/// `joined` tracks the to-many joins of the statement currently being built;
/// a non-join edge starts a new statement.
fn check_single_collection_join(
    root_type: &str,
    nodes: &[FetchNode],
    joined: &mut Vec<String>,
) -> Result<()> {
    for node in nodes {
        match node.strategy {
            PlannedFetch::Join => {
                if node.is_to_many() {
                    joined.push(node.relationship.clone());
                    if joined.len() > 1 {
                        return Err(RelmapError::UnsupportedFetchGraph {
                            entity_type: root_type.to_string(),
                            path: joined.join(", "),
                            reason: "more than one collection joined into a single statement"
                                .to_string(),
                        });
                    }
                }
                check_single_collection_join(root_type, &node.children, joined)?;
            }
            PlannedFetch::Batch(_) | PlannedFetch::SelectEach => {
                check_single_collection_join(root_type, &node.children, &mut Vec::new())?;
            }
        }
    }
    Ok(())
}
