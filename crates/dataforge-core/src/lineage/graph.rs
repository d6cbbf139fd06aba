use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Depth cap for lineage queries.
pub const MAX_DEPTH: usize = 10;

/// Number of longest paths reported by impact analysis.
const MAX_CRITICAL_PATHS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageNodeType {
    DataSource,
    Pipeline,
    Transformation,
    Snapshot,
    Export,
    Stream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: LineageNodeType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageEdgeType {
    DataFlow,
    Dependency,
    Derivation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineageEdgeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub edge_type: LineageEdgeType,
    #[serde(default)]
    pub metadata: LineageEdgeMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upstream,
    Downstream,
    Both,
}

#[derive(Debug, Clone)]
pub struct LineageQuery {
    pub node_id: String,
    pub direction: Direction,
    /// Clamped to [`MAX_DEPTH`].
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgraphMeta {
    /// Nodes with no upstream inside the subgraph.
    pub root_nodes: Vec<String>,
    /// Nodes with no downstream inside the subgraph.
    pub leaf_nodes: Vec<String>,
    pub depth: usize,
    pub total_nodes: usize,
    pub total_edges: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageSubgraph {
    pub nodes: Vec<LineageNode>,
    pub edges: Vec<LineageEdge>,
    pub metadata: SubgraphMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    pub subgraph: LineageSubgraph,
    pub affected_pipelines: Vec<String>,
    pub affected_data_sources: Vec<String>,
    /// Up to five longest acyclic node-id paths starting at the query node.
    pub critical_paths: Vec<Vec<String>>,
}

/// Field-level lineage record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldLineage {
    pub source_node: String,
    pub source_field: String,
    pub target_node: String,
    pub target_field: String,
    #[serde(default)]
    pub transformations: Vec<String>,
}

/// Adjacency-list lineage graph. See the module docs for the consistency
/// invariant between `edges`, `upstream` and `downstream`.
#[derive(Debug, Default)]
pub struct LineageGraph {
    nodes: HashMap<String, LineageNode>,
    edges: HashMap<String, LineageEdge>,
    /// `(source, target, type)` → edge id, for idempotent insertion.
    edge_index: HashMap<(String, String, LineageEdgeType), String>,
    downstream: HashMap<String, BTreeSet<String>>,
    upstream: HashMap<String, BTreeSet<String>>,
    field_lineage: Vec<FieldLineage>,
    next_edge_seq: u64,
}

impl LineageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_node(&mut self, node: LineageNode) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn get_node(&self, id: &str) -> Option<&LineageNode> {
        self.nodes.get(id)
    }

    pub fn nodes_by_type(&self, node_type: LineageNodeType) -> Vec<&LineageNode> {
        let mut nodes: Vec<&LineageNode> = self
            .nodes
            .values()
            .filter(|n| n.node_type == node_type)
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Insert an edge, updating both adjacency maps. A duplicate
    /// `(source, target, type)` triple is idempotent and returns the
    /// existing edge id. Cycles are permitted here; only impact-path
    /// computation rejects them.
    pub fn create_edge(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        edge_type: LineageEdgeType,
        metadata: LineageEdgeMeta,
    ) -> String {
        let source = source.into();
        let target = target.into();
        let key = (source.clone(), target.clone(), edge_type);
        if let Some(existing) = self.edge_index.get(&key) {
            // Refresh metadata on repeat executions of the same edge.
            if let Some(edge) = self.edges.get_mut(existing) {
                edge.metadata = metadata;
            }
            return existing.clone();
        }

        self.next_edge_seq += 1;
        let id = format!("le_{}", self.next_edge_seq);
        self.downstream
            .entry(source.clone())
            .or_default()
            .insert(target.clone());
        self.upstream
            .entry(target.clone())
            .or_default()
            .insert(source.clone());
        self.edge_index.insert(key, id.clone());
        self.edges.insert(
            id.clone(),
            LineageEdge {
                id: id.clone(),
                source,
                target,
                edge_type,
                metadata,
            },
        );
        id
    }

    /// Remove an edge by id, maintaining adjacency consistency. Adjacency
    /// entries survive only while another edge of a different type still
    /// connects the pair.
    pub fn remove_edge(&mut self, edge_id: &str) -> bool {
        let Some(edge) = self.edges.remove(edge_id) else {
            return false;
        };
        self.edge_index
            .remove(&(edge.source.clone(), edge.target.clone(), edge.edge_type));

        let still_connected = self
            .edges
            .values()
            .any(|e| e.source == edge.source && e.target == edge.target);
        if !still_connected {
            if let Some(set) = self.downstream.get_mut(&edge.source) {
                set.remove(&edge.target);
                if set.is_empty() {
                    self.downstream.remove(&edge.source);
                }
            }
            if let Some(set) = self.upstream.get_mut(&edge.target) {
                set.remove(&edge.source);
                if set.is_empty() {
                    self.upstream.remove(&edge.target);
                }
            }
        }
        true
    }

    /// Remove a node and all incident edges.
    pub fn remove_node(&mut self, node_id: &str) -> bool {
        if self.nodes.remove(node_id).is_none() {
            return false;
        }
        let incident: Vec<String> = self
            .edges
            .values()
            .filter(|e| e.source == node_id || e.target == node_id)
            .map(|e| e.id.clone())
            .collect();
        for id in incident {
            self.remove_edge(&id);
        }
        true
    }

    pub fn downstream_of(&self, node_id: &str) -> Vec<&str> {
        self.downstream
            .get(node_id)
            .map(|s| s.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn upstream_of(&self, node_id: &str) -> Vec<&str> {
        self.upstream
            .get(node_id)
            .map(|s| s.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// BFS-bounded induced subgraph around a node. The query node is always
    /// included, even when isolated.
    pub fn lineage_of(&self, query: &LineageQuery) -> LineageSubgraph {
        let depth = query.depth.min(MAX_DEPTH);
        let mut included: HashSet<String> = HashSet::new();
        included.insert(query.node_id.clone());

        if matches!(query.direction, Direction::Downstream | Direction::Both) {
            self.bfs_collect(&query.node_id, depth, &self.downstream, &mut included);
        }
        if matches!(query.direction, Direction::Upstream | Direction::Both) {
            self.bfs_collect(&query.node_id, depth, &self.upstream, &mut included);
        }

        self.induced_subgraph(&included, depth)
    }

    fn bfs_collect(
        &self,
        start: &str,
        depth: usize,
        adjacency: &HashMap<String, BTreeSet<String>>,
        included: &mut HashSet<String>,
    ) {
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        queue.push_back((start.to_string(), 0));
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(start.to_string());

        while let Some((node, level)) = queue.pop_front() {
            if level >= depth {
                continue;
            }
            if let Some(neighbors) = adjacency.get(&node) {
                for neighbor in neighbors {
                    if visited.insert(neighbor.clone()) {
                        included.insert(neighbor.clone());
                        queue.push_back((neighbor.clone(), level + 1));
                    }
                }
            }
        }
    }

    fn induced_subgraph(&self, included: &HashSet<String>, depth: usize) -> LineageSubgraph {
        let mut nodes: Vec<LineageNode> = included
            .iter()
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut edges: Vec<LineageEdge> = self
            .edges
            .values()
            .filter(|e| included.contains(&e.source) && included.contains(&e.target))
            .cloned()
            .collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));

        let has_upstream: HashSet<&str> = edges.iter().map(|e| e.target.as_str()).collect();
        let has_downstream: HashSet<&str> = edges.iter().map(|e| e.source.as_str()).collect();

        let mut root_nodes: Vec<String> = included
            .iter()
            .filter(|id| !has_upstream.contains(id.as_str()))
            .cloned()
            .collect();
        root_nodes.sort();
        let mut leaf_nodes: Vec<String> = included
            .iter()
            .filter(|id| !has_downstream.contains(id.as_str()))
            .cloned()
            .collect();
        leaf_nodes.sort();

        let total_nodes = nodes.len();
        let total_edges = edges.len();
        LineageSubgraph {
            nodes,
            edges,
            metadata: SubgraphMeta {
                root_nodes,
                leaf_nodes,
                depth,
                total_nodes,
                total_edges,
            },
        }
    }

    /// Downstream impact of a node: the induced downstream subgraph, the
    /// affected pipelines and data sources, and up to five longest simple
    /// paths. Cycles are cut by the DFS visited set.
    pub fn analyze_impact(&self, node_id: &str) -> ImpactAnalysis {
        let subgraph = self.lineage_of(&LineageQuery {
            node_id: node_id.to_string(),
            direction: Direction::Downstream,
            depth: MAX_DEPTH,
        });

        let mut affected_pipelines = Vec::new();
        let mut affected_data_sources = Vec::new();
        for node in &subgraph.nodes {
            if node.id == node_id {
                continue;
            }
            match node.node_type {
                LineageNodeType::Pipeline => affected_pipelines.push(node.id.clone()),
                LineageNodeType::DataSource => affected_data_sources.push(node.id.clone()),
                _ => {}
            }
        }

        let mut paths: Vec<Vec<String>> = Vec::new();
        let mut stack = vec![node_id.to_string()];
        let mut on_path: HashSet<String> = HashSet::new();
        on_path.insert(node_id.to_string());
        self.collect_paths(node_id, &mut stack, &mut on_path, &mut paths);
        paths.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        paths.truncate(MAX_CRITICAL_PATHS);

        ImpactAnalysis {
            subgraph,
            affected_pipelines,
            affected_data_sources,
            critical_paths: paths,
        }
    }

    fn collect_paths(
        &self,
        node: &str,
        stack: &mut Vec<String>,
        on_path: &mut HashSet<String>,
        out: &mut Vec<Vec<String>>,
    ) {
        let neighbors: Vec<String> = self
            .downstream
            .get(node)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        let mut extended = false;
        for neighbor in neighbors {
            if on_path.contains(&neighbor) {
                continue;
            }
            extended = true;
            stack.push(neighbor.clone());
            on_path.insert(neighbor.clone());
            self.collect_paths(&neighbor, stack, on_path, out);
            on_path.remove(&neighbor);
            stack.pop();
        }
        if !extended && stack.len() > 1 {
            out.push(stack.clone());
        }
    }

    pub fn track_field_lineage(&mut self, record: FieldLineage) {
        self.field_lineage.push(record);
    }

    pub fn field_lineage_between(&self, source_node: &str, target_node: &str) -> Vec<&FieldLineage> {
        self.field_lineage
            .iter()
            .filter(|f| f.source_node == source_node && f.target_node == target_node)
            .collect()
    }

    /// Whole-graph JSON export.
    pub fn export_json(&self) -> Value {
        let mut nodes: Vec<&LineageNode> = self.nodes.values().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut edges: Vec<&LineageEdge> = self.edges.values().collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        json!({
            "nodes": nodes,
            "edges": edges,
            "field_lineage": self.field_lineage,
        })
    }

    /// Graphviz DOT export.
    pub fn export_dot(&self) -> String {
        let mut out = String::from("digraph lineage {\n  rankdir=LR;\n");
        let mut nodes: Vec<&LineageNode> = self.nodes.values().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        for node in nodes {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\", shape={}];\n",
                escape_dot(&node.id),
                escape_dot(&node.name),
                match node.node_type {
                    LineageNodeType::DataSource => "cylinder",
                    LineageNodeType::Pipeline => "box",
                    LineageNodeType::Transformation => "ellipse",
                    LineageNodeType::Snapshot => "note",
                    LineageNodeType::Export => "folder",
                    LineageNodeType::Stream => "cds",
                }
            ));
        }
        let mut edges: Vec<&LineageEdge> = self.edges.values().collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        for edge in edges {
            out.push_str(&format!(
                "  \"{}\" -> \"{}\" [style={}];\n",
                escape_dot(&edge.source),
                escape_dot(&edge.target),
                match edge.edge_type {
                    LineageEdgeType::DataFlow => "solid",
                    LineageEdgeType::Dependency => "dashed",
                    LineageEdgeType::Derivation => "dotted",
                }
            ));
        }
        out.push_str("}\n");
        out
    }

    /// Invariant check used by tests: every edge appears in both adjacency
    /// maps, and every adjacency entry is backed by an edge.
    pub fn adjacency_consistent(&self) -> bool {
        for edge in self.edges.values() {
            let down_ok = self
                .downstream
                .get(&edge.source)
                .map_or(false, |s| s.contains(&edge.target));
            let up_ok = self
                .upstream
                .get(&edge.target)
                .map_or(false, |s| s.contains(&edge.source));
            if !down_ok || !up_ok {
                return false;
            }
        }
        let mut pairs: BTreeMap<(String, String), ()> = BTreeMap::new();
        for edge in self.edges.values() {
            pairs.insert((edge.source.clone(), edge.target.clone()), ());
        }
        for (source, targets) in &self.downstream {
            for target in targets {
                if !pairs.contains_key(&(source.clone(), target.clone())) {
                    return false;
                }
            }
        }
        for (target, sources) in &self.upstream {
            for source in sources {
                if !pairs.contains_key(&(source.clone(), target.clone())) {
                    return false;
                }
            }
        }
        true
    }
}

fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, node_type: LineageNodeType) -> LineageNode {
        LineageNode {
            id: id.to_string(),
            node_type,
            name: id.to_string(),
            metadata: None,
        }
    }

    fn fan_out_graph() -> LineageGraph {
        // S → P1 → O1 and S → P2 → O2
        let mut g = LineageGraph::new();
        g.register_node(node("S", LineageNodeType::DataSource));
        g.register_node(node("P1", LineageNodeType::Pipeline));
        g.register_node(node("P2", LineageNodeType::Pipeline));
        g.register_node(node("O1", LineageNodeType::DataSource));
        g.register_node(node("O2", LineageNodeType::DataSource));
        g.create_edge("S", "P1", LineageEdgeType::DataFlow, Default::default());
        g.create_edge("P1", "O1", LineageEdgeType::DataFlow, Default::default());
        g.create_edge("S", "P2", LineageEdgeType::DataFlow, Default::default());
        g.create_edge("P2", "O2", LineageEdgeType::DataFlow, Default::default());
        g
    }

    #[test]
    fn edge_creation_is_idempotent() {
        let mut g = fan_out_graph();
        let before = g.edge_count();
        let id1 = g.create_edge("S", "P1", LineageEdgeType::DataFlow, Default::default());
        assert_eq!(g.edge_count(), before);
        let id2 = g.create_edge("S", "P1", LineageEdgeType::DataFlow, Default::default());
        assert_eq!(id1, id2);
        // A different type between the same pair is a new edge.
        g.create_edge("S", "P1", LineageEdgeType::Dependency, Default::default());
        assert_eq!(g.edge_count(), before + 1);
    }

    #[test]
    fn adjacency_stays_consistent_through_removal() {
        let mut g = fan_out_graph();
        assert!(g.adjacency_consistent());

        let edge_id = g.create_edge("S", "P1", LineageEdgeType::Dependency, Default::default());
        assert!(g.adjacency_consistent());

        g.remove_edge(&edge_id);
        assert!(g.adjacency_consistent());
        // The data_flow edge still connects the pair.
        assert!(g.downstream_of("S").contains(&"P1"));

        g.remove_node("P1");
        assert!(g.adjacency_consistent());
        assert!(!g.downstream_of("S").contains(&"P1"));
    }

    #[test]
    fn lineage_query_includes_root_and_respects_depth() {
        let g = fan_out_graph();
        let sub = g.lineage_of(&LineageQuery {
            node_id: "S".to_string(),
            direction: Direction::Downstream,
            depth: 1,
        });
        let ids: Vec<&str> = sub.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["P1", "P2", "S"]);
        assert_eq!(sub.metadata.root_nodes, vec!["S"]);

        let isolated = g.lineage_of(&LineageQuery {
            node_id: "O2".to_string(),
            direction: Direction::Downstream,
            depth: 3,
        });
        assert_eq!(isolated.nodes.len(), 1);
    }

    #[test]
    fn impact_analysis_fan_out() {
        let g = fan_out_graph();
        let impact = g.analyze_impact("S");
        assert_eq!(impact.affected_pipelines, vec!["P1", "P2"]);
        assert_eq!(impact.affected_data_sources, vec!["O1", "O2"]);
        assert_eq!(impact.critical_paths.len(), 2);
        assert!(impact
            .critical_paths
            .iter()
            .all(|p| p.len() == 3 && p[0] == "S"));
    }

    #[test]
    fn impact_paths_terminate_on_cycles() {
        let mut g = fan_out_graph();
        // Rollback-style loop back to the source.
        g.create_edge("O1", "S", LineageEdgeType::Derivation, Default::default());
        let impact = g.analyze_impact("S");
        assert!(impact.critical_paths.iter().all(|p| {
            let unique: HashSet<&String> = p.iter().collect();
            unique.len() == p.len()
        }));
    }

    #[test]
    fn dot_export_contains_nodes_and_edges() {
        let g = fan_out_graph();
        let dot = g.export_dot();
        assert!(dot.starts_with("digraph lineage {"));
        assert!(dot.contains("\"S\" -> \"P1\""));
        assert!(dot.contains("shape=cylinder"));
    }

    #[test]
    fn field_lineage_is_queryable_by_pair() {
        let mut g = fan_out_graph();
        g.track_field_lineage(FieldLineage {
            source_node: "S".into(),
            source_field: "amount".into(),
            target_node: "O1".into(),
            target_field: "total".into(),
            transformations: vec!["sum".into()],
        });
        assert_eq!(g.field_lineage_between("S", "O1").len(), 1);
        assert!(g.field_lineage_between("S", "O2").is_empty());
    }
}
