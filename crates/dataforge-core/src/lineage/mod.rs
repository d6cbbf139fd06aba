//! # Data Lineage Graph
//!
//! An in-memory typed node/edge graph modeling how data moves through the
//! system: data sources feed pipelines, pipelines derive outputs, rollback
//! creates derivation loops. The graph keeps two adjacency maps (upstream
//! and downstream) consistent with the edge set at all times: for every
//! edge `(s, t)`, `downstream[s]` contains `t` and `upstream[t]` contains
//! `s`, and removing the edge removes both entries.
//!
//! The graph itself is a plain value; the application root wraps it in a
//! reader-writer lock (many readers, exclusive writer).

mod graph;

pub use graph::{
    Direction, FieldLineage, ImpactAnalysis, LineageEdge, LineageEdgeMeta, LineageEdgeType,
    LineageGraph, LineageNode, LineageNodeType, LineageQuery, LineageSubgraph, SubgraphMeta,
};
