//! # Pipeline Engine
//!
//! Executes a pipeline: a DAG of typed nodes (`source`, `transform`,
//! `merge`, `diff`, `output`) connected by port edges.
//!
//! 1. Topological sort; cycles are rejected with `CyclicPipeline`.
//! 2. A `pre-pipeline` rollback point referencing the current latest
//!    version of every data source any `output` node targets is persisted
//!    before the first execution step.
//! 3. Nodes run in topological order (sequential walk). Each transitions
//!    `idle → running → success|error|warning`, records `last_run`,
//!    duration and row counts, and the updated statuses are persisted
//!    back after the run.
//! 4. On node error with `continue_on_error = false`, downstream nodes are
//!    reset to idle, the run fails, and the rollback point is restored if
//!    any output already wrote. With `continue_on_error = true`, only the
//!    strictly-downstream nodes are skipped and the run finishes
//!    `partial`.
//!
//! Lineage edges are registered for every executed edge; start / success /
//! failure / complete events fire around the run.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dataforge_core::lineage::{LineageEdgeMeta, LineageEdgeType, LineageNode, LineageNodeType};
use dataforge_core::models::{
    EngineEvent, EventType, NodeKind, NodeStatus, Pipeline, PipelineRunStatus, RollbackPointType,
};
use dataforge_core::record::Record;
use dataforge_core::{DataForgeError, Result};

pub mod node_exec;

use crate::events::EngineContext;
use crate::ingest::IngestionEngine;
use crate::rollback::RollbackManager;
use node_exec::{
    DiffNodeConfig, MergeNodeConfig, OutputDestination, OutputNodeConfig, SourceNodeConfig,
    TransformNodeConfig,
};

#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeRunResult {
    pub node_id: String,
    pub status: NodeStatus,
    pub rows_processed: i64,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineRunReport {
    pub pipeline_id: String,
    pub status: PipelineRunStatus,
    pub rollback_point_id: String,
    pub node_results: Vec<NodeRunResult>,
    pub duration_ms: i64,
}

pub struct PipelineEngine {
    ctx: EngineContext,
    rollback: std::sync::Arc<RollbackManager>,
    ingestion: std::sync::Arc<IngestionEngine>,
}

impl PipelineEngine {
    pub fn new(
        ctx: EngineContext,
        rollback: std::sync::Arc<RollbackManager>,
        ingestion: std::sync::Arc<IngestionEngine>,
    ) -> Self {
        PipelineEngine {
            ctx,
            rollback,
            ingestion,
        }
    }

    /// Execute a pipeline to completion (or failure/cancellation).
    /// `execution_id` ties the pre-pipeline rollback point to the
    /// scheduler execution for later `rollback_failed_pipeline` calls.
    pub async fn execute(
        &self,
        pipeline_id: &str,
        execution_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PipelineRunReport> {
        let mut pipeline = self.ctx.core.get_pipeline(pipeline_id)?;
        let order = topo_sort(&pipeline)?;

        // Pre-pipeline rollback point, persisted before any node runs.
        let output_targets = output_target_sources(&pipeline)?;
        let point = self.rollback.create_point(
            &pipeline.project_id,
            &output_targets,
            RollbackPointType::PrePipeline,
            Some(chrono::Duration::days(7)),
            json!({
                "pipeline_id": pipeline.id,
                "execution_id": execution_id,
            }),
        )?;

        self.ctx.emit(
            EngineEvent::new(EventType::PipelineStart)
                .with_project(pipeline.project_id.clone())
                .with_pipeline(pipeline.id.clone())
                .with_payload(json!({"name": pipeline.name, "nodes": pipeline.nodes.len()})),
        );

        // Reset node state from any previous run.
        for node in &mut pipeline.nodes {
            node.status = NodeStatus::Idle;
        }

        let started = Instant::now();
        let run = self
            .run_nodes(&mut pipeline, &order, &point.id, cancel)
            .await;
        let duration_ms = started.elapsed().as_millis() as i64;

        // Persist node statuses regardless of outcome.
        pipeline.updated_at = Utc::now();
        self.ctx.core.update_pipeline(&pipeline)?;

        let (status, node_results) = run?;
        let event_type = match status {
            PipelineRunStatus::Success | PipelineRunStatus::Partial => EventType::PipelineSuccess,
            PipelineRunStatus::Failed | PipelineRunStatus::Cancelled => EventType::PipelineFailure,
        };
        self.ctx.emit(
            EngineEvent::new(event_type)
                .with_project(pipeline.project_id.clone())
                .with_pipeline(pipeline.id.clone())
                .with_payload(json!({"status": status, "duration_ms": duration_ms})),
        );
        self.ctx.emit(
            EngineEvent::new(EventType::PipelineComplete)
                .with_project(pipeline.project_id.clone())
                .with_pipeline(pipeline.id.clone())
                .with_payload(json!({"status": status})),
        );

        info!(pipeline_id, ?status, duration_ms, "pipeline finished");
        Ok(PipelineRunReport {
            pipeline_id: pipeline_id.to_string(),
            status,
            rollback_point_id: point.id,
            node_results,
            duration_ms,
        })
    }

    async fn run_nodes(
        &self,
        pipeline: &mut Pipeline,
        order: &[String],
        point_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(PipelineRunStatus, Vec<NodeRunResult>)> {
        let mut outputs: HashMap<String, Vec<Record>> = HashMap::new();
        let mut results: Vec<NodeRunResult> = Vec::new();
        let mut skipped: HashSet<String> = HashSet::new();
        let mut any_error = false;
        let mut wrote_output = false;

        for node_id in order {
            if cancel.is_cancelled() {
                return Ok((PipelineRunStatus::Cancelled, results));
            }
            if skipped.contains(node_id) {
                continue;
            }

            set_status(pipeline, node_id, NodeStatus::Running);
            let node_started = Instant::now();
            let inputs = resolve_inputs(pipeline, node_id, &outputs);
            let outcome = self
                .run_node(pipeline, node_id, inputs, cancel, &mut wrote_output)
                .await;
            let node_duration = node_started.elapsed().as_millis() as i64;

            match outcome {
                Ok(records) => {
                    let rows = records.len() as i64;
                    outputs.insert(node_id.clone(), records);
                    finish_node(pipeline, node_id, NodeStatus::Success, rows, node_duration);
                    results.push(NodeRunResult {
                        node_id: node_id.clone(),
                        status: NodeStatus::Success,
                        rows_processed: rows,
                        duration_ms: node_duration,
                        error: None,
                    });
                    self.record_edge_lineage(pipeline, node_id, rows);
                }
                Err(error) => {
                    any_error = true;
                    finish_node(pipeline, node_id, NodeStatus::Error, 0, node_duration);
                    results.push(NodeRunResult {
                        node_id: node_id.clone(),
                        status: NodeStatus::Error,
                        rows_processed: 0,
                        duration_ms: node_duration,
                        error: Some(error.to_string()),
                    });
                    warn!(pipeline_id = %pipeline.id, node_id = %node_id, %error, "node failed");

                    let downstream = strictly_downstream(pipeline, node_id);
                    if pipeline.continue_on_error {
                        skipped.extend(downstream);
                    } else {
                        for skipped_id in &downstream {
                            set_status(pipeline, skipped_id, NodeStatus::Idle);
                        }
                        if wrote_output {
                            if let Err(restore_error) = self.rollback.restore(point_id, false) {
                                warn!(%restore_error, "pipeline rollback failed");
                            }
                        }
                        return Ok((PipelineRunStatus::Failed, results));
                    }
                }
            }
        }

        let status = if any_error {
            PipelineRunStatus::Partial
        } else {
            PipelineRunStatus::Success
        };
        Ok((status, results))
    }

    async fn run_node(
        &self,
        pipeline: &Pipeline,
        node_id: &str,
        inputs: Vec<Vec<Record>>,
        cancel: &CancellationToken,
        wrote_output: &mut bool,
    ) -> Result<Vec<Record>> {
        let node = pipeline.node(node_id).ok_or(DataForgeError::NotFound {
            entity: "pipeline node",
            id: node_id.to_string(),
        })?;

        match node.kind {
            NodeKind::Source => {
                let config: SourceNodeConfig = node_exec::decode(node_id, &node.config)?;
                let store = self
                    .ctx
                    .router
                    .open(&pipeline.project_id, &config.data_source_id)?;
                match config.version {
                    Some(version) => store.records_of_version(version),
                    None => match store.get_latest()? {
                        Some(latest) => store.records_of_version(latest.version),
                        None => Ok(Vec::new()),
                    },
                }
            }
            NodeKind::Transform => {
                let config: TransformNodeConfig = node_exec::decode(node_id, &node.config)?;
                let input = single_input(node_id, inputs)?;
                node_exec::run_transform(&config, input, cancel)
            }
            NodeKind::Merge => {
                let config: MergeNodeConfig = node_exec::decode(node_id, &node.config)?;
                node_exec::run_merge(&config, inputs)
            }
            NodeKind::Diff => {
                let config: DiffNodeConfig = node_exec::decode(node_id, &node.config)?;
                let mut inputs = inputs.into_iter();
                let left = inputs.next().ok_or_else(|| missing_input(node_id))?;
                let right = inputs.next().ok_or_else(|| missing_input(node_id))?;
                Ok(node_exec::run_diff(&config, left, right))
            }
            NodeKind::Output => {
                let config: OutputNodeConfig = node_exec::decode(node_id, &node.config)?;
                let input = single_input(node_id, inputs)?;
                if cancel.is_cancelled() {
                    return Err(DataForgeError::Cancelled);
                }
                self.run_output(pipeline, node_id, &config, input, wrote_output)
                    .await
            }
        }
    }

    async fn run_output(
        &self,
        pipeline: &Pipeline,
        node_id: &str,
        config: &OutputNodeConfig,
        input: Vec<Record>,
        wrote_output: &mut bool,
    ) -> Result<Vec<Record>> {
        match &config.destination {
            OutputDestination::DataSource { data_source_id } => {
                let source = self.ctx.core.get_data_source(data_source_id)?;
                let version = self.ingestion.append_records(
                    &source,
                    input.clone(),
                    Some(json!({
                        "origin": "pipeline",
                        "pipeline_id": pipeline.id,
                        "node_id": node_id,
                    })),
                )?;
                *wrote_output = true;
                self.ctx.with_lineage(|graph| {
                    graph.register_node(LineageNode {
                        id: format!("ds:{}", data_source_id),
                        node_type: LineageNodeType::DataSource,
                        name: source.name.clone(),
                        metadata: None,
                    });
                    graph.create_edge(
                        format!("pipe:{}:{}", pipeline.id, node_id),
                        format!("ds:{}", data_source_id),
                        LineageEdgeType::DataFlow,
                        LineageEdgeMeta {
                            record_count: Some(input.len() as i64),
                            transformation_type: Some("output".to_string()),
                            executed_at: Some(Utc::now()),
                        },
                    );
                });
                info!(
                    pipeline_id = %pipeline.id,
                    node_id,
                    data_source_id,
                    version = version.version,
                    "output node wrote a new version"
                );
            }
            OutputDestination::File { format, name } => {
                let export_id = name
                    .clone()
                    .unwrap_or_else(|| dataforge_core::models::entity_id("exp"));
                let path = self.export_path(&export_id, *format)?;
                write_export(&path, *format, &input)?;
                info!(pipeline_id = %pipeline.id, node_id, path = %path.display(), "exported records");
            }
            OutputDestination::Webhook { url } => {
                let response = reqwest::Client::new()
                    .post(url)
                    .json(&input)
                    .timeout(std::time::Duration::from_secs(30))
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(DataForgeError::ApiError {
                        message: format!(
                            "output webhook {} returned {}",
                            url,
                            response.status()
                        ),
                    });
                }
            }
        }
        Ok(input)
    }

    fn export_path(
        &self,
        export_id: &str,
        format: node_exec::ExportFormat,
    ) -> Result<std::path::PathBuf> {
        let dir = self.ctx.router.root().join("exports");
        std::fs::create_dir_all(&dir)?;
        let ext = match format {
            node_exec::ExportFormat::Json => "json",
            node_exec::ExportFormat::Csv => "csv",
        };
        Ok(dir.join(format!("{}.{}", export_id, ext)))
    }

    fn record_edge_lineage(&self, pipeline: &Pipeline, node_id: &str, rows: i64) {
        let Some(node) = pipeline.node(node_id) else {
            return;
        };
        self.ctx.with_lineage(|graph| {
            graph.register_node(LineageNode {
                id: format!("pipe:{}:{}", pipeline.id, node_id),
                node_type: match node.kind {
                    NodeKind::Source | NodeKind::Output => LineageNodeType::Pipeline,
                    _ => LineageNodeType::Transformation,
                },
                name: format!("{}/{}", pipeline.name, node.name),
                metadata: Some(json!({"kind": node.kind})),
            });
            for edge in pipeline.edges.iter().filter(|edge| edge.target == node_id) {
                graph.create_edge(
                    format!("pipe:{}:{}", pipeline.id, edge.source),
                    format!("pipe:{}:{}", pipeline.id, edge.target),
                    LineageEdgeType::DataFlow,
                    LineageEdgeMeta {
                        record_count: Some(rows),
                        transformation_type: None,
                        executed_at: Some(Utc::now()),
                    },
                );
            }
            // Source nodes also link the data source into the pipeline.
            if node.kind == NodeKind::Source {
                if let Ok(config) =
                    node_exec::decode::<SourceNodeConfig>(node_id, &node.config)
                {
                    graph.create_edge(
                        format!("ds:{}", config.data_source_id),
                        format!("pipe:{}:{}", pipeline.id, node_id),
                        LineageEdgeType::DataFlow,
                        LineageEdgeMeta {
                            record_count: Some(rows),
                            transformation_type: None,
                            executed_at: Some(Utc::now()),
                        },
                    );
                }
            }
        });
    }
}

/// Kahn's algorithm over the node graph. Ties resolve in declaration
/// order, so runs are deterministic.
pub fn topo_sort(pipeline: &Pipeline) -> Result<Vec<String>> {
    let ids: Vec<&str> = pipeline.nodes.iter().map(|n| n.id.as_str()).collect();
    let known: HashSet<&str> = ids.iter().copied().collect();

    let mut in_degree: HashMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &pipeline.edges {
        if !known.contains(edge.source.as_str()) || !known.contains(edge.target.as_str()) {
            return Err(DataForgeError::ValidationError {
                message: format!(
                    "edge {} references an unknown node",
                    edge.id
                ),
            });
        }
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
        *in_degree.entry(edge.target.as_str()).or_default() += 1;
    }

    let mut ready: VecDeque<&str> = ids
        .iter()
        .copied()
        .filter(|id| in_degree[id] == 0)
        .collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some(id) = ready.pop_front() {
        order.push(id.to_string());
        for &next in adjacency.get(id).into_iter().flatten() {
            let degree = in_degree.get_mut(next).ok_or_else(|| {
                DataForgeError::ProcessingError {
                    message: "inconsistent pipeline graph".to_string(),
                }
            })?;
            *degree -= 1;
            if *degree == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() != ids.len() {
        return Err(DataForgeError::CyclicPipeline {
            pipeline: pipeline.id.clone(),
        });
    }
    Ok(order)
}

/// Data sources written by any output node; these get snapshotted into the
/// pre-pipeline rollback point.
fn output_target_sources(pipeline: &Pipeline) -> Result<Vec<String>> {
    let mut targets = Vec::new();
    for node in &pipeline.nodes {
        if node.kind == NodeKind::Output {
            let config: OutputNodeConfig = node_exec::decode(&node.id, &node.config)?;
            if let OutputDestination::DataSource { data_source_id } = config.destination {
                if !targets.contains(&data_source_id) {
                    targets.push(data_source_id);
                }
            }
        }
    }
    Ok(targets)
}

/// Inputs of a node: upstream outputs ordered by target port name, then
/// edge declaration order. Upstream nodes that produced nothing (skipped
/// branches) contribute nothing.
fn resolve_inputs(
    pipeline: &Pipeline,
    node_id: &str,
    outputs: &HashMap<String, Vec<Record>>,
) -> Vec<Vec<Record>> {
    let mut incoming: Vec<(&Option<String>, usize, &str)> = pipeline
        .edges
        .iter()
        .enumerate()
        .filter(|(_, edge)| edge.target == node_id)
        .map(|(index, edge)| (&edge.target_port, index, edge.source.as_str()))
        .collect();
    incoming.sort_by(|a, b| a.0.cmp(b.0).then(a.1.cmp(&b.1)));
    incoming
        .into_iter()
        .filter_map(|(_, _, source)| outputs.get(source).cloned())
        .collect()
}

fn strictly_downstream(pipeline: &Pipeline, node_id: &str) -> HashSet<String> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &pipeline.edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }
    let mut reached = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(node_id);
    while let Some(current) = queue.pop_front() {
        for &next in adjacency.get(current).into_iter().flatten() {
            if reached.insert(next.to_string()) {
                queue.push_back(next);
            }
        }
    }
    reached
}

fn single_input(node_id: &str, inputs: Vec<Vec<Record>>) -> Result<Vec<Record>> {
    let mut inputs = inputs.into_iter();
    let first = inputs.next().ok_or_else(|| missing_input(node_id))?;
    if inputs.next().is_some() {
        return Err(DataForgeError::ValidationError {
            message: format!("node {} accepts exactly one input", node_id),
        });
    }
    Ok(first)
}

fn missing_input(node_id: &str) -> DataForgeError {
    DataForgeError::ValidationError {
        message: format!("node {} is missing an input", node_id),
    }
}

fn set_status(pipeline: &mut Pipeline, node_id: &str, status: NodeStatus) {
    if let Some(node) = pipeline.node_mut(node_id) {
        node.status = status;
    }
}

fn finish_node(
    pipeline: &mut Pipeline,
    node_id: &str,
    status: NodeStatus,
    rows: i64,
    duration_ms: i64,
) {
    if let Some(node) = pipeline.node_mut(node_id) {
        node.status = status;
        node.last_run = Some(Utc::now());
        node.last_duration_ms = Some(duration_ms);
        node.rows_processed = Some(rows);
    }
}

fn write_export(
    path: &std::path::Path,
    format: node_exec::ExportFormat,
    records: &[Record],
) -> Result<()> {
    match format {
        node_exec::ExportFormat::Json => {
            let body = serde_json::to_string_pretty(
                &records.iter().cloned().map(Value::Object).collect::<Vec<_>>(),
            )?;
            std::fs::write(path, body)?;
        }
        node_exec::ExportFormat::Csv => {
            let mut writer = csv::Writer::from_path(path).map_err(|e| {
                DataForgeError::IoError {
                    message: e.to_string(),
                }
            })?;
            let headers: Vec<String> = records
                .first()
                .map(|record| record.keys().cloned().collect())
                .unwrap_or_default();
            writer
                .write_record(&headers)
                .map_err(|e| DataForgeError::IoError {
                    message: e.to_string(),
                })?;
            for record in records {
                let row: Vec<String> = headers
                    .iter()
                    .map(|header| match record.get(header) {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Null) | None => String::new(),
                        Some(other) => other.to_string(),
                    })
                    .collect();
                writer
                    .write_record(&row)
                    .map_err(|e| DataForgeError::IoError {
                        message: e.to_string(),
                    })?;
            }
            writer.flush()?;
        }
    }
    Ok(())
}
