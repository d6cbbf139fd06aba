//! Pipeline execution scenarios: the full source → transform → output
//! path, failure with pre-pipeline rollback, continue-on-error branches
//! and merge/diff nodes.

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use dataforge_core::models::{
    NodeKind, NodeStatus, PipelineEdge, PipelineNode, PipelineRunStatus, ProviderType,
    RollbackPointStatus, RollbackPointType,
};
use dataforge_core::record::records_from_value;
use dataforge_engine::app::CreateDataSource;
use dataforge_engine::{AppSettings, DataForge};

fn node(id: &str, kind: NodeKind, config: Value) -> PipelineNode {
    PipelineNode {
        id: id.to_string(),
        name: id.to_string(),
        kind,
        config,
        status: NodeStatus::Idle,
        last_run: None,
        last_duration_ms: None,
        rows_processed: None,
        version: 0,
    }
}

fn edge(id: &str, source: &str, target: &str) -> PipelineEdge {
    PipelineEdge {
        id: id.to_string(),
        source: source.to_string(),
        target: target.to_string(),
        source_port: None,
        target_port: None,
    }
}

struct Fixture {
    forge: DataForge,
    project_id: String,
    d1: String,
    d2: String,
}

async fn fixture(dir: &TempDir) -> Fixture {
    let forge = DataForge::open(AppSettings::new(dir.path())).unwrap();
    let project = forge.create_project("p", None).unwrap();
    let d1 = forge
        .create_data_source(
            &project.id,
            CreateDataSource::new("d1", ProviderType::Mock, json!({})),
        )
        .unwrap();
    let d2 = forge
        .create_data_source(
            &project.id,
            CreateDataSource::new("d2", ProviderType::Mock, json!({})),
        )
        .unwrap();
    forge
        .import(
            &project.id,
            &d1.id,
            records_from_value(json!([
                {"id": 1, "v": 10},
                {"id": 2, "v": 20}
            ]))
            .unwrap(),
            None,
            None,
        )
        .unwrap();
    Fixture {
        forge,
        project_id: project.id,
        d1: d1.id,
        d2: d2.id,
    }
}

#[tokio::test]
async fn source_transform_output_writes_target() {
    let dir = TempDir::new().unwrap();
    let fx = fixture(&dir).await;

    let pipeline = fx
        .forge
        .create_pipeline(
            &fx.project_id,
            "copy",
            vec![
                node("src", NodeKind::Source, json!({"data_source_id": fx.d1})),
                node(
                    "double",
                    NodeKind::Transform,
                    json!({"transforms": [
                        {"op": "set", "field": "doubled", "value": true}
                    ]}),
                ),
                node(
                    "out",
                    NodeKind::Output,
                    json!({"destination": {"type": "data_source", "data_source_id": fx.d2}}),
                ),
            ],
            vec![edge("e1", "src", "double"), edge("e2", "double", "out")],
            false,
        )
        .unwrap();

    let report = fx
        .forge
        .execute_pipeline_inline(&pipeline.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, PipelineRunStatus::Success);

    let records = fx.forge.version_records(&fx.project_id, &fx.d2, 1).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["doubled"], json!(true));

    // Node statuses were persisted back.
    let stored = fx.forge.get_pipeline(&pipeline.id).unwrap();
    assert!(stored
        .nodes
        .iter()
        .all(|n| n.status == NodeStatus::Success && n.last_run.is_some()));
}

#[tokio::test]
async fn failing_transform_leaves_target_untouched() {
    // Failure at the transform: the output never runs, the target gets no
    // version, and the recorded pre-pipeline point restores as a no-op.
    let dir = TempDir::new().unwrap();
    let fx = fixture(&dir).await;

    let pipeline = fx
        .forge
        .create_pipeline(
            &fx.project_id,
            "boom",
            vec![
                node("src", NodeKind::Source, json!({"data_source_id": fx.d1})),
                node(
                    "bad",
                    NodeKind::Transform,
                    json!({"transforms": [{"op": "script", "source": "throw \"nope\";"}]}),
                ),
                node(
                    "out",
                    NodeKind::Output,
                    json!({"destination": {"type": "data_source", "data_source_id": fx.d2}}),
                ),
            ],
            vec![edge("e1", "src", "bad"), edge("e2", "bad", "out")],
            false,
        )
        .unwrap();

    let report = fx
        .forge
        .execute_pipeline_inline(&pipeline.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, PipelineRunStatus::Failed);
    assert!(fx
        .forge
        .list_versions(&fx.project_id, &fx.d2, None)
        .unwrap()
        .is_empty());

    let stored = fx.forge.get_pipeline(&pipeline.id).unwrap();
    assert_eq!(stored.node("bad").unwrap().status, NodeStatus::Error);
    assert_eq!(stored.node("out").unwrap().status, NodeStatus::Idle);

    // The pre-pipeline point exists and can be restored explicitly as a
    // no-op.
    let points = fx
        .forge
        .list_rollback_points(Some(&fx.project_id), Some(RollbackPointType::PrePipeline))
        .unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].status, RollbackPointStatus::Active);
    let restore = fx
        .forge
        .restore_rollback_point(&points[0].id, false)
        .unwrap();
    assert!(restore.actions.is_empty() || restore.actions.iter().all(|a| a.noop));
}

#[tokio::test]
async fn continue_on_error_skips_only_downstream() {
    let dir = TempDir::new().unwrap();
    let fx = fixture(&dir).await;

    let pipeline = fx
        .forge
        .create_pipeline(
            &fx.project_id,
            "branches",
            vec![
                node("src", NodeKind::Source, json!({"data_source_id": fx.d1})),
                node(
                    "bad",
                    NodeKind::Transform,
                    json!({"transforms": [{"op": "script", "source": "throw \"nope\";"}]}),
                ),
                node(
                    "bad_out",
                    NodeKind::Output,
                    json!({"destination": {"type": "data_source", "data_source_id": fx.d2}}),
                ),
                node("ok", NodeKind::Transform, json!({"transforms": []})),
            ],
            vec![
                edge("e1", "src", "bad"),
                edge("e2", "bad", "bad_out"),
                edge("e3", "src", "ok"),
            ],
            true,
        )
        .unwrap();

    let report = fx
        .forge
        .execute_pipeline_inline(&pipeline.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, PipelineRunStatus::Partial);

    let stored = fx.forge.get_pipeline(&pipeline.id).unwrap();
    assert_eq!(stored.node("ok").unwrap().status, NodeStatus::Success);
    assert_eq!(stored.node("bad").unwrap().status, NodeStatus::Error);
    // Strictly-downstream of the failure was skipped, not failed.
    assert_eq!(stored.node("bad_out").unwrap().status, NodeStatus::Idle);
}

#[tokio::test]
async fn merge_and_diff_nodes_compose() {
    let dir = TempDir::new().unwrap();
    let fx = fixture(&dir).await;

    // Second input set for the merge.
    fx.forge
        .import(
            &fx.project_id,
            &fx.d2,
            records_from_value(json!([
                {"id": 1, "extra": "x"},
                {"id": 3, "extra": "z"}
            ]))
            .unwrap(),
            None,
            None,
        )
        .unwrap();

    let pipeline = fx
        .forge
        .create_pipeline(
            &fx.project_id,
            "merge-diff",
            vec![
                node("left", NodeKind::Source, json!({"data_source_id": fx.d1})),
                node("right", NodeKind::Source, json!({"data_source_id": fx.d2})),
                node(
                    "joined",
                    NodeKind::Merge,
                    json!({"join_keys": ["id"], "join_type": "outer", "conflict": "prefer_right"}),
                ),
                node(
                    "changes",
                    NodeKind::Diff,
                    json!({"compare_key": "id", "mode": "full"}),
                ),
            ],
            vec![
                PipelineEdge {
                    id: "e1".to_string(),
                    source: "left".to_string(),
                    target: "joined".to_string(),
                    source_port: None,
                    target_port: Some("a".to_string()),
                },
                PipelineEdge {
                    id: "e2".to_string(),
                    source: "right".to_string(),
                    target: "joined".to_string(),
                    source_port: None,
                    target_port: Some("b".to_string()),
                },
                PipelineEdge {
                    id: "e3".to_string(),
                    source: "left".to_string(),
                    target: "changes".to_string(),
                    source_port: None,
                    target_port: Some("left".to_string()),
                },
                PipelineEdge {
                    id: "e4".to_string(),
                    source: "joined".to_string(),
                    target: "changes".to_string(),
                    source_port: None,
                    target_port: Some("right".to_string()),
                },
            ],
            false,
        )
        .unwrap();

    let report = fx
        .forge
        .execute_pipeline_inline(&pipeline.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, PipelineRunStatus::Success);

    let merge_result = report
        .node_results
        .iter()
        .find(|r| r.node_id == "joined")
        .unwrap();
    // Outer join over ids {1,2} ∪ {1,3}.
    assert_eq!(merge_result.rows_processed, 3);

    let diff_result = report
        .node_results
        .iter()
        .find(|r| r.node_id == "changes")
        .unwrap();
    assert!(diff_result.rows_processed >= 3);
}

#[tokio::test]
async fn cyclic_pipelines_are_rejected_at_creation() {
    let dir = TempDir::new().unwrap();
    let fx = fixture(&dir).await;

    let err = fx
        .forge
        .create_pipeline(
            &fx.project_id,
            "loop",
            vec![
                node("a", NodeKind::Transform, json!({"transforms": []})),
                node("b", NodeKind::Transform, json!({"transforms": []})),
            ],
            vec![edge("e1", "a", "b"), edge("e2", "b", "a")],
            false,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        dataforge_core::DataForgeError::CyclicPipeline { .. }
    ));
}

#[tokio::test]
async fn file_export_output_writes_into_exports_dir() {
    let dir = TempDir::new().unwrap();
    let fx = fixture(&dir).await;

    let pipeline = fx
        .forge
        .create_pipeline(
            &fx.project_id,
            "export",
            vec![
                node("src", NodeKind::Source, json!({"data_source_id": fx.d1})),
                node(
                    "out",
                    NodeKind::Output,
                    json!({"destination": {"type": "file", "format": "json", "name": "snapshot"}}),
                ),
            ],
            vec![edge("e1", "src", "out")],
            false,
        )
        .unwrap();

    let report = fx
        .forge
        .execute_pipeline_inline(&pipeline.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, PipelineRunStatus::Success);

    let exported = dir.path().join("exports").join("snapshot.json");
    assert!(exported.exists());
    let body: Value = serde_json::from_str(&std::fs::read_to_string(exported).unwrap()).unwrap();
    assert_eq!(body.as_array().unwrap().len(), 2);
}
