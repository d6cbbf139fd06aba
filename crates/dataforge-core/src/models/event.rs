//! Events emitted by the engines and consumed by the webhook dispatcher
//! and event-triggered jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "pipeline.start")]
    PipelineStart,
    #[serde(rename = "pipeline.success")]
    PipelineSuccess,
    #[serde(rename = "pipeline.failure")]
    PipelineFailure,
    #[serde(rename = "pipeline.complete")]
    PipelineComplete,
    #[serde(rename = "ingest.start")]
    IngestStart,
    #[serde(rename = "ingest.success")]
    IngestSuccess,
    #[serde(rename = "ingest.failure")]
    IngestFailure,
    #[serde(rename = "job.scheduled")]
    JobScheduled,
    #[serde(rename = "job.missed")]
    JobMissed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::PipelineStart => "pipeline.start",
            EventType::PipelineSuccess => "pipeline.success",
            EventType::PipelineFailure => "pipeline.failure",
            EventType::PipelineComplete => "pipeline.complete",
            EventType::IngestStart => "ingest.start",
            EventType::IngestSuccess => "ingest.success",
            EventType::IngestFailure => "ingest.failure",
            EventType::JobScheduled => "job.scheduled",
            EventType::JobMissed => "job.missed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event on the internal stream. Ordering is guaranteed per source
/// (`data_source_id`/`pipeline_id`); cross-source order is not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event_type: EventType) -> Self {
        EngineEvent {
            event_type,
            project_id: None,
            data_source_id: None,
            pipeline_id: None,
            job_id: None,
            execution_id: None,
            payload: Value::Null,
            emitted_at: Utc::now(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_data_source(mut self, data_source_id: impl Into<String>) -> Self {
        self.data_source_id = Some(data_source_id.into());
        self
    }

    pub fn with_pipeline(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names() {
        assert_eq!(
            serde_json::to_value(EventType::PipelineStart).unwrap(),
            "pipeline.start"
        );
        let t: EventType = serde_json::from_str("\"job.missed\"").unwrap();
        assert_eq!(t, EventType::JobMissed);
        assert_eq!(EventType::IngestSuccess.to_string(), "ingest.success");
    }
}
