//! Mock provider: deterministic record batches for tests and demos.
//! Either a literal `records` array or a generated `rows` count.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use dataforge_core::record::{records_from_value, Record};
use dataforge_core::{DataForgeError, Result};

use super::provider::RecordProvider;

#[derive(Debug, Deserialize)]
struct MockConfig {
    #[serde(default)]
    records: Option<Value>,
    #[serde(default)]
    rows: Option<usize>,
    /// Extra constant fields stamped onto generated rows.
    #[serde(default)]
    template: Option<Map<String, Value>>,
}

pub struct MockProvider {
    config: MockConfig,
}

impl MockProvider {
    pub fn new(config: &Value) -> Result<Self> {
        let config: MockConfig =
            serde_json::from_value(config.clone()).map_err(|e| DataForgeError::ValidationError {
                message: format!("invalid mock provider config: {}", e),
            })?;
        Ok(MockProvider { config })
    }
}

#[async_trait]
impl RecordProvider for MockProvider {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<Record>> {
        if cancel.is_cancelled() {
            return Err(DataForgeError::Cancelled);
        }
        if let Some(records) = &self.config.records {
            return records_from_value(records.clone());
        }
        let rows = self.config.rows.unwrap_or(0);
        let mut out = Vec::with_capacity(rows);
        for i in 0..rows {
            let mut record = self.config.template.clone().unwrap_or_default();
            record.insert("id".to_string(), json!(i as i64 + 1));
            record
                .entry("value".to_string())
                .or_insert_with(|| json!(format!("row-{}", i + 1)));
            out.push(record);
        }
        Ok(out)
    }
}
