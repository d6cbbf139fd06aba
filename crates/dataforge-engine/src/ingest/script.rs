//! Script provider: runs user code in the rhai sandbox (see
//! [`crate::script`]) and treats its return value as the record batch.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use dataforge_core::record::Record;
use dataforge_core::{DataForgeError, Result};

use super::provider::RecordProvider;
use crate::script::{self, ScriptOptions};

#[derive(Debug, Deserialize)]
struct ScriptConfig {
    source: String,
    /// Variables pushed into the script scope.
    #[serde(default)]
    variables: Value,
    /// Canned responses for the script's `fetch` capability.
    #[serde(default)]
    fetch_mock: Option<Value>,
    /// Allow real HTTP from `fetch`.
    #[serde(default)]
    allow_fetch: bool,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

pub struct ScriptProvider {
    config: ScriptConfig,
}

impl ScriptProvider {
    pub fn new(config: &Value) -> Result<Self> {
        let config: ScriptConfig =
            serde_json::from_value(config.clone()).map_err(|e| DataForgeError::ValidationError {
                message: format!("invalid script provider config: {}", e),
            })?;
        Ok(ScriptProvider { config })
    }
}

#[async_trait]
impl RecordProvider for ScriptProvider {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<Record>> {
        let variables = match &self.config.variables {
            Value::Null => Vec::new(),
            Value::Object(map) => map
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            other => {
                return Err(DataForgeError::ValidationError {
                    message: format!("script variables must be an object, got {}", other),
                })
            }
        };
        let options = ScriptOptions {
            budget: Duration::from_secs(self.config.timeout_secs),
            variables,
            fetch_mock: self.config.fetch_mock.clone(),
            fetch_timeout: Duration::from_secs(self.config.timeout_secs),
            allow_fetch: self.config.allow_fetch,
        };
        script::run_records_blocking(self.config.source.clone(), options, cancel.clone()).await
    }
}
