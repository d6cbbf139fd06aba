//! Provider drivers: each turns a data-source configuration into a record
//! batch. Drivers honor the cancellation token at their blocking points
//! and surface typed errors for the taxonomy.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use dataforge_core::models::{DataSourceConfig, ProviderType};
use dataforge_core::record::Record;
use dataforge_core::{DataForgeError, Result};

use super::{api::ApiProvider, file::FileProvider, mock::MockProvider, script::ScriptProvider};

#[async_trait]
pub trait RecordProvider: Send + Sync {
    /// Produce the full record batch for this run.
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<Record>>;

    /// Change-data-capture support; providers without it make `cdc` delta
    /// mode an `UnsupportedFeature`.
    fn supports_cdc(&self) -> bool {
        false
    }
}

/// Resolve the driver for a source. `cloud` is declared in the config
/// surface but not implemented by any local driver.
pub fn resolve(source: &DataSourceConfig, http: &reqwest::Client) -> Result<Box<dyn RecordProvider>> {
    match source.provider_type {
        ProviderType::Csv => Ok(Box::new(FileProvider::csv(&source.config)?)),
        ProviderType::Json => Ok(Box::new(FileProvider::json(&source.config)?)),
        ProviderType::Api => Ok(Box::new(ApiProvider::new(&source.config, http.clone())?)),
        ProviderType::Script => Ok(Box::new(ScriptProvider::new(&source.config)?)),
        ProviderType::Mock => Ok(Box::new(MockProvider::new(&source.config)?)),
        ProviderType::Cloud => Err(DataForgeError::UnsupportedFeature {
            feature: "cloud provider".to_string(),
        }),
    }
}
