//! File provider: delimited files via the csv reader, JSON files as an
//! array of objects (or a single object). Parse failures surface as
//! `InvalidFileFormat`.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use dataforge_core::record::{records_from_value, Record};
use dataforge_core::{DataForgeError, Result};

use super::provider::RecordProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Delimited,
    Json,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    path: PathBuf,
    #[serde(default = "default_delimiter")]
    delimiter: char,
    #[serde(default = "default_true")]
    has_headers: bool,
    /// Parse numeric/boolean-looking delimited cells into typed values.
    #[serde(default = "default_true")]
    infer_types: bool,
}

fn default_delimiter() -> char {
    ','
}

fn default_true() -> bool {
    true
}

pub struct FileProvider {
    config: FileConfig,
    format: FileFormat,
}

impl FileProvider {
    pub fn csv(config: &Value) -> Result<Self> {
        Ok(FileProvider {
            config: parse_config(config)?,
            format: FileFormat::Delimited,
        })
    }

    pub fn json(config: &Value) -> Result<Self> {
        Ok(FileProvider {
            config: parse_config(config)?,
            format: FileFormat::Json,
        })
    }

    fn read_delimited(&self) -> Result<Vec<Record>> {
        let path = &self.config.path;
        let display = path.display().to_string();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.config.delimiter as u8)
            .has_headers(self.config.has_headers)
            .flexible(false)
            .from_path(path)
            .map_err(|e| invalid(&display, e))?;

        let headers: Vec<String> = if self.config.has_headers {
            reader
                .headers()
                .map_err(|e| invalid(&display, e))?
                .iter()
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|e| invalid(&display, e))?;
            let mut record = Map::new();
            for (index, cell) in row.iter().enumerate() {
                let name = headers
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| format!("column_{}", index + 1));
                let value = if self.config.infer_types {
                    sniff(cell)
                } else {
                    Value::String(cell.to_string())
                };
                record.insert(name, value);
            }
            records.push(record);
        }
        Ok(records)
    }

    fn read_json(&self) -> Result<Vec<Record>> {
        let display = self.config.path.display().to_string();
        let text = std::fs::read_to_string(&self.config.path)?;
        let value: Value =
            serde_json::from_str(&text).map_err(|e| invalid(&display, e))?;
        records_from_value(value).map_err(|e| DataForgeError::InvalidFileFormat {
            path: display,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl RecordProvider for FileProvider {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<Record>> {
        if cancel.is_cancelled() {
            return Err(DataForgeError::Cancelled);
        }
        let result = match self.format {
            FileFormat::Delimited => self.read_delimited(),
            FileFormat::Json => self.read_json(),
        };
        if cancel.is_cancelled() {
            return Err(DataForgeError::Cancelled);
        }
        result
    }
}

fn parse_config(config: &Value) -> Result<FileConfig> {
    serde_json::from_value(config.clone()).map_err(|e| DataForgeError::ValidationError {
        message: format!("invalid file provider config: {}", e),
    })
}

fn invalid(path: &str, error: impl std::fmt::Display) -> DataForgeError {
    DataForgeError::InvalidFileFormat {
        path: path.to_string(),
        message: error.to_string(),
    }
}

/// Best-effort typing of a delimited cell.
fn sniff(cell: &str) -> Value {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    match trimmed {
        "true" | "TRUE" | "True" => Value::Bool(true),
        "false" | "FALSE" | "False" => Value::Bool(false),
        _ => Value::String(cell.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    async fn fetch(provider: FileProvider) -> Result<Vec<Record>> {
        provider.fetch(&CancellationToken::new()).await
    }

    #[tokio::test]
    async fn reads_delimited_with_headers() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "id,name,score").unwrap();
        writeln!(file, "1,ada,9.5").unwrap();
        writeln!(file, "2,grace,").unwrap();
        file.flush().unwrap();

        let provider = FileProvider::csv(&json!({"path": file.path()})).unwrap();
        let records = fetch(provider).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["id"], json!(1));
        assert_eq!(records[0]["name"], json!("ada"));
        assert_eq!(records[0]["score"], json!(9.5));
        assert_eq!(records[1]["score"], Value::Null);
    }

    #[tokio::test]
    async fn semicolon_delimiter_and_no_type_inference() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "a;b").unwrap();
        writeln!(file, "1;x").unwrap();
        file.flush().unwrap();

        let provider = FileProvider::csv(&json!({
            "path": file.path(),
            "delimiter": ";",
            "infer_types": false
        }))
        .unwrap();
        let records = fetch(provider).await.unwrap();
        assert_eq!(records[0]["a"], json!("1"));
    }

    #[tokio::test]
    async fn ragged_rows_are_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "a,b").unwrap();
        writeln!(file, "1,2,3").unwrap();
        file.flush().unwrap();

        let provider = FileProvider::csv(&json!({"path": file.path()})).unwrap();
        let err = fetch(provider).await.unwrap_err();
        assert!(matches!(err, DataForgeError::InvalidFileFormat { .. }));
    }

    #[tokio::test]
    async fn reads_json_array() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"[{{"id": 1}}, {{"id": 2}}]"#).unwrap();
        file.flush().unwrap();

        let provider = FileProvider::json(&json!({"path": file.path()})).unwrap();
        let records = fetch(provider).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn malformed_json_is_invalid_file_format() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        file.flush().unwrap();

        let provider = FileProvider::json(&json!({"path": file.path()})).unwrap();
        let err = fetch(provider).await.unwrap_err();
        assert!(matches!(err, DataForgeError::InvalidFileFormat { .. }));
    }
}
