//! # Sandboxed Script Execution
//!
//! User-supplied scripts run inside an embedded rhai interpreter with an
//! explicit capability surface and hard limits:
//!
//! - a logger (`log_info` / `log_warn`),
//! - date and math helpers (`now_iso`, `timestamp_ms`),
//! - a bounded sleep (`sleep_ms`, clamped to 5 000 ms),
//! - an HTTP `fetch(url)` that is either mocked by configuration or backed
//!   by a blocking reqwest call with the provider timeout,
//! - the variables the caller pushed into the scope.
//!
//! There are no other globals: scripts cannot touch the filesystem, spawn
//! processes or import modules. An operation cap plus a wall-clock budget
//! (checked from `on_progress`, which also observes the cancellation
//! token) bound runaway scripts.

use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, Scope};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dataforge_core::record::{records_from_value, Record};
use dataforge_core::{DataForgeError, Result};

/// Hard ceiling for `sleep_ms`.
const MAX_SLEEP_MS: u64 = 5_000;

/// Default wall-clock budget for one script run.
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(30);

const MAX_OPERATIONS: u64 = 5_000_000;

#[derive(Debug, Clone)]
pub struct ScriptOptions {
    /// Wall-clock budget for the whole run.
    pub budget: Duration,
    /// Variables exposed to the script by name.
    pub variables: Vec<(String, Value)>,
    /// Canned `fetch` responses keyed by URL; when set, no network I/O
    /// happens at all.
    pub fetch_mock: Option<Value>,
    /// Timeout for real `fetch` calls.
    pub fetch_timeout: Duration,
    /// Permit real HTTP from the script. Off by default.
    pub allow_fetch: bool,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        ScriptOptions {
            budget: DEFAULT_BUDGET,
            variables: Vec::new(),
            fetch_mock: None,
            fetch_timeout: Duration::from_secs(30),
            allow_fetch: false,
        }
    }
}

/// Run a script and normalize its return value into a record batch.
///
/// The script must evaluate to a map or an array of maps; any other result
/// is a `ValidationError`. Blocking work happens on the caller's thread;
/// use [`run_records_blocking`] from async contexts.
pub fn eval_records(
    source: &str,
    options: &ScriptOptions,
    cancel: &CancellationToken,
) -> Result<Vec<Record>> {
    let value = eval_value(source, options, cancel)?;
    records_from_value(value)
}

/// [`eval_records`] hoisted onto the blocking pool for async callers.
pub async fn run_records_blocking(
    source: String,
    options: ScriptOptions,
    cancel: CancellationToken,
) -> Result<Vec<Record>> {
    tokio::task::spawn_blocking(move || eval_records(&source, &options, &cancel))
        .await
        .map_err(|e| DataForgeError::ScriptError {
            message: format!("script worker panicked: {}", e),
        })?
}

/// Evaluate a script to a raw JSON value.
pub fn eval_value(
    source: &str,
    options: &ScriptOptions,
    cancel: &CancellationToken,
) -> Result<Value> {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_call_levels(64);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_string_size(4 * 1024 * 1024);
    engine.set_max_array_size(1_000_000);
    engine.set_max_map_size(100_000);

    let started = Instant::now();
    let budget = options.budget;
    let progress_cancel = cancel.clone();
    engine.on_progress(move |_| {
        if started.elapsed() > budget {
            Some("wall-clock budget exhausted".into())
        } else if progress_cancel.is_cancelled() {
            Some("cancelled".into())
        } else {
            None
        }
    });

    register_capabilities(&mut engine, options)?;

    let mut scope = Scope::new();
    for (name, value) in &options.variables {
        let dynamic = rhai::serde::to_dynamic(value).map_err(script_error)?;
        scope.push_dynamic(name.as_str(), dynamic);
    }

    let result: Dynamic = engine
        .eval_with_scope(&mut scope, source)
        .map_err(|e| map_eval_error(*e, cancel))?;

    rhai::serde::from_dynamic::<Value>(&result).map_err(|e| DataForgeError::ValidationError {
        message: format!("script returned a non-JSON value: {}", e),
    })
}

fn register_capabilities(engine: &mut Engine, options: &ScriptOptions) -> Result<()> {
    engine.register_fn("log_info", |message: &str| {
        info!(target: "dataforge::script", "{}", message);
    });
    engine.register_fn("log_warn", |message: &str| {
        warn!(target: "dataforge::script", "{}", message);
    });
    engine.register_fn("now_iso", || chrono::Utc::now().to_rfc3339());
    engine.register_fn("timestamp_ms", || chrono::Utc::now().timestamp_millis());
    engine.register_fn("sleep_ms", |ms: i64| {
        let ms = ms.clamp(0, MAX_SLEEP_MS as i64) as u64;
        std::thread::sleep(Duration::from_millis(ms));
    });

    let fetch_mock = options.fetch_mock.clone();
    let allow_fetch = options.allow_fetch;
    let fetch_timeout = options.fetch_timeout;
    engine.register_fn(
        "fetch",
        move |url: &str| -> std::result::Result<Dynamic, Box<rhai::EvalAltResult>> {
            if let Some(mock) = &fetch_mock {
                // Either a map of url → response, or one canned response.
                let response = match mock {
                    Value::Object(map) if map.contains_key(url) => map[url].clone(),
                    other => other.clone(),
                };
                return rhai::serde::to_dynamic(&response)
                    .map_err(|e| e.to_string().into());
            }
            if !allow_fetch {
                return Err("fetch is not enabled for this source".into());
            }
            let response: Value = reqwest::blocking::Client::builder()
                .timeout(fetch_timeout)
                .build()
                .map_err(|e| e.to_string())?
                .get(url)
                .send()
                .map_err(|e| e.to_string())?
                .json()
                .map_err(|e| e.to_string())?;
            rhai::serde::to_dynamic(&response).map_err(|e| e.to_string().into())
        },
    );
    Ok(())
}

fn map_eval_error(error: rhai::EvalAltResult, cancel: &CancellationToken) -> DataForgeError {
    if cancel.is_cancelled() {
        return DataForgeError::Cancelled;
    }
    match &error {
        rhai::EvalAltResult::ErrorTerminated(token, _) => {
            if token.to_string().contains("budget") {
                DataForgeError::ScriptError {
                    message: "script exceeded its wall-clock budget".to_string(),
                }
            } else {
                DataForgeError::Cancelled
            }
        }
        _ => DataForgeError::ScriptError {
            message: error.to_string(),
        },
    }
}

fn script_error(error: Box<rhai::EvalAltResult>) -> DataForgeError {
    DataForgeError::ScriptError {
        message: error.to_string(),
    }
}
