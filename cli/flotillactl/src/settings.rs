//! Worker settings from command-line flags.

use flotilla_reconcile::WorkerConfig;
use serde_json::Value;

use crate::error::CliError;

/// Build worker settings from `--config` and `--set` flags.
///
/// `--config` supplies a base JSON object; each `KEY=VALUE` then overrides a
/// single key. VALUE is parsed as JSON, falling back to a plain string, so
/// `count=3` is a number and `output=o1` is a string.
pub fn build_config(base: Option<&str>, sets: &[String]) -> Result<WorkerConfig, CliError> {
    let mut config = match base {
        None => WorkerConfig::new(),
        Some(text) => match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => map,
            _ => return Err(CliError::ConfigNotObject),
        },
    };

    for entry in sets {
        let Some((key, raw)) = entry.split_once('=') else {
            return Err(CliError::InvalidSetting(entry.clone()));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(CliError::InvalidSetting(entry.clone()));
        }

        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        config.insert(key.to_string(), value);
    }

    Ok(config)
}
