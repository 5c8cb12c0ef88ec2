use biofetch_core::{build_cache, ExtractionConfig};
use serde_json::json;

use crate::commands::CommandResult;
use crate::error::CliError;

pub fn clear(config: &ExtractionConfig) -> Result<CommandResult, CliError> {
    let Some(cache) = build_cache(&config.cache, &config.identity) else {
        return Ok(CommandResult::ok(json!({
            "cleared": false,
            "reason": "cache is disabled",
        })));
    };

    let entries = cache.len();
    cache.clear()?;
    tracing::info!(backend = cache.name(), entries, "cache cleared");

    Ok(CommandResult::ok(json!({
        "cleared": true,
        "backend": cache.name(),
        "entries_removed": entries,
        "directory": config
            .identity
            .directory(&config.cache.root_directory())
            .display()
            .to_string(),
    })))
}
