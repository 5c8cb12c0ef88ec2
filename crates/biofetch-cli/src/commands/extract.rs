use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use biofetch_core::{BatchExtractor, ClientFactory, ExtractionConfig};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::cli::ExtractArgs;
use crate::commands::CommandResult;
use crate::error::CliError;

pub async fn run(args: &ExtractArgs, mut config: ExtractionConfig) -> Result<CommandResult, CliError> {
    let mut ids = args.ids.clone();
    if let Some(path) = &args.ids_file {
        ids.extend(read_ids_file(path)?);
    }
    if ids.is_empty() {
        return Err(CliError::NoIdentifiers);
    }

    if args.no_cache {
        config.cache.enabled = false;
    }
    let id_field = config.id_field.clone();

    let factory = ClientFactory::from_http(&config.http);
    let extractor = BatchExtractor::from_config(config, &factory)?;

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; stopping after the current batch");
                cancel.cancel();
            }
        })
    };
    let deadline = args
        .deadline_secs
        .map(|seconds| Instant::now() + Duration::from_secs(seconds));

    let result = extractor.extract_until(ids, &cancel, deadline).await;
    watcher.abort();
    factory.shutdown();

    let invalid: Vec<Value> = result
        .invalid
        .iter()
        .map(|invalid| json!({"raw": invalid.raw, "error": invalid.error.to_string()}))
        .collect();
    let degraded = result.stats.fallback > 0 || result.stats.cancelled || !invalid.is_empty();

    let data = json!({
        "run_id": result.run_id.to_string(),
        "records": result.rows(&id_field),
        "invalid": invalid,
        "stats": serde_json::to_value(&result.stats)?,
    });
    Ok(CommandResult::ok(data).with_degraded(degraded))
}

fn read_ids_file(path: &Path) -> Result<Vec<String>, CliError> {
    let text = fs::read_to_string(path).map_err(|source| CliError::Input {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_ids(&text))
}

fn parse_ids(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_file_skips_blank_lines_and_comments() {
        let text = "# molecules\nCHEMBL25\n\n  CHEMBL2  \n# done\n";
        assert_eq!(parse_ids(text), vec!["CHEMBL25", "CHEMBL2"]);
    }

    #[test]
    fn unreadable_ids_file_is_an_input_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = read_ids_file(&dir.path().join("missing.txt")).expect_err("missing file");
        assert_eq!(error.exit_code(), 2);
    }
}
