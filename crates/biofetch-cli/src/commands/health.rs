use biofetch_core::{ClientFactory, ExtractionConfig, ProbeOutcome};
use serde_json::{json, Value};

use crate::cli::HealthArgs;
use crate::commands::CommandResult;
use crate::error::CliError;

pub async fn run(args: &HealthArgs, config: &ExtractionConfig) -> Result<CommandResult, CliError> {
    let factory = ClientFactory::from_http(&config.http);
    let client = factory.client_for(config)?;

    let path = args
        .path
        .clone()
        .unwrap_or_else(|| format!("/{}", config.endpoint.trim_start_matches('/')));
    let params = vec![(String::from("limit"), String::from("1"))];

    let outcome = client.probe(&path, &params).await;
    factory.shutdown();

    let mut data = json!({
        "source": client.source().as_str(),
        "url": client.resolver().absolute(&path),
        "status": outcome.as_str(),
        "circuit": client.breaker().state(),
    });
    if let Value::Object(fields) = &mut data {
        match &outcome {
            ProbeOutcome::Healthy { status, latency } => {
                fields.insert(String::from("http_status"), json!(status));
                fields.insert(
                    String::from("latency_ms"),
                    json!(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX)),
                );
            }
            ProbeOutcome::RateLimited { retry_after } => {
                fields.insert(
                    String::from("retry_after_ms"),
                    json!(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX)),
                );
            }
            ProbeOutcome::Failed(error) => {
                fields.insert(String::from("error_type"), json!(error.kind()));
                fields.insert(String::from("error"), json!(error.to_string()));
            }
            ProbeOutcome::CircuitOpen => {}
        }
    }

    Ok(CommandResult::ok(data).with_degraded(!outcome.is_healthy()))
}
