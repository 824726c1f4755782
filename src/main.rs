use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use agent_judge::config::Config;
use agent_judge::{EvaluationRequest, Orchestrator, PluginRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("agent_judge=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    let settings = Arc::new(
        config
            .load_settings()
            .context("failed to load evaluation settings")?,
    );
    config.print_banner(&settings);

    let input = std::env::args().nth(1);
    let raw = read_input(input.as_deref()).await?;
    let requests: Vec<EvaluationRequest> =
        serde_json::from_str(&raw).context("input must be a JSON array of evaluation requests")?;
    info!(requests = requests.len(), "Loaded evaluation requests");

    let orchestrator = Orchestrator::new(Arc::new(PluginRegistry::with_default_plugins()))
        .with_max_concurrent(config.max_concurrent_evals);
    let results = orchestrator.evaluate_batch(requests, settings).await;

    let mut failures = 0usize;
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(composite) => println!("{}", serde_json::to_string(&composite)?),
            Err(e) => {
                failures += 1;
                error!(index, error = %e, "Evaluation failed");
                println!(
                    "{}",
                    serde_json::json!({ "index": index, "error": e.to_string() })
                );
            }
        }
    }

    if config.render_metrics {
        info!("\n{}", orchestrator.metrics().render_prometheus());
    }
    info!(
        stored = orchestrator.store().len(),
        failures, "Batch complete"
    );
    Ok(())
}

async fn read_input(path: Option<&str>) -> Result<String> {
    match path {
        Some(path) if path != "-" => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path)),
        _ => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .context("failed to read requests from stdin")?;
            Ok(raw)
        }
    }
}
