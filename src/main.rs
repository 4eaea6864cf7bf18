use std::sync::Arc;

use anyhow::{Context, Result};
use model_lifecycle::core::settings::ManagerSettings;
use model_lifecycle::models::{
    BatchMode, ResourceFilter, SimulatedWorker, SimulatedWorkerConfig,
};
use model_lifecycle::AppState;
use serde_json::json;
use tracing::metadata::LevelFilter;
use tracing::{info, warn};

fn setup_logging() {
    let filter = std::env::var("LIFECYCLE_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LevelFilter::INFO);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let settings = ManagerSettings::load()?;
    let worker = SimulatedWorker::new(SimulatedWorkerConfig {
        bytes_per_sec: settings.simulated_bytes_per_sec,
        ..SimulatedWorkerConfig::default()
    });
    let state = AppState::new(settings, Arc::new(worker))?;
    state.start_sweeper();

    if let Some(preset) = std::env::args().nth(1) {
        let outcome = state
            .apply_preset(&preset, BatchMode::Exclusive)
            .await
            .with_context(|| format!("could not apply preset {preset:?}"))?;
        for item in outcome.rejected() {
            warn!(resource = %item.resource_id, kind = ?item.kind, "{:?}", item.result);
        }
        let finished = state
            .poller()
            .wait_all(&outcome.operation_ids(), |snapshot| {
                info!(
                    resource = %snapshot.resource_id,
                    status = ?snapshot.status,
                    progress = snapshot.progress_percentage,
                    eta = ?snapshot.eta_seconds,
                    "operation"
                );
            })
            .await?;
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "batch": outcome,
                "operations": finished,
            }))?
        );
    } else {
        info!("no preset given; available: {}", state.preset_names().join(", "));
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "resources": state.list_resources(&ResourceFilter::default()),
            "capacity": state.get_capacity(),
        }))?
    );
    state.stop_sweeper();
    Ok(())
}
