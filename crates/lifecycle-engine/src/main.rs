mod bootstrap;

use std::process::ExitCode;

use anyhow::Result;
use chrono::{DateTime, Utc};
use lifecycle_core::config::EngineConfig;
use lifecycle_core::settings::{RunMode, Settings};
use lifecycle_data::acceptance::run_acceptance;
use lifecycle_data::analysis::AnalysisInput;
use lifecycle_data::reader::{load_events, EventContract};
use lifecycle_runtime::incremental::prepare_incremental;
use lifecycle_runtime::orchestrator::RunOrchestrator;
use lifecycle_runtime::publisher::Publisher;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let settings = Settings::load();
    bootstrap::setup_logging(&settings.log_level, settings.log_file.as_ref())?;

    tracing::info!("Lifecycle engine v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = EngineConfig::load_or_default(settings.config.as_deref())?;
    if let Some(tz) = &settings.timezone {
        config.timezone = tz.clone();
    }
    config.validate()?;

    let as_of = settings.resolve_as_of(&config.bucketer(), Utc::now())?;
    let mode = settings.run_mode();
    tracing::info!(
        "Mode: {}, as of {}, timezone {}",
        mode.as_str(),
        as_of.to_rfc3339(),
        config.timezone
    );

    // Dropping the run future on Ctrl+C stops the publish before its swap.
    // A swap already under way still completes atomically.
    tokio::select! {
        result = run(&settings, config, as_of, mode) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(
                "Ctrl+C received; run cancelled. Output is only replaced if the final swap had already started"
            );
            Ok(ExitCode::from(130))
        }
    }
}

async fn run(
    settings: &Settings,
    config: EngineConfig,
    as_of: DateTime<Utc>,
    mode: RunMode,
) -> Result<ExitCode> {
    let events = settings.events.clone();
    let directory = settings.directory.clone();
    let output = settings.output_dir();

    match mode {
        RunMode::Batch => {
            let input = tokio::task::spawn_blocking(move || {
                AnalysisInput::load(&events, &directory, config, as_of)
            })
            .await??;
            bootstrap::ensure_output_dir(&output)?;
            RunOrchestrator::new(input)
                .run_and_publish(Publisher::new(output), mode)
                .await?;
        }

        RunMode::Incremental => {
            let state_path = settings.state_path();
            let prepared = {
                let state_path = state_path.clone();
                tokio::task::spawn_blocking(move || {
                    prepare_incremental(&events, &directory, config, as_of, &state_path)
                })
                .await??
            };
            if let Some(reason) = prepared.rebuilt {
                tracing::info!("Incremental state rebuilt: {:?}", reason);
            }
            bootstrap::ensure_output_dir(&output)?;
            RunOrchestrator::new(prepared.input)
                .run_and_publish(Publisher::new(output), mode)
                .await?;
            // Persist only after a successful publish.
            prepared.state.save(&state_path)?;
        }

        RunMode::Check => {
            let report = tokio::task::spawn_blocking(move || -> lifecycle_core::error::Result<_> {
                let contract = EventContract::new(config.bucketer(), &config.validation, as_of)?;
                let loaded = load_events(&events, &contract)?;
                Ok(run_acceptance(
                    &loaded.events,
                    &loaded.contract,
                    &config.validation,
                    as_of,
                ))
            })
            .await??;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.passed() {
                tracing::error!("Acceptance checks failed");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
