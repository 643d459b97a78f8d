use anyhow::{Context, Result};
use murmur::decision::RuleBackend;
use murmur::integration::{MurmurConfig, Orchestrator, OrchestratorEvent, ProviderEntry};
use murmur::providers::{ConsoleInput, LogOutput};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Fill in console -> rules -> log for anything the config leaves out
fn with_console_defaults(mut config: MurmurConfig) -> MurmurConfig {
    if config.providers.inputs.is_empty() {
        config.providers.inputs.push(ProviderEntry::new(ConsoleInput::NAME));
    }
    if config.providers.outputs.is_empty() {
        config.providers.outputs.push(ProviderEntry::new(LogOutput::NAME));
    }
    if config.providers.backend.is_none() {
        config.providers.backend = Some(
            ProviderEntry::new(RuleBackend::NAME).with_config(json!({
                "rules": [
                    {"keywords": ["hello", "hi"], "reply": "[happy] Hello there! {hotkey:wave}"},
                    {"keywords": ["bye"], "reply": "[sad] See you soon."}
                ],
                "fallback": "You said: {text}"
            })),
        );
    }
    config
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => MurmurConfig::load(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => MurmurConfig::default(),
    };
    let config = with_console_defaults(config);

    let runtime = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    let result = runtime.block_on(run(config));
    // A pending stdin read would otherwise hold the runtime open
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(config: MurmurConfig) -> Result<()> {
    info!("Starting murmur");
    let orchestrator = Orchestrator::new(config)?;
    let report = orchestrator.start().await?;
    for outcome in report.inputs.outcomes.iter().chain(&report.outputs.outcomes) {
        if let Some(error) = &outcome.error {
            warn!(provider = %outcome.name, "Provider failed to start: {}", error);
        }
    }

    let events = orchestrator.events();
    let watcher = std::thread::spawn(move || {
        for event in events.iter() {
            match event {
                OrchestratorEvent::Error(message) => warn!("{}", message),
                OrchestratorEvent::Stopped => break,
                _ => {}
            }
        }
    });

    info!("Type a message and press Enter; Ctrl-C to quit");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    orchestrator.stop().await;
    let stats = orchestrator.stats().await;
    info!(
        processed = stats.processed,
        rendered = stats.rendered,
        dropped = stats.dropped,
        errors = stats.errors,
        "Shutdown complete"
    );
    drop(orchestrator);
    let _ = watcher.join();

    Ok(())
}
