use std::sync::Arc;

use clap::Parser;
use tracing::info;

use quarry::config::{Args, Config};
use quarry::connectors::{DatasetRegistry, StaticConnector};
use quarry::notify::LogNotifier;
use quarry::orchestrator::AnalysisOrchestrator;
use quarry::providers::{AnthropicProvider, OpenAiProvider, ProviderRegistry};
use quarry::sandbox::ContainerSandbox;
use quarry::selector::ModelSelector;
use quarry::storage::InMemoryStorage;
use quarry::telemetry::init_telemetry;
use quarry::worker::WorkerPool;
use quarry::ResultCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    if args.validate {
        println!("configuration is valid");
        return Ok(());
    }

    init_telemetry()?;
    info!("starting quarry");

    let storage = Arc::new(InMemoryStorage::new());

    let providers = ProviderRegistry::new(
        Arc::new(OpenAiProvider::new(
            config.providers.openai.base_url.clone(),
            config.providers.openai.api_key.clone(),
            config.providers.openai.timeout,
        )),
        Arc::new(AnthropicProvider::new(
            config.providers.anthropic.base_url.clone(),
            config.providers.anthropic.api_key.clone(),
            config.providers.anthropic.timeout,
        )),
        Arc::new(OpenAiProvider::gateway(
            config.providers.gateway.base_url.clone(),
            config.providers.gateway.api_key.clone(),
            config.providers.gateway.timeout,
        )),
    );

    let datasets = Arc::new(DatasetRegistry::new(Arc::new(StaticConnector::new())));
    for dataset in &config.datasets {
        info!(dataset_id = %dataset.id, name = %dataset.name, "registering dataset");
        datasets.register(dataset.clone());
    }

    let orchestrator = Arc::new(AnalysisOrchestrator::new(
        storage,
        providers,
        ModelSelector::new(config.selection.baseline_model.clone()),
        Arc::new(ContainerSandbox::new(config.sandbox.clone())),
        Arc::new(ResultCache::new(config.cache.clone())),
        datasets,
        Arc::new(LogNotifier),
        config.pipeline.clone(),
    ));

    let pool = Arc::new(WorkerPool::new(orchestrator, config.worker.clone()));
    let pool_handle = pool.spawn();

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    pool_handle.abort();

    Ok(())
}
