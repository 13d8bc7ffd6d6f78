use anyhow::Result;
use machinemon_alert::{AlertEngine, EngineHandle};
use machinemon_notify::Dispatcher;
use machinemon_storage::{SnapshotStore, SqliteStore};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use machinemon_server::config::{ProviderSeedFile, ServerConfig};
use machinemon_server::{logging, providers};

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  machinemon-server [config.toml]                              Start the alert engine");
    eprintln!("  machinemon-server init-providers <config.toml> <seed.json>   Create alert providers from a seed file");
    eprintln!("  machinemon-server list-providers <config.toml>               Print providers with secrets redacted");
    eprintln!("  machinemon-server test-provider <config.toml> <provider_id>  Send a test alert through one provider");
}

#[tokio::main]
async fn main() -> Result<()> {
    machinemon_common::id::init(1, 1);
    logging::init()?;

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("init-providers") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-providers requires <config.toml> and <seed.json> arguments")
            })?;
            let seed_path = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-providers requires <seed.json> argument")
            })?;
            run_init_providers(config_path, seed_path)
        }
        Some("list-providers") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("list-providers requires <config.toml> argument")
            })?;
            run_list_providers(config_path)
        }
        Some("test-provider") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("test-provider requires <config.toml> and <provider_id> arguments")
            })?;
            let provider_id: i64 = args
                .get(3)
                .ok_or_else(|| {
                    print_usage();
                    anyhow::anyhow!("test-provider requires <provider_id> argument")
                })?
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid provider id: {e}"))?;
            run_test_provider(config_path, provider_id).await
        }
        Some("help" | "--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/server.toml");
            run_server(config_path).await
        }
    }
}

fn open_store(config: &ServerConfig) -> Result<Arc<SqliteStore>> {
    Ok(Arc::new(SqliteStore::open(
        Path::new(&config.data_dir),
        &config.database_file,
    )?))
}

/// Create alert providers from a JSON seed file, skipping names that exist.
fn run_init_providers(config_path: &str, seed_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    let store = open_store(&config)?;

    let seed_content = std::fs::read_to_string(seed_path)
        .map_err(|e| anyhow::anyhow!("Failed to read seed file '{}': {}", seed_path, e))?;
    let seed: ProviderSeedFile = serde_json::from_str(&seed_content)
        .map_err(|e| anyhow::anyhow!("Failed to parse seed file '{}': {}", seed_path, e))?;

    let summary = providers::seed_providers(&*store, &seed)?;
    tracing::info!(
        created = summary.created,
        skipped = summary.skipped,
        invalid = summary.invalid,
        "init-providers completed"
    );
    Ok(())
}

#[allow(clippy::print_stdout)]
fn run_list_providers(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    let store = open_store(&config)?;
    let rows = providers::list_redacted(&*store)?;
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn run_test_provider(config_path: &str, provider_id: i64) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    let store = open_store(&config)?;
    let dispatcher = Dispatcher::new(store, config.provider_timeout());
    let result = dispatcher.send_test_alert(provider_id).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    tracing::info!(
        config = config_path,
        database = %config.database_path().display(),
        "Starting MachineMon server"
    );

    let store: Arc<dyn SnapshotStore> = open_store(&config)?;
    let dispatcher = Dispatcher::new(store.clone(), config.provider_timeout());
    let engine = Arc::new(AlertEngine::new(store.clone(), dispatcher));

    let cancel = CancellationToken::new();
    let (handle, engine_task) =
        machinemon_alert::start(engine, config.engine_config(), cancel.clone());
    queue_online_clients(&*store, &handle);

    signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully");
    cancel.cancel();
    if let Err(e) = engine_task.await {
        tracing::error!(error = %e, "Alert engine task failed");
    }
    tracing::info!("Server stopped");
    Ok(())
}

/// Queues an evaluation for every online client so reports stored while the
/// engine was down are alerted on without waiting for the next check-in.
fn queue_online_clients(store: &dyn SnapshotStore, engine: &EngineHandle) {
    match store.list_clients() {
        Ok(clients) => {
            let online = clients.iter().filter(|c| c.client.is_online).count();
            tracing::info!(clients = clients.len(), online, "Server ready");
            for c in clients.iter().filter(|c| c.client.is_online) {
                engine.notify_check_in(&c.client.id);
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to list clients"),
    }
}
