mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use dealsync_core::directory::{DirectoryConfig, DirectoryIndex};
use dealsync_core::{
    Actor, CycleStatus, EnvSecretStore, FileLock, JsonDocumentStore, LockOutcome, RuntimeConfig,
    SecretStore, SyncConfig, SyncEngine, SyncLock,
};
use dealsync_integrations::connectors::hubspot::HubSpotDeals;
use dealsync_integrations::lock_backends::redis::RedisLock;
use serde_json::json;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Exit status when another run holds the lock (EX_TEMPFAIL).
const EXIT_BUSY: u8 = 75;
const EXIT_PARTIAL: u8 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dealsync_core::logging::init_from_env()?;
    let cli = Cli::parse();

    let runtime = RuntimeConfig::from_env()?;
    let config = SyncConfig::load(&runtime.config_path)?;
    let directory = DirectoryConfig::load(&runtime.directory_path)?;

    match cli.command {
        Commands::ValidateConfig => {
            let index = DirectoryIndex::build(&directory);
            let summary = json!({
                "datasets": config.datasets.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
                "owners": index.owners().len(),
                "owners_without_store": index.owners().iter().filter(|o| o.store.is_none()).count(),
                "owners_without_crm_id": index.owners().iter().filter(|o| o.crm_owner_id.is_none()).count(),
                "groups": index.groups().map(|g| json!({
                    "name": g.name,
                    "members": g.members.len(),
                    "has_store": g.store.is_some(),
                })).collect::<Vec<_>>(),
                "legacy_name_matching": config.legacy_name_matching,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cycle => {
            let engine = build_engine(&runtime, config, directory).await?;
            let outcome = engine.run_cycle(&Actor::system("dealsync-cli")).await?;
            match outcome {
                LockOutcome::Acquired(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    Ok(match report.status {
                        CycleStatus::Succeeded => ExitCode::SUCCESS,
                        CycleStatus::Partial => ExitCode::from(EXIT_PARTIAL),
                    })
                }
                LockOutcome::Busy { lock, waited } => Ok(busy(&lock, waited)),
            }
        }
        Commands::PushNotes { group, actor } => {
            let engine = build_engine(&runtime, config, directory).await?;
            let outcome = engine.push_notes_up(&actor_from(actor), &group).await?;
            print_interactive(outcome)
        }
        Commands::SyncHighlight { group, actor } => {
            let engine = build_engine(&runtime, config, directory).await?;
            let outcome = engine.sync_highlights(&actor_from(actor), &group).await?;
            print_interactive(outcome)
        }
    }
}

fn actor_from(email: Option<String>) -> Actor {
    match email {
        Some(email) if !email.trim().is_empty() => Actor::user(email.trim()),
        _ => Actor::system("dealsync-cli"),
    }
}

fn busy(lock: &str, waited: Duration) -> ExitCode {
    eprintln!(
        "{}",
        json!({"status": "busy", "lock": lock, "waited_ms": waited.as_millis() as u64})
    );
    ExitCode::from(EXIT_BUSY)
}

fn print_interactive(
    outcome: LockOutcome<dealsync_core::PropagationReport>,
) -> anyhow::Result<ExitCode> {
    match outcome {
        LockOutcome::Acquired(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        LockOutcome::Busy { lock, waited } => Ok(busy(&lock, waited)),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn build_engine(
    runtime: &RuntimeConfig,
    config: SyncConfig,
    directory: DirectoryConfig,
) -> anyhow::Result<SyncEngine> {
    let secrets: Arc<dyn SecretStore> = Arc::new(EnvSecretStore);
    let mut deals = HubSpotDeals::new(secrets, config.token_secret.clone())?;
    if let Some(base) = runtime.hubspot_base_url.as_deref() {
        deals = deals.with_api_base(base);
    }

    let store = JsonDocumentStore::open(runtime.data_dir.clone()).await?;

    let lock: Arc<dyn SyncLock> = match runtime.redis_url.as_deref() {
        Some(url) => {
            // Lease outlives the cycle ceiling so a slow run is never unlocked mid-flight.
            let ttl = config.max_cycle_duration() + Duration::from_secs(30);
            let lock = RedisLock::connect(url, runtime.redis_key_prefix.clone())
                .await?
                .with_ttl(ttl);
            tracing::info!("using redis lock");
            Arc::new(lock)
        }
        None => {
            let lock = FileLock::open(runtime.data_dir.join("locks")).await?;
            tracing::info!(dir = %lock.dir().display(), "DEALSYNC_REDIS_URL not set; using host file lock");
            Arc::new(lock)
        }
    };

    Ok(SyncEngine::new(
        config,
        directory,
        Arc::new(deals),
        Arc::new(store),
        lock,
    )?)
}
