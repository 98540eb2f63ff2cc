//! PostgreSQL Backup Tool
//!
//! Provides CLI interface for backup, catalog listing, connection checks and
//! cleanup of old backups

// pgvault/src/main.rs
use anyhow::{Context, Result};
use pgvault::backup::retention::{self, RetentionPolicy};
use pgvault::config::{
    self, AppConfig, load_backup_config_from_json, load_cleanup_config_from_json,
    load_connection_from_json,
};
use pgvault::source::postgres::PgConnector;
use pgvault::{
    BackupEngine, BackupRequest, ConnectionDescriptor, EventKind, EventScope, ObjectKind, ProgressEvent,
    RunOutcome, Subscription,
};
use std::env;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = config::config_path();
    let app_config = AppConfig::load_from_json(&config_path)
        .context(format!("Failed to load application configuration from {}", config_path.display()))?;

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };

    match choice.as_str() {
        "1" | "backup" => {
            println!("🚀 Starting Backup Process...");
            run_backup(&app_config).await.context("Backup process failed")?;
        }
        "2" | "catalog" => {
            println!("🔍 Reading catalog...");
            run_catalog(&app_config).await.context("Catalog listing failed")?;
        }
        "3" | "test" => {
            println!("🔌 Testing connection...");
            let descriptor = connection(&app_config)?;
            let check = engine(&app_config).test_connection(&descriptor).await;
            if !check.success {
                anyhow::bail!("{}", check.message);
            }
            println!("✅ {}", check.message);
        }
        "4" | "cleanup" => {
            println!("🧹 Removing expired backups...");
            let (root, policy) = load_cleanup_config_from_json(&app_config.raw_json_config)
                .context("Failed to load cleanup configuration from JSON")?;
            cleanup(&root, policy).await?;
        }
        _ => {
            println!("❌ Invalid choice. Please enter '1' (backup), '2' (catalog), '3' (test) or '4' (cleanup).");
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

fn engine(app_config: &AppConfig) -> BackupEngine {
    BackupEngine::new(
        Arc::new(PgConnector::new(app_config.connector)),
        app_config.engine.clone(),
    )
}

fn connection(app_config: &AppConfig) -> Result<ConnectionDescriptor> {
    load_connection_from_json(&app_config.raw_json_config, env::var(config::PASSWORD_ENV).ok())
        .context("Failed to load connection settings from JSON")
}

async fn run_catalog(app_config: &AppConfig) -> Result<()> {
    let descriptor = connection(app_config)?;
    let snapshot = engine(app_config).list_catalog(&descriptor).await?;
    for object in snapshot.objects() {
        let size = match object.estimated_size.bytes {
            Some(bytes) => format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0)),
            None => "unknown size".to_string(),
        };
        println!("  {:<18} {:<50} {}", object.kind.as_str(), object.id.as_str(), size);
    }
    println!(
        "📋 {} objects: {} tables, {} views, {} materialized views, {} functions",
        snapshot.len(),
        snapshot.count_by_kind(ObjectKind::Table),
        snapshot.count_by_kind(ObjectKind::View),
        snapshot.count_by_kind(ObjectKind::MaterializedView),
        snapshot.count_by_kind(ObjectKind::Function),
    );
    Ok(())
}

async fn run_backup(app_config: &AppConfig) -> Result<()> {
    let descriptor = connection(app_config)?;
    let backup_config = load_backup_config_from_json(&app_config.raw_json_config)
        .context("Failed to load backup configuration from JSON")?;
    let engine = engine(app_config);

    let objects = match backup_config.objects.clone() {
        Some(objects) => objects,
        None => {
            let snapshot = engine.list_catalog(&descriptor).await?;
            println!("📋 No objects configured, backing up all {} catalog objects", snapshot.len());
            snapshot.objects().iter().map(|o| o.id.clone()).collect()
        }
    };

    let handle = engine
        .submit(BackupRequest {
            connection: descriptor,
            objects,
            destination_root: backup_config.local_backup_path.clone(),
            options: backup_config.options,
        })
        .await?;
    println!("🆔 Run {}", handle.run_id());

    let printer = tokio::spawn(print_events(handle.subscribe()));
    let canceller = handle.canceller();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("⚠ Interrupt received, cancelling backup...");
            canceller.cancel();
        }
    });

    let result = handle.wait().await?;
    interrupt.abort();
    let _ = printer.await;

    println!(
        "📦 {} of {} objects written ({} bytes) in {:.1}s",
        result.succeeded,
        result.total,
        result.bytes_written(),
        result.duration.as_secs_f64()
    );
    for err in &result.errors {
        println!("❌ {}: {}", err.object_id, err.message);
    }

    if let Some(policy) = backup_config.retention {
        cleanup(&backup_config.local_backup_path, policy).await?;
    }

    match result.outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::PartiallyFailed => {
            anyhow::bail!("{} of {} objects failed", result.errors.len(), result.total)
        }
        RunOutcome::Cancelled => anyhow::bail!("Backup cancelled; {} objects skipped", result.cancelled.len()),
        RunOutcome::Aborted { reason } => anyhow::bail!("Backup aborted: {}", reason),
    }
}

async fn cleanup(root: &Path, policy: RetentionPolicy) -> Result<()> {
    let report = retention::prune(root, policy, chrono::Utc::now())
        .await
        .context(format!("Failed to clean up {}", root.display()))?;
    for path in &report.removed {
        println!("🗑 Removed {}", path.display());
    }
    for (path, reason) in &report.failed {
        println!("⚠ Could not remove {}: {}", path.display(), reason);
    }
    println!(
        "🧹 Cleanup done: {} removed, {} kept (older than {} days are removed)",
        report.removed.len(),
        report.kept,
        policy.max_age_days
    );
    Ok(())
}

fn describe(event: &ProgressEvent) -> Option<String> {
    let subject = match &event.scope {
        EventScope::Task(id) => id.to_string(),
        EventScope::Run => "run".to_string(),
    };
    let line = match &event.kind {
        EventKind::Started if event.scope == EventScope::Run => "🚀 run started".to_string(),
        EventKind::Started => format!("⏳ {}", subject),
        EventKind::Stage { .. } => return None,
        EventKind::Progress { percent: Some(p), .. } if p % 25 == 0 && *p > 0 => {
            format!("   {} {}%", subject, p)
        }
        EventKind::Progress { .. } => return None,
        EventKind::Completed { path: Some(path), bytes } => {
            format!("✅ {} -> {} ({} bytes)", subject, path.display(), bytes)
        }
        EventKind::Completed { path: None, .. } => "✅ run completed".to_string(),
        EventKind::Failed { reason } => format!("❌ {}: {}", subject, reason),
        EventKind::Cancelled => format!("⏹ {} cancelled", subject),
        EventKind::Log { message } => format!("ℹ {}", message),
    };
    Some(line)
}

async fn print_events(mut subscription: Subscription) {
    while let Some(event) = subscription.next().await {
        if let Some(line) = describe(&event) {
            println!("{}", line);
        }
    }
    if subscription.missed() > 0 {
        println!("⚠ {} progress events were dropped", subscription.missed());
    }
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Take Backup (or type 'backup')");
    println!("2. List Catalog (or type 'catalog')");
    println!("3. Test Connection (or type 'test')");
    println!("4. Clean Up Old Backups (or type 'cleanup')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
