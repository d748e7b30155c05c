//! expo-updates CLI entry point.

mod cli;
mod host;

use clap::Parser;
use cli::{Cli, Command};
use expo_updates::launcher::UpdatesModule;
use expo_updates::{RunningUpdates, UpdatesBuilder};
use host::DirectoryHost;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("expo-updates v{}", env!("CARGO_PKG_VERSION"));

    // Build configuration
    let config = cli.to_config()?;
    let host = DirectoryHost::new(config.root_dir.clone());

    let mut updates = UpdatesBuilder::new(config, Arc::new(host.clone())).build()?;

    match cli.command {
        Command::Run { .. } => {
            let spec = updates.launch()?;
            host.publish(&spec)?;
            updates.run().await?;
        }
        Command::Check => {
            let result = updates.launcher().check_for_update_async().await?;
            print_json(&result)?;
        }
        Command::Fetch { apply } => fetch(&updates, apply).await?,
        Command::Status => {
            let context = updates
                .launcher()
                .get_native_state_machine_context_async()
                .await;
            print_json(&context)?;
        }
        Command::List => list(&updates),
        Command::Gc => {
            let report = updates
                .launcher()
                .garbage_collect(&updates.config().retention_policy())?;
            println!(
                "Removed {} updates and {} assets, kept {} updates",
                report.removed_updates.len(),
                report.removed_assets,
                report.retained_updates
            );
        }
        Command::Pin { id } => {
            updates.state_machine().store().pin(id)?;
            println!("Pinned {id}");
        }
        Command::Unpin { id } => {
            updates.state_machine().store().unpin(id)?;
            println!("Unpinned {id}");
        }
        Command::MarkLaunch { failed } => {
            let spec = updates.launcher().select_launch()?;
            if failed {
                updates.launcher().mark_launch_failed()?;
            } else {
                updates.launcher().mark_launch_succeeded()?;
            }
            println!(
                "Recorded {} launch of {}",
                if failed { "failed" } else { "successful" },
                spec.update.id
            );
        }
    }

    updates.shutdown();
    Ok(())
}

async fn fetch(updates: &RunningUpdates, apply: bool) -> color_eyre::Result<()> {
    let launcher = updates.launcher();
    let check = launcher.check_for_update_async().await?;
    if !check.is_available {
        println!("No update available");
        return Ok(());
    }

    let fetched = launcher.fetch_update_async().await?;
    print_json(&fetched)?;

    if apply {
        let update = updates.state_machine().restart_app_async().await?;
        println!("Relaunched into {}", update.id);
    }
    Ok(())
}

fn list(updates: &RunningUpdates) {
    let store = updates.state_machine().store();
    let launched = store.launched_id();
    let mut all = store.all_updates();
    all.sort_by(|a, b| b.created_at().cmp(&a.created_at()));

    if let Some(embedded) = store.embedded() {
        println!("  {}  embedded  {}", embedded.id, embedded.created_at());
    }
    for update in all {
        let marker = if Some(update.id) == launched { "*" } else { " " };
        println!(
            "{marker} {}  {:?}  {}  ok={} failed={}",
            update.id,
            update.status,
            update.created_at(),
            update.successful_launch_count,
            update.failed_launch_count
        );
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
