// Command execution

use anyhow::{bail, Context, Result};
use otasync_updates::{
    CancellationToken, CheckOutcome, CheckTrigger, ConfigLoader, UpdateEvent, UpdaterConfig,
    UpdaterService,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::cli::{Cli, Commands};
use crate::output::{format_datetime, OutputStyle};

/// Load configuration from the given file or the default location
pub fn load_config(cli: &Cli) -> Result<UpdaterConfig> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    debug!("Using configuration {}", loader.config_path().display());
    loader
        .load()
        .with_context(|| format!("Failed to load {}", loader.config_path().display()))
}

/// Run the selected command
pub async fn execute(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let style = OutputStyle::default();
    let (service, ticks) =
        UpdaterService::with_tokio_timer(config.clone()).context("Failed to set up updater")?;

    match cli.command {
        Commands::Check => {
            service.load_cached().await?;
            let report = service.check_now(CheckTrigger::Manual).await?;
            if !cli.quiet {
                println!("{}", style.outcome(&report.outcome));
            }
            if let CheckOutcome::Failed { reason } = report.outcome {
                bail!("update check failed: {}", reason);
            }
        }
        Commands::List { json } => {
            service.load_cached().await?;
            let updates = service.registry().list();
            if json {
                println!("{}", serde_json::to_string_pretty(&updates)?);
            } else if updates.is_empty() {
                println!("{}", style.info("No updates known, run `otasync check`"));
            } else {
                for update in &updates {
                    println!("{}", style.update_line(update));
                }
            }
        }
        Commands::Import { file } => {
            service.load_cached().await?;
            let update = service
                .import_file(&file)
                .await
                .with_context(|| format!("Failed to import {}", file.display()))?;
            if !cli.quiet {
                println!(
                    "{}",
                    style.success(&format!("Imported {} as {}", file.display(), update.id))
                );
            }
        }
        Commands::Status => {
            for line in status_lines(&service, &config, &style).await? {
                println!("{}", line);
            }
        }
        Commands::Watch => {
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal.cancel();
                }
            });

            let registry = service.registry();
            let mut events = registry.subscribe();
            let quiet = cli.quiet;
            tokio::spawn(async move {
                let style = OutputStyle::default();
                loop {
                    match events.recv().await {
                        Ok(UpdateEvent::StatusChanged(id)) if !quiet => {
                            if let Some(update) = registry.get(&id) {
                                println!("{}", style.update_line(&update));
                            }
                        }
                        Ok(UpdateEvent::Removed(id)) if !quiet => {
                            println!("{}", style.warning(&format!("Removed {}", id)));
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("Skipped {} registry events", skipped)
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            });

            if let Some(report) = service.start().await? {
                println!("{}", style.outcome(&report.outcome));
            }
            for line in style.schedule(&service.schedule_state()) {
                println!("{}", line);
            }
            service.run(ticks, shutdown).await;
        }
    }

    Ok(())
}

/// Last check, manifest digest and the schedule the configuration arms
async fn status_lines(
    service: &UpdaterService,
    config: &UpdaterConfig,
    style: &OutputStyle,
) -> Result<Vec<String>> {
    let last_check = match service.last_check().await? {
        Some(time) => format_datetime(time),
        None => "never".to_string(),
    };
    let digest = service
        .manifest_digest()
        .await?
        .unwrap_or_else(|| "none".to_string());

    let mut lines = vec![
        style.info(&format!("Last successful check: {}", last_check)),
        style.info(&format!("Manifest SHA-256: {}", digest)),
    ];
    service.apply_config(config.clone())?;
    lines.extend(style.schedule(&service.schedule_state()));
    Ok(lines)
}
