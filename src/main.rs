// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use autobuild::daemon::Command;
use clap::Parser;
use cli::{Cli, Commands};
use commands::parse_dist;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = cli.config.as_path();
    match cli.command {
        Commands::Init => commands::cmd_init(config),
        Commands::CheckConfig => commands::cmd_check_config(config),
        Commands::Status => commands::cmd_status(config).await,
        Commands::Resource {
            operation,
            kind,
            key,
        } => commands::cmd_resource(config, &operation, &kind, &key).await,
        Commands::Submit {
            dsc,
            package,
            version,
            distribution,
            arch,
            component,
            options,
        } => commands::cmd_submit(
            config,
            dsc,
            &package,
            &version,
            &distribution,
            &arch,
            &component,
            &options,
        ),
        Commands::History { limit } => commands::cmd_history(config, limit),
        Commands::Report { package, version } => {
            commands::cmd_report(config, &package, &version).await
        }
        Commands::Migrate {
            package,
            distribution,
            confirm,
        } => {
            let command = Command::Migrate {
                package,
                distribution: parse_dist(&distribution)?,
            };
            commands::cmd_execute(config, command, confirm.as_deref()).await
        }
        Commands::Remove {
            package,
            distribution,
            confirm,
        } => {
            let command = Command::RemovePackage {
                package,
                distribution: parse_dist(&distribution)?,
            };
            commands::cmd_execute(config, command, confirm.as_deref()).await
        }
        Commands::Port {
            package,
            from,
            to,
            confirm,
        } => {
            let command = Command::Port {
                package,
                from: parse_dist(&from)?,
                to: to.iter().map(|d| parse_dist(d)).collect::<Result<Vec<_>>>()?,
            };
            commands::cmd_execute(config, command, confirm.as_deref()).await
        }
        Commands::AutoMigrate => commands::cmd_execute(config, Command::AutoMigrate, None).await,
        Commands::Cancel { key } => commands::cmd_cancel(config, &key),
        Commands::Show { package } => {
            commands::cmd_execute(config, Command::Show { package }, None).await
        }
        Commands::Retry { key, confirm } => {
            commands::cmd_execute(config, Command::Retry { key }, confirm.as_deref()).await
        }
        Commands::Serve { interval } => commands::cmd_serve(config, interval).await,
    }
}
