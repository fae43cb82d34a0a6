// src/main.rs

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use commands::InstallOptions;
use ondemand::DeliveryConfig;
use std::process::ExitCode;

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<ondemand::Error>()
        .map_or(1, |e| e.exit_code())
        .clamp(1, 255) as u8
}

async fn run(cli: Cli, config: &DeliveryConfig) -> anyhow::Result<()> {
    match cli.command {
        Commands::Install {
            module,
            installed,
            size,
            chunk,
            step_ms,
            confirm,
            fail,
        } => {
            let opts = InstallOptions {
                module,
                installed,
                size,
                chunk,
                step_ms,
                confirm,
                fail,
            };
            commands::cmd_install(config, opts, cli.json).await
        }
        Commands::Uninstall { modules, installed } => {
            commands::cmd_uninstall(config, modules, installed, cli.json).await
        }
        #[cfg(feature = "server")]
        Commands::Serve { bind, installed } => commands::cmd_serve(config, bind, installed).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match DeliveryConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(1);
        }
    };

    // Logs go to stderr so --json output stays clean
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    match run(cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}
