use std::process;

use clap::{CommandFactory, Parser};
use tracing::error;

mod cli;

use autorc::config::{Settings, load_env_file};
use autorc::logger::{LogConfig, init_tracing};
use cli::{Cli, CliContext, Commands};

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        let _ = Cli::command().print_help();
        println!("\nAvailable actions: {}", Commands::names().join(", "));
        process::exit(0);
    };

    load_env_file(cli.env_file.as_deref());
    let (mut settings, origin) = Settings::load(cli.config.as_deref());
    settings.apply_env();

    // units install their own logging once the orchestrator tells them where to
    let guard = if command.installs_own_logging() {
        None
    } else {
        match init_tracing(&LogConfig::new(settings.log_level, settings.log_dir.clone(), "autorc.log")) {
            Ok((_, guard)) => Some(guard),
            Err(e) => {
                eprintln!("{e:#}");
                process::exit(1);
            }
        }
    };
    origin.log();

    let context = CliContext::new(cli.profile, settings);
    let code = match cli::execute(&context, command).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            1
        }
    };
    drop(guard);
    process::exit(code);
}
