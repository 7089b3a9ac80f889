use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod list_profile;
pub mod reset_servo;
pub mod start;
pub mod unit;

use autorc::config::Settings;
use start::StartArgs;

#[derive(Parser, Debug)]
#[command(name = "autorc", about = "Dataflow runtime for small autonomous cars", version)]
pub struct Cli {
    /// Profile to operate on
    #[arg(short, long, global = true, default_value = "default")]
    pub profile: String,

    /// JSON file overriding the compiled-in vehicle settings (UPPERCASE keys only)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// .env file to load before reading AUTORC_* variables
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the profiles found under the profiles root
    ListProfile,

    /// Start the vehicle described by the selected profile
    Start(StartArgs),

    /// Put every servo channel back to its neutral angle
    ResetServo,

    /// Entry point of an execution unit, started by `start`
    #[command(hide = true)]
    Unit,
}

impl Commands {
    pub fn names() -> [&'static str; 3] {
        ["list-profile", "start", "reset-servo"]
    }

    /// Units are told their log level and directory over the control plane.
    pub fn installs_own_logging(&self) -> bool {
        matches!(self, Commands::Unit)
    }
}

/// What every command gets handed: the resolved settings and the profile name.
#[derive(Debug, Clone)]
pub struct CliContext {
    pub profile: String,
    pub settings: Settings,
}

impl CliContext {
    pub fn new(profile: String, settings: Settings) -> Self {
        Self { profile, settings }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::ListProfile => list_profile::execute(context).map(|_| 0),
        Commands::Start(args) => start::execute(args, context).await,
        Commands::ResetServo => reset_servo::execute(context).map(|_| 0),
        Commands::Unit => unit::execute().await,
    }
}
