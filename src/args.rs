use crate::commands::{post::PostArgs, setup::SetupArgs};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "remote-builder",
    about = "Provision a remote build daemon for a CI job and tear it down afterwards"
)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Acquire a build instance and register it as a builder
    Setup(SetupArgs),
    /// Tear down whatever setup recorded for this run
    Post(PostArgs),
}
