use clap::Parser;
use remote_builder::args::{Cli, Commands};
use remote_builder::commands;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let res = match cli.command {
        Commands::Setup(args) => commands::setup(args),
        Commands::Post(args) => commands::post(args),
    };
    if let Err(e) = res {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}
