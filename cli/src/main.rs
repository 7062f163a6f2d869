use std::process::ExitCode;

use clap::Parser;

mod cli;
mod commands;
mod config;
mod error;

use cli::{Cli, Commands};
use config::{load_config, merge_config};
use error::{CliResult, to_exit_code};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let filter = if cli.verbose {
        "lipc=debug,lipc_cli=debug"
    } else {
        "lipc=warn,lipc_cli=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    to_exit_code(run(cli))
}

fn run(cli: Cli) -> CliResult<()> {
    let file_config = load_config(cli.config.as_deref())?;
    let config = merge_config(file_config, &cli.common)?;

    match cli.command {
        Commands::List(args) => commands::list::execute(args, config),
        Commands::Doc(args) => commands::doc::execute(args, config),
        Commands::Call(args) => commands::call::execute(args, config),
    }
}
