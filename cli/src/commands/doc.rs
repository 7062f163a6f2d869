use lipc::{Client, ClientConfig};

use crate::cli::DocArgs;
use crate::error::CliResult;

pub fn execute(args: DocArgs, config: ClientConfig) -> CliResult<()> {
    let client = Client::with_config(config)?;

    match client.get_documentation(&args.name)? {
        Some(doc) => println!("{doc}"),
        None => tracing::info!(function = %args.name, "no documentation"),
    }
    Ok(())
}
