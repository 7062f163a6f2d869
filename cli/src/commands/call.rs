use anyhow::Context;
use lipc::{Client, ClientConfig};

use crate::cli::CallArgs;
use crate::config::{parse_kwargs, parse_value};
use crate::error::CliResult;

pub fn execute(args: CallArgs, config: ClientConfig) -> CliResult<()> {
    let positional: Vec<_> = args.args.iter().map(|raw| parse_value(raw)).collect();
    let kwargs = parse_kwargs(&args.kwargs)?;

    let client = Client::with_config(config)?;
    tracing::debug!(function = %args.name, args = ?positional, kwargs = ?kwargs, "calling");
    let result = client.call(&args.name, &positional, &kwargs)?;

    let output = if args.pretty {
        serde_json::to_string_pretty(&result)
    } else {
        serde_json::to_string(&result)
    }
    .context("failed to format result")?;
    println!("{output}");
    Ok(())
}
