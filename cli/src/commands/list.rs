use lipc::{Client, ClientConfig};

use crate::cli::ListArgs;
use crate::error::CliResult;

pub fn execute(args: ListArgs, config: ClientConfig) -> CliResult<()> {
    let client = Client::with_config(config)?;
    tracing::debug!(
        namespace = %client.config().namespace().dir().display(),
        count = client.directory().len(),
        "listing functions"
    );

    for entry in client.directory().iter() {
        if args.long {
            println!("{}\t{}", entry.name, entry.address.display());
        } else {
            println!("{}", entry.name);
        }
    }
    Ok(())
}
