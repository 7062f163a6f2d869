use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lipc")]
#[command(version)]
#[command(about = "Discover and call functions hosted on local sockets")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the functions present in the namespace
    List(ListArgs),

    /// Print the documentation of a function
    Doc(DocArgs),

    /// Call a function and print its result as JSON
    Call(CallArgs),
}

#[derive(Args)]
pub struct ListArgs {
    /// Also print each socket address
    #[arg(short, long)]
    pub long: bool,
}

#[derive(Args)]
pub struct DocArgs {
    /// Function name
    pub name: String,
}

#[derive(Args)]
pub struct CallArgs {
    /// Function name
    pub name: String,

    /// Positional arguments, parsed as JSON (bare words become strings)
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Keyword argument KEY=VALUE, VALUE parsed like positionals (can be repeated)
    #[arg(long = "kwarg", short = 'k')]
    pub kwargs: Vec<String>,

    /// Pretty-print the result
    #[arg(long)]
    pub pretty: bool,
}

/// Arguments shared by every subcommand
#[derive(Args)]
pub struct CommonArgs {
    /// Namespace directory holding the endpoint sockets
    #[arg(long, global = true, env = "LIPC_NAMESPACE_DIR")]
    pub namespace: Option<PathBuf>,

    /// Per-call timeout in seconds (0 waits forever)
    #[arg(long, global = true)]
    pub timeout: Option<f64>,
}
