//! lipc - local function endpoints over Unix domain sockets
//!
//! A function registered with a [`Registry`] is served on its own socket,
//! `lipcm-<name>.sock`, inside a namespace directory (`/tmp` unless
//! `LIPC_NAMESPACE_DIR` says otherwise). Any process on the machine can find
//! it by scanning that directory and call it synchronously through a
//! [`Client`].
//!
//! # Example
//!
//! ```rust,ignore
//! use lipc::{Client, EndpointOptions, FunctionDescriptor, Map, Registry, Signature, json};
//!
//! fn main() -> lipc::Result<()> {
//!     let registry = Registry::new();
//!     let sum = FunctionDescriptor::new("sum_func", Signature::new().param("a").param("b"))
//!         .doc("Return the sum of a and b.")
//!         .deterministic(true)
//!         .build(|args| Ok(json!(args.get::<i64>("a")? + args.get::<i64>("b")?)));
//!
//!     let options = EndpointOptions::builder().cache(true).build();
//!     let mut endpoint = registry.register(sum, options)?;
//!     endpoint.start()?;
//!
//!     let client = Client::new()?;
//!     assert_eq!(client.call("sum_func", &[json!(3), json!(4)], &Map::new())?, json!(7));
//!     println!("{:?}", client.get_documentation("sum_func")?);
//!
//!     endpoint.terminate();
//!     Ok(())
//! }
//! ```
//!
//! # Errors
//!
//! Calls distinguish a name missing from the client's snapshot
//! ([`Error::NotFound`]), a known name nobody listens on
//! ([`Error::Unavailable`]), rejected arguments ([`Error::Validation`]) and a
//! failing function ([`Error::Execution`]).

mod cache;
mod client;
mod config;
mod directory;
mod error;
mod function;
pub mod ipc;
mod logging;
mod registry;
mod signature;

pub use cache::{CacheError, CacheKey, CachePolicy, CacheStats};
pub use client::Client;
pub use config::{
    ClientConfig, ClientConfigBuilder, EndpointOptions, EndpointOptionsBuilder, Isolation,
};
pub use directory::{
    DEFAULT_NAMESPACE_DIR, Directory, DirectoryEntry, NAMESPACE_ENV, Namespace, SOCKET_PREFIX,
    SOCKET_SUFFIX, name_from_file,
};
pub use error::{CallStage, Error, Result};
pub use function::{FnFunction, Function, FunctionDescriptor};
pub use logging::RotatingFile;
pub use registry::{EndpointHandle, Registry};
pub use signature::{ArgumentError, BindError, BoundArgs, Param, Signature};

/// Re-export rmp_serde for callers speaking the wire format directly.
pub use rmp_serde;
pub use serde_json::{Map, Value, json};
