//! Calling hosted functions
//!
//! A [`Client`] holds the directory snapshot taken when it was created (or
//! last refreshed). Names that appeared since are invisible until
//! [`Client::refresh`]; names that vanished fail at connect time.
//!
//! # Example
//!
//! ```rust,ignore
//! use lipc::{Client, Map, json};
//!
//! let client = Client::new()?;
//! let sum = client.call("sum_func", &[json!(3), json!(4)], &Map::new())?;
//! assert_eq!(sum, json!(7));
//! ```

use std::io;
use std::os::unix::net::UnixStream;

use serde_json::{Map, Value};

use crate::config::ClientConfig;
use crate::directory::Directory;
use crate::error::{CallStage, Error, Result};
use crate::ipc::protocol::{ErrorKind, Request, Response, read_frame, write_frame};

/// Synchronous caller of endpoints in one namespace
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    directory: Directory,
}

impl Client {
    /// Client with the default configuration, scanning immediately
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let directory = config.namespace().scan()?;
        Ok(Self { config, directory })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The snapshot calls are resolved against
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Names in the current snapshot, sorted
    pub fn list_functions(&self) -> Vec<String> {
        self.directory.names().map(str::to_string).collect()
    }

    /// Rescan the namespace
    pub fn refresh(&mut self) -> Result<()> {
        self.directory = self.config.namespace().scan()?;
        Ok(())
    }

    /// Documentation text of `name`, without executing it
    pub fn get_documentation(&self, name: &str) -> Result<Option<String>> {
        match self.request(name, &Request::describe())? {
            Value::Null => Ok(None),
            Value::String(doc) => Ok(Some(doc)),
            other => Err(Error::Protocol(format!(
                "documentation of '{name}' is not a string: {other}"
            ))),
        }
    }

    /// Invoke `name` with positional and keyword arguments
    pub fn call(&self, name: &str, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value> {
        self.request(name, &Request::call(args.to_vec(), kwargs.clone()))
    }

    fn request(&self, name: &str, request: &Request) -> Result<Value> {
        let address = self
            .directory
            .address(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let framed = request.to_bytes()?;

        tracing::trace!(function = name, stage = %CallStage::Connecting, "calling");
        let mut stream = UnixStream::connect(address).map_err(|source| Error::Unavailable {
            name: name.to_string(),
            address: address.to_path_buf(),
            source,
        })?;
        let timeout = self.config.timeout();
        stream
            .set_read_timeout(timeout)
            .and_then(|()| stream.set_write_timeout(timeout))
            .map_err(|source| Error::Transport {
                stage: CallStage::Connecting,
                source,
            })?;

        tracing::trace!(function = name, stage = %CallStage::Sending, "calling");
        if let Err(source) = write_frame(&mut stream, framed.as_slice()) {
            // A busy endpoint answers and closes before reading the request
            return match read_response(&mut stream) {
                Ok(response) => into_value(response),
                Err(_) => Err(Error::Transport {
                    stage: CallStage::Sending,
                    source,
                }),
            };
        }

        tracing::trace!(function = name, stage = %CallStage::AwaitingResponse, "calling");
        into_value(read_response(&mut stream)?)
    }
}

fn read_response(stream: &mut UnixStream) -> Result<Response> {
    let body = read_frame(stream).map_err(|source| match source.kind() {
        io::ErrorKind::UnexpectedEof => {
            Error::Protocol("connection closed before a response was received".to_string())
        }
        io::ErrorKind::InvalidData => Error::Protocol(source.to_string()),
        _ => Error::Transport {
            stage: CallStage::AwaitingResponse,
            source,
        },
    })?;
    Response::from_bytes(&body)
}

fn into_value(response: Response) -> Result<Value> {
    match response {
        Response::Result(value) => Ok(value),
        Response::Error { kind, message } => Err(match kind {
            ErrorKind::Validation => Error::Validation(message),
            ErrorKind::Execution => Error::Execution(message),
            ErrorKind::Busy => Error::Busy(message),
        }),
    }
}
