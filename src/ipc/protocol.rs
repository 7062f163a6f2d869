//! Wire protocol types for local calls
//!
//! Wire format, one message per connection in each direction:
//! ```text
//! Frame:
//!   [4 bytes: body length (u32 BE)]
//!   [body bytes (MessagePack map)]
//!
//! Request body:
//!   {args: [value...], kwargs: {string: value}, type: "call" | "docstring"}
//!
//! Response body, exactly one of:
//!   {result: value}
//!   {error: string, kind?: "validation" | "execution" | "busy"}
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// What a request asks the endpoint to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestKind {
    /// Execute the function
    #[default]
    Call,
    /// Return the documentation text without executing
    Describe,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Call => "call",
            RequestKind::Describe => "docstring",
        }
    }
}

impl FromStr for RequestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(RequestKind::Call),
            "docstring" => Ok(RequestKind::Describe),
            other => Err(format!("unknown request type: {other}")),
        }
    }
}

impl Serialize for RequestKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RequestKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let kind = String::deserialize(deserializer)?;
        kind.parse().map_err(serde::de::Error::custom)
    }
}

/// Request decoded from wire format
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default, rename = "type")]
    pub kind: RequestKind,
}

impl Request {
    pub fn call(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            args,
            kwargs,
            kind: RequestKind::Call,
        }
    }

    pub fn describe() -> Self {
        Self {
            kind: RequestKind::Describe,
            ..Self::default()
        }
    }

    /// Serialize to a length-prefixed frame
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        frame(rmp_serde::to_vec_named(self)?)
    }

    /// Parse a request from a frame body (after the length prefix)
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(body)?)
    }
}

/// Why an endpoint answered with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Arguments did not fit the declared parameters; nothing ran
    Validation,
    /// The function itself failed
    Execution,
    /// No worker could take the connection
    Busy,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Execution => "execution",
            ErrorKind::Busy => "busy",
        }
    }

    fn parse(kind: Option<&Value>) -> Self {
        match kind.and_then(Value::as_str) {
            Some("validation") => ErrorKind::Validation,
            Some("busy") => ErrorKind::Busy,
            _ => ErrorKind::Execution,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response to be sent over wire: a result or an error, never both
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Result(Value),
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            kind,
            message: message.into(),
        }
    }

    /// Serialize to a length-prefixed frame
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = Map::new();
        match self {
            Response::Result(value) => {
                body.insert("result".to_string(), value.clone());
            }
            Response::Error { kind, message } => {
                body.insert("error".to_string(), Value::String(message.clone()));
                body.insert("kind".to_string(), Value::String(kind.as_str().to_string()));
            }
        }
        frame(rmp_serde::to_vec_named(&body)?)
    }

    /// Parse a response from a frame body (after the length prefix)
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        let mut map: Map<String, Value> = rmp_serde::from_slice(body)?;
        match (map.remove("result"), map.remove("error")) {
            (Some(value), None) => Ok(Response::Result(value)),
            (None, Some(Value::String(message))) => Ok(Response::Error {
                kind: ErrorKind::parse(map.get("kind")),
                message,
            }),
            (None, Some(other)) => Err(Error::Protocol(format!(
                "error message must be a string, got {other}"
            ))),
            (Some(_), Some(_)) => Err(Error::Protocol(
                "response carries both a result and an error".to_string(),
            )),
            (None, None) => Err(Error::Protocol(
                "response carries neither a result nor an error".to_string(),
            )),
        }
    }
}

/// Prefix a body with its length
fn frame(body: Vec<u8>) -> Result<Vec<u8>> {
    if body.is_empty() || body.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("invalid frame length: {}", body.len())));
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    // Body length (u32 BE)
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Read one complete frame body
///
/// An out-of-range length prefix is reported as `InvalidData`; a peer that
/// closes early surfaces as `UnexpectedEof`.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length: {len}"),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

/// Write an already framed message and flush it
pub fn write_frame<W: Write>(writer: &mut W, framed: &[u8]) -> io::Result<()> {
    writer.write_all(framed)?;
    writer.flush()
}
