//! Endpoint hosting and the wire protocol
//!
//! Each endpoint owns one Unix listener. An accept loop hands connections to
//! a bounded worker pool; every connection carries exactly one request and
//! one response, both length-prefixed MessagePack maps.

pub(crate) mod host;
pub(crate) mod pool;
pub mod protocol;
pub(crate) mod server;
pub(crate) mod service;

pub use protocol::{
    ErrorKind, MAX_FRAME_LEN, Request, RequestKind, Response, read_frame, write_frame,
};
