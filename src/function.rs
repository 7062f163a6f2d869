//! Hosted function definition
//!
//! Users implement [`Function`] (or build one from a closure with
//! [`FunctionDescriptor::build`]) to expose it as an endpoint.
//!
//! # Example
//!
//! ```rust,ignore
//! use lipc::{FunctionDescriptor, Signature, json};
//!
//! let sum = FunctionDescriptor::new("sum_func", Signature::new().param("a").param("b"))
//!     .doc("Add two integers.")
//!     .deterministic(true)
//!     .build(|args| {
//!         let a: i64 = args.get("a")?;
//!         let b: i64 = args.get("b")?;
//!         Ok(json!(a + b))
//!     });
//! ```

use std::fmt;

use serde_json::Value;

use crate::signature::{BoundArgs, Signature};

/// Name, declared parameters and documentation of a hosted function
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDescriptor {
    name: String,
    signature: Signature,
    doc: Option<String>,
    deterministic: bool,
}

impl FunctionDescriptor {
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        Self {
            name: name.into(),
            signature,
            doc: None,
            deterministic: false,
        }
    }

    /// Documentation text returned to DESCRIBE requests
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Mark the function pure, which allows its results to be cached
    pub fn deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    /// Attach a closure as the function body
    pub fn build<F>(self, body: F) -> FnFunction<F>
    where
        F: Fn(&BoundArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        FnFunction {
            descriptor: self,
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn documentation(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    pub fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    pub(crate) fn rename(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// A function that can be hosted as an endpoint
///
/// `call` runs on a worker thread of the endpoint, possibly concurrently with
/// other calls, and only after the request's arguments were bound against
/// `descriptor().signature()`.
pub trait Function: Send + Sync + 'static {
    /// Description used for the endpoint name, argument checks and DESCRIBE
    fn descriptor(&self) -> FunctionDescriptor;

    /// Run the function body
    ///
    /// An `Err` is stringified for the caller; its full chain is logged on the
    /// host side only.
    fn call(&self, args: &BoundArgs) -> anyhow::Result<Value>;
}

/// A [`Function`] backed by a closure
pub struct FnFunction<F> {
    descriptor: FunctionDescriptor,
    body: F,
}

impl<F> Function for FnFunction<F>
where
    F: Fn(&BoundArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    fn descriptor(&self) -> FunctionDescriptor {
        self.descriptor.clone()
    }

    fn call(&self, args: &BoundArgs) -> anyhow::Result<Value> {
        (self.body)(args)
    }
}

impl<F> fmt::Debug for FnFunction<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFunction")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    #[test]
    fn test_closure_function_calls_body() {
        let square = FunctionDescriptor::new("square", Signature::new().param("n"))
            .doc("Square a number.")
            .build(|args| {
                let n: i64 = args.get("n")?;
                Ok(json!(n * n))
            });

        let descriptor = square.descriptor();
        assert_eq!(descriptor.name(), "square");
        assert_eq!(descriptor.documentation(), Some("Square a number."));
        assert!(!descriptor.is_deterministic());

        let bound = descriptor
            .signature()
            .bind(&[json!(7)], &Map::new())
            .unwrap();
        assert_eq!(square.call(&bound).unwrap(), json!(49));
    }

    #[test]
    fn test_argument_errors_propagate_through_body() {
        let f = FunctionDescriptor::new("f", Signature::new().param("n"))
            .build(|args| Ok(json!(args.get::<i64>("n")?)));
        let bound = f
            .descriptor()
            .signature()
            .bind(&[json!("not a number")], &Map::new())
            .unwrap();
        let err = f.call(&bound).unwrap_err();
        assert!(err.to_string().contains("'n'"));
    }
}
