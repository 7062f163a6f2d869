//! Declared parameters and argument binding
//!
//! A [`Signature`] is declared once when a function is registered. Every CALL
//! request is bound against it before the function body runs, so a mismatch is
//! reported to the caller without executing anything.

use std::collections::{BTreeMap, HashSet};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors produced when a request's arguments do not fit a signature
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("missing a required argument: '{0}'")]
    Missing(String),

    #[error(
        "unexpected positional argument at index {index}: expected at most {expected}, got {given}"
    )]
    TooManyPositional {
        index: usize,
        expected: usize,
        given: usize,
    },

    #[error("multiple values for argument '{0}'")]
    MultipleValues(String),

    #[error("got an unexpected keyword argument '{0}'")]
    UnexpectedKeyword(String),
}

/// Errors produced when extracting a typed value from bound arguments
#[derive(Debug, Error)]
pub enum ArgumentError {
    #[error("no argument named '{0}'")]
    Unknown(String),

    #[error("argument '{name}' has the wrong type: {source}")]
    Type {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A single declared parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    name: String,
    default: Option<Value>,
}

impl Param {
    /// A parameter the caller must supply
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    /// A parameter that falls back to `default` when omitted
    pub fn optional(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Declared parameters of a hosted function
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    params: Vec<Param>,
    rest: Option<String>,
    extra: Option<String>,
}

impl Signature {
    /// An empty signature: accepts no arguments at all
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a required parameter
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param::required(name));
        self
    }

    /// Append a parameter with a default value
    pub fn optional(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.params.push(Param::optional(name, default));
        self
    }

    /// Collect surplus positional arguments under `name`
    pub fn rest(mut self, name: impl Into<String>) -> Self {
        self.rest = Some(name.into());
        self
    }

    /// Collect surplus keyword arguments under `name`
    pub fn extra(mut self, name: impl Into<String>) -> Self {
        self.extra = Some(name.into());
        self
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn rest_name(&self) -> Option<&str> {
        self.rest.as_deref()
    }

    pub fn extra_name(&self) -> Option<&str> {
        self.extra.as_deref()
    }

    /// Check the signature is well formed
    ///
    /// Names must be non-empty and unique, and a required parameter may not
    /// follow one that has a default.
    pub fn check(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        let mut saw_default = false;

        let collectors = self.rest.iter().chain(self.extra.iter());
        for name in self.params.iter().map(|p| &p.name).chain(collectors) {
            if name.is_empty() {
                return Err("parameter names must not be empty".to_string());
            }
            if !seen.insert(name.as_str()) {
                return Err(format!("duplicate parameter '{name}'"));
            }
        }

        for param in &self.params {
            match (&param.default, saw_default) {
                (Some(_), _) => saw_default = true,
                (None, true) => {
                    return Err(format!(
                        "required parameter '{}' follows a parameter with a default",
                        param.name
                    ));
                }
                (None, false) => {}
            }
        }

        Ok(())
    }

    /// Bind request arguments to the declared parameters
    pub fn bind(
        &self,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<BoundArgs, BindError> {
        let mut values: BTreeMap<String, Value> = BTreeMap::new();
        let mut rest = Vec::new();
        let mut extra = Map::new();

        for (index, value) in args.iter().enumerate() {
            match self.params.get(index) {
                Some(param) => {
                    values.insert(param.name.clone(), value.clone());
                }
                None if self.rest.is_some() => rest.push(value.clone()),
                None => {
                    return Err(BindError::TooManyPositional {
                        index,
                        expected: self.params.len(),
                        given: args.len(),
                    });
                }
            }
        }

        for (key, value) in kwargs {
            if self.params.iter().any(|p| &p.name == key) {
                if values.contains_key(key) {
                    return Err(BindError::MultipleValues(key.clone()));
                }
                values.insert(key.clone(), value.clone());
            } else if self.extra.is_some() {
                extra.insert(key.clone(), value.clone());
            } else {
                return Err(BindError::UnexpectedKeyword(key.clone()));
            }
        }

        for param in &self.params {
            if values.contains_key(&param.name) {
                continue;
            }
            match &param.default {
                Some(default) => {
                    values.insert(param.name.clone(), default.clone());
                }
                None => return Err(BindError::Missing(param.name.clone())),
            }
        }

        Ok(BoundArgs {
            values,
            rest,
            extra,
        })
    }
}

/// Arguments after binding: every declared parameter has a value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs {
    values: BTreeMap<String, Value>,
    rest: Vec<Value>,
    extra: Map<String, Value>,
}

impl BoundArgs {
    /// Raw value of a declared parameter
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Deserialize a declared parameter into `T`
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, ArgumentError> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| ArgumentError::Unknown(name.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|source| ArgumentError::Type {
            name: name.to_string(),
            source,
        })
    }

    /// Surplus positional values collected by the `rest` parameter
    pub fn rest(&self) -> &[Value] {
        &self.rest
    }

    /// Deserialize every surplus positional value into `T`
    pub fn rest_as<T: DeserializeOwned>(&self) -> Result<Vec<T>, ArgumentError> {
        self.rest
            .iter()
            .enumerate()
            .map(|(index, value)| {
                serde_json::from_value(value.clone()).map_err(|source| ArgumentError::Type {
                    name: format!("rest[{index}]"),
                    source,
                })
            })
            .collect()
    }

    /// Surplus keyword values collected by the `extra` parameter
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair() -> Signature {
        Signature::new().param("a").param("b")
    }

    fn kwargs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_bind_positional() {
        let bound = pair().bind(&[json!(3), json!(4)], &Map::new()).unwrap();
        assert_eq!(bound.get::<i64>("a").unwrap(), 3);
        assert_eq!(bound.get::<i64>("b").unwrap(), 4);
    }

    #[test]
    fn test_bind_keywords_and_mixed() {
        let bound = pair()
            .bind(&[json!(1)], &kwargs(json!({"b": 2})))
            .unwrap();
        assert_eq!(bound.value("a"), Some(&json!(1)));
        assert_eq!(bound.value("b"), Some(&json!(2)));
    }

    #[test]
    fn test_missing_argument_names_parameter() {
        let err = pair().bind(&[json!(1)], &Map::new()).unwrap_err();
        assert_eq!(err, BindError::Missing("b".to_string()));
        assert_eq!(err.to_string(), "missing a required argument: 'b'");
    }

    #[test]
    fn test_too_many_positional() {
        let err = pair()
            .bind(&[json!(1), json!(2), json!(3)], &Map::new())
            .unwrap_err();
        assert_eq!(
            err,
            BindError::TooManyPositional {
                index: 2,
                expected: 2,
                given: 3
            }
        );
        assert_eq!(
            err.to_string(),
            "unexpected positional argument at index 2: expected at most 2, got 3"
        );
    }

    #[test]
    fn test_multiple_values() {
        let err = pair()
            .bind(&[json!(1), json!(2)], &kwargs(json!({"a": 5})))
            .unwrap_err();
        assert_eq!(err, BindError::MultipleValues("a".to_string()));
    }

    #[test]
    fn test_unexpected_keyword() {
        let err = pair()
            .bind(&[json!(1), json!(2)], &kwargs(json!({"c": 5})))
            .unwrap_err();
        assert!(err.to_string().contains("'c'"));
    }

    #[test]
    fn test_defaults_fill_in() {
        let sig = Signature::new().param("n").optional("scale", 10);
        let bound = sig.bind(&[json!(2)], &Map::new()).unwrap();
        assert_eq!(bound.get::<i64>("scale").unwrap(), 10);

        let bound = sig.bind(&[json!(2), json!(3)], &Map::new()).unwrap();
        assert_eq!(bound.get::<i64>("scale").unwrap(), 3);
    }

    #[test]
    fn test_rest_and_extra_collect_surplus() {
        let sig = Signature::new().rest("values").extra("options");
        let bound = sig
            .bind(&[json!(1), json!(2), json!(3)], &kwargs(json!({"verbose": true})))
            .unwrap();
        assert_eq!(bound.rest_as::<i64>().unwrap(), vec![1, 2, 3]);
        assert_eq!(bound.extra().get("verbose"), Some(&json!(true)));
    }

    #[test]
    fn test_typed_extraction_errors() {
        let bound = pair().bind(&[json!("x"), json!(2)], &Map::new()).unwrap();
        assert!(matches!(
            bound.get::<i64>("a"),
            Err(ArgumentError::Type { ref name, .. }) if name == "a"
        ));
        assert!(matches!(bound.get::<i64>("zz"), Err(ArgumentError::Unknown(_))));
    }

    #[test]
    fn test_check_rejects_malformed() {
        assert!(pair().check().is_ok());
        assert!(Signature::new().param("a").param("a").check().is_err());
        assert!(Signature::new().param("a").rest("a").check().is_err());
        assert!(Signature::new().optional("a", 1).param("b").check().is_err());
        assert!(Signature::new().param("").check().is_err());
    }
}
