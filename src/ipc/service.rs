//! Request dispatch for one endpoint

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};

use crate::cache::{CacheKey, CacheStats, ResultCache};
use crate::function::{Function, FunctionDescriptor};
use crate::ipc::protocol::{ErrorKind, Request, RequestKind, Response};
use crate::signature::BoundArgs;

/// The bound function of an endpoint together with its cache
///
/// Shared by every worker of the endpoint.
pub(crate) struct Service {
    descriptor: FunctionDescriptor,
    function: Arc<dyn Function>,
    cache: Option<ResultCache>,
}

impl Service {
    pub fn new(
        descriptor: FunctionDescriptor,
        function: Arc<dyn Function>,
        cache: Option<ResultCache>,
    ) -> Self {
        Self {
            descriptor,
            function,
            cache,
        }
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(ResultCache::stats)
    }

    /// Produce the response for a decoded request
    pub fn handle(&self, request: &Request) -> Response {
        match request.kind {
            RequestKind::Describe => Response::Result(
                self.descriptor
                    .documentation()
                    .map_or(Value::Null, |doc| Value::String(doc.to_string())),
            ),
            RequestKind::Call => self.call(&request.args, &request.kwargs),
        }
    }

    fn call(&self, args: &[Value], kwargs: &Map<String, Value>) -> Response {
        let name = self.name();

        let bound = match self.descriptor.signature().bind(args, kwargs) {
            Ok(bound) => bound,
            Err(e) => {
                tracing::warn!(function = name, error = %e, "invalid arguments");
                return Response::error(ErrorKind::Validation, e.to_string());
            }
        };

        let start = Instant::now();
        let execute = || self.execute(&bound);
        let outcome = match &self.cache {
            Some(cache) => match CacheKey::new(args, kwargs) {
                Ok(key) => cache.get_or_compute(key, execute),
                Err(e) => {
                    tracing::error!(function = name, error = %e, "cache key failed");
                    return Response::error(ErrorKind::Execution, e.to_string());
                }
            },
            None => execute().map(|value| (value, false)),
        };
        let elapsed = start.elapsed();

        match outcome {
            Ok((value, cached)) => {
                tracing::debug!(
                    function = name,
                    args = ?args,
                    kwargs = ?kwargs,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    cached,
                    "call completed"
                );
                Response::Result(value)
            }
            Err(message) => {
                tracing::debug!(
                    function = name,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    "call failed"
                );
                Response::error(ErrorKind::Execution, message)
            }
        }
    }

    /// Run the function body, turning errors and panics into a message
    fn execute(&self, bound: &BoundArgs) -> Result<Value, String> {
        let name = self.name();

        match catch_unwind(AssertUnwindSafe(|| self.function.call(bound))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!(function = name, args = ?bound, error = ?e, "function failed");
                Err(e.to_string())
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                tracing::error!(
                    function = name,
                    args = ?bound,
                    panic = %message,
                    "function panicked"
                );
                Err(format!("function panicked: {message}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicy;
    use crate::signature::Signature;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sum_service(cache: CachePolicy, runs: Arc<AtomicUsize>) -> Service {
        let function = FunctionDescriptor::new("sum_func", Signature::new().param("a").param("b"))
            .doc("Add two numbers.")
            .deterministic(true)
            .build(move |args| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(json!(args.get::<i64>("a")? + args.get::<i64>("b")?))
            });
        Service::new(
            function.descriptor(),
            Arc::new(function),
            ResultCache::for_policy(cache),
        )
    }

    #[test]
    fn test_call_and_describe() {
        let service = sum_service(CachePolicy::Disabled, Arc::default());

        let response = service.handle(&Request::call(vec![json!(3), json!(4)], Map::new()));
        assert_eq!(response, Response::Result(json!(7)));

        let doc = service.handle(&Request::describe());
        assert_eq!(doc, Response::Result(json!("Add two numbers.")));
        assert_eq!(service.handle(&Request::describe()), doc);
        assert!(service.cache_stats().is_none());
    }

    #[test]
    fn test_validation_never_runs_body() {
        let runs = Arc::new(AtomicUsize::new(0));
        let service = sum_service(CachePolicy::Disabled, runs.clone());

        let response = service.handle(&Request::call(vec![json!(1)], Map::new()));
        assert_eq!(
            response,
            Response::error(ErrorKind::Validation, "missing a required argument: 'b'")
        );
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cache_skips_repeat_execution() {
        let runs = Arc::new(AtomicUsize::new(0));
        let service = sum_service(CachePolicy::Unbounded, runs.clone());
        let request = Request::call(vec![json!(2), json!(5)], Map::new());

        assert_eq!(service.handle(&request), Response::Result(json!(7)));
        assert_eq!(service.handle(&request), Response::Result(json!(7)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let other = Request::call(vec![json!(2), json!(6)], Map::new());
        assert_eq!(service.handle(&other), Response::Result(json!(8)));
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let stats = service.cache_stats().unwrap();
        assert_eq!((stats.hits, stats.misses), (1, 2));
    }

    #[test]
    fn test_errors_and_panics_become_execution_errors() {
        let function = FunctionDescriptor::new("div", Signature::new().param("a").param("b"))
            .build(|args| {
                let a: i64 = args.get("a")?;
                let b: i64 = args.get("b")?;
                if b == 0 {
                    anyhow::bail!("division by zero");
                }
                if b < 0 {
                    panic!("negative divisor");
                }
                Ok(json!(a / b))
            });
        let service = Service::new(function.descriptor(), Arc::new(function), None);

        let response = service.handle(&Request::call(vec![json!(1), json!(0)], Map::new()));
        assert_eq!(response, Response::error(ErrorKind::Execution, "division by zero"));

        let response = service.handle(&Request::call(vec![json!(1), json!(-1)], Map::new()));
        assert_eq!(
            response,
            Response::error(ErrorKind::Execution, "function panicked: negative divisor")
        );

        let response = service.handle(&Request::call(vec![json!(9), json!(3)], Map::new()));
        assert_eq!(response, Response::Result(json!(3)));
    }
}
