//! Registration of hosted functions
//!
//! # Example
//!
//! ```rust,ignore
//! use lipc::{EndpointOptions, FunctionDescriptor, Registry, Signature, json};
//!
//! let registry = Registry::new();
//! let sum = FunctionDescriptor::new("sum_func", Signature::new().param("a").param("b"))
//!     .build(|args| Ok(json!(args.get::<i64>("a")? + args.get::<i64>("b")?)));
//!
//! let mut endpoint = registry.register(sum, EndpointOptions::default())?;
//! endpoint.start()?;
//! // ... serve until done
//! endpoint.terminate();
//! ```

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::{CacheStats, ResultCache};
use crate::config::EndpointOptions;
use crate::directory::Namespace;
use crate::error::{Error, Result};
use crate::function::Function;
use crate::ipc::host::Host;
use crate::ipc::server::{self, ServeContext};
use crate::ipc::service::Service;

type Names = Arc<Mutex<HashSet<String>>>;

fn lock(names: &Names) -> MutexGuard<'_, HashSet<String>> {
    names.lock().unwrap_or_else(|e| e.into_inner())
}

/// Hands out endpoints within one namespace
///
/// A name can be held by at most one [`EndpointHandle`] of a registry at a
/// time; dropping the handle releases it.
#[derive(Debug)]
pub struct Registry {
    namespace: Namespace,
    names: Names,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry for the namespace from `LIPC_NAMESPACE_DIR` or `/tmp`
    pub fn new() -> Self {
        Self::with_namespace(Namespace::from_env())
    }

    pub fn with_namespace(namespace: Namespace) -> Self {
        Self {
            namespace,
            names: Arc::default(),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Names currently held by live handles, sorted
    pub fn registered(&self) -> Vec<String> {
        lock(&self.names)
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Register `function` under its own name
    pub fn register<F: Function>(
        &self,
        function: F,
        options: EndpointOptions,
    ) -> Result<EndpointHandle> {
        let name = function.descriptor().name().to_string();
        self.register_as(name, function, options)
    }

    /// Register `function` under `name`
    ///
    /// Nothing is bound until [`EndpointHandle::start`] is called.
    pub fn register_as<F: Function>(
        &self,
        name: impl Into<String>,
        function: F,
        options: EndpointOptions,
    ) -> Result<EndpointHandle> {
        let name = name.into();
        let address = self.namespace.address_for(&name)?;
        let descriptor = function.descriptor().rename(&name);

        descriptor
            .signature()
            .check()
            .map_err(|reason| Error::InvalidSignature {
                name: name.clone(),
                reason,
            })?;
        if options.cache().is_enabled() && !descriptor.is_deterministic() {
            return Err(Error::NotCacheable(name));
        }
        if !lock(&self.names).insert(name.clone()) {
            return Err(Error::AlreadyRegistered(name));
        }

        let cache = ResultCache::for_policy(options.cache());
        let service = Service::new(descriptor, Arc::new(function), cache);
        tracing::debug!(function = %name, address = %address.display(), "registered endpoint");

        Ok(EndpointHandle {
            name,
            address,
            service: Arc::new(service),
            options,
            host: None,
            names: Arc::clone(&self.names),
        })
    }
}

/// A registered function and, once started, its running host
///
/// Dropping the handle terminates the endpoint.
pub struct EndpointHandle {
    name: String,
    address: PathBuf,
    service: Arc<Service>,
    options: EndpointOptions,
    host: Option<Host>,
    names: Names,
}

impl EndpointHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Socket address clients connect to
    pub fn address(&self) -> &Path {
        &self.address
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.host.is_some()
    }

    /// Cache counters, when caching is enabled
    ///
    /// With process isolation the counters live in the child and stay at zero
    /// here.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.service.cache_stats()
    }

    /// Bind the address and start serving
    ///
    /// The address is connectable once this returns. Starting a running
    /// endpoint does nothing.
    pub fn start(&mut self) -> Result<()> {
        if self.host.is_some() {
            tracing::debug!(function = %self.name, "endpoint already running");
            return Ok(());
        }

        if let Some(parent) = self.address.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = server::bind(&self.address, self.options.backlog())?;
        let ctx = ServeContext {
            service: Arc::clone(&self.service),
            options: self.options.clone(),
        };

        match Host::launch(listener, ctx, self.options.isolation()) {
            Ok(host) => {
                self.host = Some(host);
                tracing::info!(
                    function = %self.name,
                    address = %self.address.display(),
                    isolation = ?self.options.isolation(),
                    "endpoint started"
                );
                Ok(())
            }
            Err(e) => {
                server::remove_address(&self.address);
                Err(e)
            }
        }
    }

    /// Stop serving and remove the socket file
    ///
    /// In-flight calls get the grace period to finish. Terminating an endpoint
    /// that is not running does nothing. The handle may be started again.
    pub fn terminate(&mut self) {
        let Some(host) = self.host.take() else {
            return;
        };

        host.stop(self.options.grace_period());
        server::remove_address(&self.address);
        tracing::info!(function = %self.name, "endpoint terminated");
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        self.terminate();
        lock(&self.names).remove(&self.name);
    }
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
