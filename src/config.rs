use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::level_filters::LevelFilter;

use crate::cache::CachePolicy;
use crate::directory::Namespace;
use crate::logging::{DEFAULT_MAX_BYTES, DEFAULT_MAX_FILES};

const DEFAULT_BACKLOG: i32 = 8;
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Where an endpoint's accept loop runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Isolation {
    /// A dedicated thread in the registering process
    #[default]
    Thread,
    /// A forked child process
    Process,
}

fn default_max_workers() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    (cpus + 4).min(32)
}

/// Options of a registered endpoint
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    cache: CachePolicy,
    isolation: Isolation,
    max_workers: usize,
    max_pending: usize,
    backlog: i32,
    grace_period: Duration,
    io_timeout: Option<Duration>,
    log_level: LevelFilter,
    log_dir: Option<PathBuf>,
    log_max_bytes: u64,
    log_max_files: usize,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        let max_workers = default_max_workers();
        Self {
            cache: CachePolicy::Disabled,
            isolation: Isolation::Thread,
            max_workers,
            max_pending: max_workers,
            backlog: DEFAULT_BACKLOG,
            grace_period: DEFAULT_GRACE_PERIOD,
            io_timeout: Some(DEFAULT_IO_TIMEOUT),
            log_level: LevelFilter::INFO,
            log_dir: None,
            log_max_bytes: DEFAULT_MAX_BYTES,
            log_max_files: DEFAULT_MAX_FILES,
        }
    }
}

impl EndpointOptions {
    /// Create a new builder for EndpointOptions
    pub fn builder() -> EndpointOptionsBuilder {
        EndpointOptionsBuilder::default()
    }

    pub fn cache(&self) -> CachePolicy {
        self.cache
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn backlog(&self) -> i32 {
        self.backlog
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    pub fn log_max_bytes(&self) -> u64 {
        self.log_max_bytes
    }

    pub fn log_max_files(&self) -> usize {
        self.log_max_files
    }
}

/// Builder for EndpointOptions
#[derive(Debug, Default)]
pub struct EndpointOptionsBuilder {
    inner: EndpointOptions,
    cache_enabled: bool,
    cache_capacity: Option<usize>,
}

impl EndpointOptionsBuilder {
    /// Memoize results; requires a deterministic function
    pub fn cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Bound the cache; `0` keeps it unbounded
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }

    pub fn isolation(mut self, isolation: Isolation) -> Self {
        self.inner.isolation = isolation;
        self
    }

    /// Upper bound on concurrently handled connections
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.inner.max_workers = workers.max(1);
        self
    }

    /// Accepted connections allowed to wait for a worker, at least one
    pub fn max_pending(mut self, pending: usize) -> Self {
        self.inner.max_pending = pending.max(1);
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.inner.backlog = backlog.max(1);
        self
    }

    /// How long `terminate()` waits for in-flight calls
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.inner.grace_period = grace;
        self
    }

    /// Read/write timeout on accepted connections; `None` waits forever
    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inner.io_timeout = timeout;
        self
    }

    pub fn log_level(mut self, level: impl Into<LevelFilter>) -> Self {
        self.inner.log_level = level.into();
        self
    }

    /// Write `log_<name>.log` into `dir`
    pub fn log_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.inner.log_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn log_rotation(mut self, max_bytes: u64, max_files: usize) -> Self {
        self.inner.log_max_bytes = max_bytes;
        self.inner.log_max_files = max_files;
        self
    }

    pub fn build(mut self) -> EndpointOptions {
        self.inner.cache = CachePolicy::from_options(self.cache_enabled, self.cache_capacity);
        self.inner
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    namespace: Namespace,
    timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace: Namespace::from_env(),
            timeout: Some(DEFAULT_IO_TIMEOUT),
        }
    }
}

impl ClientConfig {
    /// Create a new builder for ClientConfig
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Builder for ClientConfig
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    inner: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn namespace(mut self, namespace: Namespace) -> Self {
        self.inner.namespace = namespace;
        self
    }

    pub fn namespace_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.inner.namespace = Namespace::new(dir);
        self
    }

    /// Read/write timeout of each call; `None` waits forever
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inner.timeout = timeout;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;

    #[test]
    fn test_endpoint_defaults() {
        let options = EndpointOptions::default();
        assert_eq!(options.cache(), CachePolicy::Disabled);
        assert_eq!(options.isolation(), Isolation::Thread);
        assert_eq!(options.log_level(), LevelFilter::INFO);
        assert!(options.log_dir().is_none());
        assert!(options.max_workers() >= 1 && options.max_workers() <= 32);
    }

    #[test]
    fn test_cache_options() {
        let options = EndpointOptions::builder().cache(true).build();
        assert_eq!(options.cache(), CachePolicy::Unbounded);

        let options = EndpointOptions::builder()
            .cache(true)
            .cache_capacity(16)
            .build();
        assert_eq!(
            options.cache(),
            CachePolicy::Bounded(NonZeroUsize::new(16).unwrap())
        );

        let options = EndpointOptions::builder().cache_capacity(16).build();
        assert_eq!(options.cache(), CachePolicy::Disabled);
    }

    #[test]
    fn test_worker_floor() {
        let options = EndpointOptions::builder().max_workers(0).build();
        assert_eq!(options.max_workers(), 1);
    }

    #[test]
    fn test_client_builder() {
        let config = ClientConfig::builder()
            .namespace_dir("/run/lipc")
            .timeout(None)
            .build();
        assert_eq!(config.namespace().dir(), Path::new("/run/lipc"));
        assert_eq!(config.timeout(), None);
    }
}
