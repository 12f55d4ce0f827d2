use thiserror::Error;

/// An error that happens when requesting a resource from the cache.
///
/// The error is cloneable so that the outcome of a single load can be handed to every caller that
/// joined it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The loader failed to produce the resource.
    ///
    /// The attached string contains the loader's error message, including its causes.
    #[error("load failed: {0}")]
    LoadFailed(String),
    /// The requested identifier can not be turned into a valid cache key, or the loader could not
    /// make sense of it.
    #[error("invalid cache key: {0}")]
    CacheKeyInvalid(String),
    /// The cache refuses to start new loads because memory pressure is critical.
    #[error("memory pressure is critical")]
    MemoryCritical,
    /// The load was cancelled before it settled, either because it exceeded the maximum task age
    /// or because the cache was cleared or invalidated in the meantime.
    #[error("load cancelled")]
    LoadCancelled,
    /// Too many loads are already in flight.
    #[error("too many loads in flight")]
    Overloaded,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    /// Converts an arbitrary error into [`LoadFailed`](Self::LoadFailed), keeping its causes.
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "resource load failed");

        let mut message = e.to_string();
        let mut source = e.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::LoadFailed(message)
    }

    /// A short, static name for this error, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            CacheError::LoadFailed(_) => "load_failed",
            CacheError::CacheKeyInvalid(_) => "invalid_key",
            CacheError::MemoryCritical => "memory_critical",
            CacheError::LoadCancelled => "cancelled",
            CacheError::Overloaded => "overloaded",
        }
    }
}

/// The outcome of a cache request: either `Ok(T)` or the reason why no resource is available.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
