use thiserror::Error;

/// An error that happens while loading a value into a cache.
///
/// This error is handed out to every caller that was waiting on the same load, which is
/// why it is [`Clone`] and only carries the rendered message of the underlying loader error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The loader returned an error.
    ///
    /// The attached string contains the loader's error message.
    #[error("load failed: {0}")]
    LoadFailed(String),
    /// The load task panicked or was aborted before it could produce a value.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// Converts a loader error into a [`CacheError::LoadFailed`].
    pub fn from_load_error(err: &(dyn std::error::Error + Send + Sync + 'static)) -> Self {
        Self::LoadFailed(err.to_string())
    }

    /// A short tag used when reporting this error in metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::LoadFailed(_) => "load-failed",
            Self::InternalError => "internal",
        }
    }
}

impl From<tokio::task::JoinError> for CacheError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> Self {
        let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "Cache load task did not complete");
        Self::InternalError
    }
}

/// The result of a cache lookup.
pub type CacheResult<T> = Result<T, CacheError>;
