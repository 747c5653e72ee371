use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;

/// The error type a [`CacheLoader`] may fail with.
pub type LoadError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The future returned by [`CacheLoader::load`].
pub type LoadFuture<'a, V> = BoxFuture<'a, Result<V, LoadError>>;

/// Produces the value for a cache key.
///
/// The loader is fixed when a [`CacheInstance`](super::CacheInstance) is created and is invoked
/// for cold keys as well as for background refreshes of stale keys. It may be slow and it may
/// fail; the cache makes sure that at most one invocation per key is in flight at a time.
pub trait CacheLoader<V>: Send + Sync + 'static {
    /// Loads the value for `key`.
    fn load<'a>(&'a self, key: &'a str) -> LoadFuture<'a, V>;
}

/// A [`CacheLoader`] backed by an async closure, created via [`loader_fn`].
pub struct FnLoader<F> {
    f: F,
}

impl<F> fmt::Debug for FnLoader<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnLoader").finish_non_exhaustive()
    }
}

impl<F, Fut, V, E> CacheLoader<V> for FnLoader<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
    E: Into<LoadError>,
{
    fn load<'a>(&'a self, key: &'a str) -> LoadFuture<'a, V> {
        (self.f)(key.to_owned()).map(|res| res.map_err(Into::into)).boxed()
    }
}

/// Wraps an async closure taking the owned key into a [`CacheLoader`].
///
/// ```
/// use smartcache::caching::loader_fn;
///
/// let loader = loader_fn(|key: String| async move {
///     Ok::<_, std::io::Error>(key.len())
/// });
/// # let _ = loader;
/// ```
pub fn loader_fn<F, Fut, V, E>(f: F) -> FnLoader<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
    E: Into<LoadError>,
{
    FnLoader { f }
}
