//! The coordinator callers interact with: per-key requests, the dispatch
//! queue, the cache, and the explicit dispatch trigger.

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::hash::Hash;
use std::mem;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use crate::batch::{BatchJob, Chunk, Drive, LoadFuture, LoadHandle};
use crate::cache::{CacheMap, HashMapCache};
use crate::environment::Environment;
use crate::reply::{BatchFn, LoadError};
use crate::wakerset::Token;

/// What [`Loader::prime`] should do when the cache already holds an entry
/// for the key being primed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Leave the existing entry alone; the prime is a no-op.
    Keep,
    /// Replace the existing entry with the primed outcome. Futures already
    /// handed out for the old entry are unaffected.
    Replace,
}

/// Configuration for a [`Loader`]. Every field has a sensible default;
/// construct with `LoaderOptions::default()` and override what you need.
pub struct LoaderOptions<K, V, E, C, CK> {
    /// When false, dispatch invokes the batch function once per queued
    /// key instead of once per batch. Loads still queue until dispatch;
    /// they are never resolved synchronously. Default: true.
    pub batching: bool,

    /// When false, every load creates a fresh request and nothing is
    /// remembered between them; the batch function may see the same key
    /// any number of times. Default: true.
    pub caching: bool,

    /// Upper bound on the number of keys per batch function invocation.
    /// A dispatch cycle with more queued keys than this makes several
    /// invocations, in queue order. Default: unbounded.
    pub max_batch_size: Option<NonZeroUsize>,

    /// Derives the cache key for a requested key. The default is the
    /// identity function.
    pub cache_key: Box<dyn Fn(&K) -> CK + Send + Sync>,

    /// The cache backend. Defaults to an unbounded [`HashMapCache`].
    pub cache: Box<dyn CacheMap<CK, LoadHandle<V, E>> + Send>,

    /// Produces the [`Environment`] for a dispatch cycle. Invoked once
    /// per cycle, at dispatch time, so the environment reflects the state
    /// of the world at the moment the batch actually runs. The default
    /// yields the neutral environment.
    pub environment: Box<dyn Fn() -> Environment<K, C> + Send + Sync>,
}

impl<K, V, E, C> Default for LoaderOptions<K, V, E, C, K>
where
    K: Clone + Hash + Eq + Send + 'static,
    V: Send + 'static,
    E: Send + 'static,
    C: 'static,
{
    fn default() -> Self {
        LoaderOptions {
            batching: true,
            caching: true,
            max_batch_size: None,
            cache_key: Box::new(|key: &K| key.clone()),
            cache: Box::new(HashMapCache::new()),
            environment: Box::new(Environment::default),
        }
    }
}

impl<K, V, E, C, CK> Debug for LoaderOptions<K, V, E, C, CK> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderOptions")
            .field("batching", &self.batching)
            .field("caching", &self.caching)
            .field("max_batch_size", &self.max_batch_size)
            .field("cache_key", &"<closure>")
            .field("cache", &"<cache>")
            .field("environment", &"<closure>")
            .finish()
    }
}

struct Inner<K, V, E, CK> {
    queue: Vec<(K, LoadHandle<V, E>)>,
    cache: Box<dyn CacheMap<CK, LoadHandle<V, E>> + Send>,
}

/// Coordinates batching and caching of per-key requests against one batch
/// function.
///
/// Individual requests are made with [`load`]; nothing is fetched until
/// [`dispatch`] is called, at which point every queued key is resolved by
/// a single batch function invocation (or several, under
/// [`max_batch_size`]). Results are cached, so repeated loads for a key
/// share one fetch and one outcome for the loader's lifetime, unless
/// cleared.
///
/// A `Loader` can be shared by reference across concurrent tasks, even on
/// different threads; loads racing with a dispatch are atomically either
/// in that cycle or queued for the next one.
///
/// Loaders are cheap to create and callers are expected to create one per
/// logical operation boundary (for instance, per incoming request of a
/// larger system), so that the cache's lifetime matches the operation's.
///
/// [`load`]: Loader::load
/// [`dispatch`]: Loader::dispatch
/// [`max_batch_size`]: LoaderOptions::max_batch_size
pub struct Loader<K, V, E, C, CK, B> {
    batch_fn: B,
    batching: bool,
    caching: bool,
    max_batch_size: Option<NonZeroUsize>,
    cache_key: Box<dyn Fn(&K) -> CK + Send + Sync>,
    environment: Box<dyn Fn() -> Environment<K, C> + Send + Sync>,
    inner: Mutex<Inner<K, V, E, CK>>,
}

impl<K, V, E, C, B> Loader<K, V, E, C, K, B>
where
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    C: Send + Sync + 'static,
    B: BatchFn<K, V, E, C> + Send + 'static,
    B::Fut: Send + 'static,
{
    /// Create a loader over `batch_fn` with default options: batching and
    /// caching on, no batch size limit, identity cache keys, neutral
    /// environment.
    pub fn new(batch_fn: B) -> Self {
        Self::with_options(batch_fn, LoaderOptions::default())
    }
}

impl<K, V, E, C, CK, B> Loader<K, V, E, C, CK, B>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    C: Send + Sync + 'static,
    B: BatchFn<K, V, E, C> + Send + 'static,
    B::Fut: Send + 'static,
{
    /// Create a loader over `batch_fn` with explicit options.
    pub fn with_options(batch_fn: B, options: LoaderOptions<K, V, E, C, CK>) -> Self {
        let LoaderOptions {
            batching,
            caching,
            max_batch_size,
            cache_key,
            cache,
            environment,
        } = options;

        Loader {
            batch_fn,
            batching,
            caching,
            max_batch_size,
            cache_key,
            environment,
            inner: Mutex::new(Inner {
                queue: Vec::new(),
                cache,
            }),
        }
    }

    /// Request the value for one key.
    ///
    /// If the cache already holds a result (settled or in flight) for the
    /// key, the returned future resolves from it and no new work is
    /// queued. Otherwise the key joins the dispatch queue and the future
    /// resolves once a later [`dispatch`] settles it.
    ///
    /// This never blocks and never invokes the batch function; it only
    /// does bookkeeping.
    ///
    /// [`dispatch`]: Loader::dispatch
    pub fn load(&self, key: K) -> LoadFuture<V, E> {
        if !self.caching {
            let handle = LoadHandle::pending();
            self.inner
                .lock()
                .unwrap()
                .queue
                .push((key, handle.clone()));
            return handle.future();
        }

        // Derive the cache key outside the lock; it's a user callback.
        let cache_key = (self.cache_key)(&key);

        let mut inner = self.inner.lock().unwrap();
        if let Some(handle) = inner.cache.get(&cache_key) {
            return handle.future();
        }

        let handle = LoadHandle::pending();
        inner.cache.put(cache_key, handle.clone());
        inner.queue.push((key, handle.clone()));
        handle.future()
    }

    /// Request values for several keys, returning one future per key in
    /// the same order, duplicates included. Duplicate keys resolve from
    /// the same underlying slot.
    pub fn load_many(&self, keys: impl IntoIterator<Item = K>) -> Vec<LoadFuture<V, E>> {
        keys.into_iter().map(|key| self.load(key)).collect()
    }

    /// Send every queued key to the batch function.
    ///
    /// The queue is drained immediately, in this call: keys loaded after
    /// `dispatch` returns (or from another task during it) always belong
    /// to the next cycle. The returned [`Dispatch`] future resolves to
    /// this cycle's outcomes in queue order once the batch has settled.
    ///
    /// Awaiting the returned future is one way to run the batch, but not
    /// the only one: once `dispatch` has been called, awaiting any of the
    /// cycle's load futures drives it too, so dropping the `Dispatch`
    /// future unpolled does not cancel the cycle.
    ///
    /// An empty queue makes no batch function call and yields an
    /// immediately-ready empty outcome list.
    pub fn dispatch(&self) -> Dispatch<V, E> {
        let drained = mem::take(&mut self.inner.lock().unwrap().queue);
        if drained.is_empty() {
            return Dispatch {
                job: None,
                handles: Vec::new(),
                drive_token: None,
            };
        }

        // The provider is a user callback and runs outside the lock, once
        // per cycle: the environment reflects the moment of dispatch, not
        // the moments keys were loaded.
        let environment = (self.environment)();

        let chunk_size = if self.batching {
            self.max_batch_size
                .map(NonZeroUsize::get)
                .unwrap_or_else(|| drained.len())
        } else {
            1
        };

        let handles: Vec<LoadHandle<V, E>> =
            drained.iter().map(|(_key, handle)| handle.clone()).collect();

        let mut chunks = VecDeque::new();
        let mut keys = Vec::new();
        let mut chunk_handles = Vec::new();
        for (key, handle) in drained {
            keys.push(key);
            chunk_handles.push(handle);
            if keys.len() == chunk_size {
                chunks.push_back(Chunk {
                    keys: mem::take(&mut keys),
                    handles: mem::take(&mut chunk_handles),
                });
            }
        }
        if !keys.is_empty() {
            chunks.push_back(Chunk {
                keys,
                handles: chunk_handles,
            });
        }

        tracing::debug!(
            keys = handles.len(),
            batches = chunks.len(),
            "dispatching queued loads"
        );

        let job: Arc<dyn Drive> = Arc::new(Mutex::new(BatchJob::new(
            self.batch_fn.clone(),
            environment,
            chunks,
        )));

        // Point every drained slot at the job and wake anything already
        // awaiting one of them, so the batch gets driven even if the
        // Dispatch future returned here is dropped unpolled.
        for handle in &handles {
            handle.attach(&job);
        }

        Dispatch {
            job: Some(job),
            handles,
            drive_token: None,
        }
    }

    /// Dispatch until the queue stays empty, collecting every cycle's
    /// outcomes in order.
    ///
    /// Useful when settling one batch enqueues follow-up loads (a task
    /// awaiting a load may react by loading more keys); plain
    /// [`dispatch`] would leave those queued. Between cycles this yields
    /// once to the executor, so tasks woken by a cycle's settlement get
    /// the chance to issue their follow-up loads before the queue is
    /// rechecked.
    ///
    /// [`dispatch`]: Loader::dispatch
    pub async fn dispatch_and_join(&self) -> Vec<Result<V, LoadError<E>>> {
        let mut outcomes = self.dispatch().await;
        loop {
            YieldNow { yielded: false }.await;
            if self.dispatch_depth() == 0 {
                return outcomes;
            }
            outcomes.extend(self.dispatch().await);
        }
    }

    /// The number of keys queued for the next dispatch cycle.
    pub fn dispatch_depth(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Forget the cached result for one key. Queued or in-flight requests
    /// for the key still settle normally; only future [`load`] calls are
    /// affected, which will fetch fresh.
    ///
    /// [`load`]: Loader::load
    pub fn clear(&self, key: &K) {
        let cache_key = (self.cache_key)(key);
        self.inner.lock().unwrap().cache.delete(&cache_key);
    }

    /// Forget every cached result.
    pub fn clear_all(&self) {
        self.inner.lock().unwrap().cache.clear();
    }

    /// Seed the cache with a precomputed outcome for `key`, so that loads
    /// for it resolve immediately without ever reaching the batch
    /// function. `on_conflict` chooses what happens if the key is already
    /// cached. A no-op when caching is disabled.
    pub fn prime(&self, on_conflict: OnConflict, key: K, outcome: Result<V, E>) {
        if !self.caching {
            return;
        }

        let cache_key = (self.cache_key)(&key);

        let mut inner = self.inner.lock().unwrap();
        if on_conflict == OnConflict::Keep && inner.cache.get(&cache_key).is_some() {
            return;
        }

        inner.cache.put(
            cache_key,
            LoadHandle::settled(outcome.map_err(LoadError::Loader)),
        );
    }
}

impl<K, V, E, C, CK, B> Debug for Loader<K, V, E, C, CK, B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("batch_fn", &"<closure>")
            .field("batching", &self.batching)
            .field("caching", &self.caching)
            .field("max_batch_size", &self.max_batch_size)
            .finish()
    }
}

/// Suspend once and immediately reschedule. Lets sibling tasks run
/// between two dispatch cycles of [`Loader::dispatch_and_join`].
struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = Pin::into_inner(self);
        if this.yielded {
            Poll::Ready(())
        } else {
            this.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// The future of one dispatch cycle, returned by [`Loader::dispatch`].
/// Resolves to the cycle's outcomes, one per queued key, in queue order.
///
/// The cycle's work is shared: this future and the cycle's
/// [`LoadFuture`]s all drive the same underlying batch, whichever is
/// polled. Dropping a `Dispatch` does not cancel the cycle as long as
/// some load future of the cycle is still being awaited.
///
/// [`Loader::dispatch`]: Loader::dispatch
pub struct Dispatch<V, E> {
    job: Option<Arc<dyn Drive>>,
    handles: Vec<LoadHandle<V, E>>,
    drive_token: Option<Token>,
}

impl<V: Clone, E: Clone> Future for Dispatch<V, E> {
    type Output = Vec<Result<V, LoadError<E>>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        let job = match &this.job {
            Some(job) => job,
            // Empty cycle: nothing was queued, nothing to wait for.
            None => return Poll::Ready(Vec::new()),
        };

        match job.drive(&mut this.drive_token, cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => Poll::Ready(
                this.handles
                    .iter()
                    .map(|handle| {
                        handle
                            .outcome()
                            .expect("batch completed without settling its keys")
                    })
                    .collect(),
            ),
        }
    }
}

impl<V, E> Drop for Dispatch<V, E> {
    fn drop(&mut self) {
        // If this future was the one driving the batch, hand over to one
        // of the waiting load futures.
        if let (Some(job), Some(token)) = (&self.job, self.drive_token.take()) {
            job.abandon(token);
        }
    }
}

impl<V, E> Debug for Dispatch<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("keys", &self.handles.len())
            .finish()
    }
}
