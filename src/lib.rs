//! Batchcache is a Rust implementation of the
//! [dataloader pattern](https://github.com/graphql/dataloader) originally
//! created by Facebook. It collects individual keyed requests made from
//! unrelated parts of an application, resolves them together through a
//! single user-supplied batch function, caches the outcomes, and hands
//! each requester its own result, without the requesters knowing anything
//! about each other. The common use case is collapsing the "N+1 fetch"
//! pattern that shows up when resolving graphs of related data, but it
//! works for any situation where it is useful to hide batching and
//! request-scoped caching behind a per-key interface.
//!
//! ## Overview
//!
//! Suppose you have an API to fetch user data by username, and the API
//! supports batching: you can supply multiple usernames in one request
//! and get results for all of them. Your application code, however, wants
//! to ask for one user at a time, from many places.
//!
//! First, adapt the fetch to the batch function shape. A batch function
//! takes the batch's keys plus an [`Environment`] of contextual data, and
//! asynchronously returns a reply in one of the [`BatchReply`] shapes: an
//! ordered `Vec` matching the keys positionally, or a keyed `HashMap`.
//!
//! ```
//! use batchcache::Environment;
//!
//! #[derive(Debug, Clone)]
//! struct UserData {
//!     username: String,
//!     name: String,
//! }
//!
//! #[derive(Debug, Clone)]
//! struct ApiError {}
//!
//! async fn batch_get_users(
//!     usernames: Vec<String>,
//!     _env: Environment<String, ()>,
//! ) -> Result<Vec<UserData>, ApiError> {
//!     // one API round trip for the whole batch; the reply must contain
//!     // exactly one entry per username, in the same order
//!     # let _ = usernames; todo!()
//! }
//! ```
//!
//! Then create a [`Loader`] around the batch function. A `Loader` can be
//! shared by reference across your request handlers, so that many
//! independent async tasks (even on different threads) feed individual
//! key lookups into the same batch:
//!
//! ```
//! use batchcache::{Environment, Loader};
//!
//! async fn stringify(
//!     keys: Vec<u32>,
//!     _env: Environment<u32, ()>,
//! ) -> Result<Vec<String>, String> {
//!     Ok(keys.iter().map(|key| key.to_string()).collect())
//! }
//!
//! let loader = Loader::new(stringify);
//!
//! let first = loader.load(1);
//! let second = loader.load(2);
//! let again = loader.load(1); // cached: same slot as `first`
//!
//! // Nothing has been fetched yet. Dispatch sends the queued keys (here
//! // [1, 2]: the repeated key was deduplicated by the cache) to the
//! // batch function in one invocation.
//! let outcomes = futures::executor::block_on(loader.dispatch_and_join());
//! assert_eq!(outcomes.len(), 2);
//!
//! assert_eq!(futures::executor::block_on(first).unwrap(), "1");
//! assert_eq!(futures::executor::block_on(second).unwrap(), "2");
//! assert_eq!(futures::executor::block_on(again).unwrap(), "1");
//! ```
//!
//! Batching and caching behavior, batch size limits, the cache backend,
//! cache key derivation, and the per-dispatch [`Environment`] are all
//! configured through [`LoaderOptions`].
//!
//! ## Design notes
//!
//! ### Explicit dispatch
//!
//! Nothing here schedules batches on a timer or in a background task.
//! [`Loader::load`] only queues; the moment a batch happens is chosen by
//! whoever calls [`Loader::dispatch`], typically the framework layer that
//! knows when a wave of loads has been issued (for instance, at the end
//! of one resolver pass). Keys loaded while a cycle is in flight never
//! join it; they wait for the next dispatch. This keeps the concurrency
//! story small: the queue swap in `dispatch` is the only point of
//! contention, and it is atomic with respect to concurrent loads.
//!
//! ### Reply shapes
//!
//! Traditional dataloader implementations take a list of keys and expect
//! a same-length list of values back, with no way to express "I have no
//! value for this key" other than sneaking a sentinel into the list.
//! Batchcache accepts the reply in four shapes ([`BatchReply`]): ordered
//! `Vec<V>` or `Vec<Result<V, E>>`, and keyed `HashMap<K, V>` or
//! `HashMap<K, Result<V, E>>`. Keyed replies may omit a key, which
//! surfaces as a distinguished [`LoadError::MissingKey`] for exactly that
//! key; an ordered reply of the wrong length fails the whole batch, since
//! positions can no longer be trusted. Everything is normalized into
//! per-key outcomes in key order before results are distributed.
//!
//! ### Poll-driven design
//!
//! In keeping with Rust's polling async model, the batch function's
//! future is not spawned anywhere; it is driven directly by whichever
//! task polls one of the cycle's futures, whether that is the
//! [`Dispatch`] future or any individual [`LoadFuture`]. Only a single
//! task drives the shared work at a time; the others are woken when their
//! own result is ready, or when the driving task disappears and one of
//! them has to take over. Calling `dispatch` and dropping the returned
//! future is therefore fine, as long as something awaits the loads.
//!
//! ### Caching pending results
//!
//! The cache stores result *handles*, not values: a key that is still in
//! flight is just as cached as one that has settled, which is what makes
//! duplicate loads collapse onto one slot. Failures stay cached too;
//! retrying means clearing the key first. The backend is pluggable
//! through the [`CacheMap`] trait, and a backend is allowed to evict
//! whenever it wants; handles already given out keep working regardless.

mod batch;
mod cache;
mod environment;
mod loader;
mod reply;
mod wakerset;

pub use batch::{LoadFuture, LoadHandle};
pub use cache::{CacheMap, HashMapCache};
pub use environment::{Environment, EnvironmentBuilder};
pub use loader::{Dispatch, Loader, LoaderOptions, OnConflict};
pub use reply::{BatchFn, BatchReply, LoadError};
