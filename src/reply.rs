//! The calling convention between a [`Loader`] and its batch function, and
//! the normalization of the function's reply into per-key outcomes.
//!
//! [`Loader`]: crate::Loader

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

use thiserror::Error;

use crate::environment::Environment;

/// The failure surfaced through a [`LoadFuture`] when a key could not be
/// resolved to a value.
///
/// `Loader` wraps the batch function's own error type: it is produced both
/// when a whole invocation returns `Err` (in which case every key of that
/// batch observes it) and when an ordered reply marks a single position as
/// failed (in which case only that key observes it). The other variants
/// describe replies that were structurally wrong.
///
/// [`LoadFuture`]: crate::LoadFuture
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    /// The batch function reported a failure, either for its whole
    /// invocation or for this key's position in the reply.
    #[error("batch function failed: {0}")]
    Loader(E),

    /// A keyed reply did not contain this key at all. This is distinct
    /// from the key being mapped to an explicit "empty" value; it means
    /// the batch function dropped the key on the floor.
    #[error("batch function reply omitted a requested key")]
    MissingKey,

    /// An ordered reply had a different number of entries than the batch
    /// had keys. There is no way to tell which positions are trustworthy,
    /// so every key of the batch observes this error.
    #[error("batch function replied with {actual} values for {expected} keys")]
    WrongLength { expected: usize, actual: usize },
}

/// One of the reply shapes a batch function may produce, together with the
/// logic that lines the reply up with the keys that were requested.
///
/// The loader always works internally with one representation: a list of
/// per-key outcomes in the same order the keys were submitted. This trait
/// is the adapter boundary where each supported shape is translated into
/// that representation:
///
/// - `Vec<V>`: ordered reply; entry `i` is the value for key `i`. The
///   reply must be exactly as long as the key list.
/// - `Vec<Result<V, E>>`: ordered reply where individual positions may
///   fail without affecting their siblings.
/// - `HashMap<K, V>`: keyed reply; the map may be in any order. A key
///   absent from the map resolves to [`LoadError::MissingKey`].
/// - `HashMap<K, Result<V, E>>`: keyed reply with per-key failures.
///
/// Which shape is in play is decided by the batch function's return type
/// when the [`Loader`] is constructed; no runtime dispatch is involved.
///
/// [`Loader`]: crate::Loader
pub trait BatchReply<K, V, E> {
    /// Translate this reply into one outcome per submitted key, in key
    /// order. The outer `Err` reports a structurally broken reply, which
    /// the loader applies to every key of the batch.
    fn into_outcomes(self, keys: &[K]) -> Result<Vec<Result<V, LoadError<E>>>, LoadError<E>>;
}

impl<K, V, E> BatchReply<K, V, E> for Vec<V> {
    fn into_outcomes(self, keys: &[K]) -> Result<Vec<Result<V, LoadError<E>>>, LoadError<E>> {
        if self.len() != keys.len() {
            return Err(LoadError::WrongLength {
                expected: keys.len(),
                actual: self.len(),
            });
        }

        Ok(self.into_iter().map(Ok).collect())
    }
}

impl<K, V, E> BatchReply<K, V, E> for Vec<Result<V, E>> {
    fn into_outcomes(self, keys: &[K]) -> Result<Vec<Result<V, LoadError<E>>>, LoadError<E>> {
        if self.len() != keys.len() {
            return Err(LoadError::WrongLength {
                expected: keys.len(),
                actual: self.len(),
            });
        }

        Ok(self
            .into_iter()
            .map(|entry| entry.map_err(LoadError::Loader))
            .collect())
    }
}

impl<K: Hash + Eq, V: Clone, E> BatchReply<K, V, E> for HashMap<K, V> {
    fn into_outcomes(self, keys: &[K]) -> Result<Vec<Result<V, LoadError<E>>>, LoadError<E>> {
        // Lookups are by reference because the same key may legitimately
        // appear at several positions (caching disabled); each position
        // gets its own copy of the value.
        Ok(keys
            .iter()
            .map(|key| self.get(key).cloned().ok_or(LoadError::MissingKey))
            .collect())
    }
}

impl<K: Hash + Eq, V: Clone, E: Clone> BatchReply<K, V, E> for HashMap<K, Result<V, E>> {
    fn into_outcomes(self, keys: &[K]) -> Result<Vec<Result<V, LoadError<E>>>, LoadError<E>> {
        Ok(keys
            .iter()
            .map(|key| match self.get(key) {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(error)) => Err(LoadError::Loader(error.clone())),
                None => Err(LoadError::MissingKey),
            })
            .collect())
    }
}

/// The batch function itself: the user-supplied operation that resolves a
/// whole batch of keys in one go.
///
/// This is implemented for any cloneable async function of the form
/// `Fn(Vec<K>, Environment<K, C>) -> Future<Output = Result<R, E>>` where
/// `R` is one of the [`BatchReply`] shapes. The environment parameter is
/// always present; batch functions that don't care about context simply
/// ignore it.
///
/// The trait exists so that the function's future type rides along as an
/// associated type instead of appearing in every signature that touches
/// the loader.
pub trait BatchFn<K, V, E, C>: Clone {
    /// The shape of a successful reply.
    type Reply: BatchReply<K, V, E>;

    /// The in-flight invocation.
    type Fut: Future<Output = Result<Self::Reply, E>>;

    /// Start resolving one batch of keys.
    fn invoke(&self, keys: Vec<K>, environment: Environment<K, C>) -> Self::Fut;
}

impl<F, Fut, R, K, V, E, C> BatchFn<K, V, E, C> for F
where
    F: Clone + Fn(Vec<K>, Environment<K, C>) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    R: BatchReply<K, V, E>,
{
    type Reply = R;
    type Fut = Fut;

    fn invoke(&self, keys: Vec<K>, environment: Environment<K, C>) -> Fut {
        self(keys, environment)
    }
}
