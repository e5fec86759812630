//! The context bag handed to every batch function invocation.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::hash::Hash;
use std::sync::Arc;

#[derive(Debug)]
struct EnvInner<K, C> {
    context: Option<C>,
    key_contexts: HashMap<K, C>,
}

/// An immutable bag of contextual data that a [`Loader`] passes to its
/// batch function on every invocation: one overall context value, plus an
/// optional per-key metadata map.
///
/// Environments are built up front with [`Environment::builder`] and are
/// frozen from then on; cloning one is cheap (the contents are shared). A
/// loader configured without an environment provider hands its batch
/// function a *neutral* environment, for which [`context`] returns `None`.
/// Batch functions should treat an unset context as ordinary input, not as
/// an error.
///
/// ```
/// use batchcache::Environment;
///
/// let env: Environment<&str, &str> = Environment::builder()
///     .context("request-17")
///     .key_context("alpha", "hot")
///     .build();
///
/// assert_eq!(env.context(), Some(&"request-17"));
/// assert_eq!(env.key_context(&"alpha"), Some(&"hot"));
/// assert_eq!(env.key_context(&"beta"), None);
/// ```
///
/// [`Loader`]: crate::Loader
/// [`context`]: Environment::context
pub struct Environment<K, C> {
    inner: Arc<EnvInner<K, C>>,
}

impl<K, C> Environment<K, C> {
    /// Start building an environment. The builder is the only way to put
    /// data into one.
    pub fn builder() -> EnvironmentBuilder<K, C> {
        EnvironmentBuilder {
            context: None,
            key_contexts: HashMap::new(),
        }
    }

    /// The overall context value, or `None` if the environment was built
    /// without one (in particular, the neutral environment used when no
    /// provider is configured).
    pub fn context(&self) -> Option<&C> {
        self.inner.context.as_ref()
    }

    /// Iterate over every (key, metadata) pair in this environment, in an
    /// arbitrary order.
    pub fn key_contexts(&self) -> impl Iterator<Item = (&K, &C)> {
        self.inner.key_contexts.iter()
    }
}

impl<K: Hash + Eq, C> Environment<K, C> {
    /// The per-key metadata attached to `key`, if any.
    pub fn key_context(&self, key: &K) -> Option<&C> {
        self.inner.key_contexts.get(key)
    }
}

impl<K, C> Clone for Environment<K, C> {
    fn clone(&self) -> Self {
        Environment {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, C> Default for Environment<K, C> {
    /// The neutral environment: no context value, no key metadata.
    fn default() -> Self {
        Environment {
            inner: Arc::new(EnvInner {
                context: None,
                key_contexts: HashMap::new(),
            }),
        }
    }
}

impl<K: Debug, C: Debug> Debug for Environment<K, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("context", &self.inner.context)
            .field("key_contexts", &self.inner.key_contexts)
            .finish()
    }
}

/// Builder for [`Environment`]. Created with [`Environment::builder`].
#[derive(Debug)]
pub struct EnvironmentBuilder<K, C> {
    context: Option<C>,
    key_contexts: HashMap<K, C>,
}

impl<K, C> EnvironmentBuilder<K, C> {
    /// Set the overall context value.
    pub fn context(mut self, context: C) -> Self {
        self.context = Some(context);
        self
    }

    /// Freeze the accumulated data into an immutable environment.
    pub fn build(self) -> Environment<K, C> {
        Environment {
            inner: Arc::new(EnvInner {
                context: self.context,
                key_contexts: self.key_contexts,
            }),
        }
    }
}

impl<K: Hash + Eq, C> EnvironmentBuilder<K, C> {
    /// Attach metadata to a single key. Later values for the same key
    /// replace earlier ones.
    pub fn key_context(mut self, key: K, context: C) -> Self {
        self.key_contexts.insert(key, context);
        self
    }

    /// Attach metadata to many keys at once.
    pub fn key_contexts(mut self, contexts: impl IntoIterator<Item = (K, C)>) -> Self {
        self.key_contexts.extend(contexts);
        self
    }
}
