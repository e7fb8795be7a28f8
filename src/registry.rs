use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::{batch_function::BatchFunction, config::LoaderConfig, error::LoadError, loader::Loader};

/// The loaders available to one unit of work, one per relation.
///
/// A registry is built when handling of an incoming request starts and is passed explicitly to
/// every resolver that needs to load data. Loaders are looked up by the type of the
/// [`BatchFunction`] they were registered with:
///
/// ```ignore
/// let registry = LoaderRegistry::default()
///     .with(AddressById, store.clone())
///     .with(OrdersByCustomer, store.clone());
///
/// let address = registry.loader::<AddressById>()?.load(customer.address_id).await?;
/// ```
///
/// Registries are never shared between requests. Dropping the registry cancels every loader it
/// holds, which drops their caches along with it.
pub struct LoaderRegistry {
    config: LoaderConfig,
    loaders: HashMap<TypeId, Box<dyn RegisteredLoader>>,
}

/// Type-erased view of a [`Loader`] so that loaders of different key/value types can live in one
/// map.
trait RegisteredLoader: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn flush(&self);
    fn cancel(&self);
}

impl<K, V> RegisteredLoader for Loader<K, V>
where
    K: 'static + Eq + Debug + Clone + Send + Sync,
    V: 'static + Send + Debug + Clone,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn flush(&self) {
        Loader::flush(self);
    }

    fn cancel(&self) {
        Loader::cancel(self);
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::new(LoaderConfig::default())
    }
}

impl LoaderRegistry {
    /// Creates an empty registry whose loaders will all use `config`.
    pub fn new(config: LoaderConfig) -> Self {
        Self { config, loaders: HashMap::new() }
    }

    pub fn config(&self) -> LoaderConfig {
        self.config
    }

    /// Starts a loader for `F`, replacing (and cancelling) one that was registered before.
    pub fn register<F>(&mut self, batch_fn: F, context: F::Context) -> &mut Self
    where
        F: 'static + BatchFunction + Send,
        F::Key: 'static + Eq + Debug + Clone + Hash + Send + Sync,
        F::Value: 'static + Send + Debug + Clone,
        F::Context: Send + Sync + 'static,
    {
        let loader = Loader::with_config(batch_fn, context, self.config);
        if self.loaders.insert(TypeId::of::<F>(), Box::new(loader)).is_some() {
            tracing::debug!(relation = type_name::<F>(), "replaced registered loader");
        }
        self
    }

    /// Builder form of [`LoaderRegistry::register`].
    pub fn with<F>(mut self, batch_fn: F, context: F::Context) -> Self
    where
        F: 'static + BatchFunction + Send,
        F::Key: 'static + Eq + Debug + Clone + Hash + Send + Sync,
        F::Value: 'static + Send + Debug + Clone,
        F::Context: Send + Sync + 'static,
    {
        self.register(batch_fn, context);
        self
    }

    pub fn get<F>(&self) -> Option<&Loader<F::Key, F::Value>>
    where
        F: 'static + BatchFunction,
        F::Key: 'static + Eq + Debug + Clone + Send + Sync,
        F::Value: 'static + Send + Debug + Clone,
    {
        self.loaders.get(&TypeId::of::<F>()).and_then(|loader| loader.as_any().downcast_ref())
    }

    /// Like [`LoaderRegistry::get`], but reports a missing relation as a [`LoadError`].
    pub fn loader<F>(&self) -> Result<&Loader<F::Key, F::Value>, LoadError>
    where
        F: 'static + BatchFunction,
        F::Key: 'static + Eq + Debug + Clone + Send + Sync,
        F::Value: 'static + Send + Debug + Clone,
    {
        self.get::<F>().ok_or(LoadError::Unregistered(type_name::<F>()))
    }

    /// Dispatches whatever every loader has accumulated, e.g. at the end of a traversal pass.
    pub fn flush_all(&self) {
        for loader in self.loaders.values() {
            loader.flush();
        }
    }

    /// Aborts the unit of work: every pending request on every loader resolves to
    /// [`LoadError::Cancelled`] and no further results are cached.
    pub fn cancel(&self) {
        tracing::debug!(loaders = self.loaders.len(), "cancelling loader registry");
        for loader in self.loaders.values() {
            loader.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}
