//! A small service container handed to packet handlers.
//!
//! Handlers often need shared resources: a database pool, a game world,
//! an encryption provider. Instead of threading those through every
//! closure, the application registers them once on a
//! [`ServiceCollection`] and handlers resolve them from the
//! [`ServiceScope`] they are given.
//!
//! # Lifetimes
//!
//! ```text
//! ServiceContainer ──begin_scope()──→ ServiceScope (one per connection)
//!   singletons cached here               │ scoped instances cached here
//!                                        └─begin_scope()──→ child scope
//!                                                           (one per handler call)
//! ```
//!
//! - **Singleton**: built on first resolve, then shared by every scope.
//! - **Scoped**: built once per scope and shared within it.
//! - **Transient**: built on every resolve.
//!
//! Resolved values are cloned out of the container, so services should be
//! cheap to clone; wrap shared state in an `Arc`.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::ResolveError;

type Instance = Box<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&ServiceScope) -> Instance + Send + Sync>;

/// How long a resolved service lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// One instance per container.
    Singleton,
    /// One instance per scope.
    Scoped,
    /// A new instance per resolve.
    Transient,
}

struct Registration {
    lifetime: Lifetime,
    factory: Factory,
}

/// Collects service registrations before the container is built.
#[derive(Default)]
pub struct ServiceCollection {
    registrations: HashMap<TypeId, Registration>,
}

impl ServiceCollection {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an existing value as a singleton.
    pub fn add_instance<T>(&mut self, value: T) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.add_singleton(move |_| value.clone())
    }

    /// Registers a singleton built lazily by `factory`.
    pub fn add_singleton<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&ServiceScope) -> T + Send + Sync + 'static,
    {
        self.insert(Lifetime::Singleton, factory)
    }

    /// Registers a service built once per scope.
    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&ServiceScope) -> T + Send + Sync + 'static,
    {
        self.insert(Lifetime::Scoped, factory)
    }

    /// Registers a service built on every resolve.
    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&ServiceScope) -> T + Send + Sync + 'static,
    {
        self.insert(Lifetime::Transient, factory)
    }

    /// Returns `true` if a service of type `T` is registered.
    pub fn contains<T: 'static>(&self) -> bool {
        self.registrations.contains_key(&TypeId::of::<T>())
    }

    /// Freezes the registrations into a container.
    pub fn build(self) -> ServiceContainer {
        ServiceContainer {
            inner: Arc::new(ContainerInner {
                registrations: self.registrations,
                singletons: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn insert<T, F>(&mut self, lifetime: Lifetime, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&ServiceScope) -> T + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();
        if self.registrations.contains_key(&type_id) {
            tracing::warn!(
                service = std::any::type_name::<T>(),
                "service registered twice; the last registration wins"
            );
        }
        let factory: Factory =
            Arc::new(move |scope: &ServiceScope| -> Instance { Box::new(factory(scope)) });
        self.registrations
            .insert(type_id, Registration { lifetime, factory });
        self
    }
}

impl fmt::Debug for ServiceCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCollection")
            .field("registrations", &self.registrations.len())
            .finish()
    }
}

struct ContainerInner {
    registrations: HashMap<TypeId, Registration>,
    singletons: Mutex<HashMap<TypeId, Instance>>,
}

/// Frozen set of service registrations plus the singleton cache.
///
/// Cloning is cheap; clones share the same singletons.
#[derive(Clone)]
pub struct ServiceContainer {
    inner: Arc<ContainerInner>,
}

impl ServiceContainer {
    /// A container with no registrations.
    pub fn empty() -> Self {
        ServiceCollection::new().build()
    }

    /// Opens a new scope.
    pub fn begin_scope(&self) -> ServiceScope {
        ServiceScope {
            container: self.clone(),
            state: Arc::new(ScopeState::new(None)),
        }
    }

    /// Resolves a service through a throwaway scope.
    ///
    /// Scoped services resolved this way are not cached.
    pub fn resolve<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.begin_scope().resolve()
    }

    fn singleton<T: Clone + Send + Sync + 'static>(
        &self,
        registration: &Registration,
        scope: &ServiceScope,
    ) -> Option<T> {
        let type_id = TypeId::of::<T>();
        if let Some(found) = cached(&self.inner.singletons, type_id) {
            return Some(found);
        }

        // Build outside the lock so the factory may resolve other services.
        let built = (registration.factory)(scope);
        let mut singletons = self
            .inner
            .singletons
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        singletons
            .entry(type_id)
            .or_insert(built)
            .downcast_ref::<T>()
            .cloned()
    }
}

impl fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("registrations", &self.inner.registrations.len())
            .finish()
    }
}

/// A resolution context with its own cache of scoped services.
///
/// Every connection owns one scope for its whole lifetime, and every
/// handler invocation runs in a child scope that is disposed when the
/// handler returns. Clones share the same cache and disposal flag.
#[derive(Clone)]
pub struct ServiceScope {
    container: ServiceContainer,
    state: Arc<ScopeState>,
}

struct ScopeState {
    scoped: Mutex<HashMap<TypeId, Instance>>,
    disposed: AtomicBool,
    parent: Option<Arc<ScopeState>>,
}

impl ScopeState {
    fn new(parent: Option<Arc<ScopeState>>) -> Self {
        Self {
            scoped: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            parent,
        }
    }

    /// A scope counts as disposed once it or any ancestor is.
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
            || self.parent.as_ref().is_some_and(|parent| parent.is_disposed())
    }
}

impl ServiceScope {
    /// Resolves a service, or `None` if it is not registered or the scope
    /// has been disposed.
    pub fn resolve<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        if self.is_disposed() {
            tracing::debug!(
                service = std::any::type_name::<T>(),
                "resolve on disposed scope"
            );
            return None;
        }

        let type_id = TypeId::of::<T>();
        let registration = self.container.inner.registrations.get(&type_id)?;
        match registration.lifetime {
            Lifetime::Singleton => self.container.singleton(registration, self),
            Lifetime::Transient => (registration.factory)(self).downcast_ref::<T>().cloned(),
            Lifetime::Scoped => {
                if let Some(found) = cached(&self.state.scoped, type_id) {
                    return Some(found);
                }
                let built = (registration.factory)(self);
                let mut scoped = self.state.scoped.lock().unwrap_or_else(PoisonError::into_inner);
                scoped
                    .entry(type_id)
                    .or_insert(built)
                    .downcast_ref::<T>()
                    .cloned()
            }
        }
    }

    /// Like [`resolve`](Self::resolve), but reports why nothing came back.
    pub fn require<T: Clone + Send + Sync + 'static>(&self) -> Result<T, ResolveError> {
        if self.is_disposed() {
            return Err(ResolveError::Disposed);
        }
        self.resolve()
            .ok_or(ResolveError::NotRegistered(std::any::type_name::<T>()))
    }

    /// Opens a child scope that shares this scope's container.
    ///
    /// The child keeps its own scoped instances but is disposed along
    /// with this scope.
    pub fn begin_scope(&self) -> ServiceScope {
        ServiceScope {
            container: self.container.clone(),
            state: Arc::new(ScopeState::new(Some(Arc::clone(&self.state)))),
        }
    }

    /// Drops every scoped instance and refuses further resolves.
    pub fn dispose(&self) {
        self.state.disposed.store(true, Ordering::Release);
        self.state
            .scoped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Returns `true` after [`dispose`](Self::dispose) on this scope or
    /// any scope it was opened from.
    pub fn is_disposed(&self) -> bool {
        self.state.is_disposed()
    }
}

impl fmt::Debug for ServiceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceScope")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn cached<T: Clone + 'static>(cache: &Mutex<HashMap<TypeId, Instance>>, type_id: TypeId) -> Option<T> {
    cache
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&type_id)
        .and_then(|instance| instance.downcast_ref::<T>().cloned())
}
