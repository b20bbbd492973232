use std::any::{type_name, Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, RwLock};

// ── Errors ──────────────────────────────────────────────────────────────────

/// Errors raised while registering or resolving services.
#[derive(Debug)]
pub enum ContainerError {
    /// No binding exists for the requested type.
    NotBound { type_name: &'static str },
    /// A factory resolved the type it is currently constructing.
    Reentrant { type_name: &'static str },
    /// A factory failed while constructing its value.
    Construction {
        type_name: &'static str,
        message: String,
    },
}

impl fmt::Display for ContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerError::NotBound { type_name } => {
                write!(
                    f,
                    "No binding for type '{type_name}'. \
                     Use .provide(instance), .bind(factory) or .singleton(factory)"
                )
            }
            ContainerError::Reentrant { type_name } => {
                write!(
                    f,
                    "Re-entrant resolution of '{type_name}' while it is being constructed"
                )
            }
            ContainerError::Construction { type_name, message } => {
                write!(f, "Failed to construct '{type_name}': {message}")
            }
        }
    }
}

impl std::error::Error for ContainerError {}

// ── Container ───────────────────────────────────────────────────────────────

type Factory =
    Box<dyn Fn(&Container) -> Result<Box<dyn Any + Send + Sync>, ContainerError> + Send + Sync>;

enum Lifetime {
    Transient,
    Singleton,
}

struct Binding {
    type_name: &'static str,
    lifetime: Lifetime,
    factory: Factory,
}

/// Type-keyed service registry.
///
/// Bindings are registered during boot (`&mut self`) and resolved read-only
/// afterwards. Transient bindings run their factory on every resolve;
/// singletons construct lazily, at most once, and hand out clones of the
/// cached instance. Prebuilt values go in with [`provide`](Self::provide).
///
/// There is no dependency graph: a factory pulls its own dependencies from
/// the container it receives. Resolving a type from within its own factory
/// fails with [`ContainerError::Reentrant`].
pub struct Container {
    bindings: HashMap<TypeId, Binding>,
    singletons: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    in_progress: Mutex<HashSet<TypeId>>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("binding_count", &self.bindings.len())
            .finish()
    }
}

impl Container {
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
            singletons: RwLock::new(HashMap::new()),
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    /// Register a transient factory: a fresh value per resolve.
    pub fn bind<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&Container) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.insert_binding::<T, F>(Lifetime::Transient, factory)
    }

    /// Register a singleton factory: constructed lazily on first resolve,
    /// cached, and cloned out on later resolves.
    pub fn singleton<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&Container) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.insert_binding::<T, F>(Lifetime::Singleton, factory)
    }

    /// Provide a pre-built instance (e.g. a pool constructed elsewhere).
    pub fn provide<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.singletons
            .get_mut()
            .expect("container lock poisoned during boot")
            .insert(TypeId::of::<T>(), Box::new(value));
        self.bindings.insert(
            TypeId::of::<T>(),
            Binding {
                type_name: type_name::<T>(),
                lifetime: Lifetime::Singleton,
                factory: Box::new(|_| {
                    // provided instances never re-run a factory
                    unreachable!("provided instance resolved through factory")
                }),
            },
        );
        self
    }

    fn insert_binding<T, F>(&mut self, lifetime: Lifetime, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&Container) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.bindings.insert(
            TypeId::of::<T>(),
            Binding {
                type_name: type_name::<T>(),
                lifetime,
                factory: Box::new(move |c| {
                    factory(c).map(|v| Box::new(v) as Box<dyn Any + Send + Sync>)
                }),
            },
        );
        self
    }

    /// Resolve an instance of `T`.
    pub fn resolve<T: Clone + Send + Sync + 'static>(&self) -> Result<T, ContainerError> {
        let tid = TypeId::of::<T>();

        if let Some(cached) = self.clone_singleton::<T>(&tid) {
            return Ok(cached);
        }

        let binding = self.bindings.get(&tid).ok_or(ContainerError::NotBound {
            type_name: type_name::<T>(),
        })?;

        {
            let mut building = self
                .in_progress
                .lock()
                .map_err(|_| Self::poisoned(binding.type_name))?;
            if !building.insert(tid) {
                return Err(ContainerError::Reentrant {
                    type_name: binding.type_name,
                });
            }
        }

        let built = (binding.factory)(self);

        if let Ok(mut building) = self.in_progress.lock() {
            building.remove(&tid);
        }

        let boxed = built?;
        let value = boxed
            .downcast_ref::<T>()
            .ok_or_else(|| Self::poisoned(binding.type_name))?
            .clone();

        if matches!(binding.lifetime, Lifetime::Singleton) {
            if let Ok(mut cache) = self.singletons.write() {
                // first writer wins; the cached instance is what later
                // resolves observe
                cache.entry(tid).or_insert(boxed);
                if let Some(cached) = cache.get(&tid).and_then(|v| v.downcast_ref::<T>()) {
                    return Ok(cached.clone());
                }
            }
        }

        Ok(value)
    }

    /// Whether a binding or provided instance exists for `T`.
    pub fn contains<T: 'static>(&self) -> bool {
        let tid = TypeId::of::<T>();
        self.bindings.contains_key(&tid)
            || self
                .singletons
                .read()
                .map(|c| c.contains_key(&tid))
                .unwrap_or(false)
    }

    /// Human-readable names of every registered type.
    pub fn known_types(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> =
            self.bindings.values().map(|b| b.type_name).collect();
        names.sort_unstable();
        names
    }

    fn clone_singleton<T: Clone + 'static>(&self, tid: &TypeId) -> Option<T> {
        self.singletons
            .read()
            .ok()?
            .get(tid)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    fn poisoned(type_name: &'static str) -> ContainerError {
        ContainerError::Construction {
            type_name,
            message: "container state poisoned".to_string(),
        }
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}
