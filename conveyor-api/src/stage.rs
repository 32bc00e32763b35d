use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::package::{ProcessFlags, WorkPackage};

/// Destination a stage hands its packages to.
pub type Route<T> = Arc<dyn Fn(WorkPackage<T>) + Send + Sync>;

/// Sequential, stateful processing logic run by a worker actor.
///
/// The body is only ever touched by one thread at a time, so `process` takes
/// `&mut self`. Completion is reported through the [`Outlet`]: either right
/// away or later, from any thread, through a cloned outlet.
pub trait Stage: Send + 'static {
    type Payload: Send + 'static;

    /// Handles one package. Every package must eventually be passed to
    /// [`Outlet::emit`] or [`Outlet::abandon`].
    fn process(&mut self, package: WorkPackage<Self::Payload>, outlet: &Outlet<Self::Payload>);

    /// Handle used to break out of a blocking call when the actor is
    /// deactivated. Queried once, when the actor is created.
    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Hook invoked synchronously by `deactivate()` on the calling thread.
pub trait Interrupt: Send + Sync {
    fn about_to_deactivate(&self);
}

impl<F> Interrupt for F
where
    F: Fn() + Send + Sync,
{
    fn about_to_deactivate(&self) {
        self()
    }
}

struct Routes<T> {
    processed: Option<Route<T>>,
    abandoned: Option<Route<T>>,
}

/// Completion side of a stage.
///
/// Cloning is cheap; every clone shares the same routes, which are installed
/// once the pipeline is wired and may be replaced later.
pub struct Outlet<T> {
    routes: Arc<RwLock<Routes<T>>>,
}

impl<T> Clone for Outlet<T> {
    fn clone(&self) -> Self {
        Self {
            routes: Arc::clone(&self.routes),
        }
    }
}

impl<T> Default for Outlet<T> {
    fn default() -> Self {
        Self {
            routes: Arc::new(RwLock::new(Routes {
                processed: None,
                abandoned: None,
            })),
        }
    }
}

impl<T> fmt::Debug for Outlet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outlet")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl<T> Outlet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the routes for completed and abandoned packages.
    pub fn connect(&self, processed: Route<T>, abandoned: Route<T>) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        routes.processed = Some(processed);
        routes.abandoned = Some(abandoned);
    }

    pub fn is_connected(&self) -> bool {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .processed
            .is_some()
    }

    /// Reports `package` as done by this stage.
    pub fn emit(&self, package: WorkPackage<T>) {
        let route = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .processed
            .clone();
        match route {
            Some(route) => route(package),
            None => tracing::warn!(package = %package.id(), "outlet not connected, dropping package"),
        }
    }

    /// Gives up on `package`. It is marked [`ProcessFlags::UNPROCESSED`] and
    /// skips the rest of the pipeline.
    pub fn abandon(&self, mut package: WorkPackage<T>) {
        package.mark(ProcessFlags::UNPROCESSED);
        let route = {
            let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
            routes.abandoned.clone().or_else(|| routes.processed.clone())
        };
        match route {
            Some(route) => route(package),
            None => tracing::warn!(package = %package.id(), "outlet not connected, dropping abandoned package"),
        }
    }
}
