//! The [`Adapter`] handle shared by all sessions of a process.

use std::fmt;
use std::sync::Arc;

use crate::config::ConfigurationDocument;
use crate::middleware::Middleware;
use crate::routing::RoutingCoordinator;
use crate::session::SessionBuilder;
use crate::supervisor::{LockSweeper, ModuleSlot};

/// Entry point for building sessions.
///
/// Cheap to clone. Clones share the configuration document, the routing
/// slot and the middleware handle.
///
/// # Example
///
/// ```no_run
/// use someip_adapter::prelude::*;
///
/// fn main() -> Result<()> {
///     let adapter = someip_adapter::configure().build()?;
///
///     let client = adapter.application("client_example", 0x1234, 0x5678).build()?;
///     client.create()?;
///     client.register()?;
///     client.start()?;
///     client.request(0x0421, b"hello")?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Adapter {
    inner: Arc<Inner>,
}

struct Inner {
    coordinator: RoutingCoordinator,
    module: ModuleSlot,
    sweeper: LockSweeper,
    lock_pattern: String,
}

impl Adapter {
    pub(crate) fn new(
        coordinator: RoutingCoordinator,
        module: ModuleSlot,
        sweeper: LockSweeper,
        lock_pattern: String,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                coordinator,
                module,
                sweeper,
                lock_pattern,
            }),
        }
    }

    /// Start building a session named `name` bound to `service`/`instance`.
    pub fn application(&self, name: impl Into<String>, service: u16, instance: u16) -> SessionBuilder {
        SessionBuilder::new(self.clone(), name.into(), service, instance)
    }

    /// Snapshot of the active configuration document.
    pub fn configuration(&self) -> ConfigurationDocument {
        self.inner.coordinator.configuration()
    }

    /// Name of the application acting as router, if any.
    pub fn router(&self) -> Option<String> {
        self.inner.coordinator.router()
    }

    /// Current middleware handle.
    pub fn middleware(&self) -> Arc<dyn Middleware> {
        self.inner.module.get()
    }

    /// Remove stale lock files matching `pattern`, or the configured lock
    /// pattern when `None`. Returns whether anything was removed.
    pub fn force_clear_locks(&self, pattern: Option<&str>) -> bool {
        self.inner
            .sweeper
            .sweep(pattern.unwrap_or(self.inner.lock_pattern.as_str()))
    }

    /// Reset to a pristine state: fresh middleware handle, empty routing
    /// slot, template document.
    ///
    /// Sessions that still exist keep talking to the handle they were
    /// created against.
    pub fn terminate_all(&self) {
        tracing::debug!("Terminating all applications");
        self.inner.coordinator.reset();
        self.inner.module.reset();
    }

    pub(crate) fn coordinator(&self) -> &RoutingCoordinator {
        &self.inner.coordinator
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("configuration", &self.inner.coordinator.path())
            .field("router", &self.router())
            .field("lock_dir", &self.inner.sweeper.dir())
            .finish_non_exhaustive()
    }
}
