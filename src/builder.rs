//! Builder for configuring an [`Adapter`].
//!
//! ## Quick Start
//!
//! For most applications, the defaults work out of the box:
//!
//! ```no_run
//! # fn example() -> someip_adapter::Result<()> {
//! let adapter = someip_adapter::configure().build()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Builder Pattern
//!
//! ```no_run
//! use someip_adapter::prelude::*;
//! use someip_adapter::middleware::LocalMiddleware;
//!
//! # fn example() -> someip_adapter::Result<()> {
//! let adapter = someip_adapter::configure()
//!     .configuration_path("/run/someip/vsomeip.json")
//!     .template_path("/etc/someip/template.json")
//!     .lock_dir("/run/someip")
//!     .middleware(|| LocalMiddleware::with_configuration("/run/someip/vsomeip.json"))
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Defaults
//!
//! | Setting | Default |
//! |---------|---------|
//! | `configuration_path` | `vsomeip.json` in the working directory |
//! | template | shipped with the crate |
//! | `lock_dir` | the system temp directory |
//! | `lock_pattern` | [`DEFAULT_LOCK_PATTERN`] |
//! | `lock_retries` | [`DEFAULT_SWEEP_ATTEMPTS`] attempts, [`DEFAULT_SWEEP_BACKOFF`] apart |
//! | `middleware` | [`LocalMiddleware`] reading `configuration_path` |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::Adapter;
use crate::config::{Template, CONFIGURATION_FILE};
use crate::error::Result;
use crate::middleware::{LocalMiddleware, Middleware, MiddlewareFactory};
use crate::routing::RoutingCoordinator;
use crate::supervisor::{
    LockSweeper, ModuleSlot, DEFAULT_LOCK_PATTERN, DEFAULT_SWEEP_ATTEMPTS, DEFAULT_SWEEP_BACKOFF,
};

#[derive(Debug, Clone)]
enum TemplateSource {
    Embedded,
    Path(PathBuf),
    Parsed(Template),
}

/// Builder for an [`Adapter`].
///
/// Created via [`configure()`](crate::configure).
#[derive(Debug, Clone)]
#[must_use]
pub struct AdapterBuilder {
    configuration_path: PathBuf,
    template: TemplateSource,
    lock_dir: PathBuf,
    lock_pattern: String,
    lock_attempts: u32,
    lock_backoff: Duration,
    middleware: Option<MiddlewareFactory>,
}

impl Default for AdapterBuilder {
    fn default() -> Self {
        Self {
            configuration_path: PathBuf::from(CONFIGURATION_FILE),
            template: TemplateSource::Embedded,
            lock_dir: std::env::temp_dir(),
            lock_pattern: DEFAULT_LOCK_PATTERN.to_string(),
            lock_attempts: DEFAULT_SWEEP_ATTEMPTS,
            lock_backoff: DEFAULT_SWEEP_BACKOFF,
            middleware: None,
        }
    }
}

impl AdapterBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the configuration document is persisted for the engine.
    ///
    /// Default: `vsomeip.json`
    pub fn configuration_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.configuration_path = path.into();
        self
    }

    /// Read the template from `path` instead of the shipped one.
    pub fn template_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.template = TemplateSource::Path(path.into());
        self
    }

    pub fn template(mut self, template: Template) -> Self {
        self.template = TemplateSource::Parsed(template);
        self
    }

    /// Directory swept for stale lock files.
    ///
    /// Default: the system temp directory
    pub fn lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    /// Regex matched against lock file names.
    pub fn lock_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.lock_pattern = pattern.into();
        self
    }

    /// Tries per lock file and the pause between them. At least one try is
    /// always made.
    ///
    /// Default: 3 tries, 100ms apart
    pub fn lock_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.lock_attempts = attempts;
        self.lock_backoff = backoff;
        self
    }

    /// Produce middleware handles with `factory`. Called once now and again
    /// on every [`Adapter::terminate_all`].
    pub fn middleware<F, M>(mut self, factory: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Middleware,
    {
        self.middleware = Some(MiddlewareFactory::new(factory));
        self
    }

    /// Use one middleware handle for the adapter's whole life.
    pub fn shared_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware = Some(MiddlewareFactory::shared(middleware));
        self
    }

    /// Build the adapter.
    ///
    /// # Errors
    ///
    /// [`Error::Config`](crate::Error::Config) when the template is missing
    /// or malformed.
    pub fn build(self) -> Result<Adapter> {
        let template = match self.template {
            TemplateSource::Embedded => Template::embedded()?,
            TemplateSource::Path(path) => Template::from_path(path)?,
            TemplateSource::Parsed(template) => template,
        };
        let factory = self.middleware.unwrap_or_else(|| {
            let path = self.configuration_path.clone();
            MiddlewareFactory::new(move || LocalMiddleware::with_configuration(&path))
        });

        tracing::debug!(
            "Building adapter: configuration {}, locks in {}",
            self.configuration_path.display(),
            self.lock_dir.display()
        );
        Ok(Adapter::new(
            RoutingCoordinator::new(template, self.configuration_path),
            ModuleSlot::new(factory),
            LockSweeper::new(self.lock_dir).with_attempts(self.lock_attempts, self.lock_backoff),
            self.lock_pattern,
        ))
    }
}
