//! Middleware capability abstraction.
//!
//! The adapter does not speak the SOME/IP wire protocol itself. Every
//! lifecycle and messaging operation of a [`Session`](crate::Session) is a
//! call into a [`Middleware`] implementation, and inbound traffic comes back
//! through the [`Handler`] registered with
//! [`register_message`](Middleware::register_message).
//!
//! [`LocalMiddleware`] is an in-process engine routing between
//! applications of one host. Bindings to an external engine implement the
//! same trait.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::dispatch::{Handler, RequestId};
use crate::error::Result;
use crate::session::Identity;

mod local;

pub use local::LocalMiddleware;

/// Event group wildcard: "default/all".
pub const ANY: u16 = 0xFFFF;

/// Transport used for an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transport {
    /// UDP transport (default).
    #[default]
    Udp,
    /// TCP transport.
    Tcp,
}

/// Receives service availability changes.
pub trait AvailabilityHandler: Send + Sync {
    fn on_availability(&self, service: u16, instance: u16, available: bool);
}

impl<F> AvailabilityHandler for F
where
    F: Fn(u16, u16, bool) + Send + Sync,
{
    fn on_availability(&self, service: u16, instance: u16, available: bool) {
        self(service, instance, available);
    }
}

/// Operations the adapter needs from a SOME/IP engine.
///
/// Applications are addressed by their [`Identity`]. Implementations must
/// be callable from any thread, including from inside a handler they are
/// currently running.
pub trait Middleware: Send + Sync + 'static {
    /// Create the application. The engine reads the persisted configuration
    /// document at this point.
    fn create(&self, app: &Identity) -> Result<()>;

    fn start(&self, app: &Identity) -> Result<()>;

    /// Stop the application and drop its registrations.
    fn stop(&self, app: &Identity) -> Result<()>;

    /// Ask for the application's service/instance at its version.
    fn request_service(&self, app: &Identity) -> Result<()>;

    fn offer_service(&self, app: &Identity) -> Result<()>;

    fn offer_event(&self, app: &Identity, event: u16, group: u16) -> Result<()>;

    /// Request and subscribe to `event` in `group`.
    fn request_event(&self, app: &Identity, event: u16, group: u16) -> Result<()>;

    /// Undo [`request_event`](Self::request_event).
    fn release_event(&self, app: &Identity, event: u16, group: u16) -> Result<()>;

    /// Send a request to `method` and return its correlation id.
    fn send_request(
        &self,
        app: &Identity,
        method: u16,
        transport: Transport,
        payload: Bytes,
    ) -> Result<RequestId>;

    fn notify(&self, app: &Identity, event: u16, payload: Bytes) -> Result<()>;

    /// Route inbound messages for `member` to `handler`.
    fn register_message(&self, app: &Identity, member: u16, handler: Arc<dyn Handler>)
        -> Result<()>;

    /// Report availability changes of any service to `handler`.
    fn register_availability(
        &self,
        app: &Identity,
        handler: Arc<dyn AvailabilityHandler>,
    ) -> Result<()>;
}

/// Produces fresh middleware handles.
///
/// Called once when the adapter is built and again on every
/// [`terminate_all`](crate::Adapter::terminate_all).
#[derive(Clone)]
pub struct MiddlewareFactory(Arc<dyn Fn() -> Arc<dyn Middleware> + Send + Sync>);

impl MiddlewareFactory {
    pub fn new<F, M>(factory: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Middleware,
    {
        Self(Arc::new(move || Arc::new(factory()) as Arc<dyn Middleware>))
    }

    /// Factory handing out clones of one shared handle.
    pub fn shared(middleware: Arc<dyn Middleware>) -> Self {
        Self(Arc::new(move || middleware.clone()))
    }

    pub fn produce(&self) -> Arc<dyn Middleware> {
        (self.0)()
    }
}

impl fmt::Debug for MiddlewareFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MiddlewareFactory(..)")
    }
}
