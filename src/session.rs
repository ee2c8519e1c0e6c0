//! # Application Session
//!
//! One named SOME/IP application bound to a single service/instance pair.
//!
//! ## Lifecycle
//!
//! ```text
//!  build() ──▶ Uncreated ──create()──▶ Created ──offer()────▶ Offering ──┐
//!                                        │                               │
//!                                        └─────register()──▶ Registered ─┤
//!                                                                        │
//!                                   start() from any created stage ──▶ Started
//!
//!  stop() from anywhere ──▶ Stopped (terminal)
//! ```
//!
//! `register`, `offer`, `request` and `start` need a created session.
//! Everything except `stop` fails with
//! [`Error::InvalidState`](crate::Error::InvalidState) once the session is
//! stopped. `stop` is idempotent and is also run when the session is dropped.
//!
//! ## Roles
//!
//! A session has no role until its first role-defining call:
//!
//! | Operation | Needs | Sets |
//! |-----------|-------|------|
//! | `register`, `request` | not a service | client |
//! | `offer`, `offer_events` | not a client | service |
//! | `notify` | service | - |
//!
//! A role violation fails with [`Error::Role`](crate::Error::Role) before
//! any middleware call is made, and the role never changes once set.
//!
//! ## Handlers
//!
//! Inbound messages are dispatched on the middleware's delivery thread
//! through the session's [`Dispatcher`]. Handlers may call back into the
//! session (`notify` from a request handler is the common case).
//!
//! ```no_run
//! use someip_adapter::prelude::*;
//! use bytes::Bytes;
//!
//! # fn example(adapter: &Adapter) -> Result<()> {
//! let service = adapter.application("service_example", 0x1234, 0x5678).build()?;
//! service.create()?;
//! service.offer()?;
//! service.on_message(0x0421, |request| {
//!     Some(Bytes::from(request.payload.to_ascii_uppercase()))
//! })?;
//! service.start()?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::adapter::Adapter;
use crate::config::ConfigurationDocument;
use crate::dispatch::{Dispatcher, HandlerSlot, Message, RequestId};
use crate::error::{Error, Result, RoleError};
use crate::middleware::{AvailabilityHandler, Middleware, Transport, ANY};
use crate::routing::RouterDecision;

/// Payload sent when a request or notification carries no data.
pub const EMPTY_PAYLOAD: &[u8] = &[0x00];

/// Interface version of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Who an application is and which service instance it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    name: String,
    service: u16,
    instance: u16,
    version: Version,
}

impl Identity {
    pub fn new(name: impl Into<String>, service: u16, instance: u16, version: Version) -> Self {
        Self {
            name: name.into(),
            service,
            instance,
            version,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> u16 {
        self.service
    }

    pub fn instance(&self) -> u16 {
        self.instance
    }

    pub fn version(&self) -> Version {
        self.version
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:#06x}/{:#06x} v{})",
            self.name, self.service, self.instance, self.version
        )
    }
}

/// Lifecycle stage of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Uncreated,
    Created,
    Offering,
    Registered,
    Started,
    Stopped,
}

impl Stage {
    /// Whether `create` has succeeded and `stop` has not run yet.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Offering | Self::Registered | Self::Started
        )
    }
}

/// Role a [`Session`] has committed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    #[default]
    Undetermined,
    Service,
    Client,
}

#[derive(Debug)]
struct State {
    stage: Stage,
    role: Role,
    /// Event groups subscribed per event id
    subscriptions: HashMap<u16, HashSet<u16>>,
}

/// Builder for a [`Session`], created by [`Adapter::application`].
#[derive(Debug)]
#[must_use]
pub struct SessionBuilder {
    adapter: Adapter,
    name: String,
    service: u16,
    instance: u16,
    version: Version,
    configuration: Option<ConfigurationDocument>,
    force: bool,
}

impl SessionBuilder {
    pub(crate) fn new(adapter: Adapter, name: String, service: u16, instance: u16) -> Self {
        Self {
            adapter,
            name,
            service,
            instance,
            version: Version::default(),
            configuration: None,
            force: false,
        }
    }

    /// Interface version requested or offered. Default: `0.0`
    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.version = Version::new(major, minor);
        self
    }

    /// Replace the active configuration document with `configuration`.
    ///
    /// Without it the document is reset to a fresh copy of the template.
    pub fn configuration(mut self, configuration: ConfigurationDocument) -> Self {
        self.configuration = Some(configuration);
        self
    }

    /// Sweep stale lock artifacts before installing the configuration.
    ///
    /// Always done on Windows. Default: `false`
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Install the configuration, elect a router if needed and persist the
    /// document.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] or [`Error::Json`] when the document cannot be written.
    pub fn build(self) -> Result<Session> {
        let identity = Identity::new(self.name, self.service, self.instance, self.version);
        let sweep = self.force || cfg!(windows);
        let adapter = self.adapter;

        let decision = adapter.coordinator().install(identity.name(), self.configuration, || {
            if sweep {
                adapter.force_clear_locks(None);
            }
        })?;
        match &decision {
            RouterDecision::Router => tracing::info!("{} is the routing manager", identity),
            decision => tracing::debug!("Built session {}: {:?}", identity, decision),
        }

        let dispatcher = Arc::new(Dispatcher::new(identity.name()));
        Ok(Session {
            identity,
            middleware: adapter.middleware(),
            adapter,
            dispatcher,
            state: Mutex::new(State {
                stage: Stage::Uncreated,
                role: Role::Undetermined,
                subscriptions: HashMap::new(),
            }),
        })
    }
}

/// A SOME/IP application session.
///
/// All operations take `&self`, so a session can be shared with handlers
/// through an [`Arc`].
pub struct Session {
    identity: Identity,
    /// Handle current when the session was built
    middleware: Arc<dyn Middleware>,
    adapter: Adapter,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<State>,
}

impl Session {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        self.identity.name()
    }

    pub fn stage(&self) -> Stage {
        self.state.lock().stage
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn is_service(&self) -> bool {
        self.role() == Role::Service
    }

    /// Whether this session currently holds the routing slot.
    pub fn is_router(&self) -> bool {
        self.adapter.router().as_deref() == Some(self.name())
    }

    /// Create the application in the middleware.
    ///
    /// The configuration document is persisted again first, so the engine
    /// sees the latest router election.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] unless the session is uncreated
    /// - [`Error::Middleware`] when the engine rejects the application
    pub fn create(&self) -> Result<()> {
        self.expect_stage("create", |stage| stage == Stage::Uncreated)?;
        let decision = self.adapter.coordinator().prepare(self.name())?;
        tracing::debug!("Creating {}: {:?}", self.identity, decision);
        self.middleware().create(&self.identity)?;
        self.advance(Stage::Created, |_| true);
        Ok(())
    }

    /// Start processing messages.
    pub fn start(&self) -> Result<()> {
        self.expect_stage("start", Stage::is_live)?;
        self.middleware().start(&self.identity)?;
        self.advance(Stage::Started, |_| true);
        tracing::debug!("Started {}", self.identity);
        Ok(())
    }

    /// Request the bound service. Makes this session a client.
    pub fn register(&self) -> Result<()> {
        self.claim_role("register", Role::Client)?;
        self.middleware().request_service(&self.identity)?;
        self.advance(Stage::Registered, |stage| stage == Stage::Created);
        Ok(())
    }

    /// Offer the bound service. Makes this session a service.
    pub fn offer(&self) -> Result<()> {
        self.claim_role("offer", Role::Service)?;
        self.middleware().offer_service(&self.identity)?;
        self.advance(Stage::Offering, |stage| stage == Stage::Created);
        Ok(())
    }

    /// Offer each of `events` in `group`. An empty list offers the service
    /// itself instead.
    pub fn offer_events(&self, events: &[u16], group: u16) -> Result<()> {
        if events.is_empty() {
            return self.offer();
        }
        self.claim_role("offer", Role::Service)?;
        let middleware = self.middleware();
        for &event in events {
            middleware.offer_event(&self.identity, event, group)?;
        }
        self.advance(Stage::Offering, |stage| stage == Stage::Created);
        Ok(())
    }

    /// Send a request to `method` over UDP. An empty payload is sent as a
    /// single `0x00` byte.
    pub fn request(&self, method: u16, payload: &[u8]) -> Result<RequestId> {
        self.request_with(method, payload, Transport::Udp)
    }

    /// Send a request to `method` over `transport`.
    pub fn request_with(&self, method: u16, payload: &[u8], transport: Transport) -> Result<RequestId> {
        self.claim_role("request", Role::Client)?;
        self.middleware()
            .send_request(&self.identity, method, transport, payload_or_default(payload))
    }

    /// Notify subscribers of `event`. An empty payload is sent as a single
    /// `0x00` byte.
    ///
    /// # Errors
    ///
    /// [`Error::Role`] unless this session has offered something.
    pub fn notify(&self, event: u16, payload: &[u8]) -> Result<()> {
        {
            let state = self.state.lock();
            if state.role != Role::Service {
                return Err(RoleError::new("notify", state.role).into());
            }
            check_not_stopped("notify", state.stage)?;
        }
        self.middleware()
            .notify(&self.identity, event, payload_or_default(payload))
    }

    /// Register `handler` for method or event `id`.
    pub fn on_message<F>(&self, id: u16, handler: F) -> Result<()>
    where
        F: Fn(&Message) -> Option<Bytes> + Send + Sync + 'static,
    {
        self.install_handler("on_message", id, HandlerSlot::custom(handler))
    }

    /// Register the logging/echo default handler for `id`.
    pub fn on_message_default(&self, id: u16) -> Result<()> {
        self.install_handler("on_message", id, HandlerSlot::Default)
    }

    /// Subscribe to `event` in `group` and register `handler` for it.
    pub fn on_event<F>(&self, event: u16, handler: F, group: u16) -> Result<()>
    where
        F: Fn(&Message) -> Option<Bytes> + Send + Sync + 'static,
    {
        self.subscribe(event, HandlerSlot::custom(handler), group)
    }

    /// Subscribe to `event` in `group` with the default handler.
    pub fn on_event_default(&self, event: u16, group: u16) -> Result<()> {
        self.subscribe(event, HandlerSlot::Default, group)
    }

    /// Release the subscription to `event` in `group` ([`ANY`] releases every
    /// group). The handler goes away with the last group.
    pub fn remove(&self, event: u16, group: u16) -> Result<()> {
        self.expect_stage("remove", |stage| stage != Stage::Stopped)?;
        self.middleware().release_event(&self.identity, event, group)?;

        let mut state = self.state.lock();
        let Some(groups) = state.subscriptions.get_mut(&event) else {
            return Ok(());
        };
        if group == ANY {
            groups.clear();
        } else {
            groups.remove(&group);
        }
        if groups.is_empty() {
            state.subscriptions.remove(&event);
            self.dispatcher.unregister(event);
            tracing::debug!("[{}] unsubscribed from {:#06x}", self.name(), event);
        }
        Ok(())
    }

    /// Report availability changes of any service to `handler`.
    pub fn on_availability<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(u16, u16, bool) + Send + Sync + 'static,
    {
        self.expect_stage("on_availability", |stage| stage != Stage::Stopped)?;
        self.middleware()
            .register_availability(&self.identity, Arc::new(handler) as Arc<dyn AvailabilityHandler>)
    }

    /// Dispatch `message` as if the middleware had delivered it.
    pub fn callback(&self, message: &Message) -> Option<Bytes> {
        self.dispatcher.dispatch(message)
    }

    /// Stop the application and give up the routing slot if held.
    ///
    /// Never fails: middleware errors are logged. Repeated calls do nothing.
    pub fn stop(&self) {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.stage, Stage::Stopped)
        };
        if previous == Stage::Stopped {
            return;
        }

        if previous != Stage::Uncreated {
            if let Err(e) = self.middleware().stop(&self.identity) {
                tracing::warn!("Stopping {} failed: {}", self.identity, e);
            }
        }
        self.dispatcher.clear();
        self.state.lock().subscriptions.clear();
        if self.adapter.coordinator().release_router(self.name()) {
            tracing::info!("{} released the routing slot", self.identity);
        }
        tracing::debug!("Stopped {}", self.identity);
    }

    fn middleware(&self) -> &dyn Middleware {
        self.middleware.as_ref()
    }

    fn expect_stage(&self, operation: &'static str, allowed: impl Fn(Stage) -> bool) -> Result<()> {
        let stage = self.state.lock().stage;
        if allowed(stage) {
            Ok(())
        } else {
            Err(Error::InvalidState { operation, stage })
        }
    }

    /// Role check first, then stage. The role sticks even if the middleware
    /// call that follows fails.
    fn claim_role(&self, operation: &'static str, role: Role) -> Result<()> {
        let mut state = self.state.lock();
        if state.role != Role::Undetermined && state.role != role {
            return Err(RoleError::new(operation, state.role).into());
        }
        if !state.stage.is_live() {
            return Err(Error::InvalidState {
                operation,
                stage: state.stage,
            });
        }
        state.role = role;
        Ok(())
    }

    /// Move to `next` if the current stage passes `from` and the session
    /// was not stopped in the meantime.
    fn advance(&self, next: Stage, from: impl Fn(Stage) -> bool) {
        let mut state = self.state.lock();
        if state.stage != Stage::Stopped && from(state.stage) {
            state.stage = next;
        }
    }

    fn install_handler(&self, operation: &'static str, id: u16, slot: HandlerSlot) -> Result<()> {
        self.expect_stage(operation, |stage| stage != Stage::Stopped)?;
        self.dispatcher.register(id, slot);
        self.middleware()
            .register_message(&self.identity, id, self.dispatcher.clone())
    }

    fn subscribe(&self, event: u16, slot: HandlerSlot, group: u16) -> Result<()> {
        self.expect_stage("on_event", |stage| stage != Stage::Stopped)?;
        self.middleware().request_event(&self.identity, event, group)?;
        self.state
            .lock()
            .subscriptions
            .entry(event)
            .or_default()
            .insert(group);
        self.install_handler("on_event", event, slot)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("stage", &state.stage)
            .field("role", &state.role)
            .finish_non_exhaustive()
    }
}

fn check_not_stopped(operation: &'static str, stage: Stage) -> Result<()> {
    if stage == Stage::Stopped {
        Err(Error::InvalidState { operation, stage })
    } else {
        Ok(())
    }
}

fn payload_or_default(payload: &[u8]) -> Bytes {
    if payload.is_empty() {
        Bytes::from_static(EMPTY_PAYLOAD)
    } else {
        Bytes::copy_from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_stages() {
        assert!(!Stage::Uncreated.is_live());
        assert!(Stage::Created.is_live());
        assert!(Stage::Offering.is_live());
        assert!(Stage::Registered.is_live());
        assert!(Stage::Started.is_live());
        assert!(!Stage::Stopped.is_live());
    }

    #[test]
    fn empty_payload_becomes_null_byte() {
        assert_eq!(payload_or_default(b""), Bytes::from_static(&[0x00]));
        assert_eq!(payload_or_default(b"ABC"), Bytes::from_static(b"ABC"));
    }

    #[test]
    fn identity_display() {
        let identity = Identity::new("app", 0x1234, 0x5678, Version::new(1, 2));
        assert_eq!(identity.to_string(), "app (0x1234/0x5678 v1.2)");
    }
}
