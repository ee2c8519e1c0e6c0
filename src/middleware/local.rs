//! In-process middleware engine.
//!
//! Routes requests, responses, notifications and availability changes
//! between the applications created on one [`LocalMiddleware`].
//!
//! ## Threads
//!
//! Registration calls (`create`, `offer_service`, `register_message`, ...)
//! update the application table directly under a lock and return. Traffic
//! (`send_request`, `notify`, availability changes) is queued to an event
//! loop running on a dedicated thread, which looks up the target handlers,
//! releases the lock and invokes them. Handlers therefore always run on the
//! engine's delivery thread and may call back into the engine.
//!
//! The delivery thread exits once the last handle to the engine is dropped.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{AvailabilityHandler, Middleware, Transport, ANY};
use crate::config::{ConfigurationDocument, CONFIGURATION_FILE};
use crate::dispatch::{Handler, Message, MessageType, RequestId};
use crate::error::{MiddlewareError, Result};
use crate::session::Identity;

/// First client id handed out to applications without an `applications` entry.
const FIRST_AUTO_CLIENT_ID: u16 = 0x0100;

/// Traffic queued for the delivery thread.
enum Delivery {
    Request {
        from: String,
        service: u16,
        instance: u16,
        method: u16,
        payload: Bytes,
        request_id: RequestId,
    },
    Notification {
        service: u16,
        instance: u16,
        event: u16,
        payload: Bytes,
    },
    Availability {
        service: u16,
        instance: u16,
        available: bool,
    },
}

/// Engine-side view of one created application.
struct Application {
    identity: Identity,
    client_id: u16,
    next_session: u16,
    started: bool,
    offered: bool,
    offered_events: HashMap<u16, HashSet<u16>>,
    subscriptions: HashMap<u16, HashSet<u16>>,
    handlers: HashMap<u16, Arc<dyn Handler>>,
    availability: Vec<Arc<dyn AvailabilityHandler>>,
}

impl Application {
    fn new(identity: Identity, client_id: u16) -> Self {
        Self {
            identity,
            client_id,
            next_session: 1,
            started: false,
            offered: false,
            offered_events: HashMap::new(),
            subscriptions: HashMap::new(),
            handlers: HashMap::new(),
            availability: Vec::new(),
        }
    }

    /// Session ids wrap from 0xFFFF to 0x0001, never 0x0000.
    fn next_request_id(&mut self) -> RequestId {
        let session = self.next_session;
        self.next_session = match self.next_session.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        RequestId::new(self.client_id, session)
    }

    fn hosts(&self, service: u16, instance: u16) -> bool {
        self.identity.service() == service
            && (self.identity.instance() == instance || instance == ANY || self.identity.instance() == ANY)
    }

    fn is_available(&self) -> bool {
        self.started && self.offered
    }
}

#[derive(Default)]
struct Engine {
    applications: Mutex<HashMap<String, Application>>,
}

impl Engine {
    fn deliver(&self, delivery: Delivery) {
        match delivery {
            Delivery::Request {
                from,
                service,
                instance,
                method,
                payload,
                request_id,
            } => self.deliver_request(&from, service, instance, method, payload, request_id),
            Delivery::Notification {
                service,
                instance,
                event,
                payload,
            } => self.deliver_notification(service, instance, event, payload),
            Delivery::Availability {
                service,
                instance,
                available,
            } => {
                let handlers: Vec<_> = self
                    .applications
                    .lock()
                    .values()
                    .filter(|app| app.started)
                    .flat_map(|app| app.availability.iter().cloned())
                    .collect();
                for handler in handlers {
                    handler.on_availability(service, instance, available);
                }
            }
        }
    }

    fn deliver_request(
        &self,
        from: &str,
        service: u16,
        instance: u16,
        method: u16,
        payload: Bytes,
        request_id: RequestId,
    ) {
        let target = self
            .applications
            .lock()
            .values()
            .filter(|app| app.is_available() && app.hosts(service, instance))
            .find_map(|app| app.handlers.get(&method).cloned());

        let Some(handler) = target else {
            tracing::debug!(
                "Dropping request {:#06x}/{:#06x} ({}): no available handler",
                service,
                method,
                request_id
            );
            return;
        };

        let request = Message {
            message_type: MessageType::Request,
            service,
            member: method,
            payload,
            request_id,
        };
        tracing::trace!("Delivering request {:#06x}/{:#06x} ({})", service, method, request_id);
        let Some(response) = handler.handle(&request) else {
            return;
        };

        let requester = self
            .applications
            .lock()
            .get(from)
            .filter(|app| app.started)
            .and_then(|app| app.handlers.get(&method).cloned());

        match requester {
            Some(handler) => {
                let message = Message {
                    message_type: MessageType::Response,
                    payload: response,
                    ..request
                };
                handler.handle(&message);
            }
            None => tracing::debug!(
                "Dropping response {:#06x}/{:#06x} ({}): requester {} has no handler",
                service,
                method,
                request_id,
                from
            ),
        }
    }

    fn deliver_notification(&self, service: u16, instance: u16, event: u16, payload: Bytes) {
        let handlers: Vec<_> = self
            .applications
            .lock()
            .values()
            .filter(|app| {
                app.started && app.hosts(service, instance) && app.subscriptions.contains_key(&event)
            })
            .filter_map(|app| app.handlers.get(&event).cloned())
            .collect();

        tracing::trace!(
            "Delivering notification {:#06x}/{:#06x} to {} subscriber(s)",
            service,
            event,
            handlers.len()
        );
        let message = Message {
            message_type: MessageType::Notification,
            service,
            member: event,
            payload,
            request_id: RequestId::default(),
        };
        for handler in handlers {
            handler.handle(&message);
        }
    }
}

async fn event_loop(engine: Arc<Engine>, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = deliveries.recv().await {
        engine.deliver(delivery);
    }
    tracing::debug!("Local middleware shutting down");
}

fn spawn_delivery_thread(engine: Arc<Engine>) -> mpsc::UnboundedSender<Delivery> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("someip-local".to_string())
        .spawn(move || {
            match tokio::runtime::Builder::new_current_thread().build() {
                Ok(runtime) => runtime.block_on(event_loop(engine, rx)),
                Err(e) => tracing::error!("Failed to build delivery runtime: {}", e),
            }
        });
    if let Err(e) = spawned {
        tracing::error!("Failed to spawn delivery thread: {}", e);
    }
    tx
}

/// In-process SOME/IP engine.
///
/// # Example
///
/// ```no_run
/// use someip_adapter::prelude::*;
/// use someip_adapter::middleware::LocalMiddleware;
///
/// # fn main() -> Result<()> {
/// let adapter = someip_adapter::configure()
///     .middleware(|| LocalMiddleware::with_configuration("vsomeip.json"))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct LocalMiddleware {
    engine: Arc<Engine>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    configuration: PathBuf,
    next_client_id: AtomicU16,
}

impl LocalMiddleware {
    /// Engine reading [`CONFIGURATION_FILE`] from the working directory.
    pub fn new() -> Self {
        Self::with_configuration(CONFIGURATION_FILE)
    }

    /// Engine reading its configuration document from `path` at `create`.
    pub fn with_configuration(path: impl AsRef<Path>) -> Self {
        let engine = Arc::new(Engine::default());
        let deliveries = spawn_delivery_thread(engine.clone());
        Self {
            engine,
            deliveries,
            configuration: path.as_ref().to_path_buf(),
            next_client_id: AtomicU16::new(FIRST_AUTO_CLIENT_ID),
        }
    }

    /// Names of the applications currently created.
    pub fn applications(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engine.applications.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Client id the engine assigned to `name`.
    pub fn client_id(&self, name: &str) -> Option<u16> {
        self.engine
            .applications
            .lock()
            .get(name)
            .map(|app| app.client_id)
    }

    fn queue(&self, delivery: Delivery) {
        if self.deliveries.send(delivery).is_err() {
            tracing::warn!("Local middleware delivery thread is gone, dropping traffic");
        }
    }

    fn with_application<T>(
        &self,
        call: &'static str,
        app: &Identity,
        f: impl FnOnce(&mut Application) -> T,
    ) -> Result<T> {
        let mut applications = self.engine.applications.lock();
        let application = applications
            .get_mut(app.name())
            .ok_or_else(|| MiddlewareError::new(call, format!("unknown application {}", app.name())))?;
        Ok(f(application))
    }

    fn resolve_client_id(&self, name: &str) -> u16 {
        match ConfigurationDocument::load(&self.configuration) {
            Ok(document) => {
                if let Some(entry) = document.application(name) {
                    return entry.id;
                }
            }
            Err(e) => tracing::warn!(
                "Cannot read configuration {}: {}, using defaults",
                self.configuration.display(),
                e
            ),
        }
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for LocalMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for LocalMiddleware {
    fn create(&self, app: &Identity) -> Result<()> {
        let client_id = self.resolve_client_id(app.name());
        let mut applications = self.engine.applications.lock();
        if applications.contains_key(app.name()) {
            return Err(MiddlewareError::new(
                "create",
                format!("application {} already exists", app.name()),
            )
            .into());
        }
        tracing::debug!("Created {} with client id {:#06x}", app.name(), client_id);
        applications.insert(app.name().to_string(), Application::new(app.clone(), client_id));
        Ok(())
    }

    fn start(&self, app: &Identity) -> Result<()> {
        let announce = self.with_application("start", app, |application| {
            let announce = application.offered && !application.started;
            application.started = true;
            announce
        })?;
        if announce {
            self.queue(Delivery::Availability {
                service: app.service(),
                instance: app.instance(),
                available: true,
            });
        }
        Ok(())
    }

    fn stop(&self, app: &Identity) -> Result<()> {
        let removed = self
            .engine
            .applications
            .lock()
            .remove(app.name())
            .ok_or_else(|| MiddlewareError::new("stop", format!("unknown application {}", app.name())))?;
        if removed.is_available() {
            self.queue(Delivery::Availability {
                service: app.service(),
                instance: app.instance(),
                available: false,
            });
        }
        Ok(())
    }

    fn request_service(&self, app: &Identity) -> Result<()> {
        self.with_application("request_service", app, |application| {
            tracing::trace!(
                "{} requests {:#06x}/{:#06x} v{}",
                application.identity.name(),
                app.service(),
                app.instance(),
                app.version()
            );
        })
    }

    fn offer_service(&self, app: &Identity) -> Result<()> {
        let announce = self.with_application("offer_service", app, |application| {
            let announce = application.started && !application.offered;
            application.offered = true;
            announce
        })?;
        if announce {
            self.queue(Delivery::Availability {
                service: app.service(),
                instance: app.instance(),
                available: true,
            });
        }
        Ok(())
    }

    fn offer_event(&self, app: &Identity, event: u16, group: u16) -> Result<()> {
        self.with_application("offer_event", app, |application| {
            application.offered_events.entry(event).or_default().insert(group);
        })
    }

    fn request_event(&self, app: &Identity, event: u16, group: u16) -> Result<()> {
        self.with_application("request_event", app, |application| {
            application.subscriptions.entry(event).or_default().insert(group);
        })
    }

    fn release_event(&self, app: &Identity, event: u16, group: u16) -> Result<()> {
        self.with_application("release_event", app, |application| {
            if group == ANY {
                application.subscriptions.remove(&event);
            } else if let Some(groups) = application.subscriptions.get_mut(&event) {
                groups.remove(&group);
                if groups.is_empty() {
                    application.subscriptions.remove(&event);
                }
            }
        })
    }

    fn send_request(
        &self,
        app: &Identity,
        method: u16,
        transport: Transport,
        payload: Bytes,
    ) -> Result<RequestId> {
        let request_id = self.with_application("send_service", app, Application::next_request_id)?;
        tracing::trace!(
            "{} requests {:#06x}/{:#06x} over {:?} ({})",
            app.name(),
            app.service(),
            method,
            transport,
            request_id
        );
        self.queue(Delivery::Request {
            from: app.name().to_string(),
            service: app.service(),
            instance: app.instance(),
            method,
            payload,
            request_id,
        });
        Ok(request_id)
    }

    fn notify(&self, app: &Identity, event: u16, payload: Bytes) -> Result<()> {
        let offered = self.with_application("notify_clients", app, |application| {
            application.offered_events.contains_key(&event)
        })?;
        if !offered {
            tracing::debug!("{} notifies {:#06x} without offering it, dropped", app.name(), event);
            return Ok(());
        }
        self.queue(Delivery::Notification {
            service: app.service(),
            instance: app.instance(),
            event,
            payload,
        });
        Ok(())
    }

    fn register_message(
        &self,
        app: &Identity,
        member: u16,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        self.with_application("register_message", app, |application| {
            application.handlers.insert(member, handler);
        })
    }

    fn register_availability(
        &self,
        app: &Identity,
        handler: Arc<dyn AvailabilityHandler>,
    ) -> Result<()> {
        self.with_application("register_availability", app, |application| {
            application.availability.push(handler);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Version;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn identity(name: &str) -> Identity {
        Identity::new(name, 0x1234, 0x5678, Version::default())
    }

    fn engine() -> (tempfile::TempDir, LocalMiddleware) {
        let dir = tempfile::tempdir().unwrap();
        let middleware = LocalMiddleware::with_configuration(dir.path().join(CONFIGURATION_FILE));
        (dir, middleware)
    }

    #[test]
    fn client_id_from_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIGURATION_FILE);
        crate::config::Template::embedded()
            .unwrap()
            .instantiate()
            .with_application("known", 0x1111)
            .persist(&path)
            .unwrap();

        let middleware = LocalMiddleware::with_configuration(&path);
        middleware.create(&identity("known")).unwrap();
        middleware.create(&identity("unknown")).unwrap();

        assert_eq!(middleware.client_id("known"), Some(0x1111));
        assert_eq!(middleware.client_id("unknown"), Some(FIRST_AUTO_CLIENT_ID));
    }

    #[test]
    fn duplicate_create_and_unknown_stop_fail() {
        let (_dir, middleware) = engine();
        let app = identity("app");
        middleware.create(&app).unwrap();
        assert!(middleware.create(&app).is_err());

        middleware.stop(&app).unwrap();
        assert!(middleware.stop(&app).is_err());
        assert!(middleware.applications().is_empty());
    }

    #[test]
    fn request_ids_increment_per_application() {
        let (_dir, middleware) = engine();
        let app = identity("client");
        middleware.create(&app).unwrap();

        let first = middleware
            .send_request(&app, 0x0001, Transport::Udp, Bytes::from_static(b"a"))
            .unwrap();
        let second = middleware
            .send_request(&app, 0x0001, Transport::Tcp, Bytes::from_static(b"b"))
            .unwrap();
        assert_eq!(first.client, second.client);
        assert_eq!(first.session + 1, second.session);
    }

    #[test]
    fn session_ids_skip_zero() {
        let mut app = Application::new(identity("wrap"), 0x0100);
        app.next_session = 0xFFFF;
        assert_eq!(app.next_request_id().session, 0xFFFF);
        assert_eq!(app.next_request_id().session, 0x0001);
    }

    #[test]
    fn request_reaches_offering_application_and_response_returns() {
        let (_dir, middleware) = engine();
        let service = identity("service");
        let client = identity("client");
        middleware.create(&service).unwrap();
        middleware.create(&client).unwrap();

        let (tx, rx) = std_mpsc::channel();
        let responses = Mutex::new(tx);
        middleware
            .register_message(
                &service,
                0x0001,
                Arc::new(|m: &Message| {
                    Some(Bytes::from(m.payload.iter().rev().copied().collect::<Vec<u8>>()))
                }),
            )
            .unwrap();
        middleware
            .register_message(
                &client,
                0x0001,
                Arc::new(move |m: &Message| -> Option<Bytes> {
                    let _ = responses.lock().send(m.clone());
                    None
                }),
            )
            .unwrap();
        middleware.offer_service(&service).unwrap();
        middleware.start(&service).unwrap();
        middleware.start(&client).unwrap();

        let request_id = middleware
            .send_request(&client, 0x0001, Transport::Udp, Bytes::from_static(b"abc"))
            .unwrap();

        let response = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(response.message_type, MessageType::Response);
        assert_eq!(response.payload, Bytes::from_static(b"cba"));
        assert_eq!(response.request_id, request_id);
    }

    #[test]
    fn notification_requires_offer_and_subscription() {
        let (_dir, middleware) = engine();
        let service = identity("service");
        let client = identity("client");
        middleware.create(&service).unwrap();
        middleware.create(&client).unwrap();
        middleware.start(&service).unwrap();
        middleware.start(&client).unwrap();

        let (tx, rx) = std_mpsc::channel();
        let events = Mutex::new(tx);
        middleware
            .register_message(
                &client,
                0x8001,
                Arc::new(move |m: &Message| -> Option<Bytes> {
                    let _ = events.lock().send(m.payload.clone());
                    None
                }),
            )
            .unwrap();

        // Not offered yet
        middleware.request_event(&client, 0x8001, 0x0001).unwrap();
        middleware.notify(&service, 0x8001, Bytes::from_static(b"1")).unwrap();

        middleware.offer_event(&service, 0x8001, 0x0001).unwrap();
        middleware.notify(&service, 0x8001, Bytes::from_static(b"2")).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Bytes::from_static(b"2"));

        middleware.release_event(&client, 0x8001, ANY).unwrap();
        middleware.notify(&service, 0x8001, Bytes::from_static(b"3")).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn availability_follows_offer_and_stop() {
        let (_dir, middleware) = engine();
        let service = identity("service");
        let observer = Identity::new("observer", 0x4321, 0x0001, Version::default());
        middleware.create(&service).unwrap();
        middleware.create(&observer).unwrap();

        let (tx, rx) = std_mpsc::channel();
        let changes = Mutex::new(tx);
        middleware
            .register_availability(
                &observer,
                Arc::new(move |service: u16, instance: u16, available: bool| {
                    let _ = changes.lock().send((service, instance, available));
                }),
            )
            .unwrap();
        middleware.start(&observer).unwrap();

        middleware.offer_service(&service).unwrap();
        middleware.start(&service).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (0x1234, 0x5678, true));

        middleware.stop(&service).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (0x1234, 0x5678, false));
    }
}
