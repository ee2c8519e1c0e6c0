#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use someip_adapter::middleware::{AvailabilityHandler, Middleware, Transport};
use someip_adapter::prelude::*;
use someip_adapter::{Identity, MiddlewareError};
use tempfile::TempDir;

pub(crate) const WAIT: Duration = Duration::from_secs(5);
pub(crate) const QUIET: Duration = Duration::from_millis(200);

pub(crate) fn configure_tracing() {
    use std::sync::OnceLock;
    static TRACING_INIT: OnceLock<()> = OnceLock::new();
    TRACING_INIT.get_or_init(|| {
        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::builder()
                        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                        .from_env_lossy(),
                )
                .with_test_writer()
                .finish(),
        );
    });
}

/// Adapter writing into a scratch directory.
pub(crate) struct Fixture {
    pub dir: TempDir,
    pub adapter: Adapter,
}

impl Fixture {
    /// Default middleware ([`LocalMiddleware`] on the scratch document).
    pub fn local() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let adapter = someip_adapter::configure()
            .configuration_path(dir.path().join("vsomeip.json"))
            .lock_dir(dir.path())
            .build()
            .unwrap();
        Self { dir, adapter }
    }

    pub fn recording() -> (Self, Arc<RecordingMiddleware>) {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(RecordingMiddleware::default());
        let adapter = someip_adapter::configure()
            .configuration_path(dir.path().join("vsomeip.json"))
            .lock_dir(dir.path())
            .shared_middleware(recorder.clone())
            .build()
            .unwrap();
        (Self { dir, adapter }, recorder)
    }

    pub fn persisted(&self) -> ConfigurationDocument {
        ConfigurationDocument::load(self.dir.path().join("vsomeip.json")).unwrap()
    }

    /// Active document plus one UDP service entry.
    pub fn with_service(&self, service: u16, instance: u16) -> ConfigurationDocument {
        self.adapter
            .configuration()
            .with_service(service, instance, 30509)
    }
}

/// Handler forwarding every message into a channel.
pub(crate) fn collector(
    reply: Option<&'static [u8]>,
) -> (
    impl Fn(&Message) -> Option<Bytes> + Send + Sync + 'static,
    mpsc::Receiver<Message>,
) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let handler = move |message: &Message| {
        let _ = tx.lock().send(message.clone());
        reply.map(Bytes::from_static)
    };
    (handler, rx)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub op: &'static str,
    pub app: String,
    pub member: Option<u16>,
    pub group: Option<u16>,
    pub payload: Option<Bytes>,
}

/// Middleware that records every call and can be told to fail one.
#[derive(Default)]
pub(crate) struct RecordingMiddleware {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<Option<&'static str>>,
    next_session: Mutex<u16>,
}

impl RecordingMiddleware {
    pub fn fail_on(&self, op: &'static str) {
        *self.failing.lock() = Some(op);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn ops(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(|c| c.op).collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(
        &self,
        op: &'static str,
        app: &Identity,
        member: Option<u16>,
        group: Option<u16>,
        payload: Option<Bytes>,
    ) -> someip_adapter::Result<()> {
        self.calls.lock().push(Call {
            op,
            app: app.name().to_string(),
            member,
            group,
            payload,
        });
        if *self.failing.lock() == Some(op) {
            return Err(MiddlewareError::new(op, "injected failure").into());
        }
        Ok(())
    }
}

impl Middleware for RecordingMiddleware {
    fn create(&self, app: &Identity) -> someip_adapter::Result<()> {
        self.record("create", app, None, None, None)
    }

    fn start(&self, app: &Identity) -> someip_adapter::Result<()> {
        self.record("start", app, None, None, None)
    }

    fn stop(&self, app: &Identity) -> someip_adapter::Result<()> {
        self.record("stop", app, None, None, None)
    }

    fn request_service(&self, app: &Identity) -> someip_adapter::Result<()> {
        self.record("request_service", app, None, None, None)
    }

    fn offer_service(&self, app: &Identity) -> someip_adapter::Result<()> {
        self.record("offer_service", app, None, None, None)
    }

    fn offer_event(&self, app: &Identity, event: u16, group: u16) -> someip_adapter::Result<()> {
        self.record("offer_event", app, Some(event), Some(group), None)
    }

    fn request_event(&self, app: &Identity, event: u16, group: u16) -> someip_adapter::Result<()> {
        self.record("request_event", app, Some(event), Some(group), None)
    }

    fn release_event(&self, app: &Identity, event: u16, group: u16) -> someip_adapter::Result<()> {
        self.record("release_event", app, Some(event), Some(group), None)
    }

    fn send_request(
        &self,
        app: &Identity,
        method: u16,
        _transport: Transport,
        payload: Bytes,
    ) -> someip_adapter::Result<RequestId> {
        self.record("send_request", app, Some(method), None, Some(payload))?;
        let mut session = self.next_session.lock();
        *session += 1;
        Ok(RequestId::new(0x0100, *session))
    }

    fn notify(&self, app: &Identity, event: u16, payload: Bytes) -> someip_adapter::Result<()> {
        self.record("notify", app, Some(event), None, Some(payload))
    }

    fn register_message(
        &self,
        app: &Identity,
        member: u16,
        _handler: Arc<dyn someip_adapter::Handler>,
    ) -> someip_adapter::Result<()> {
        self.record("register_message", app, Some(member), None, None)
    }

    fn register_availability(
        &self,
        app: &Identity,
        _handler: Arc<dyn AvailabilityHandler>,
    ) -> someip_adapter::Result<()> {
        self.record("register_availability", app, None, None, None)
    }
}
