//! # Dispatch Gateway
//!
//! Routes inbound middleware callbacks to the handler registered for the
//! member (method or event) id.
//!
//! ```text
//!  middleware delivery thread
//!            │  Message { type, service, member, payload, request_id }
//!            ▼
//!  ┌───────────────────┐   lookup member   ┌───────────────────┐
//!  │    Dispatcher     │ ────────────────▶ │   HandlerSlot     │
//!  └───────────────────┘                   │  Default | Custom │
//!            ▲                             └─────────┬─────────┘
//!            │  Option<Bytes> (REQUEST only)         │
//!            └───────────────────────────────────────┘
//! ```
//!
//! Dispatch is a direct synchronous call-through on the thread the
//! middleware calls from. There is no queue: a slow handler delays every
//! later delivery on that thread.
//!
//! ## Default handler
//!
//! A member registered without a handler, or an unknown member, goes to
//! [`HandlerSlot::Default`]. It logs the message and echoes the payload back
//! for REQUEST messages, so a service with no handlers still answers
//! requests.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

/// SOME/IP message type codes seen by handlers.
///
/// The codes match the protocol header encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    Notification = 0x02,
    Response = 0x80,
    Unknown = 0xFF,
}

impl MessageType {
    /// Classify a raw header value. Anything unrecognised is `Unknown`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Request,
            0x02 => Self::Notification,
            0x80 => Self::Response,
            _ => Self::Unknown,
        }
    }

    pub fn value(self) -> u8 {
        self as u8
    }

    /// Only requests have a response path.
    pub fn expects_response(self) -> bool {
        self == Self::Request
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "REQUEST"),
            Self::Notification => write!(f, "NOTIFICATION"),
            Self::Response => write!(f, "RESPONSE"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Correlates a request with its response: requesting client id plus
/// session counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RequestId {
    pub client: u16,
    pub session: u16,
}

impl RequestId {
    pub const fn new(client: u16, session: u16) -> Self {
        Self { client, session }
    }

    /// Packed form, client in the high half.
    pub const fn value(self) -> u32 {
        ((self.client as u32) << 16) | self.session as u32
    }

    pub const fn from_value(value: u32) -> Self {
        Self {
            client: (value >> 16) as u16,
            session: value as u16,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}/{:04x}", self.client, self.session)
    }
}

/// An inbound message as handed to a [`Handler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub service: u16,
    /// Method or event id
    pub member: u16,
    pub payload: Bytes,
    pub request_id: RequestId,
}

/// Handles inbound messages for one member id.
///
/// The returned payload is sent back as the response when the message is a
/// REQUEST. It is ignored for every other message type.
pub trait Handler: Send + Sync {
    fn handle(&self, message: &Message) -> Option<Bytes>;
}

impl<F> Handler for F
where
    F: Fn(&Message) -> Option<Bytes> + Send + Sync,
{
    fn handle(&self, message: &Message) -> Option<Bytes> {
        self(message)
    }
}

/// Handler registered for a member id.
#[derive(Clone)]
pub enum HandlerSlot {
    /// Log, and echo REQUEST payloads back.
    Default,
    Custom(Arc<dyn Handler>),
}

impl HandlerSlot {
    pub fn custom(handler: impl Handler + 'static) -> Self {
        Self::Custom(Arc::new(handler))
    }

    fn invoke(&self, owner: &str, message: &Message) -> Option<Bytes> {
        match self {
            Self::Default => default_handler(owner, message),
            Self::Custom(handler) => handler.handle(message),
        }
    }
}

impl fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "Default"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

fn default_handler(owner: &str, message: &Message) -> Option<Bytes> {
    tracing::info!(
        "[{}] {} -> service/id: {:#06x}/{:#06x} ({}), data: {:02x?}",
        owner,
        message.message_type,
        message.service,
        message.member,
        message.request_id,
        message.payload.as_ref()
    );
    message
        .message_type
        .expects_response()
        .then(|| message.payload.clone())
}

/// Per-session handler table.
///
/// Shared between the session (registration) and the middleware delivery
/// thread (dispatch), hence the lock. Handlers are cloned out of the table
/// before they run so a handler may register or remove handlers itself.
pub struct Dispatcher {
    owner: String,
    handlers: RwLock<HashMap<u16, HandlerSlot>>,
}

impl Dispatcher {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `slot` for `member`, replacing any earlier registration.
    pub fn register(&self, member: u16, slot: HandlerSlot) {
        if self.handlers.write().insert(member, slot).is_some() {
            tracing::debug!("[{}] replaced handler for {:#06x}", self.owner, member);
        }
    }

    /// Drop the handler for `member`. Returns whether one was registered.
    pub fn unregister(&self, member: u16) -> bool {
        self.handlers.write().remove(&member).is_some()
    }

    pub fn is_registered(&self, member: u16) -> bool {
        self.handlers.read().contains_key(&member)
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    /// Route `message` to its handler and return the response payload, if
    /// the message type has a response path and the handler produced one.
    pub fn dispatch(&self, message: &Message) -> Option<Bytes> {
        let slot = self
            .handlers
            .read()
            .get(&message.member)
            .cloned()
            .unwrap_or(HandlerSlot::Default);

        let response = slot.invoke(&self.owner, message);
        match (message.message_type.expects_response(), response) {
            (true, response) => response,
            (false, Some(_)) => {
                tracing::trace!(
                    "[{}] ignoring reply to {} {:#06x}",
                    self.owner,
                    message.message_type,
                    message.member
                );
                None
            }
            (false, None) => None,
        }
    }
}

impl Handler for Dispatcher {
    fn handle(&self, message: &Message) -> Option<Bytes> {
        self.dispatch(message)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut members: Vec<u16> = self.handlers.read().keys().copied().collect();
        members.sort_unstable();
        f.debug_struct("Dispatcher")
            .field("owner", &self.owner)
            .field("members", &members)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(message_type: MessageType, member: u16, payload: &'static [u8]) -> Message {
        Message {
            message_type,
            service: 0x1234,
            member,
            payload: Bytes::from_static(payload),
            request_id: RequestId::default(),
        }
    }

    #[test]
    fn message_type_codes() {
        assert_eq!(MessageType::Request.value(), 0x00);
        assert_eq!(MessageType::Notification.value(), 0x02);
        assert_eq!(MessageType::Response.value(), 0x80);
        assert_eq!(MessageType::Unknown.value(), 0xFF);

        assert_eq!(MessageType::from_u8(0x80), MessageType::Response);
        assert_eq!(MessageType::from_u8(0x01), MessageType::Unknown);
        assert_eq!(MessageType::from_u8(0x81), MessageType::Unknown);
    }

    #[test]
    fn request_id_packs_client_high() {
        let id = RequestId::new(0x1111, 0x0002);
        assert_eq!(id.value(), 0x1111_0002);
        assert_eq!(RequestId::from_value(0x1111_0002), id);
        assert_eq!(id.to_string(), "1111/0002");
    }

    #[test]
    fn default_handler_echoes_requests_only() {
        let dispatcher = Dispatcher::new("test");

        let request = message(MessageType::Request, 0x9002, b"\x01\x02\x03");
        assert_eq!(dispatcher.dispatch(&request), Some(request.payload.clone()));

        for message_type in [
            MessageType::Response,
            MessageType::Notification,
            MessageType::Unknown,
        ] {
            assert_eq!(dispatcher.dispatch(&message(message_type, 0x9002, b"x")), None);
        }
    }

    #[test]
    fn custom_handler_reply_dropped_for_notifications() {
        let dispatcher = Dispatcher::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dispatcher.register(
            0x8001,
            HandlerSlot::custom(move |_: &Message| {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(Bytes::from_static(b"reply"))
            }),
        );

        assert_eq!(
            dispatcher.dispatch(&message(MessageType::Notification, 0x8001, b"evt")),
            None
        );
        assert_eq!(
            dispatcher.dispatch(&message(MessageType::Request, 0x8001, b"req")),
            Some(Bytes::from_static(b"reply"))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handler_returning_none_sends_nothing() {
        let dispatcher = Dispatcher::new("test");
        dispatcher.register(0x0001, HandlerSlot::custom(|_: &Message| None::<Bytes>));
        assert_eq!(dispatcher.dispatch(&message(MessageType::Request, 0x0001, b"q")), None);
    }

    #[test]
    fn unregister_falls_back_to_default() {
        let dispatcher = Dispatcher::new("test");
        dispatcher.register(0x0001, HandlerSlot::custom(|_: &Message| None::<Bytes>));
        assert!(dispatcher.is_registered(0x0001));
        assert!(dispatcher.unregister(0x0001));
        assert!(!dispatcher.unregister(0x0001));

        let request = message(MessageType::Request, 0x0001, b"q");
        assert_eq!(dispatcher.dispatch(&request), Some(request.payload.clone()));
    }

    #[test]
    fn handler_may_register_during_dispatch() {
        let dispatcher = Arc::new(Dispatcher::new("test"));
        let inner = dispatcher.clone();
        dispatcher.register(
            0x0001,
            HandlerSlot::custom(move |_: &Message| -> Option<Bytes> {
                inner.register(0x0002, HandlerSlot::Default);
                None
            }),
        );

        dispatcher.dispatch(&message(MessageType::Request, 0x0001, b""));
        assert!(dispatcher.is_registered(0x0002));
        dispatcher.clear();
    }
}
