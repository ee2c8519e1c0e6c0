//! # someip-adapter
//!
//! A **session, routing and dispatch layer** over a SOME/IP middleware
//! engine.
//!
//! SOME/IP (Scalable service-Oriented `MiddlewarE` over IP) is the
//! service-oriented middleware protocol of automotive Ethernet. Engines such
//! as vsomeip implement the wire protocol and service discovery, but expect
//! applications to agree on a shared configuration file and on one routing
//! manager per host. This crate handles that coordination and gives each
//! application a small, role-checked API.
//!
//! ## Features
//!
//! - **Role enforcement**: a session is a client or a service, never both
//! - **Router election**: first service application on the host routes
//! - **Configuration document**: typed, persisted with sorted keys
//! - **Dispatch**: per-member handlers with a logging/echo default
//! - **Cleanup**: stale lock removal and middleware reset
//!
//! ## Quick Start
//!
//! ### Minimal Service
//!
//! ```no_run
//! use someip_adapter::prelude::*;
//!
//! const SERVICE_ID: u16 = 0x1234;
//! const INSTANCE_ID: u16 = 0x5678;
//!
//! fn main() -> Result<()> {
//!     let adapter = someip_adapter::configure().build()?;
//!
//!     let configuration = adapter
//!         .configuration()
//!         .with_application("service_example", 0x1111)
//!         .with_service(SERVICE_ID, INSTANCE_ID, 30509);
//!
//!     let service = adapter
//!         .application("service_example", SERVICE_ID, INSTANCE_ID)
//!         .configuration(configuration)
//!         .build()?;
//!
//!     service.create()?;
//!     service.offer_events(&[0x8001], 0x0001)?;
//!     service.offer()?;
//!     service.on_message(0x0421, |request| Some(request.payload.clone()))?;
//!     service.start()?;
//!
//!     service.notify(0x8001, b"ready")?;
//!     Ok(())
//! }
//! ```
//!
//! ### Minimal Client
//!
//! ```no_run
//! use someip_adapter::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let adapter = someip_adapter::configure().build()?;
//!     let client = adapter.application("client_example", 0x1234, 0x5678).build()?;
//!
//!     client.create()?;
//!     client.register()?;
//!     client.on_message(0x0421, |response| {
//!         println!("{} {:02x?}", response.message_type, response.payload.as_ref());
//!         None
//!     })?;
//!     client.on_event(0x8001, |event| {
//!         println!("event {:02x?}", event.payload.as_ref());
//!         None
//!     }, 0x0001)?;
//!     client.start()?;
//!
//!     client.request(0x0421, b"hello")?;
//!     Ok(())
//! }
//! ```
//!
//! ---
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          User Application                            │
//! │     ┌───────────────┐                        ┌───────────────┐       │
//! │     │ Session       │ ...                    │ Session       │       │
//! │     │ (service)     │                        │ (client)      │       │
//! │     └──┬─────────┬──┘                        └──┬─────────┬──┘       │
//! └────────┼─────────┼──────────────────────────────┼─────────┼──────────┘
//!          │ install │ calls                        │         │
//!          ▼         │                              ▼         │
//! ┌────────────────────────────┐                              │
//! │ Adapter                    │                              │
//! │  RoutingCoordinator        │── persist ──▶ vsomeip.json   │
//! │   • active document        │                  │           │
//! │   • routing slot           │                  │ read at   │
//! │  ModuleSlot ───────────────┼──────────┐       │ create    │
//! │  LockSweeper               │          ▼       ▼           ▼
//! └────────────────────────────┘   ┌───────────────────────────────┐
//!                                  │ Middleware (LocalMiddleware)  │
//!                                  │   delivery thread ──▶ Dispatcher
//!                                  └───────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`config`] | [`ConfigurationDocument`], [`Template`](config::Template), persistence |
//! | [`builder`] | [`AdapterBuilder`] |
//! | [`routing`] | Active document and router election |
//! | [`session`] | [`Session`] lifecycle and role enforcement |
//! | [`dispatch`] | [`Dispatcher`](dispatch::Dispatcher), [`Handler`], message types |
//! | [`middleware`] | [`Middleware`](middleware::Middleware) trait and [`LocalMiddleware`](middleware::LocalMiddleware) |
//! | [`supervisor`] | Middleware reset and stale lock removal |
//! | [`error`] | [`Error`], [`Result`] |
//!
//! ## Threading
//!
//! Every session operation is synchronous and takes `&self`. Handlers run on
//! the middleware's delivery thread, one at a time, and may call back into
//! any session.
//!
//! ## Logging
//!
//! The crate logs through [`tracing`]. Install any subscriber to see it:
//! `debug` covers lifecycle and routing decisions, `trace` covers message
//! traffic, and `warn` reports absorbed teardown failures.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod adapter;
pub mod builder;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod middleware;
pub mod routing;
pub mod session;
pub mod supervisor;

pub use adapter::Adapter;
pub use builder::AdapterBuilder;
pub use config::ConfigurationDocument;
pub use dispatch::{Handler, HandlerSlot, Message, MessageType, RequestId};
pub use error::*;
pub use middleware::{Transport, ANY};
pub use routing::RouterDecision;
pub use session::{Identity, Role, Session, SessionBuilder, Stage, Version};

/// Start configuring an [`Adapter`].
///
/// ```no_run
/// # fn example() -> someip_adapter::Result<()> {
/// let adapter = someip_adapter::configure()
///     .configuration_path("vsomeip.json")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub fn configure() -> AdapterBuilder {
    AdapterBuilder::new()
}

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub mod prelude {
    pub use crate::{
        Adapter, ConfigurationDocument, Error, Handler, Message, MessageType, RequestId, Result,
        Role, Session, Stage, Transport, ANY,
    };
}
