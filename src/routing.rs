//! # Routing Coordinator
//!
//! Process-wide state shared by every session of one [`Adapter`]:
//! the active configuration document and the routing slot.
//!
//! ## Router Election
//!
//! Exactly one application per host acts as routing manager, and only when
//! the active document configures at least one service. The first session
//! built (or created) while the slot is empty takes it. Later sessions get
//! the existing router written into their document.
//!
//! | Slot | Document has services | Outcome |
//! |------|----------------------|---------|
//! | empty | yes | caller becomes router |
//! | held by caller | yes | caller stays router |
//! | held by other | yes | `routing` set to holder |
//! | any | no | nothing changes |
//!
//! When the router stops, the slot is cleared and the active document is
//! reset to a fresh template copy. Other sessions already created keep
//! running against the document they were created with.
//!
//! All updates happen under one lock, and the document is persisted before
//! the lock is released, so the file on disk always matches the slot.
//!
//! [`Adapter`]: crate::Adapter

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::config::{build_configuration, ConfigurationDocument, Template};
use crate::error::Result;

/// Result of a router election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterDecision {
    /// The caller holds the routing slot.
    Router,
    /// Another application holds it.
    Follower(String),
    /// No service configured, no router needed.
    NotRequired,
}

#[derive(Debug)]
struct SharedState {
    active: ConfigurationDocument,
    router: Option<String>,
}

impl SharedState {
    fn elect(&mut self, name: &str) -> RouterDecision {
        if !self.active.has_services() {
            return RouterDecision::NotRequired;
        }
        let router = self.router.get_or_insert_with(|| name.to_string()).clone();
        self.active.routing = Some(router.clone());
        if router == name {
            RouterDecision::Router
        } else {
            RouterDecision::Follower(router)
        }
    }
}

/// Guards the active configuration document and the routing slot.
#[derive(Debug)]
pub struct RoutingCoordinator {
    state: Mutex<SharedState>,
    template: Template,
    path: PathBuf,
}

impl RoutingCoordinator {
    /// Start with a fresh template copy and an empty slot. Nothing is
    /// written until the first session is built.
    pub fn new(template: Template, path: impl Into<PathBuf>) -> Self {
        Self {
            state: Mutex::new(SharedState {
                active: template.instantiate(),
                router: None,
            }),
            template,
            path: path.into(),
        }
    }

    /// Where the document is persisted.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Snapshot of the active document.
    pub fn configuration(&self) -> ConfigurationDocument {
        self.state.lock().active.clone()
    }

    /// Name of the application holding the routing slot.
    pub fn router(&self) -> Option<String> {
        self.state.lock().router.clone()
    }

    /// Replace the active document, elect and persist, all under the lock.
    ///
    /// `before` runs first while the lock is held.
    pub fn install(
        &self,
        name: &str,
        overrides: Option<ConfigurationDocument>,
        before: impl FnOnce(),
    ) -> Result<RouterDecision> {
        let mut state = self.state.lock();
        before();
        state.active = build_configuration(overrides, &self.template);
        let decision = state.elect(name);
        state.active.persist(&self.path)?;
        Ok(decision)
    }

    /// Re-run the election for `name` and persist the document.
    pub fn prepare(&self, name: &str) -> Result<RouterDecision> {
        let mut state = self.state.lock();
        let decision = state.elect(name);
        state.active.persist(&self.path)?;
        Ok(decision)
    }

    /// Elect without persisting.
    pub fn elect_router(&self, name: &str) -> RouterDecision {
        self.state.lock().elect(name)
    }

    /// Give up the slot if `name` holds it, resetting the active document.
    /// Returns whether anything changed.
    pub fn release_router(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        if state.router.as_deref() != Some(name) {
            return false;
        }
        state.router = None;
        state.active = self.template.instantiate();
        true
    }

    /// Clear the slot and reset the document regardless of holder.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if let Some(router) = state.router.take() {
            tracing::debug!("Dropping routing slot held by {}", router);
        }
        state.active = self.template.instantiate();
    }
}
