//! Presence coordination
//!
//! [`PresenceState`] is the lifecycle of one attachment. [`SinkSlot`] holds
//! the input sink that completions publish to: readers take a shared guard,
//! and retraction takes the exclusive guard, so once [`SinkSlot::retract`]
//! returns no completion is still inside the sink.

use crate::usb::error::DriverError;
use common::InputSink;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};

/// Lifecycle of a device attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    /// Nothing bound yet
    Detached,
    /// Endpoints found and buffers allocated, not yet polling
    Attaching,
    /// Registered with the sink and polling
    Active,
    /// Removal in progress, waiting for transfers and references
    Detaching,
    /// Resources released
    Reclaimed,
}

impl PresenceState {
    /// Whether `self -> to` is a legal edge
    pub fn can_transition(self, to: PresenceState) -> bool {
        use PresenceState::*;

        matches!(
            (self, to),
            (Detached, Attaching)
                | (Attaching, Active)
                | (Active, Detaching)
                | (Detaching, Reclaimed)
                // attach failures
                | (Detached, Reclaimed)
                | (Attaching, Reclaimed)
        )
    }

    /// Apply a transition, leaving `self` untouched if it is illegal
    pub fn transition(&mut self, to: PresenceState) -> Result<(), DriverError> {
        if !self.can_transition(to) {
            return Err(DriverError::InvalidTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }

    pub fn is_reclaimed(self) -> bool {
        self == PresenceState::Reclaimed
    }
}

/// Read-mostly holder for the input sink
pub struct SinkSlot {
    slot: RwLock<Option<Arc<dyn InputSink>>>,
}

impl SinkSlot {
    pub fn new(sink: Arc<dyn InputSink>) -> Self {
        Self {
            slot: RwLock::new(Some(sink)),
        }
    }

    /// Run `f` against the sink if it is still installed
    pub fn with<R>(&self, f: impl FnOnce(&dyn InputSink) -> R) -> Option<R> {
        let guard = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_deref().map(f)
    }

    /// Take the sink out, waiting for every reader in flight
    pub fn retract(&self) -> Option<Arc<dyn InputSink>> {
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_installed(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
