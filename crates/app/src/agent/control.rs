use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Deserialize;

/// Remote `camera-control` actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Stop,
}

impl ControlAction {
    pub fn enables(self) -> bool {
        matches!(self, ControlAction::Start)
    }
}

/// The "capture enabled" flag.
///
/// This is the only cross-thread mutable state in the agent. Readers take a
/// [`snapshot`](Self::snapshot) so the lock is never held across camera I/O.
#[derive(Debug, Default)]
pub struct ControlState {
    enabled: Mutex<bool>,
}

impl ControlState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Mutex::new(enabled),
        }
    }

    pub fn snapshot(&self) -> bool {
        *self.lock()
    }

    /// Apply a remote action and return the new value.
    pub fn apply(&self, action: ControlAction) -> bool {
        let mut guard = self.lock();
        *guard = action.enables();
        *guard
    }

    /// Internal transition used on shutdown.
    pub(crate) fn disable(&self) {
        *self.lock() = false;
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // A bool cannot be left half-written, so a poisoned lock is still usable.
        self.enabled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
