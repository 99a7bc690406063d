pub(crate) mod gap;
pub(crate) mod mesh;

pub use self::gap::{
    AD_PAYLOAD_BUDGET, AdStore, AdType, Connection, ControllerIdentity, DiscoveryLog, FoundDevice,
    GapState, PairingState,
};
pub use self::mesh::MeshState;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// State-model invariant violations. Surfaced to handlers as failures,
/// never as panics.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    /// The element would push the encoded advertising payload past the cap.
    #[error("advertising element `{ad_type}` needs {needed} bytes but only {budget} fit")]
    AdBudgetExceeded {
        ad_type: AdType,
        needed: usize,
        budget: usize,
    },
    /// Own identity was read before the controller-info bootstrap ran.
    #[error("controller identity has not been read yet")]
    IdentityUnknown,
    /// A peer-directed operation ran before setup primed the peer address.
    #[error("no peer address has been primed for this case")]
    PeerUnknown,
    /// A connection-scoped operation ran while disconnected.
    #[error("no active connection")]
    NoConnection,
}

/// Mutable mirror of one IUT instance, reset between test cases.
#[derive(Debug, Clone, Default)]
pub struct DeviceStack {
    pub gap: GapState,
    pub mesh: MeshState,
}

impl DeviceStack {
    /// Restores every substate to its power-on default. Called at the start
    /// of each test case so nothing leaks across cases.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Shared handle to one role's [`DeviceStack`].
///
/// Handlers and the event pump mutate the stack through `with`, which
/// scopes the lock to the closure so it can never be held across an await.
#[derive(Debug, Clone, Default)]
pub struct SharedStack {
    inner: Arc<Mutex<DeviceStack>>,
}

impl SharedStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `operation` with exclusive access to the stack.
    pub fn with<T>(&self, operation: impl FnOnce(&mut DeviceStack) -> T) -> T {
        let mut guard = lock(&self.inner);
        operation(&mut guard)
    }

    /// Resets the underlying stack to power-on defaults.
    pub fn reset(&self) {
        self.with(DeviceStack::reset);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
