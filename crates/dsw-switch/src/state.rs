//! Tenant switch state tracking

use std::collections::BTreeSet;
use std::fmt;

use dsw_modem::{DataClass, RadioState, TenantId};
use serde::{Deserialize, Serialize};

use crate::error::FailReason;

/// Phase of one tenant's view of the shared data path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SwitchState {
    /// Holds nothing
    #[default]
    Idle,
    /// At least one enable in flight, nothing connected yet
    Acquiring,
    /// Carrying at least one class
    Active,
    /// Force-idle in flight
    Releasing,
}

impl SwitchState {
    /// Whether the tenant occupies the data path in any way
    pub fn is_occupying(&self) -> bool {
        !matches!(self, SwitchState::Idle)
    }

    /// Short lowercase name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SwitchState::Idle => "idle",
            SwitchState::Acquiring => "acquiring",
            SwitchState::Active => "active",
            SwitchState::Releasing => "releasing",
        }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of a tenant switch for observers
///
/// This is a plain copy that can be sent across channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSnapshot {
    /// Tenant the snapshot describes
    pub tenant: TenantId,
    /// Current phase
    pub state: SwitchState,
    /// Classes the tenant has requested
    pub classes: BTreeSet<DataClass>,
    /// Requested classes the modem reports connected
    pub connected: BTreeSet<DataClass>,
    /// Connect requests parked until idle is confirmed
    pub deferred: usize,
    /// Last radio state reported by the modem
    pub radio: RadioState,
}

impl TenantSnapshot {
    /// Snapshot of a freshly started, idle tenant
    pub fn idle(tenant: TenantId) -> Self {
        Self {
            tenant,
            state: SwitchState::Idle,
            classes: BTreeSet::new(),
            connected: BTreeSet::new(),
            deferred: 0,
            radio: RadioState::default(),
        }
    }

    /// Whether a non-default class is connected
    pub fn holds_non_default(&self) -> bool {
        self.connected.iter().any(|c| !c.is_default())
    }
}

/// Answer to a connect/disconnect style request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Accepted; completion is reported later through events
    Started,
    /// Class already connected
    AlreadyActive,
    /// Nothing to tear down
    AlreadyInactive,
    /// Rejected
    Failed(FailReason),
}

impl RequestOutcome {
    /// Whether the request was rejected
    pub fn is_failed(&self) -> bool {
        matches!(self, RequestOutcome::Failed(_))
    }
}
