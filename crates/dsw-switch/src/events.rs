//! Event stream and subscriber notices
//!
//! Two kinds of output leave the switch:
//!
//! - [`SwitchEvent`]: a broadcast stream for observers (logging, UI, tests).
//!   Lossy under lag, never used for control decisions.
//! - [`SwitchNotice`]: delivered to explicit subscribers of one tenant switch
//!   over unbounded channels. The arbitrator relies on these.

use dsw_modem::{DataClass, RadioState, TenantId};

use crate::error::FailReason;
use crate::state::{SwitchState, TenantSnapshot};

/// Observable switch activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchEvent {
    // -------------------------------------------------------------------------
    // Tenant events
    // -------------------------------------------------------------------------
    /// A tenant switch changed phase
    TenantStateChanged {
        tenant: TenantId,
        from: SwitchState,
        to: SwitchState,
    },

    /// The modem reports a class carrying data
    ClassConnected { tenant: TenantId, class: DataClass },

    /// A modem command for a previously started request failed
    RequestFailed {
        tenant: TenantId,
        class: Option<DataClass>,
        reason: FailReason,
    },

    /// A connect parked during release was replayed
    DeferredReplayed { tenant: TenantId, class: DataClass },

    /// The modem reported a radio state change
    RadioStateChanged {
        tenant: TenantId,
        from: RadioState,
        to: RadioState,
    },

    // -------------------------------------------------------------------------
    // Arbitration events
    // -------------------------------------------------------------------------
    /// Resource ownership moved
    OwnerChanged {
        from: Option<TenantId>,
        to: Option<TenantId>,
    },

    /// A parked activation was superseded by a newer one
    PendingReplaced {
        previous: TenantId,
        tenant: TenantId,
    },

    /// The arbitrator refused an activation
    ActivationRejected {
        tenant: TenantId,
        class: DataClass,
        reason: FailReason,
    },

    /// The arbitrator activated the default tenant after radio recovery
    AutoActivation { tenant: TenantId, class: DataClass },
}

impl SwitchEvent {
    /// Check if this event concerns resource ownership
    pub fn is_ownership(&self) -> bool {
        matches!(
            self,
            SwitchEvent::OwnerChanged { .. }
                | SwitchEvent::PendingReplaced { .. }
                | SwitchEvent::AutoActivation { .. }
        )
    }

    /// Check if this event reports a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SwitchEvent::RequestFailed { .. } | SwitchEvent::ActivationRejected { .. }
        )
    }

    /// Get the tenant this event is associated with, if any
    pub fn tenant(&self) -> Option<TenantId> {
        match self {
            SwitchEvent::TenantStateChanged { tenant, .. }
            | SwitchEvent::ClassConnected { tenant, .. }
            | SwitchEvent::RequestFailed { tenant, .. }
            | SwitchEvent::DeferredReplayed { tenant, .. }
            | SwitchEvent::RadioStateChanged { tenant, .. }
            | SwitchEvent::PendingReplaced { tenant, .. }
            | SwitchEvent::ActivationRejected { tenant, .. }
            | SwitchEvent::AutoActivation { tenant, .. } => Some(*tenant),
            SwitchEvent::OwnerChanged { to, .. } => *to,
        }
    }
}

/// Which notices a subscriber wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeFilter {
    /// Only [`SwitchNotice::EnteredIdle`]
    IdleOnly,
    /// Every notice
    All,
}

/// Notice delivered to subscribers of a tenant switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchNotice {
    /// The switch entered Idle
    ///
    /// Sent exactly once per entry. `replaying` lists connects parked during
    /// release that the switch is about to replay.
    EnteredIdle {
        tenant: TenantId,
        replaying: Vec<DataClass>,
    },

    /// Phase, classes or connectivity changed
    Updated { snapshot: TenantSnapshot },

    /// The modem reported a radio state change
    RadioChanged {
        tenant: TenantId,
        from: RadioState,
        to: RadioState,
    },
}

impl SwitchNotice {
    /// Whether a subscriber with `filter` receives this notice
    pub fn passes(&self, filter: NoticeFilter) -> bool {
        match filter {
            NoticeFilter::All => true,
            NoticeFilter::IdleOnly => matches!(self, SwitchNotice::EnteredIdle { .. }),
        }
    }
}
