//! Modem commands and events

use std::fmt;

use tokio::sync::{mpsc, oneshot};

use crate::class::DataClass;
use crate::error::ModemError;
use crate::tenant::{RadioState, TenantId};

/// Correlates a modem command with its eventual completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(pub u64);

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Commands accepted by the modem actor
#[derive(Debug)]
pub enum ModemCommand {
    /// Register the event sink for a tenant
    ///
    /// The modem replies on the sink with the tenant's current radio state.
    Attach {
        /// Tenant being attached
        tenant: TenantId,
        /// Where completions and unsolicited events for this tenant go
        events: mpsc::UnboundedSender<ModemEvent>,
    },

    /// Bring up a data class for a tenant
    EnableClass {
        tenant: TenantId,
        class: DataClass,
        token: RequestToken,
    },

    /// Tear down a data class for a tenant
    DisableClass {
        tenant: TenantId,
        class: DataClass,
        token: RequestToken,
    },

    /// Unconditionally detach everything the tenant holds
    ForceIdle { tenant: TenantId, token: RequestToken },

    /// Ask whether the tenant's radio can carry a class at all
    QuerySupport {
        tenant: TenantId,
        class: DataClass,
        response: oneshot::Sender<bool>,
    },
}

impl ModemCommand {
    /// Tenant the command is addressed to
    pub fn tenant(&self) -> TenantId {
        match self {
            ModemCommand::Attach { tenant, .. }
            | ModemCommand::EnableClass { tenant, .. }
            | ModemCommand::DisableClass { tenant, .. }
            | ModemCommand::ForceIdle { tenant, .. }
            | ModemCommand::QuerySupport { tenant, .. } => *tenant,
        }
    }

    /// Correlation token, for commands that complete asynchronously
    pub fn token(&self) -> Option<RequestToken> {
        match self {
            ModemCommand::EnableClass { token, .. }
            | ModemCommand::DisableClass { token, .. }
            | ModemCommand::ForceIdle { token, .. } => Some(*token),
            ModemCommand::Attach { .. } | ModemCommand::QuerySupport { .. } => None,
        }
    }
}

/// Events delivered to a tenant's sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemEvent {
    /// A previously submitted command finished
    Completed {
        tenant: TenantId,
        token: RequestToken,
        result: Result<(), ModemError>,
    },

    /// A requested class is now physically carrying data
    ClassConnected { tenant: TenantId, class: DataClass },

    /// The slot's radio changed power/service state
    RadioStateChanged { tenant: TenantId, state: RadioState },
}

impl ModemEvent {
    /// Tenant the event concerns
    pub fn tenant(&self) -> TenantId {
        match self {
            ModemEvent::Completed { tenant, .. }
            | ModemEvent::ClassConnected { tenant, .. }
            | ModemEvent::RadioStateChanged { tenant, .. } => *tenant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_accessors() {
        let cmd = ModemCommand::ForceIdle {
            tenant: TenantId(1),
            token: RequestToken(7),
        };
        assert_eq!(cmd.tenant(), TenantId(1));
        assert_eq!(cmd.token(), Some(RequestToken(7)));

        let (tx, _rx) = oneshot::channel();
        let query = ModemCommand::QuerySupport {
            tenant: TenantId(0),
            class: DataClass::default_class(),
            response: tx,
        };
        assert_eq!(query.token(), None);
    }

    #[test]
    fn test_event_tenant() {
        let event = ModemEvent::RadioStateChanged {
            tenant: TenantId(3),
            state: RadioState::Off,
        };
        assert_eq!(event.tenant(), TenantId(3));
        assert_eq!(RequestToken(4).to_string(), "#4");
    }
}
