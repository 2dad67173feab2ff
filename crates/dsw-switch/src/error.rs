//! Error types for the data-connection switch

use dsw_modem::{DataClass, ModemError, TenantId};
use thiserror::Error;

/// Why a single request did not succeed
///
/// Carried inside [`RequestOutcome::Failed`](crate::state::RequestOutcome::Failed);
/// none of these are fatal to the switch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// Tenant id outside the configured slot range
    #[error("unknown tenant {0}")]
    UnknownTenant(TenantId),

    /// The tenant's radio is powered off
    #[error("radio off on {0}")]
    RadioOff(TenantId),

    /// Another tenant holds a non-default class
    #[error("{class} rejected: {holder} holds a non-default class")]
    Conflict { class: DataClass, holder: TenantId },

    /// The modem reported a failure
    #[error("modem: {0}")]
    Transport(#[from] ModemError),

    /// The reply channel was dropped before an answer arrived
    #[error("no reply")]
    NoReply,

    /// A reply arrived that does not belong to the request
    #[error("mismatched reply")]
    MismatchedReply,
}

/// Errors raised by the switch plumbing itself
#[derive(Debug, Error)]
pub enum SwitchError {
    /// A tenant mailbox is full (fire-and-forget sends only)
    #[error("mailbox full for {0}")]
    MailboxFull(TenantId),

    /// The actor behind a channel has stopped
    #[error("switch actor for {0} has stopped")]
    Closed(TenantId),

    /// The arbitrator actor has stopped
    #[error("arbitrator has stopped")]
    ArbitratorClosed,

    /// Startup configuration is unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Modem error during startup
    #[error("modem error: {0}")]
    Modem(#[from] ModemError),
}
