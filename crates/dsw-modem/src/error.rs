//! Error types for the modem boundary

use thiserror::Error;

use crate::class::DataClass;
use crate::tenant::TenantId;

/// Errors reported by, or while talking to, the modem
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModemError {
    /// Label is not a known data class
    #[error("invalid data class: {0:?}")]
    InvalidClass(String),

    /// The slot's radio cannot carry this class at all
    #[error("{class} not supported on {tenant}")]
    Unsupported { tenant: TenantId, class: DataClass },

    /// The slot's radio is powered off
    #[error("radio off on {0}")]
    RadioOff(TenantId),

    /// Another slot currently holds the data path
    #[error("data path busy (held by {holder})")]
    Busy { holder: TenantId },

    /// The modem rejected or failed the command
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// The modem actor has gone away
    #[error("modem channel closed")]
    Closed,
}
