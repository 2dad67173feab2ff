//! Error types for the virtual modem

use thiserror::Error;

/// Errors in virtual modem configuration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SimError {
    /// No slots configured
    #[error("virtual modem needs at least one slot")]
    NoSlots,

    /// More slots than tenant ids can address
    #[error("{0} slots configured, at most 255 are addressable")]
    TooManySlots(usize),
}
