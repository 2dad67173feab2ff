//! Tenant identity and radio state

use std::fmt;

/// Identifier for one SIM slot sharing the modem
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct TenantId(pub u8);

impl TenantId {
    /// Slot index, usable for indexing per-tenant tables
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

/// Power/service state of one slot's radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RadioState {
    /// Radio powered off
    Off,
    /// Registered and in service
    #[default]
    On,
    /// Powered but not registered
    OutOfService,
    /// Only emergency calls possible
    EmergencyOnly,
}

impl RadioState {
    /// Whether the radio is confirmed powered off
    pub fn is_off(&self) -> bool {
        matches!(self, RadioState::Off)
    }

    /// Whether the radio can carry data
    pub fn is_in_service(&self) -> bool {
        matches!(self, RadioState::On)
    }

    /// Short lowercase name for logs
    pub fn name(&self) -> &'static str {
        match self {
            RadioState::Off => "off",
            RadioState::On => "on",
            RadioState::OutOfService => "out-of-service",
            RadioState::EmergencyOnly => "emergency-only",
        }
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_display() {
        assert_eq!(TenantId(0).to_string(), "slot0");
        assert_eq!(TenantId(2).index(), 2);
    }

    #[test]
    fn test_radio_state_predicates() {
        assert!(RadioState::Off.is_off());
        assert!(!RadioState::Off.is_in_service());
        assert!(RadioState::On.is_in_service());
        assert!(!RadioState::OutOfService.is_in_service());
        assert!(!RadioState::EmergencyOnly.is_off());
    }
}
