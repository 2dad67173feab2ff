//! Virtual modem model
//!
//! Tracks per-slot radio state and connected data classes. The model also
//! acts as an oracle for the single-data-path rule: enabling a class while a
//! different slot still holds one is refused with [`ModemError::Busy`] and
//! counted as a violation.

use std::collections::BTreeSet;

use dsw_modem::{DataClass, ModemError, RadioState, TenantId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SimError;

/// Configuration for one virtual slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualSlotConfig {
    /// Radio state at startup
    pub radio: RadioState,
    /// Classes the slot can carry; empty means every known class
    pub supported: Vec<DataClass>,
}

impl Default for VirtualSlotConfig {
    fn default() -> Self {
        Self {
            radio: RadioState::On,
            supported: Vec::new(),
        }
    }
}

/// Configuration for the virtual modem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualModemConfig {
    /// Delay before each command completes
    pub latency_ms: u64,
    /// One entry per SIM slot
    pub slots: Vec<VirtualSlotConfig>,
}

impl Default for VirtualModemConfig {
    fn default() -> Self {
        Self {
            latency_ms: 20,
            slots: vec![VirtualSlotConfig::default(); 2],
        }
    }
}

impl VirtualModemConfig {
    /// Fast modem with `count` default slots
    pub fn with_slots(count: u8) -> Self {
        Self {
            latency_ms: 1,
            slots: vec![VirtualSlotConfig::default(); count as usize],
        }
    }

    /// Check the configuration can be started
    pub fn validate(&self) -> Result<(), SimError> {
        match self.slots.len() {
            0 => Err(SimError::NoSlots),
            n if n > u8::MAX as usize => Err(SimError::TooManySlots(n)),
            _ => Ok(()),
        }
    }
}

/// Counters reported by the virtual modem
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualModemStats {
    /// Slot currently carrying data
    pub holder: Option<TenantId>,
    /// Classes connected on the holder
    pub active_classes: Vec<DataClass>,
    /// Enables refused because another slot held the data path
    pub violations: u64,
    /// Data-path commands executed
    pub commands: u64,
}

#[derive(Debug, Clone)]
struct Slot {
    radio: RadioState,
    supported: BTreeSet<DataClass>,
    connected: BTreeSet<DataClass>,
    fail_enables: u32,
    fail_disables: u32,
}

impl Slot {
    fn from_config(config: &VirtualSlotConfig) -> Self {
        let supported = if config.supported.is_empty() {
            DataClass::known().collect()
        } else {
            config.supported.iter().cloned().collect()
        };
        Self {
            radio: config.radio,
            supported,
            connected: BTreeSet::new(),
            fail_enables: 0,
            fail_disables: 0,
        }
    }
}

/// Simulated modem with one data path shared by all slots
#[derive(Debug, Clone)]
pub struct VirtualModem {
    slots: Vec<Slot>,
    violations: u64,
    commands: u64,
}

impl VirtualModem {
    /// Create a modem from configuration
    pub fn from_config(config: &VirtualModemConfig) -> Self {
        Self {
            slots: config.slots.iter().map(Slot::from_config).collect(),
            violations: 0,
            commands: 0,
        }
    }

    /// Number of slots
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, tenant: TenantId) -> Result<&Slot, ModemError> {
        self.slots
            .get(tenant.index())
            .ok_or_else(|| ModemError::CommandFailed(format!("no such slot {}", tenant)))
    }

    fn slot_mut(&mut self, tenant: TenantId) -> Result<&mut Slot, ModemError> {
        self.slots
            .get_mut(tenant.index())
            .ok_or_else(|| ModemError::CommandFailed(format!("no such slot {}", tenant)))
    }

    /// Radio state of a slot
    pub fn radio(&self, tenant: TenantId) -> Option<RadioState> {
        self.slots.get(tenant.index()).map(|s| s.radio)
    }

    /// Classes connected on a slot
    pub fn connected(&self, tenant: TenantId) -> Option<&BTreeSet<DataClass>> {
        self.slots.get(tenant.index()).map(|s| &s.connected)
    }

    /// Slot currently carrying data
    pub fn holder(&self) -> Option<TenantId> {
        self.slots
            .iter()
            .position(|s| !s.connected.is_empty())
            .map(|i| TenantId(i as u8))
    }

    /// Whether a slot can carry a class at all
    pub fn supports(&self, tenant: TenantId, class: &DataClass) -> bool {
        self.slots
            .get(tenant.index())
            .map(|s| s.supported.contains(class))
            .unwrap_or(false)
    }

    /// Bring up a class
    pub fn enable(&mut self, tenant: TenantId, class: &DataClass) -> Result<(), ModemError> {
        self.commands += 1;
        let slot = self.slot(tenant)?;

        if slot.radio.is_off() {
            return Err(ModemError::RadioOff(tenant));
        }
        if !slot.supported.contains(class) {
            return Err(ModemError::Unsupported {
                tenant,
                class: class.clone(),
            });
        }

        let slot = self.slot_mut(tenant)?;
        if slot.fail_enables > 0 {
            slot.fail_enables -= 1;
            return Err(ModemError::CommandFailed(format!("injected enable failure for {}", class)));
        }

        if let Some(holder) = self.holder().filter(|h| *h != tenant) {
            self.violations += 1;
            warn!(
                "{} enabling {} while {} holds the data path (violation {})",
                tenant, class, holder, self.violations
            );
            return Err(ModemError::Busy { holder });
        }

        debug!("{}: {} up", tenant, class);
        self.slot_mut(tenant)?.connected.insert(class.clone());
        Ok(())
    }

    /// Tear down a class
    pub fn disable(&mut self, tenant: TenantId, class: &DataClass) -> Result<(), ModemError> {
        self.commands += 1;
        let slot = self.slot_mut(tenant)?;
        if slot.fail_disables > 0 {
            slot.fail_disables -= 1;
            return Err(ModemError::CommandFailed(format!("injected disable failure for {}", class)));
        }
        slot.connected.remove(class);
        debug!("{}: {} down", tenant, class);
        Ok(())
    }

    /// Drop everything a slot holds
    pub fn force_idle(&mut self, tenant: TenantId) -> Result<(), ModemError> {
        self.commands += 1;
        let slot = self.slot_mut(tenant)?;
        slot.connected.clear();
        debug!("{}: idle", tenant);
        Ok(())
    }

    /// Change a slot's radio state
    ///
    /// Returns `true` if the state changed. Powering off drops the slot's
    /// classes.
    pub fn set_radio(&mut self, tenant: TenantId, state: RadioState) -> bool {
        let Some(slot) = self.slots.get_mut(tenant.index()) else {
            return false;
        };
        if slot.radio == state {
            return false;
        }
        slot.radio = state;
        if state.is_off() {
            slot.connected.clear();
        }
        true
    }

    /// Make the next `count` enables on a slot fail
    pub fn fail_next_enable(&mut self, tenant: TenantId, count: u32) {
        if let Some(slot) = self.slots.get_mut(tenant.index()) {
            slot.fail_enables += count;
        }
    }

    /// Make the next `count` disables on a slot fail
    pub fn fail_next_disable(&mut self, tenant: TenantId, count: u32) {
        if let Some(slot) = self.slots.get_mut(tenant.index()) {
            slot.fail_disables += count;
        }
    }

    /// Current counters
    pub fn stats(&self) -> VirtualModemStats {
        let holder = self.holder();
        VirtualModemStats {
            holder,
            active_classes: holder
                .and_then(|h| self.connected(h))
                .map(|c| c.iter().cloned().collect())
                .unwrap_or_default(),
            violations: self.violations,
            commands: self.commands,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(label: &str) -> DataClass {
        label.parse().unwrap()
    }

    fn modem(slots: u8) -> VirtualModem {
        VirtualModem::from_config(&VirtualModemConfig::with_slots(slots))
    }

    #[test]
    fn test_enable_and_holder() {
        let mut m = modem(2);
        assert_eq!(m.holder(), None);

        m.enable(TenantId(1), &class("default")).unwrap();

        assert_eq!(m.holder(), Some(TenantId(1)));
        assert_eq!(m.stats().active_classes, vec![class("default")]);
    }

    #[test]
    fn test_second_slot_is_busy() {
        let mut m = modem(2);
        m.enable(TenantId(0), &class("default")).unwrap();

        let err = m.enable(TenantId(1), &class("mms")).unwrap_err();

        assert_eq!(err, ModemError::Busy { holder: TenantId(0) });
        assert_eq!(m.stats().violations, 1);
    }

    #[test]
    fn test_force_idle_frees_path() {
        let mut m = modem(2);
        m.enable(TenantId(0), &class("default")).unwrap();
        m.enable(TenantId(0), &class("supl")).unwrap();

        m.force_idle(TenantId(0)).unwrap();

        assert_eq!(m.holder(), None);
        assert!(m.enable(TenantId(1), &class("default")).is_ok());
        assert_eq!(m.stats().violations, 0);
    }

    #[test]
    fn test_radio_off_refuses_and_drops() {
        let mut m = modem(1);
        m.enable(TenantId(0), &class("default")).unwrap();

        assert!(m.set_radio(TenantId(0), RadioState::Off));
        assert!(!m.set_radio(TenantId(0), RadioState::Off));

        assert_eq!(m.holder(), None);
        assert_eq!(
            m.enable(TenantId(0), &class("default")),
            Err(ModemError::RadioOff(TenantId(0)))
        );
    }

    #[test]
    fn test_unsupported_class() {
        let config = VirtualModemConfig {
            latency_ms: 0,
            slots: vec![VirtualSlotConfig {
                radio: RadioState::On,
                supported: vec![class("default")],
            }],
        };
        let mut m = VirtualModem::from_config(&config);

        assert!(m.supports(TenantId(0), &class("default")));
        assert!(!m.supports(TenantId(0), &class("mms")));
        assert!(!m.supports(TenantId(3), &class("default")));
        assert!(matches!(
            m.enable(TenantId(0), &class("mms")),
            Err(ModemError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_injected_failures() {
        let mut m = modem(1);
        m.fail_next_enable(TenantId(0), 1);
        m.fail_next_disable(TenantId(0), 1);

        assert!(m.enable(TenantId(0), &class("default")).is_err());
        assert!(m.enable(TenantId(0), &class("default")).is_ok());
        assert!(m.disable(TenantId(0), &class("default")).is_err());
        assert!(m.disable(TenantId(0), &class("default")).is_ok());
        assert_eq!(m.stats().commands, 4);
    }

    #[test]
    fn test_config_validation() {
        assert!(VirtualModemConfig::default().validate().is_ok());
        let empty = VirtualModemConfig {
            latency_ms: 0,
            slots: Vec::new(),
        };
        assert_eq!(empty.validate(), Err(SimError::NoSlots));
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{"latency_ms": 5, "slots": [{"radio": "off"}, {"supported": ["default", "mms"]}]}"#;
        let config: VirtualModemConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.slots[0].radio, RadioState::Off);
        assert_eq!(config.slots[1].radio, RadioState::On);
        assert_eq!(config.slots[1].supported.len(), 2);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Enable(u8, usize),
            Disable(u8, usize),
            ForceIdle(u8),
            RadioOff(u8),
            RadioOn(u8),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u8..3, 0usize..4).prop_map(|(t, c)| Op::Enable(t, c)),
                (0u8..3, 0usize..4).prop_map(|(t, c)| Op::Disable(t, c)),
                (0u8..3).prop_map(Op::ForceIdle),
                (0u8..3).prop_map(Op::RadioOff),
                (0u8..3).prop_map(Op::RadioOn),
            ]
        }

        proptest! {
            #[test]
            fn only_one_slot_ever_carries_data(ops in prop::collection::vec(op(), 1..60)) {
                let classes: Vec<DataClass> = DataClass::known().take(4).collect();
                let mut m = modem(3);

                for op in ops {
                    match op {
                        Op::Enable(t, c) => { let _ = m.enable(TenantId(t), &classes[c]); }
                        Op::Disable(t, c) => { let _ = m.disable(TenantId(t), &classes[c]); }
                        Op::ForceIdle(t) => { let _ = m.force_idle(TenantId(t)); }
                        Op::RadioOff(t) => { m.set_radio(TenantId(t), RadioState::Off); }
                        Op::RadioOn(t) => { m.set_radio(TenantId(t), RadioState::On); }
                    }

                    let carrying = (0..3u8)
                        .filter(|t| m.connected(TenantId(*t)).is_some_and(|c| !c.is_empty()))
                        .count();
                    prop_assert!(carrying <= 1);
                }
            }
        }
    }
}
