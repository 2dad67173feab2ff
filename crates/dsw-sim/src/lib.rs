//! Virtual Modem Simulation
//!
//! This crate provides a simulated modem for exercising the data-connection
//! switch without hardware. It includes:
//!
//! - **VirtualModem**: per-slot radio state and connected classes, plus an
//!   oracle that counts violations of the single-data-path rule
//! - **run_virtual_modem**: an actor task serving a [`dsw_modem::ModemHandle`]
//!   with configurable latency and fault injection
//!
//! # Example
//!
//! ```rust
//! use dsw_modem::{DataClass, TenantId};
//! use dsw_sim::{VirtualModem, VirtualModemConfig};
//!
//! let mut modem = VirtualModem::from_config(&VirtualModemConfig::with_slots(2));
//! modem.enable(TenantId(0), &DataClass::default_class()).unwrap();
//!
//! // A second slot cannot take the data path while the first holds it
//! assert!(modem.enable(TenantId(1), &DataClass::default_class()).is_err());
//! assert_eq!(modem.stats().violations, 1);
//! ```

pub mod error;
pub mod modem;
pub mod modem_task;

pub use error::SimError;
pub use modem::{VirtualModem, VirtualModemConfig, VirtualModemStats, VirtualSlotConfig};
pub use modem_task::{
    run_virtual_modem, spawn_virtual_modem, VirtualModemCommand, VirtualModemControl,
};
