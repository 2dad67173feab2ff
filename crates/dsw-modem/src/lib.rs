//! Shared Modem Data Path Boundary
//!
//! This crate defines the vocabulary spoken between the data-connection switch
//! and the modem that physically carries packet data:
//!
//! - **Tenants**: one per SIM slot, identified by a small integer
//! - **Data classes**: validated labels such as `default`, `mms` or `supl`
//! - **Radio state**: the per-slot power/service state reported by the modem
//! - **Commands and events**: the asynchronous request/completion protocol
//!
//! # Architecture
//!
//! The modem is an actor reached through a [`ModemHandle`]. Every command is
//! submitted without waiting for its outcome; the outcome comes back later as a
//! [`ModemEvent`] on the event sink the tenant registered with
//! [`ModemHandle::attach`]. Unsolicited events (a class becoming connected, a
//! radio changing state) travel the same way.
//!
//! ```text
//!  TenantSwitch ──ModemCommand──► modem actor
//!       ▲                              │
//!       └──────── ModemEvent ──────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use dsw_modem::{DataClass, RadioState, TenantId};
//!
//! let mms: DataClass = "mms".parse().unwrap();
//! assert!(!mms.is_default());
//! assert!(DataClass::default_class().is_default());
//! assert!("bogus".parse::<DataClass>().is_err());
//!
//! assert_eq!(TenantId(1).to_string(), "slot1");
//! assert!(RadioState::On.is_in_service());
//! ```

pub mod class;
pub mod command;
pub mod error;
pub mod handle;
pub mod tenant;

pub use class::DataClass;
pub use command::{ModemCommand, ModemEvent, RequestToken};
pub use error::ModemError;
pub use handle::ModemHandle;
pub use tenant::{RadioState, TenantId};
