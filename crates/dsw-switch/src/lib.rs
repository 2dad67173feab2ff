//! Data-Connection Switch
//!
//! This crate arbitrates one shared modem data path between several SIM-slot
//! tenants. At most one tenant may occupy the data path at a time.
//!
//! # Architecture
//!
//! - **TenantSwitch**: one per slot. Tracks which data classes the tenant
//!   wants and drives the modem through Idle, Acquiring, Active and Releasing.
//! - **SwitchArbitrator**: owns the single-owner rule. It grants the data path
//!   to an idle resource immediately, otherwise parks the request and asks the
//!   owner to clean up. Ownership moves only after the owner confirms Idle
//!   and has answered every connect it was granted.
//! - **SwitchChannel**: the only way to reach a tenant switch. Requests are
//!   queued in a bounded mailbox and answered over one-shot reply channels
//!   tagged with a request id. A connect sent to an idle tenant is handed to
//!   the arbitrator, so the channel cannot bypass the single-owner rule.
//!
//! ```text
//!   callers ──► ArbitratorHandle ──► arbitrator actor
//!                                        │  ▲
//!                          SwitchChannel │  │ SwitchNotice
//!                                        ▼  │
//!                                  tenant switch actors ──► ModemHandle
//! ```
//!
//! Every observable change is also published as a [`SwitchEvent`] on a
//! broadcast stream.
//!
//! # Example
//!
//! ```rust,no_run
//! use dsw_modem::{DataClass, ModemHandle, TenantId};
//! use dsw_switch::{ArbitratorConfig, DataSwitch};
//!
//! # async fn demo(modem: ModemHandle) -> Result<(), dsw_switch::SwitchError> {
//! let switch = DataSwitch::start(ArbitratorConfig::default(), modem).await?;
//! let mut events = switch.subscribe_events();
//!
//! switch
//!     .arbitrator()
//!     .activate(TenantId(0), DataClass::default_class())
//!     .await;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod arbitrator;
pub mod arbitrator_actor;
pub mod channel;
pub mod error;
pub mod events;
pub mod state;
pub mod switch;
pub mod switch_actor;

// Re-export actor types
pub use arbitrator_actor::{
    run_arbitrator, ArbitratorCommand, ArbitratorHandle, DataSwitch, EVENT_CAPACITY,
};
pub use switch_actor::{run_tenant_switch, spawn_arbitrated_switch, spawn_tenant_switch};

// Re-export channel types
pub use channel::{
    create_switch_channel, OwnershipGrant, RequestId, ResponseKind, Responder, SubscriptionId,
    SwitchChannel, SwitchMessage, SwitchRequest, SwitchResponse,
};

// Re-export event types
pub use events::{NoticeFilter, SwitchEvent, SwitchNotice};

// Re-export engine types
pub use arbitrator::{
    Activation, ArbitratorConfig, ArbitratorEffect, ArbitratorStatus, SwitchArbitrator,
};
pub use error::{FailReason, SwitchError};
pub use state::{RequestOutcome, SwitchState, TenantSnapshot};
pub use switch::{SwitchEffect, TenantSwitch};
