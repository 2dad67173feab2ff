//! Tenant switch actor
//!
//! Each tenant runs one of these tasks. It owns a [`TenantSwitch`] and is the
//! only code that touches it; everything else talks to it through a
//! [`SwitchChannel`].
//!
//! An arbitrated actor also holds an [`ArbitratorHandle`]. When its idle
//! switch is asked to connect, the actor forwards the request to the
//! arbitrator and relays the arbitrator's outcome as the answer.
//!
//! # Architecture
//!
//! ```text
//!   SwitchChannel ──► mailbox ──┐
//!                               ├─► TenantSwitch ──► effects ──┬─► ModemHandle
//!   modem events ───────────────┘                              ├─► subscribers
//!                                                              ├─► broadcast events
//!                                                              ├─► replies
//!                                                              └─► arbitrator
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use dsw_switch::switch_actor::spawn_tenant_switch;
//! use tokio::sync::broadcast;
//!
//! let (event_tx, _) = broadcast::channel(256);
//! let (channel, task) = spawn_tenant_switch(TenantId(0), modem.clone(), event_tx, 64);
//! channel.connect(DataClass::default_class()).await;
//! ```

use std::collections::HashMap;

use dsw_modem::{ModemError, ModemEvent, ModemHandle, RequestToken, TenantId};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::arbitrator_actor::ArbitratorHandle;
use crate::channel::{
    create_switch_channel, ResponseKind, SubscriptionId, SwitchChannel, SwitchMessage,
    SwitchResponse,
};
use crate::error::{FailReason, SwitchError};
use crate::events::{NoticeFilter, SwitchEvent, SwitchNotice};
use crate::state::RequestOutcome;
use crate::switch::{SwitchEffect, TenantSwitch};

struct Subscriber {
    filter: NoticeFilter,
    sink: mpsc::UnboundedSender<SwitchNotice>,
}

/// Internal state for the tenant actor
struct TenantActorState {
    machine: TenantSwitch,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    next_subscription: u64,
    arbiter: Option<ArbitratorHandle>,
}

impl TenantActorState {
    fn new(tenant: TenantId, arbiter: Option<ArbitratorHandle>) -> Self {
        let machine = match arbiter {
            Some(_) => TenantSwitch::arbitrated(tenant),
            None => TenantSwitch::new(tenant),
        };
        Self {
            machine,
            subscribers: HashMap::new(),
            next_subscription: 1,
            arbiter,
        }
    }

    fn subscribe(
        &mut self,
        filter: NoticeFilter,
        sink: mpsc::UnboundedSender<SwitchNotice>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;

        // Full subscribers start from the current state
        if filter == NoticeFilter::All {
            let _ = sink.send(SwitchNotice::Updated {
                snapshot: self.machine.snapshot(),
            });
        }
        self.subscribers.insert(id, Subscriber { filter, sink });
        id
    }

    fn notify(&mut self, notice: &SwitchNotice) {
        self.subscribers.retain(|id, sub| {
            if !notice.passes(sub.filter) {
                return true;
            }
            let alive = sub.sink.send(notice.clone()).is_ok();
            if !alive {
                debug!("dropping closed subscription {:?}", id);
            }
            alive
        });
    }
}

/// Spawn a standalone tenant switch actor and return the channel that reaches it
///
/// Nothing arbitrates a standalone switch: any connect may take the modem.
pub fn spawn_tenant_switch(
    tenant: TenantId,
    modem: ModemHandle,
    event_tx: broadcast::Sender<SwitchEvent>,
    mailbox_capacity: usize,
) -> (SwitchChannel, JoinHandle<Result<(), SwitchError>>) {
    let (channel, mailbox) = create_switch_channel(tenant, mailbox_capacity);
    let task = tokio::spawn(run_tenant_switch(tenant, mailbox, modem, event_tx, None));
    (channel, task)
}

/// Spawn a tenant switch actor that leaves Idle only with the arbitrator's grant
pub fn spawn_arbitrated_switch(
    tenant: TenantId,
    modem: ModemHandle,
    event_tx: broadcast::Sender<SwitchEvent>,
    mailbox_capacity: usize,
    arbiter: ArbitratorHandle,
) -> (SwitchChannel, JoinHandle<Result<(), SwitchError>>) {
    let (channel, mailbox) = create_switch_channel(tenant, mailbox_capacity);
    let task = tokio::spawn(run_tenant_switch(
        tenant,
        mailbox,
        modem,
        event_tx,
        Some(arbiter),
    ));
    (channel, task)
}

/// Run the tenant switch actor
///
/// Attaches to the modem, then serves the mailbox and modem events until the
/// mailbox closes or a [`SwitchMessage::Shutdown`] arrives. Requests are
/// handled strictly one at a time in arrival order. With an `arbiter` the
/// switch is arbitrated.
pub async fn run_tenant_switch(
    tenant: TenantId,
    mut mailbox: mpsc::Receiver<SwitchMessage>,
    modem: ModemHandle,
    event_tx: broadcast::Sender<SwitchEvent>,
    arbiter: Option<ArbitratorHandle>,
) -> Result<(), SwitchError> {
    let (modem_tx, mut modem_rx) = mpsc::unbounded_channel();
    modem.attach(tenant, modem_tx).await?;

    let mut state = TenantActorState::new(tenant, arbiter);
    let mut modem_open = true;
    info!("{}: switch actor started", tenant);

    loop {
        tokio::select! {
            msg = mailbox.recv() => {
                let Some(msg) = msg else { break; };
                match msg {
                    SwitchMessage::Request { id, request, reply } => {
                        debug!("{}: {} {:?}", tenant, id, request);
                        state.machine.handle_request(id, request, reply);
                    }

                    SwitchMessage::Subscribe { filter, sink, response } => {
                        let id = state.subscribe(filter, sink);
                        let _ = response.send(id);
                    }

                    SwitchMessage::Unsubscribe { id, response } => {
                        let _ = response.send(state.subscribers.remove(&id).is_some());
                    }

                    SwitchMessage::Shutdown => {
                        info!("{}: shutdown requested", tenant);
                        break;
                    }
                }
            }

            event = modem_rx.recv(), if modem_open => {
                match event {
                    Some(event) => state.machine.on_modem_event(event),
                    None => {
                        warn!("{}: modem event stream closed", tenant);
                        modem_open = false;
                    }
                }
            }
        }

        apply_effects(&mut state, &modem, &event_tx).await;
    }

    info!("{}: switch actor stopped", tenant);
    Ok(())
}

/// Carry out everything the state machine asked for, in order
///
/// A command the modem never accepted is fed back as a failed completion, so
/// this loops until the machine has nothing left to say.
async fn apply_effects(
    state: &mut TenantActorState,
    modem: &ModemHandle,
    event_tx: &broadcast::Sender<SwitchEvent>,
) {
    let tenant = state.machine.tenant();

    loop {
        let effects = state.machine.drain_effects();
        if effects.is_empty() {
            break;
        }

        for effect in effects {
            match effect {
                SwitchEffect::Enable { class, token } => {
                    if let Err(e) = modem.enable_class(tenant, class, token).await {
                        reject(state, tenant, token, e);
                    }
                }
                SwitchEffect::Disable { class, token } => {
                    if let Err(e) = modem.disable_class(tenant, class, token).await {
                        reject(state, tenant, token, e);
                    }
                }
                SwitchEffect::ForceIdle { token } => {
                    if let Err(e) = modem.force_idle(tenant, token).await {
                        reject(state, tenant, token, e);
                    }
                }
                SwitchEffect::Notice(notice) => state.notify(&notice),
                SwitchEffect::Event(event) => {
                    // No receivers is fine
                    let _ = event_tx.send(event);
                }
                SwitchEffect::Reply { reply, response } => {
                    let _ = reply.send(response);
                }
                SwitchEffect::RequestOwnership { id, class, reply } => {
                    let Some(arbiter) = state.arbiter.clone() else {
                        warn!("{}: ownership requested without an arbitrator", tenant);
                        let outcome = RequestOutcome::Failed(FailReason::NoReply);
                        if let Some(reply) = reply {
                            let _ = reply.send(SwitchResponse {
                                id,
                                kind: ResponseKind::Outcome(outcome),
                            });
                        }
                        continue;
                    };
                    // Off the actor loop: the arbitrator may be waiting on this mailbox
                    tokio::spawn(async move {
                        let outcome = arbiter.activate(tenant, class).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(SwitchResponse {
                                id,
                                kind: ResponseKind::Outcome(outcome),
                            });
                        }
                    });
                }
            }
        }
    }
}

fn reject(
    state: &mut TenantActorState,
    tenant: TenantId,
    token: RequestToken,
    error: ModemError,
) {
    warn!("{}: modem refused {}: {}", tenant, token, error);
    state.machine.on_modem_event(ModemEvent::Completed {
        tenant,
        token,
        result: Err(error),
    });
}
