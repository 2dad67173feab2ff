//! Arbitrator actor and service startup
//!
//! The arbitrator task owns the [`SwitchArbitrator`], subscribes to every
//! tenant switch and serves [`ArbitratorCommand`]s. Notices from tenants are
//! always drained before new commands so arbitration decisions see the latest
//! tenant state.
//!
//! [`DataSwitch::start`] wires the whole service: one arbitrated tenant actor
//! per slot, the arbitrator, and a shared broadcast event stream. Tenant
//! actors hold an [`ArbitratorHandle`] so a connect sent straight to an idle
//! tenant still goes through arbitration.
//!
//! # Example
//!
//! ```rust,ignore
//! let switch = DataSwitch::start(ArbitratorConfig::default(), modem).await?;
//! let outcome = switch
//!     .arbitrator()
//!     .activate(TenantId(1), DataClass::default_class())
//!     .await;
//! ```

use dsw_modem::{DataClass, ModemHandle, TenantId};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::arbitrator::{
    Activation, ArbitratorConfig, ArbitratorEffect, ArbitratorStatus, SwitchArbitrator,
};
use crate::channel::{outcome_from, OwnershipGrant, SwitchChannel, SwitchRequest};
use crate::error::{FailReason, SwitchError};
use crate::events::{NoticeFilter, SwitchEvent};
use crate::state::RequestOutcome;
use crate::switch_actor::spawn_arbitrated_switch;

/// Capacity of the broadcast event stream
pub const EVENT_CAPACITY: usize = 1024;

/// Commands sent to the arbitrator actor
#[derive(Debug)]
pub enum ArbitratorCommand {
    /// Bring up a class on a tenant
    Activate {
        tenant: TenantId,
        class: DataClass,
        response: oneshot::Sender<RequestOutcome>,
    },

    /// Tear down a class on a tenant
    Deactivate {
        tenant: TenantId,
        class: DataClass,
        response: oneshot::Sender<RequestOutcome>,
    },

    /// Query ownership and tenant mirrors
    Status {
        response: oneshot::Sender<ArbitratorStatus>,
    },

    /// Change the preferred tenant for the default class
    SetDefaultTenant {
        tenant: Option<TenantId>,
        response: oneshot::Sender<Result<(), FailReason>>,
    },

    /// Stop the actor
    Shutdown,
}

/// Clonable handle to the arbitrator actor
#[derive(Debug, Clone)]
pub struct ArbitratorHandle {
    tx: mpsc::Sender<ArbitratorCommand>,
    modem: ModemHandle,
    tenant_count: u8,
}

impl ArbitratorHandle {
    /// Wrap the arbitrator inbox
    pub fn new(tx: mpsc::Sender<ArbitratorCommand>, modem: ModemHandle, tenant_count: u8) -> Self {
        Self {
            tx,
            modem,
            tenant_count,
        }
    }

    /// Request a class on a tenant
    ///
    /// Returns once the arbitrator has decided: a granted or forwarded
    /// request answers with the tenant switch's outcome, a request that has
    /// to wait for another tenant to release answers `Started`.
    pub async fn activate(&self, tenant: TenantId, class: DataClass) -> RequestOutcome {
        let (response, rx) = oneshot::channel();
        let command = ArbitratorCommand::Activate {
            tenant,
            class,
            response,
        };
        self.call(command, rx).await
    }

    /// Release a class on a tenant
    pub async fn deactivate(&self, tenant: TenantId, class: DataClass) -> RequestOutcome {
        let (response, rx) = oneshot::channel();
        let command = ArbitratorCommand::Deactivate {
            tenant,
            class,
            response,
        };
        self.call(command, rx).await
    }

    async fn call(
        &self,
        command: ArbitratorCommand,
        rx: oneshot::Receiver<RequestOutcome>,
    ) -> RequestOutcome {
        if self.tx.send(command).await.is_err() {
            return RequestOutcome::Failed(FailReason::NoReply);
        }
        rx.await.unwrap_or(RequestOutcome::Failed(FailReason::NoReply))
    }

    /// Whether the modem could ever carry `class` on `tenant`
    ///
    /// Answered by the modem directly; ownership is not considered.
    pub async fn is_possible(&self, tenant: TenantId, class: DataClass) -> bool {
        if tenant.0 >= self.tenant_count {
            return false;
        }
        self.modem.supports(tenant, class).await
    }

    /// Current ownership and tenant mirrors
    pub async fn status(&self) -> Result<ArbitratorStatus, SwitchError> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(ArbitratorCommand::Status { response })
            .await
            .map_err(|_| SwitchError::ArbitratorClosed)?;
        rx.await.map_err(|_| SwitchError::ArbitratorClosed)
    }

    /// Change the preferred tenant for the default class
    pub async fn set_default_tenant(&self, tenant: Option<TenantId>) -> Result<(), SwitchError> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(ArbitratorCommand::SetDefaultTenant { tenant, response })
            .await
            .map_err(|_| SwitchError::ArbitratorClosed)?;
        rx.await
            .map_err(|_| SwitchError::ArbitratorClosed)?
            .map_err(|reason| SwitchError::InvalidConfig(reason.to_string()))
    }

    /// Stop the arbitrator
    pub async fn shutdown(&self) {
        let _ = self.tx.send(ArbitratorCommand::Shutdown).await;
    }
}

/// Run the arbitrator actor
///
/// Subscribes to every tenant in `channels` (indexed by slot), then serves
/// commands until the inbox closes, a shutdown arrives, or every tenant
/// switch has stopped.
pub async fn run_arbitrator(
    config: ArbitratorConfig,
    channels: Vec<SwitchChannel>,
    mut cmd_rx: mpsc::Receiver<ArbitratorCommand>,
    event_tx: broadcast::Sender<SwitchEvent>,
) -> Result<(), SwitchError> {
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    for channel in &channels {
        channel.subscribe(NoticeFilter::All, notice_tx.clone()).await?;
    }
    drop(notice_tx);

    let (answer_tx, mut answer_rx) = mpsc::unbounded_channel();
    let mut arbitrator = SwitchArbitrator::new(config);
    info!("Arbitrator started with {} tenants", channels.len());

    loop {
        tokio::select! {
            biased;

            notice = notice_rx.recv() => {
                let Some(notice) = notice else {
                    warn!("All tenant switches stopped");
                    break;
                };
                arbitrator.on_notice(notice);
            }

            answer = answer_rx.recv() => {
                if let Some(Answer { tenant, tracked, outcome }) = answer {
                    match tracked {
                        Tracked::Grant(grant) => arbitrator.on_grant_answered(grant, &outcome),
                        Tracked::Cleanup => arbitrator.on_cleanup_answered(tenant, &outcome),
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                match cmd {
                    ArbitratorCommand::Activate { tenant, class, response } => {
                        match arbitrator.activate(tenant, class.clone()) {
                            Activation::Reply(outcome) => {
                                let _ = response.send(outcome);
                            }
                            Activation::Forward { grant } => {
                                let request = match grant {
                                    Some(grant) => SwitchRequest::Acquire(class, grant),
                                    None => SwitchRequest::Connect(class),
                                };
                                forward(
                                    &channels,
                                    tenant,
                                    request,
                                    grant.map(Tracked::Grant),
                                    Some(response),
                                    &answer_tx,
                                )
                                .await;
                            }
                        }
                    }

                    ArbitratorCommand::Deactivate { tenant, class, response } => {
                        match arbitrator.deactivate(tenant, &class) {
                            Activation::Reply(outcome) => {
                                let _ = response.send(outcome);
                            }
                            Activation::Forward { grant } => {
                                forward(
                                    &channels,
                                    tenant,
                                    SwitchRequest::Disconnect(class),
                                    grant.map(Tracked::Grant),
                                    Some(response),
                                    &answer_tx,
                                )
                                .await;
                            }
                        }
                    }

                    ArbitratorCommand::Status { response } => {
                        let _ = response.send(arbitrator.status());
                    }

                    ArbitratorCommand::SetDefaultTenant { tenant, response } => {
                        let _ = response.send(arbitrator.set_default_tenant(tenant));
                    }

                    ArbitratorCommand::Shutdown => {
                        info!("Arbitrator shutdown requested");
                        break;
                    }
                }
            }
        }

        apply_effects(&mut arbitrator, &channels, &event_tx, &answer_tx).await;
    }

    info!("Arbitrator stopped");
    Ok(())
}

/// Forwarded request whose answer the arbitrator needs to see
#[derive(Debug, Clone, Copy)]
enum Tracked {
    Grant(OwnershipGrant),
    Cleanup,
}

#[derive(Debug)]
struct Answer {
    tenant: TenantId,
    tracked: Tracked,
    outcome: RequestOutcome,
}

async fn apply_effects(
    arbitrator: &mut SwitchArbitrator,
    channels: &[SwitchChannel],
    event_tx: &broadcast::Sender<SwitchEvent>,
    answer_tx: &mpsc::UnboundedSender<Answer>,
) {
    for effect in arbitrator.drain_effects() {
        match effect {
            ArbitratorEffect::Connect {
                tenant,
                class,
                grant,
            } => {
                forward(
                    channels,
                    tenant,
                    SwitchRequest::Acquire(class, grant),
                    Some(Tracked::Grant(grant)),
                    None,
                    answer_tx,
                )
                .await;
            }
            ArbitratorEffect::CleanupAll { tenant } => {
                forward(
                    channels,
                    tenant,
                    SwitchRequest::CleanupAll,
                    Some(Tracked::Cleanup),
                    None,
                    answer_tx,
                )
                .await;
            }
            ArbitratorEffect::Event(event) => {
                let _ = event_tx.send(event);
            }
        }
    }
}

/// Enqueue a request on a tenant switch and relay its answer
///
/// The request is queued before returning so tenant mailboxes see requests in
/// the order the arbitrator decided them. Only the wait for the answer runs
/// in the background. Every answer to a tracked request, lost ones included,
/// goes back to the arbitrator.
async fn forward(
    channels: &[SwitchChannel],
    tenant: TenantId,
    request: SwitchRequest,
    tracked: Option<Tracked>,
    reply: Option<oneshot::Sender<RequestOutcome>>,
    answer_tx: &mpsc::UnboundedSender<Answer>,
) {
    let Some(channel) = channels.get(tenant.index()) else {
        let outcome = RequestOutcome::Failed(FailReason::UnknownTenant(tenant));
        deliver(tenant, tracked, outcome, reply, answer_tx);
        return;
    };

    match channel.send_request(request).await {
        Ok((id, rx)) => {
            let answer_tx = answer_tx.clone();
            tokio::spawn(async move {
                let outcome = outcome_from(id, rx.await.ok());
                debug!("{}: {} answered {:?}", tenant, id, outcome);
                deliver(tenant, tracked, outcome, reply, &answer_tx);
            });
        }
        Err(e) => {
            warn!("{}: could not forward request: {}", tenant, e);
            let outcome = RequestOutcome::Failed(FailReason::NoReply);
            deliver(tenant, tracked, outcome, reply, answer_tx);
        }
    }
}

fn deliver(
    tenant: TenantId,
    tracked: Option<Tracked>,
    outcome: RequestOutcome,
    reply: Option<oneshot::Sender<RequestOutcome>>,
    answer_tx: &mpsc::UnboundedSender<Answer>,
) {
    if let Some(tracked) = tracked {
        let _ = answer_tx.send(Answer {
            tenant,
            tracked,
            outcome: outcome.clone(),
        });
    }
    if let Some(reply) = reply {
        let _ = reply.send(outcome);
    }
}

/// A running data-connection switch
///
/// Owns the tenant actors and the arbitrator. Tenant actors and the
/// arbitrator hold each other's channels, so dropping this leaves them
/// running; call [`DataSwitch::shutdown`] to stop them.
#[derive(Debug)]
pub struct DataSwitch {
    arbitrator: ArbitratorHandle,
    channels: Vec<SwitchChannel>,
    event_tx: broadcast::Sender<SwitchEvent>,
    tasks: Vec<JoinHandle<Result<(), SwitchError>>>,
}

impl DataSwitch {
    /// Start tenant switches and the arbitrator on the current runtime
    pub async fn start(config: ArbitratorConfig, modem: ModemHandle) -> Result<Self, SwitchError> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (tx, rx) = mpsc::channel(config.mailbox_capacity);
        let arbitrator = ArbitratorHandle::new(tx, modem.clone(), config.tenant_count);

        let mut channels = Vec::with_capacity(config.tenant_count as usize);
        let mut tasks = Vec::with_capacity(config.tenant_count as usize + 1);
        for tenant in config.tenants() {
            let (channel, task) = spawn_arbitrated_switch(
                tenant,
                modem.clone(),
                event_tx.clone(),
                config.mailbox_capacity,
                arbitrator.clone(),
            );
            channels.push(channel);
            tasks.push(task);
        }

        tasks.push(tokio::spawn(run_arbitrator(
            config,
            channels.clone(),
            rx,
            event_tx.clone(),
        )));

        Ok(Self {
            arbitrator,
            channels,
            event_tx,
            tasks,
        })
    }

    /// Handle to the arbitrator
    pub fn arbitrator(&self) -> &ArbitratorHandle {
        &self.arbitrator
    }

    /// Direct channel to one tenant switch
    ///
    /// Connects sent here to an idle tenant are passed to the arbitrator
    /// like [`ArbitratorHandle::activate`].
    pub fn channel(&self, tenant: TenantId) -> Option<&SwitchChannel> {
        self.channels.get(tenant.index())
    }

    /// All tenant channels in slot order
    pub fn channels(&self) -> &[SwitchChannel] {
        &self.channels
    }

    /// Subscribe to the event stream
    pub fn subscribe_events(&self) -> broadcast::Receiver<SwitchEvent> {
        self.event_tx.subscribe()
    }

    /// Stop the arbitrator and every tenant switch
    ///
    /// Returns the first error any task ended with.
    pub async fn shutdown(self) -> Result<(), SwitchError> {
        self.arbitrator.shutdown().await;
        for channel in &self.channels {
            channel.shutdown().await;
        }

        let mut first_error = None;
        for task in self.tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Switch task ended with error: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => warn!("Switch task panicked: {}", e),
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SwitchState;
    use dsw_sim::{spawn_virtual_modem, VirtualModemConfig};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn start(tenants: u8) -> (DataSwitch, dsw_sim::VirtualModemControl) {
        let (modem, control) = spawn_virtual_modem(VirtualModemConfig::with_slots(tenants));
        let config = ArbitratorConfig {
            tenant_count: tenants,
            ..ArbitratorConfig::default()
        };
        let switch = DataSwitch::start(config, modem).await.unwrap();
        (switch, control)
    }

    async fn wait_owner(switch: &DataSwitch, owner: Option<TenantId>) -> ArbitratorStatus {
        timeout(Duration::from_secs(5), async {
            loop {
                let status = switch.arbitrator().status().await.unwrap();
                if status.current_owner == owner {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("owner reached")
    }

    #[tokio::test]
    async fn test_activate_grants_idle_resource() {
        let (switch, _control) = start(2).await;

        let outcome = switch
            .arbitrator()
            .activate(TenantId(0), DataClass::default_class())
            .await;

        assert_eq!(outcome, RequestOutcome::Started);
        wait_owner(&switch, Some(TenantId(0))).await;
        switch.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_reports_unknown_tenant_rejection() {
        let (switch, _control) = start(2).await;

        let outcome = switch
            .arbitrator()
            .activate(TenantId(9), DataClass::default_class())
            .await;

        assert_eq!(
            outcome,
            RequestOutcome::Failed(FailReason::UnknownTenant(TenantId(9)))
        );
        assert!(!switch
            .arbitrator()
            .is_possible(TenantId(9), DataClass::default_class())
            .await);
        assert!(switch
            .arbitrator()
            .is_possible(TenantId(1), DataClass::default_class())
            .await);
    }

    #[tokio::test]
    async fn test_set_default_tenant_validates() {
        let (switch, _control) = start(2).await;

        assert!(switch.arbitrator().set_default_tenant(Some(TenantId(1))).await.is_ok());
        assert!(matches!(
            switch.arbitrator().set_default_tenant(Some(TenantId(4))).await,
            Err(SwitchError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_handoff_between_tenants() {
        let (switch, _control) = start(2).await;
        let arb = switch.arbitrator().clone();

        arb.activate(TenantId(0), DataClass::default_class()).await;
        wait_owner(&switch, Some(TenantId(0))).await;

        assert_eq!(
            arb.activate(TenantId(1), DataClass::default_class()).await,
            RequestOutcome::Started
        );
        let status = wait_owner(&switch, Some(TenantId(1))).await;
        assert_eq!(status.pending_owner, None);

        let snap = switch.channel(TenantId(0)).unwrap().snapshot().await.unwrap();
        assert_eq!(snap.state, SwitchState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_config_refused() {
        let (modem, _control) = spawn_virtual_modem(VirtualModemConfig::with_slots(1));
        let config = ArbitratorConfig {
            tenant_count: 0,
            ..ArbitratorConfig::default()
        };

        assert!(matches!(
            DataSwitch::start(config, modem).await,
            Err(SwitchError::InvalidConfig(_))
        ));
    }
}
