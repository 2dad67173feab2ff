//! Cross-tenant arbitration
//!
//! [`SwitchArbitrator`] decides which tenant may use the shared data path. It
//! never talks to the modem: it forwards connects to tenant switches and asks
//! the current owner to clean up when someone else wants in. Ownership only
//! moves once the owner's switch confirms Idle, so two tenants never occupy
//! the modem at once.
//!
//! Every connect the arbitrator sends carries an [`OwnershipGrant`] that stays
//! outstanding until the tenant switch answers it. An owner that is Idle with
//! grants outstanding may still be about to acquire, so ownership does not
//! move until they are all answered.
//!
//! Like [`TenantSwitch`](crate::switch::TenantSwitch) this is a synchronous
//! state machine; the actor in [`arbitrator_actor`](crate::arbitrator_actor)
//! drives it and carries out the buffered [`ArbitratorEffect`]s.

use std::collections::BTreeSet;

use dsw_modem::{DataClass, RadioState, TenantId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::OwnershipGrant;
use crate::error::{FailReason, SwitchError};
use crate::events::{SwitchEvent, SwitchNotice};
use crate::state::{RequestOutcome, SwitchState, TenantSnapshot};

/// Arbitrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitratorConfig {
    /// Number of SIM slots, numbered from zero
    pub tenant_count: u8,
    /// Tenant preferred for the default class
    pub default_tenant: Option<TenantId>,
    /// Class activated on the default tenant after radio recovery
    pub default_class: DataClass,
    /// Capacity of each tenant mailbox and the arbitrator inbox
    pub mailbox_capacity: usize,
    /// Re-activate the default tenant when its radio comes back
    pub auto_recover_default: bool,
}

impl Default for ArbitratorConfig {
    fn default() -> Self {
        Self {
            tenant_count: 2,
            default_tenant: Some(TenantId(0)),
            default_class: DataClass::default_class(),
            mailbox_capacity: 64,
            auto_recover_default: true,
        }
    }
}

impl ArbitratorConfig {
    /// Check the configuration can be started
    pub fn validate(&self) -> Result<(), SwitchError> {
        if self.tenant_count == 0 {
            return Err(SwitchError::InvalidConfig("tenant_count must be at least 1".into()));
        }
        if self.mailbox_capacity == 0 {
            return Err(SwitchError::InvalidConfig(
                "mailbox_capacity must be at least 1".into(),
            ));
        }
        if let Some(tenant) = self.default_tenant {
            if tenant.0 >= self.tenant_count {
                return Err(SwitchError::InvalidConfig(format!(
                    "default tenant {} outside {} slots",
                    tenant, self.tenant_count
                )));
            }
        }
        Ok(())
    }

    /// All configured tenants in slot order
    pub fn tenants(&self) -> impl Iterator<Item = TenantId> {
        (0..self.tenant_count).map(TenantId)
    }
}

/// Activation waiting for the current owner to go idle
#[derive(Debug, Clone, PartialEq, Eq)]
struct Pending {
    tenant: TenantId,
    classes: BTreeSet<DataClass>,
}

/// What to do with an activate or deactivate call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// Answer the caller directly
    Reply(RequestOutcome),
    /// Pass the request to the tenant's switch and relay its answer
    ///
    /// Connects carry a grant, which must be reported back through
    /// [`SwitchArbitrator::on_grant_answered`] once the switch answers.
    Forward { grant: Option<OwnershipGrant> },
}

/// Work produced by the arbitrator for its actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbitratorEffect {
    /// Connect a class on a tenant switch without a waiting caller
    Connect {
        tenant: TenantId,
        class: DataClass,
        grant: OwnershipGrant,
    },
    /// Ask a tenant switch to release everything
    CleanupAll { tenant: TenantId },
    /// Publish on the event stream
    Event(SwitchEvent),
}

/// Arbitration status for observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArbitratorStatus {
    /// Tenant holding the data path
    pub current_owner: Option<TenantId>,
    /// Tenant waiting for the owner to release
    pub pending_owner: Option<TenantId>,
    /// Classes the pending tenant will get
    pub pending_classes: Vec<DataClass>,
    /// Classes the owner will reconnect after its release completes
    pub reacquire: Vec<DataClass>,
    /// Connects sent to the owner and not answered yet
    pub grants_outstanding: usize,
    /// Last known state of every tenant switch
    pub tenants: Vec<TenantSnapshot>,
}

/// Single-owner arbitration over all tenant switches
#[derive(Debug)]
pub struct SwitchArbitrator {
    config: ArbitratorConfig,
    current_owner: Option<TenantId>,
    pending: Option<Pending>,
    /// Owner requests made while it was releasing
    reacquire: BTreeSet<DataClass>,
    /// CleanupAll sent to the owner and not yet answered by Idle
    cleanup_requested: bool,
    outstanding: BTreeSet<OwnershipGrant>,
    next_grant: u64,
    /// Mirrors of tenant switch state, indexed by slot
    mirrors: Vec<TenantSnapshot>,
    /// Slots whose radio went off and has not come back on
    recovering: Vec<bool>,
    effects: Vec<ArbitratorEffect>,
}

impl SwitchArbitrator {
    /// Create an arbitrator with every tenant idle
    pub fn new(config: ArbitratorConfig) -> Self {
        let mirrors = config.tenants().map(TenantSnapshot::idle).collect();
        let recovering = vec![false; config.tenant_count as usize];
        Self {
            config,
            current_owner: None,
            pending: None,
            reacquire: BTreeSet::new(),
            cleanup_requested: false,
            outstanding: BTreeSet::new(),
            next_grant: 0,
            mirrors,
            recovering,
            effects: Vec::new(),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &ArbitratorConfig {
        &self.config
    }

    /// Tenant holding the data path
    pub fn current_owner(&self) -> Option<TenantId> {
        self.current_owner
    }

    /// Tenant waiting for the data path
    pub fn pending_owner(&self) -> Option<TenantId> {
        self.pending.as_ref().map(|p| p.tenant)
    }

    /// Whether a tenant id is within the configured slots
    pub fn knows(&self, tenant: TenantId) -> bool {
        tenant.index() < self.mirrors.len()
    }

    /// Last known state of a tenant switch
    pub fn mirror(&self, tenant: TenantId) -> Option<&TenantSnapshot> {
        self.mirrors.get(tenant.index())
    }

    /// Snapshot for observers
    pub fn status(&self) -> ArbitratorStatus {
        ArbitratorStatus {
            current_owner: self.current_owner,
            pending_owner: self.pending_owner(),
            pending_classes: self
                .pending
                .as_ref()
                .map(|p| p.classes.iter().cloned().collect())
                .unwrap_or_default(),
            reacquire: self.reacquire.iter().cloned().collect(),
            grants_outstanding: self.outstanding.len(),
            tenants: self.mirrors.clone(),
        }
    }

    /// Drain pending effects
    pub fn drain_effects(&mut self) -> Vec<ArbitratorEffect> {
        std::mem::take(&mut self.effects)
    }

    /// Change the preferred tenant for the default class
    pub fn set_default_tenant(&mut self, tenant: Option<TenantId>) -> Result<(), FailReason> {
        if let Some(t) = tenant {
            if !self.knows(t) {
                return Err(FailReason::UnknownTenant(t));
            }
        }
        info!("default tenant set to {:?}", tenant);
        self.config.default_tenant = tenant;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Decide what happens to an activation of `class` on `tenant`
    pub fn activate(&mut self, tenant: TenantId, class: DataClass) -> Activation {
        let Some(mirror) = self.mirror(tenant) else {
            return self.reject(tenant, class, FailReason::UnknownTenant(tenant));
        };

        if mirror.radio.is_off() {
            return self.reject(tenant, class, FailReason::RadioOff(tenant));
        }

        if !class.is_default() {
            let holder = self
                .mirrors
                .iter()
                .find(|m| m.tenant != tenant && m.holds_non_default())
                .map(|m| m.tenant);
            if let Some(holder) = holder {
                let reason = FailReason::Conflict {
                    class: class.clone(),
                    holder,
                };
                return self.reject(tenant, class, reason);
            }
        }

        match self.current_owner {
            None => {
                self.set_owner(Some(tenant));
                Activation::Forward {
                    grant: Some(self.issue_grant()),
                }
            }

            Some(owner) if owner == tenant => {
                let releasing = self.mirrors[tenant.index()].state == SwitchState::Releasing;
                if self.cleanup_requested || releasing || self.pending.is_some() {
                    debug!("{}: {} queued until release completes", tenant, class);
                    self.reacquire.insert(class);
                    if let Some(previous) = self.pending.take() {
                        self.emit(SwitchEvent::PendingReplaced {
                            previous: previous.tenant,
                            tenant,
                        });
                    }
                    self.settle_owner();
                    Activation::Reply(RequestOutcome::Started)
                } else {
                    Activation::Forward {
                        grant: Some(self.issue_grant()),
                    }
                }
            }

            Some(owner) => {
                match &mut self.pending {
                    Some(p) if p.tenant == tenant => {
                        p.classes.insert(class);
                    }
                    slot => {
                        let previous = slot.replace(Pending {
                            tenant,
                            classes: BTreeSet::from([class]),
                        });
                        if let Some(previous) = previous {
                            info!(
                                "pending activation for {} replaced by {}",
                                previous.tenant, tenant
                            );
                            self.emit(SwitchEvent::PendingReplaced {
                                previous: previous.tenant,
                                tenant,
                            });
                        }
                    }
                }

                if !self.reacquire.is_empty() {
                    debug!("{}: dropping reacquire, {} is waiting", owner, tenant);
                    self.reacquire.clear();
                }

                if !self.cleanup_requested {
                    info!("{} waiting for {} to release", tenant, owner);
                    self.cleanup_requested = true;
                    self.effects.push(ArbitratorEffect::CleanupAll { tenant: owner });
                }
                Activation::Reply(RequestOutcome::Started)
            }
        }
    }

    /// Decide what happens to a deactivation of `class` on `tenant`
    pub fn deactivate(&mut self, tenant: TenantId, class: &DataClass) -> Activation {
        if !self.knows(tenant) {
            return Activation::Reply(RequestOutcome::Failed(FailReason::UnknownTenant(tenant)));
        }

        if let Some(p) = &mut self.pending {
            if p.tenant == tenant && p.classes.remove(class) && p.classes.is_empty() {
                debug!("{}: pending activation withdrawn", tenant);
                self.pending = None;
            }
        }
        if self.current_owner == Some(tenant) {
            self.reacquire.remove(class);
        }

        Activation::Forward { grant: None }
    }

    /// A tenant switch answered a connect carrying `grant`
    ///
    /// Call this for every answer, including failures and lost replies.
    pub fn on_grant_answered(&mut self, grant: OwnershipGrant, outcome: &RequestOutcome) {
        if !self.outstanding.remove(&grant) {
            debug!("{} answered twice", grant);
            return;
        }
        if outcome.is_failed() {
            warn!("{} refused: {:?}", grant, outcome);
        }
        self.settle_owner();
    }

    /// A tenant switch answered a [`ArbitratorEffect::CleanupAll`]
    ///
    /// `AlreadyInactive` means nothing was released, so no Idle notice will
    /// close this cleanup.
    pub fn on_cleanup_answered(&mut self, tenant: TenantId, outcome: &RequestOutcome) {
        if self.current_owner != Some(tenant) || *outcome != RequestOutcome::AlreadyInactive {
            return;
        }
        debug!("{}: cleanup found nothing to release", tenant);
        self.cleanup_requested = false;
        self.settle_owner();
    }

    // -------------------------------------------------------------------------
    // Tenant notices
    // -------------------------------------------------------------------------

    /// Process a notice from a tenant switch
    pub fn on_notice(&mut self, notice: SwitchNotice) {
        match notice {
            SwitchNotice::Updated { snapshot } => self.on_updated(snapshot),
            SwitchNotice::RadioChanged { tenant, from, to } => self.on_radio(tenant, from, to),
            SwitchNotice::EnteredIdle { tenant, replaying } => self.on_idle(tenant, &replaying),
        }
    }

    fn on_updated(&mut self, snapshot: TenantSnapshot) {
        let tenant = snapshot.tenant;
        let Some(mirror) = self.mirrors.get_mut(tenant.index()) else {
            return;
        };

        if snapshot.state.is_occupying() && self.current_owner != Some(tenant) {
            warn!(
                "{} is {} without owning the data path (owner {:?})",
                tenant, snapshot.state, self.current_owner
            );
        }
        *mirror = snapshot;
    }

    fn on_radio(&mut self, tenant: TenantId, from: RadioState, to: RadioState) {
        let idx = tenant.index();
        if idx >= self.mirrors.len() {
            return;
        }
        debug!("{}: radio {} -> {}", tenant, from, to);
        self.mirrors[idx].radio = to;

        if to.is_off() {
            self.recovering[idx] = true;
            return;
        }
        if to != RadioState::On || !self.recovering[idx] {
            return;
        }

        self.recovering[idx] = false;
        let eligible = self.config.auto_recover_default
            && self.current_owner.is_none()
            && self.config.default_tenant == Some(tenant);
        if eligible {
            let class = self.config.default_class.clone();
            info!("{}: radio recovered, activating {}", tenant, class);
            self.set_owner(Some(tenant));
            self.emit(SwitchEvent::AutoActivation {
                tenant,
                class: class.clone(),
            });
            let grant = self.issue_grant();
            self.effects.push(ArbitratorEffect::Connect {
                tenant,
                class,
                grant,
            });
        }
    }

    fn on_idle(&mut self, tenant: TenantId, replaying: &[DataClass]) {
        let idx = tenant.index();
        if let Some(mirror) = self.mirrors.get_mut(idx) {
            mirror.state = SwitchState::Idle;
            mirror.classes.clear();
            mirror.connected.clear();
            mirror.deferred = 0;
        }

        if self.current_owner != Some(tenant) {
            debug!("{}: idle while not owner, nothing to do", tenant);
            return;
        }

        if !replaying.is_empty() {
            debug!("{}: {} parked connects will ask again", tenant, replaying.len());
        }
        self.cleanup_requested = false;
        self.settle_owner();
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Decide what the owner's current state means for ownership
    ///
    /// An idle owner with nothing in flight either reconnects what it asked
    /// for while releasing or hands the data path on. A busy owner is asked
    /// to clean up when someone is waiting.
    fn settle_owner(&mut self) {
        let Some(owner) = self.current_owner else {
            return;
        };

        match self.mirrors[owner.index()].state {
            SwitchState::Idle => {
                if !self.outstanding.is_empty() {
                    debug!(
                        "{}: idle with {} grants outstanding, waiting",
                        owner,
                        self.outstanding.len()
                    );
                    return;
                }
                if self.pending.is_none() && !self.reacquire.is_empty() {
                    self.forward_reacquire(owner);
                } else {
                    self.reacquire.clear();
                    self.release_and_grant();
                }
            }
            SwitchState::Acquiring | SwitchState::Active => {
                if self.pending.is_some() {
                    if !self.cleanup_requested {
                        info!("{} still holds the data path, asking again", owner);
                        self.cleanup_requested = true;
                        self.effects.push(ArbitratorEffect::CleanupAll { tenant: owner });
                    }
                } else if !self.reacquire.is_empty() && !self.cleanup_requested {
                    self.forward_reacquire(owner);
                }
            }
            // EnteredIdle follows
            SwitchState::Releasing => {}
        }
    }

    fn forward_reacquire(&mut self, tenant: TenantId) {
        for class in std::mem::take(&mut self.reacquire) {
            debug!("{}: reacquiring {}", tenant, class);
            let grant = self.issue_grant();
            self.effects.push(ArbitratorEffect::Connect {
                tenant,
                class,
                grant,
            });
        }
    }

    fn issue_grant(&mut self) -> OwnershipGrant {
        self.next_grant += 1;
        let grant = OwnershipGrant::new(self.next_grant);
        self.outstanding.insert(grant);
        grant
    }

    /// Owner is idle: hand the data path to whoever is waiting
    fn release_and_grant(&mut self) {
        let Some(pending) = self.pending.take() else {
            self.set_owner(None);
            return;
        };

        let radio_off = self
            .mirror(pending.tenant)
            .map(|m| m.radio.is_off())
            .unwrap_or(true);
        if radio_off {
            self.set_owner(None);
            for class in pending.classes {
                self.emit(SwitchEvent::ActivationRejected {
                    tenant: pending.tenant,
                    class,
                    reason: FailReason::RadioOff(pending.tenant),
                });
            }
            return;
        }

        self.set_owner(Some(pending.tenant));
        for class in pending.classes {
            let grant = self.issue_grant();
            self.effects.push(ArbitratorEffect::Connect {
                tenant: pending.tenant,
                class,
                grant,
            });
        }
    }

    fn set_owner(&mut self, owner: Option<TenantId>) {
        if self.current_owner == owner {
            return;
        }
        self.cleanup_requested = false;
        self.reacquire.clear();
        let from = std::mem::replace(&mut self.current_owner, owner);
        info!("data path owner {:?} -> {:?}", from, owner);
        self.emit(SwitchEvent::OwnerChanged { from, to: owner });
    }

    fn reject(&mut self, tenant: TenantId, class: DataClass, reason: FailReason) -> Activation {
        warn!("{}: activation of {} rejected: {}", tenant, class, reason);
        self.emit(SwitchEvent::ActivationRejected {
            tenant,
            class,
            reason: reason.clone(),
        });
        Activation::Reply(RequestOutcome::Failed(reason))
    }

    fn emit(&mut self, event: SwitchEvent) {
        self.effects.push(ArbitratorEffect::Event(event));
    }
}
