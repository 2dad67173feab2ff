//! Per-tenant switch state machine
//!
//! [`TenantSwitch`] owns one tenant's view of the shared data path. It is a
//! plain synchronous state machine: requests and modem events go in, and the
//! resulting modem commands, notices, events and replies are buffered as
//! [`SwitchEffect`]s for the actor to carry out (see
//! [`run_tenant_switch`](crate::switch_actor::run_tenant_switch)).
//!
//! # States
//!
//! ```text
//!            connect                classConnected
//!   Idle ─────────────► Acquiring ─────────────────► Active
//!    ▲                      │  last disconnect /        │
//!    │                      │  cleanupAll               │
//!    │   idle confirmed     ▼                           │
//!    └──────────────── Releasing ◄──────────────────────┘
//! ```
//!
//! While Releasing, connects are parked in FIFO order and replayed as plain
//! connects once the force-idle completion confirms Idle. A grant carried by
//! a parked connect belongs to the release that just ended and is dropped.
//!
//! # Arbitrated switches
//!
//! A switch built with [`TenantSwitch::arbitrated`] never leaves Idle on a
//! plain [`SwitchRequest::Connect`]. It emits
//! [`SwitchEffect::RequestOwnership`] instead and the actor asks the
//! arbitrator, which answers with a [`SwitchRequest::Acquire`] carrying an
//! [`OwnershipGrant`]. Connects on a switch that already occupies the data
//! path stay local.

use std::collections::{BTreeSet, HashMap, VecDeque};

use dsw_modem::{DataClass, ModemError, ModemEvent, RadioState, RequestToken, TenantId};
use tracing::{debug, info, warn};

use crate::channel::{
    OwnershipGrant, RequestId, ResponseKind, Responder, SwitchRequest, SwitchResponse,
};
use crate::error::FailReason;
use crate::events::{SwitchEvent, SwitchNotice};
use crate::state::{RequestOutcome, SwitchState, TenantSnapshot};

/// Work produced by the state machine for the actor to perform
#[derive(Debug)]
pub enum SwitchEffect {
    /// Ask the modem to enable a class
    Enable { class: DataClass, token: RequestToken },
    /// Ask the modem to disable a class
    Disable { class: DataClass, token: RequestToken },
    /// Ask the modem to force-idle the tenant
    ForceIdle { token: RequestToken },
    /// Deliver to subscribers
    Notice(SwitchNotice),
    /// Publish on the event stream
    Event(SwitchEvent),
    /// Answer a caller
    Reply {
        reply: Responder,
        response: SwitchResponse,
    },
    /// Ask the arbitrator for the data path on behalf of a connect
    ///
    /// The arbitrator's outcome answers request `id`.
    RequestOwnership {
        id: RequestId,
        class: DataClass,
        reply: Option<Responder>,
    },
}

/// Modem command awaiting completion
#[derive(Debug, Clone)]
enum Inflight {
    Enable(DataClass),
    Disable(DataClass),
    ForceIdle,
}

/// Connect parked while Releasing
#[derive(Debug)]
struct Deferred {
    id: RequestId,
    class: DataClass,
    reply: Option<Responder>,
}

/// One tenant's data path state machine
#[derive(Debug)]
pub struct TenantSwitch {
    tenant: TenantId,
    state: SwitchState,
    classes: BTreeSet<DataClass>,
    connected: BTreeSet<DataClass>,
    inflight: HashMap<RequestToken, Inflight>,
    /// Force-idle whose completion ends the current Releasing phase
    release_token: Option<RequestToken>,
    deferred: VecDeque<Deferred>,
    radio: RadioState,
    /// Leaving Idle needs an [`OwnershipGrant`]
    arbitrated: bool,
    next_token: u64,
    effects: Vec<SwitchEffect>,
}

impl TenantSwitch {
    /// Create an idle switch for a tenant
    pub fn new(tenant: TenantId) -> Self {
        Self {
            tenant,
            state: SwitchState::Idle,
            classes: BTreeSet::new(),
            connected: BTreeSet::new(),
            inflight: HashMap::new(),
            release_token: None,
            deferred: VecDeque::new(),
            radio: RadioState::default(),
            arbitrated: false,
            next_token: 1,
            effects: Vec::new(),
        }
    }

    /// Create an idle switch that only leaves Idle when granted
    pub fn arbitrated(tenant: TenantId) -> Self {
        Self {
            arbitrated: true,
            ..Self::new(tenant)
        }
    }

    /// Whether leaving Idle needs an ownership grant
    pub fn is_arbitrated(&self) -> bool {
        self.arbitrated
    }

    /// Tenant this switch serves
    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    /// Current phase
    pub fn state(&self) -> SwitchState {
        self.state
    }

    /// Classes currently requested
    pub fn classes(&self) -> &BTreeSet<DataClass> {
        &self.classes
    }

    /// Requested classes the modem reports connected
    pub fn connected(&self) -> &BTreeSet<DataClass> {
        &self.connected
    }

    /// Last radio state reported by the modem
    pub fn radio(&self) -> RadioState {
        self.radio
    }

    /// Number of connects parked until idle
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Copy of the observable state
    pub fn snapshot(&self) -> TenantSnapshot {
        TenantSnapshot {
            tenant: self.tenant,
            state: self.state,
            classes: self.classes.clone(),
            connected: self.connected.clone(),
            deferred: self.deferred.len(),
            radio: self.radio,
        }
    }

    /// Drain pending effects
    ///
    /// Replies and ownership requests are moved behind everything else so
    /// subscribers hear about a change before anyone acts on it.
    pub fn drain_effects(&mut self) -> Vec<SwitchEffect> {
        let (replies, mut effects): (Vec<_>, Vec<_>) = std::mem::take(&mut self.effects)
            .into_iter()
            .partition(|e| {
                matches!(
                    e,
                    SwitchEffect::Reply { .. } | SwitchEffect::RequestOwnership { .. }
                )
            });
        effects.extend(replies);
        effects
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    /// Process one request from the mailbox
    pub fn handle_request(
        &mut self,
        id: RequestId,
        request: SwitchRequest,
        reply: Option<Responder>,
    ) {
        let before = self.snapshot();

        match request {
            SwitchRequest::Connect(class) => self.connect(id, class, reply, None),
            SwitchRequest::Acquire(class, grant) => self.connect(id, class, reply, Some(grant)),
            SwitchRequest::Disconnect(class) => {
                let outcome = self.disconnect(class);
                self.reply(reply, id, ResponseKind::Outcome(outcome));
            }
            SwitchRequest::RetryConnect => {
                let outcome = self.retry_connect();
                self.reply(reply, id, ResponseKind::Outcome(outcome));
            }
            SwitchRequest::CleanupAll => {
                let outcome = self.cleanup_all();
                self.reply(reply, id, ResponseKind::Outcome(outcome));
            }
            SwitchRequest::IsIdle => {
                let idle = self.state == SwitchState::Idle;
                self.reply(reply, id, ResponseKind::Flag(idle));
            }
            SwitchRequest::IsIdleOrReleasing => {
                let flag = matches!(self.state, SwitchState::Idle | SwitchState::Releasing);
                self.reply(reply, id, ResponseKind::Flag(flag));
            }
            SwitchRequest::Snapshot => {
                let snapshot = self.snapshot();
                self.reply(reply, id, ResponseKind::Snapshot(snapshot));
            }
        }

        self.publish_if_changed(&before);
    }

    /// Process one event from the modem
    pub fn on_modem_event(&mut self, event: ModemEvent) {
        let before = self.snapshot();

        match event {
            ModemEvent::Completed { token, result, .. } => {
                let Some(op) = self.inflight.remove(&token) else {
                    debug!("{}: completion for unknown token {}", self.tenant, token);
                    return;
                };
                self.on_completed(token, op, result);
            }
            ModemEvent::ClassConnected { class, .. } => self.on_class_connected(class),
            ModemEvent::RadioStateChanged { state, .. } => self.on_radio_state(state),
        }

        self.publish_if_changed(&before);
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    fn connect(
        &mut self,
        id: RequestId,
        class: DataClass,
        reply: Option<Responder>,
        grant: Option<OwnershipGrant>,
    ) {
        if self.radio.is_off() {
            let outcome = RequestOutcome::Failed(FailReason::RadioOff(self.tenant));
            self.reply(reply, id, ResponseKind::Outcome(outcome));
            return;
        }

        if self.state == SwitchState::Releasing {
            debug!(
                "{}: deferring connect {} until idle ({} parked)",
                self.tenant,
                class,
                self.deferred.len() + 1
            );
            self.deferred.push_back(Deferred { id, class, reply });
            return;
        }

        if self.state == SwitchState::Idle && self.arbitrated {
            let Some(grant) = grant else {
                debug!("{}: asking for the data path for {}", self.tenant, class);
                self.effects
                    .push(SwitchEffect::RequestOwnership { id, class, reply });
                return;
            };
            debug!("{}: {} granted for {}", self.tenant, grant, class);
        }

        let outcome = match self.state {
            SwitchState::Idle => {
                self.classes.insert(class.clone());
                self.issue_enable(class);
                self.transition(SwitchState::Acquiring);
                RequestOutcome::Started
            }
            _ if self.connected.contains(&class) => RequestOutcome::AlreadyActive,
            // Enable already in flight
            _ if self.classes.contains(&class) => RequestOutcome::Started,
            _ => {
                self.classes.insert(class.clone());
                self.issue_enable(class);
                RequestOutcome::Started
            }
        };
        self.reply(reply, id, ResponseKind::Outcome(outcome));
    }

    fn disconnect(&mut self, class: DataClass) -> RequestOutcome {
        if !matches!(self.state, SwitchState::Acquiring | SwitchState::Active) {
            return RequestOutcome::AlreadyInactive;
        }
        if !self.classes.remove(&class) {
            return RequestOutcome::AlreadyInactive;
        }

        self.connected.remove(&class);
        self.issue_disable(class);

        if self.classes.is_empty() {
            self.begin_release();
        } else if self.connected.is_empty() {
            self.transition(SwitchState::Acquiring);
        }
        RequestOutcome::Started
    }

    fn retry_connect(&mut self) -> RequestOutcome {
        if !matches!(self.state, SwitchState::Acquiring | SwitchState::Active) {
            return RequestOutcome::AlreadyInactive;
        }

        let waiting: Vec<DataClass> = self
            .classes
            .difference(&self.connected)
            .cloned()
            .collect();
        if waiting.is_empty() {
            return RequestOutcome::AlreadyActive;
        }

        for class in waiting {
            let in_flight = self
                .inflight
                .values()
                .any(|op| matches!(op, Inflight::Enable(c) if *c == class));
            if !in_flight {
                debug!("{}: retrying enable of {}", self.tenant, class);
                self.issue_enable(class);
            }
        }
        RequestOutcome::Started
    }

    fn cleanup_all(&mut self) -> RequestOutcome {
        match self.state {
            SwitchState::Idle => {
                // Unconditional on the modem side; harmless when nothing is held
                let token = self.allocate(Inflight::ForceIdle);
                self.effects.push(SwitchEffect::ForceIdle { token });
                RequestOutcome::AlreadyInactive
            }
            SwitchState::Acquiring | SwitchState::Active => {
                self.begin_release();
                RequestOutcome::Started
            }
            SwitchState::Releasing => RequestOutcome::AlreadyInactive,
        }
    }

    // -------------------------------------------------------------------------
    // Modem events
    // -------------------------------------------------------------------------

    fn on_completed(
        &mut self,
        token: RequestToken,
        op: Inflight,
        result: Result<(), ModemError>,
    ) {
        match (op, result) {
            (Inflight::Enable(_), Ok(())) | (Inflight::Disable(_), Ok(())) => {}
            (Inflight::Enable(class), Err(e)) => {
                warn!("{}: enable {} failed: {}", self.tenant, class, e);
                let tracked = self.classes.remove(&class);
                self.connected.remove(&class);
                self.effects.push(SwitchEffect::Event(SwitchEvent::RequestFailed {
                    tenant: self.tenant,
                    class: Some(class),
                    reason: FailReason::Transport(e),
                }));

                if tracked && self.state.is_occupying() && self.state != SwitchState::Releasing {
                    if self.classes.is_empty() {
                        self.begin_release();
                    } else if self.connected.is_empty() {
                        self.transition(SwitchState::Acquiring);
                    }
                }
            }
            (Inflight::Disable(class), Err(e)) => {
                warn!("{}: disable {} failed: {}", self.tenant, class, e);
                self.effects.push(SwitchEffect::Event(SwitchEvent::RequestFailed {
                    tenant: self.tenant,
                    class: Some(class),
                    reason: FailReason::Transport(e),
                }));
            }
            (Inflight::ForceIdle, result) => {
                if let Err(e) = result {
                    warn!("{}: force-idle reported {}, treating as idle", self.tenant, e);
                }
                if self.state == SwitchState::Releasing && self.release_token == Some(token) {
                    self.complete_release();
                } else {
                    debug!(
                        "{}: ignoring force-idle completion {} while {}",
                        self.tenant, token, self.state
                    );
                }
            }
        }
    }

    fn on_class_connected(&mut self, class: DataClass) {
        let live = matches!(self.state, SwitchState::Acquiring | SwitchState::Active);
        if !live || !self.classes.contains(&class) {
            debug!(
                "{}: ignoring classConnected {} while {}",
                self.tenant, class, self.state
            );
            return;
        }

        if self.connected.insert(class.clone()) {
            info!("{}: {} connected", self.tenant, class);
            self.effects.push(SwitchEffect::Event(SwitchEvent::ClassConnected {
                tenant: self.tenant,
                class,
            }));
        }
        self.transition(SwitchState::Active);
    }

    fn on_radio_state(&mut self, state: RadioState) {
        if state == self.radio {
            return;
        }

        let from = self.radio;
        self.radio = state;
        info!("{}: radio {} -> {}", self.tenant, from, state);
        self.effects.push(SwitchEffect::Notice(SwitchNotice::RadioChanged {
            tenant: self.tenant,
            from,
            to: state,
        }));
        self.effects.push(SwitchEffect::Event(SwitchEvent::RadioStateChanged {
            tenant: self.tenant,
            from,
            to: state,
        }));

        // The data path is gone with the radio
        if state.is_off() && matches!(self.state, SwitchState::Acquiring | SwitchState::Active) {
            self.begin_release();
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn begin_release(&mut self) {
        let token = self.allocate(Inflight::ForceIdle);
        self.release_token = Some(token);
        self.effects.push(SwitchEffect::ForceIdle { token });
        self.transition(SwitchState::Releasing);
    }

    fn complete_release(&mut self) {
        self.release_token = None;
        self.classes.clear();
        self.connected.clear();
        self.transition(SwitchState::Idle);

        let parked = std::mem::take(&mut self.deferred);
        self.effects.push(SwitchEffect::Notice(SwitchNotice::EnteredIdle {
            tenant: self.tenant,
            replaying: parked.iter().map(|d| d.class.clone()).collect(),
        }));

        for Deferred { id, class, reply } in parked {
            debug!("{}: replaying deferred connect {}", self.tenant, class);
            self.effects.push(SwitchEffect::Event(SwitchEvent::DeferredReplayed {
                tenant: self.tenant,
                class: class.clone(),
            }));
            self.connect(id, class, reply, None);
        }
    }

    fn transition(&mut self, to: SwitchState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        info!("{}: {} -> {}", self.tenant, from, to);
        self.effects.push(SwitchEffect::Event(SwitchEvent::TenantStateChanged {
            tenant: self.tenant,
            from,
            to,
        }));
    }

    fn allocate(&mut self, op: Inflight) -> RequestToken {
        let token = RequestToken(self.next_token);
        self.next_token += 1;
        self.inflight.insert(token, op);
        token
    }

    fn issue_enable(&mut self, class: DataClass) {
        let token = self.allocate(Inflight::Enable(class.clone()));
        self.effects.push(SwitchEffect::Enable { class, token });
    }

    fn issue_disable(&mut self, class: DataClass) {
        let token = self.allocate(Inflight::Disable(class.clone()));
        self.effects.push(SwitchEffect::Disable { class, token });
    }

    fn reply(&mut self, reply: Option<Responder>, id: RequestId, kind: ResponseKind) {
        if let Some(reply) = reply {
            self.effects.push(SwitchEffect::Reply {
                reply,
                response: SwitchResponse { id, kind },
            });
        }
    }

    fn publish_if_changed(&mut self, before: &TenantSnapshot) {
        let after = self.snapshot();
        if after != *before {
            self.effects
                .push(SwitchEffect::Notice(SwitchNotice::Updated { snapshot: after }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    const T: TenantId = TenantId(0);

    fn class(label: &str) -> DataClass {
        label.parse().unwrap()
    }

    /// Send a request with a reply channel and return the answer
    fn ask(sw: &mut TenantSwitch, request: SwitchRequest) -> Option<ResponseKind> {
        let (tx, mut rx) = oneshot::channel();
        sw.handle_request(RequestId(1), request, Some(tx));
        for effect in sw.drain_effects() {
            if let SwitchEffect::Reply { reply, response } = effect {
                let _ = reply.send(response);
            }
        }
        rx.try_recv().ok().map(|r| r.kind)
    }

    fn outcome(sw: &mut TenantSwitch, request: SwitchRequest) -> RequestOutcome {
        match ask(sw, request) {
            Some(ResponseKind::Outcome(o)) => o,
            other => panic!("expected outcome, got {:?}", other),
        }
    }

    /// Send a request and return the effects without executing replies
    fn effects_of(sw: &mut TenantSwitch, request: SwitchRequest) -> Vec<SwitchEffect> {
        sw.handle_request(RequestId(1), request, None);
        sw.drain_effects()
    }

    fn tokens(effects: &[SwitchEffect]) -> Vec<RequestToken> {
        effects
            .iter()
            .filter_map(|e| match e {
                SwitchEffect::Enable { token, .. }
                | SwitchEffect::Disable { token, .. }
                | SwitchEffect::ForceIdle { token } => Some(*token),
                _ => None,
            })
            .collect()
    }

    fn force_idle_token(effects: &[SwitchEffect]) -> RequestToken {
        effects
            .iter()
            .find_map(|e| match e {
                SwitchEffect::ForceIdle { token } => Some(*token),
                _ => None,
            })
            .expect("force-idle issued")
    }

    fn complete(sw: &mut TenantSwitch, token: RequestToken, result: Result<(), ModemError>) {
        sw.on_modem_event(ModemEvent::Completed {
            tenant: T,
            token,
            result,
        });
    }

    fn connected(sw: &mut TenantSwitch, label: &str) {
        sw.on_modem_event(ModemEvent::ClassConnected {
            tenant: T,
            class: class(label),
        });
    }

    fn has_idle_notice(effects: &[SwitchEffect]) -> bool {
        effects
            .iter()
            .any(|e| matches!(e, SwitchEffect::Notice(SwitchNotice::EnteredIdle { .. })))
    }

    #[test]
    fn test_connect_from_idle_acquires() {
        let mut sw = TenantSwitch::new(T);

        let effects = effects_of(&mut sw, SwitchRequest::Connect(class("default")));

        assert_eq!(sw.state(), SwitchState::Acquiring);
        assert!(sw.classes().contains(&class("default")));
        assert!(effects
            .iter()
            .any(|e| matches!(e, SwitchEffect::Enable { class, .. } if class.is_default())));
        assert!(effects
            .iter()
            .any(|e| matches!(e, SwitchEffect::Notice(SwitchNotice::Updated { .. }))));
    }

    #[test]
    fn test_class_connected_activates() {
        let mut sw = TenantSwitch::new(T);
        assert_eq!(
            outcome(&mut sw, SwitchRequest::Connect(class("default"))),
            RequestOutcome::Started
        );

        connected(&mut sw, "default");

        assert_eq!(sw.state(), SwitchState::Active);
        assert_eq!(
            outcome(&mut sw, SwitchRequest::Connect(class("default"))),
            RequestOutcome::AlreadyActive
        );
    }

    #[test]
    fn test_connect_in_flight_class_does_not_reissue() {
        let mut sw = TenantSwitch::new(T);
        effects_of(&mut sw, SwitchRequest::Connect(class("mms")));

        let effects = effects_of(&mut sw, SwitchRequest::Connect(class("mms")));

        assert!(tokens(&effects).is_empty());
        assert_eq!(sw.classes().len(), 1);
    }

    #[test]
    fn test_fan_out_while_acquiring() {
        let mut sw = TenantSwitch::new(T);
        effects_of(&mut sw, SwitchRequest::Connect(class("default")));

        let effects = effects_of(&mut sw, SwitchRequest::Connect(class("supl")));

        assert_eq!(sw.state(), SwitchState::Acquiring);
        assert_eq!(tokens(&effects).len(), 1);
        assert_eq!(sw.classes().len(), 2);
    }

    #[test]
    fn test_disconnect_with_nothing_tracked_is_inactive() {
        let mut sw = TenantSwitch::new(T);

        sw.handle_request(RequestId(9), SwitchRequest::Disconnect(class("mms")), None);
        let effects = sw.drain_effects();

        assert!(effects.is_empty(), "no state change expected: {:?}", effects);
        assert_eq!(
            outcome(&mut sw, SwitchRequest::Disconnect(class("mms"))),
            RequestOutcome::AlreadyInactive
        );
        assert_eq!(sw.state(), SwitchState::Idle);
    }

    #[test]
    fn test_last_disconnect_releases() {
        let mut sw = TenantSwitch::new(T);
        effects_of(&mut sw, SwitchRequest::Connect(class("default")));
        connected(&mut sw, "default");
        sw.drain_effects();

        let effects = effects_of(&mut sw, SwitchRequest::Disconnect(class("default")));

        assert_eq!(sw.state(), SwitchState::Releasing);
        let disable_then_idle: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                SwitchEffect::Disable { .. } => Some("disable"),
                SwitchEffect::ForceIdle { .. } => Some("idle"),
                _ => None,
            })
            .collect();
        assert_eq!(disable_then_idle, vec!["disable", "idle"]);
    }

    #[test]
    fn test_partial_disconnect_keeps_state() {
        let mut sw = TenantSwitch::new(T);
        effects_of(&mut sw, SwitchRequest::Connect(class("default")));
        effects_of(&mut sw, SwitchRequest::Connect(class("mms")));
        connected(&mut sw, "default");
        connected(&mut sw, "mms");

        assert_eq!(
            outcome(&mut sw, SwitchRequest::Disconnect(class("mms"))),
            RequestOutcome::Started
        );
        assert_eq!(sw.state(), SwitchState::Active);
        assert!(!sw.classes().contains(&class("mms")));
    }

    #[test]
    fn test_connect_then_disconnect_round_trip() {
        let mut sw = TenantSwitch::new(T);
        effects_of(&mut sw, SwitchRequest::Connect(class("supl")));

        let effects = effects_of(&mut sw, SwitchRequest::Disconnect(class("supl")));
        let token = force_idle_token(&effects);
        complete(&mut sw, token, Ok(()));
        let effects = sw.drain_effects();

        assert_eq!(sw.state(), SwitchState::Idle);
        assert!(sw.classes().is_empty());
        assert!(has_idle_notice(&effects));
    }

    #[test]
    fn test_connect_while_releasing_is_deferred_and_replayed() {
        let mut sw = TenantSwitch::new(T);
        effects_of(&mut sw, SwitchRequest::Connect(class("default")));
        connected(&mut sw, "default");
        let effects = effects_of(&mut sw, SwitchRequest::CleanupAll);
        let release = force_idle_token(&effects);

        let (tx, mut rx) = oneshot::channel();
        sw.handle_request(RequestId(42), SwitchRequest::Connect(class("mms")), Some(tx));
        let effects = sw.drain_effects();
        assert!(tokens(&effects).is_empty(), "nothing sent while releasing");
        assert_eq!(sw.deferred_len(), 1);

        complete(&mut sw, release, Ok(()));
        let effects = sw.drain_effects();

        match effects.iter().find_map(|e| match e {
            SwitchEffect::Notice(SwitchNotice::EnteredIdle { replaying, .. }) => Some(replaying),
            _ => None,
        }) {
            Some(replaying) => assert_eq!(replaying, &vec![class("mms")]),
            None => panic!("missing idle notice"),
        }
        assert_eq!(sw.state(), SwitchState::Acquiring);
        assert_eq!(sw.classes().iter().collect::<Vec<_>>(), vec![&class("mms")]);

        for effect in effects {
            if let SwitchEffect::Reply { reply, response } = effect {
                let _ = reply.send(response);
            }
        }
        let response = rx.try_recv().unwrap();
        assert_eq!(response.id, RequestId(42));
        assert_eq!(response.kind, ResponseKind::Outcome(RequestOutcome::Started));
    }

    #[test]
    fn test_disconnect_while_releasing_is_inactive() {
        let mut sw = TenantSwitch::new(T);
        effects_of(&mut sw, SwitchRequest::Connect(class("default")));
        effects_of(&mut sw, SwitchRequest::CleanupAll);

        assert_eq!(
            outcome(&mut sw, SwitchRequest::Disconnect(class("default"))),
            RequestOutcome::AlreadyInactive
        );
    }

    #[test]
    fn test_cleanup_when_idle_stays_idle() {
        let mut sw = TenantSwitch::new(T);

        let effects = effects_of(&mut sw, SwitchRequest::CleanupAll);
        let token = force_idle_token(&effects);
        complete(&mut sw, token, Ok(()));
        let effects = sw.drain_effects();

        assert_eq!(sw.state(), SwitchState::Idle);
        assert!(!has_idle_notice(&effects));
    }

    #[test]
    fn test_stale_force_idle_does_not_confirm_release() {
        let mut sw = TenantSwitch::new(T);
        let idle_effects = effects_of(&mut sw, SwitchRequest::CleanupAll);
        let stale = force_idle_token(&idle_effects);

        effects_of(&mut sw, SwitchRequest::Connect(class("default")));
        let effects = effects_of(&mut sw, SwitchRequest::Disconnect(class("default")));
        let current = force_idle_token(&effects);

        complete(&mut sw, stale, Ok(()));
        assert_eq!(sw.state(), SwitchState::Releasing);

        complete(&mut sw, current, Ok(()));
        assert_eq!(sw.state(), SwitchState::Idle);
    }

    #[test]
    fn test_enable_failure_releases_when_nothing_left() {
        let mut sw = TenantSwitch::new(T);
        let effects = effects_of(&mut sw, SwitchRequest::Connect(class("default")));
        let enable = tokens(&effects)[0];

        complete(
            &mut sw,
            enable,
            Err(ModemError::CommandFailed("no service".into())),
        );
        let effects = sw.drain_effects();

        assert_eq!(sw.state(), SwitchState::Releasing);
        assert!(effects.iter().any(|e| matches!(
            e,
            SwitchEffect::Event(SwitchEvent::RequestFailed { .. })
        )));
    }

    #[test]
    fn test_enable_failure_keeps_other_classes() {
        let mut sw = TenantSwitch::new(T);
        effects_of(&mut sw, SwitchRequest::Connect(class("default")));
        connected(&mut sw, "default");
        let effects = effects_of(&mut sw, SwitchRequest::Connect(class("mms")));
        let enable = tokens(&effects)[0];

        complete(&mut sw, enable, Err(ModemError::Busy { holder: TenantId(1) }));

        assert_eq!(sw.state(), SwitchState::Active);
        assert!(!sw.classes().contains(&class("mms")));
    }

    #[test]
    fn test_radio_off_rejects_connect() {
        let mut sw = TenantSwitch::new(T);
        sw.on_modem_event(ModemEvent::RadioStateChanged {
            tenant: T,
            state: RadioState::Off,
        });
        sw.drain_effects();

        assert_eq!(
            outcome(&mut sw, SwitchRequest::Connect(class("default"))),
            RequestOutcome::Failed(FailReason::RadioOff(T))
        );
        assert_eq!(sw.state(), SwitchState::Idle);
    }

    #[test]
    fn test_radio_off_while_active_releases() {
        let mut sw = TenantSwitch::new(T);
        effects_of(&mut sw, SwitchRequest::Connect(class("default")));
        connected(&mut sw, "default");

        sw.on_modem_event(ModemEvent::RadioStateChanged {
            tenant: T,
            state: RadioState::Off,
        });
        let effects = sw.drain_effects();

        assert_eq!(sw.state(), SwitchState::Releasing);
        assert!(effects
            .iter()
            .any(|e| matches!(e, SwitchEffect::Notice(SwitchNotice::RadioChanged { .. }))));
    }

    #[test]
    fn test_retry_connect_reissues_unconnected() {
        let mut sw = TenantSwitch::new(T);
        let effects = effects_of(&mut sw, SwitchRequest::Connect(class("default")));
        complete(&mut sw, tokens(&effects)[0], Ok(()));
        sw.drain_effects();

        let effects = effects_of(&mut sw, SwitchRequest::RetryConnect);
        assert_eq!(tokens(&effects).len(), 1);

        connected(&mut sw, "default");
        assert_eq!(
            outcome(&mut sw, SwitchRequest::RetryConnect),
            RequestOutcome::AlreadyActive
        );
    }

    #[test]
    fn test_idle_queries() {
        let mut sw = TenantSwitch::new(T);
        assert_eq!(ask(&mut sw, SwitchRequest::IsIdle), Some(ResponseKind::Flag(true)));

        effects_of(&mut sw, SwitchRequest::Connect(class("default")));
        effects_of(&mut sw, SwitchRequest::CleanupAll);

        assert_eq!(ask(&mut sw, SwitchRequest::IsIdle), Some(ResponseKind::Flag(false)));
        assert_eq!(
            ask(&mut sw, SwitchRequest::IsIdleOrReleasing),
            Some(ResponseKind::Flag(true))
        );
    }

    #[test]
    fn test_class_connected_ignored_when_untracked() {
        let mut sw = TenantSwitch::new(T);
        connected(&mut sw, "default");

        assert_eq!(sw.state(), SwitchState::Idle);
        assert!(sw.drain_effects().is_empty());
    }

    fn ownership_request(effects: &[SwitchEffect]) -> Option<(RequestId, &DataClass)> {
        effects.iter().find_map(|e| match e {
            SwitchEffect::RequestOwnership { id, class, .. } => Some((*id, class)),
            _ => None,
        })
    }

    #[test]
    fn test_arbitrated_connect_from_idle_asks_for_ownership() {
        let mut sw = TenantSwitch::arbitrated(T);

        let effects = effects_of(&mut sw, SwitchRequest::Connect(class("default")));

        assert_eq!(sw.state(), SwitchState::Idle);
        assert!(sw.classes().is_empty());
        assert!(tokens(&effects).is_empty(), "modem untouched: {:?}", effects);
        assert_eq!(
            ownership_request(&effects),
            Some((RequestId(1), &class("default")))
        );
    }

    #[test]
    fn test_arbitrated_acquire_leaves_idle() {
        let mut sw = TenantSwitch::arbitrated(T);

        assert_eq!(
            outcome(
                &mut sw,
                SwitchRequest::Acquire(class("mms"), OwnershipGrant::new(7))
            ),
            RequestOutcome::Started
        );
        assert_eq!(sw.state(), SwitchState::Acquiring);

        // Already occupying: more classes do not need another grant
        let effects = effects_of(&mut sw, SwitchRequest::Connect(class("supl")));
        assert_eq!(tokens(&effects).len(), 1);
        assert!(ownership_request(&effects).is_none());
    }

    #[test]
    fn test_arbitrated_replay_asks_again() {
        let mut sw = TenantSwitch::arbitrated(T);
        effects_of(
            &mut sw,
            SwitchRequest::Acquire(class("default"), OwnershipGrant::new(1)),
        );
        connected(&mut sw, "default");
        let effects = effects_of(&mut sw, SwitchRequest::CleanupAll);
        let release = force_idle_token(&effects);

        sw.handle_request(
            RequestId(42),
            SwitchRequest::Acquire(class("mms"), OwnershipGrant::new(2)),
            None,
        );
        assert_eq!(sw.deferred_len(), 1);
        sw.drain_effects();

        complete(&mut sw, release, Ok(()));
        let effects = sw.drain_effects();

        assert_eq!(sw.state(), SwitchState::Idle);
        assert!(tokens(&effects).is_empty());
        assert_eq!(ownership_request(&effects), Some((RequestId(42), &class("mms"))));
        // The arbitrator hears about Idle before the request arrives
        let idle_at = effects
            .iter()
            .position(|e| matches!(e, SwitchEffect::Notice(SwitchNotice::EnteredIdle { .. })))
            .unwrap();
        let request_at = effects
            .iter()
            .position(|e| matches!(e, SwitchEffect::RequestOwnership { .. }))
            .unwrap();
        assert!(idle_at < request_at);
    }

    #[test]
    fn test_standalone_acquire_behaves_like_connect() {
        let mut sw = TenantSwitch::new(T);
        assert!(!sw.is_arbitrated());

        effects_of(
            &mut sw,
            SwitchRequest::Acquire(class("default"), OwnershipGrant::new(3)),
        );

        assert_eq!(sw.state(), SwitchState::Acquiring);
    }

    #[test]
    fn test_replies_drain_after_notices() {
        let mut sw = TenantSwitch::new(T);
        let (tx, _rx) = oneshot::channel();
        sw.handle_request(RequestId(1), SwitchRequest::Connect(class("default")), Some(tx));

        let effects = sw.drain_effects();
        assert!(matches!(effects.last(), Some(SwitchEffect::Reply { .. })));
    }
}
