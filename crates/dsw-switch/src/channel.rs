//! Request/response transport to a tenant switch
//!
//! Each tenant switch reads a bounded mailbox of [`SwitchMessage`]s. A
//! [`SwitchChannel`] is the sending side: it stamps every request with a
//! [`RequestId`], hands a oneshot along for the answer and checks that the
//! answer it gets back belongs to the request it sent.
//!
//! Three calling styles are offered:
//!
//! - **async**: `connect(..).await` and friends
//! - **fire-and-forget**: `req_connect(..)`, which never waits for capacity
//!   or an answer
//! - **blocking**: `connect_sync(..)` for callers on plain threads. These
//!   park the calling thread and must not be used from inside the runtime.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dsw_modem::{DataClass, TenantId};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{FailReason, SwitchError};
use crate::events::{NoticeFilter, SwitchNotice};
use crate::state::{RequestOutcome, TenantSnapshot};

/// Correlation id for one request on one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req{}", self.0)
    }
}

/// Handle returned by a subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Permission from the arbitrator to take the data path
///
/// Only the arbitrator creates these. An arbitrated switch leaves Idle only
/// for a [`SwitchRequest::Acquire`] carrying one, so holding a
/// [`SwitchChannel`] is not enough to put a tenant on the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnershipGrant(u64);

impl OwnershipGrant {
    pub(crate) fn new(serial: u64) -> Self {
        Self(serial)
    }

    /// Serial number, unique per arbitrator
    pub fn serial(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnershipGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grant{}", self.0)
    }
}

/// Requests a tenant switch understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchRequest {
    /// Bring up a class
    ///
    /// On an idle arbitrated switch this asks the arbitrator first.
    Connect(DataClass),
    /// Bring up a class the arbitrator granted
    Acquire(DataClass, OwnershipGrant),
    /// Tear down a class
    Disconnect(DataClass),
    /// Re-issue enables for classes not yet connected
    RetryConnect,
    /// Force-idle everything
    CleanupAll,
    /// Query: phase is Idle
    IsIdle,
    /// Query: phase is Idle or Releasing
    IsIdleOrReleasing,
    /// Query: full snapshot
    Snapshot,
}

/// Body of a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// Answer to connect/disconnect/retry/cleanup
    Outcome(RequestOutcome),
    /// Answer to a boolean query
    Flag(bool),
    /// Answer to a snapshot query
    Snapshot(TenantSnapshot),
}

/// Reply correlated to its request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchResponse {
    /// Id of the request being answered
    pub id: RequestId,
    /// The answer
    pub kind: ResponseKind,
}

/// Where a tenant switch sends its answer
pub type Responder = oneshot::Sender<SwitchResponse>;

/// Messages read by a tenant switch actor
#[derive(Debug)]
pub enum SwitchMessage {
    /// A request, optionally expecting a reply
    Request {
        id: RequestId,
        request: SwitchRequest,
        reply: Option<Responder>,
    },

    /// Register a notice subscriber
    Subscribe {
        filter: NoticeFilter,
        sink: mpsc::UnboundedSender<SwitchNotice>,
        response: oneshot::Sender<SubscriptionId>,
    },

    /// Remove a notice subscriber; answers whether it was registered
    Unsubscribe {
        id: SubscriptionId,
        response: oneshot::Sender<bool>,
    },

    /// Stop the actor
    Shutdown,
}

/// Create a channel pair for a tenant switch
///
/// Returns (SwitchChannel for callers, Receiver for the switch actor)
pub fn create_switch_channel(
    tenant: TenantId,
    buffer_size: usize,
) -> (SwitchChannel, mpsc::Receiver<SwitchMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (SwitchChannel::new(tenant, tx), rx)
}

/// Caller side of a tenant switch mailbox
#[derive(Debug, Clone)]
pub struct SwitchChannel {
    tenant: TenantId,
    tx: mpsc::Sender<SwitchMessage>,
    next_id: Arc<AtomicU64>,
}

impl SwitchChannel {
    /// Wrap the sender of a tenant switch mailbox
    pub fn new(tenant: TenantId, tx: mpsc::Sender<SwitchMessage>) -> Self {
        Self {
            tenant,
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Tenant served by this channel
    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    fn next_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // -------------------------------------------------------------------------
    // Async requests
    // -------------------------------------------------------------------------

    /// Send a request and hand back the receiver for its reply
    pub async fn send_request(
        &self,
        request: SwitchRequest,
    ) -> Result<(RequestId, oneshot::Receiver<SwitchResponse>), SwitchError> {
        let id = self.next_id();
        let (reply, rx) = oneshot::channel();
        debug!("{} {} {:?}", self.tenant, id, request);
        self.tx
            .send(SwitchMessage::Request {
                id,
                request,
                reply: Some(reply),
            })
            .await
            .map_err(|_| SwitchError::Closed(self.tenant))?;
        Ok((id, rx))
    }

    async fn call_outcome(&self, request: SwitchRequest) -> RequestOutcome {
        match self.send_request(request).await {
            Ok((id, rx)) => outcome_from(id, rx.await.ok()),
            Err(_) => RequestOutcome::Failed(FailReason::NoReply),
        }
    }

    async fn call_flag(&self, request: SwitchRequest) -> bool {
        match self.send_request(request).await {
            Ok((id, rx)) => flag_from(id, rx.await.ok()),
            Err(_) => false,
        }
    }

    /// Bring up a class
    ///
    /// An idle arbitrated switch relays this to the arbitrator, so the answer
    /// may be `Started` for a request parked behind another tenant.
    pub async fn connect(&self, class: DataClass) -> RequestOutcome {
        self.call_outcome(SwitchRequest::Connect(class)).await
    }

    /// Tear down a class
    pub async fn disconnect(&self, class: DataClass) -> RequestOutcome {
        self.call_outcome(SwitchRequest::Disconnect(class)).await
    }

    /// Re-issue enables for classes that have not connected yet
    pub async fn retry_connect(&self) -> RequestOutcome {
        self.call_outcome(SwitchRequest::RetryConnect).await
    }

    /// Force-idle everything the tenant holds
    pub async fn cleanup_all(&self) -> RequestOutcome {
        self.call_outcome(SwitchRequest::CleanupAll).await
    }

    /// Whether the switch is Idle
    pub async fn is_idle(&self) -> bool {
        self.call_flag(SwitchRequest::IsIdle).await
    }

    /// Whether the switch is Idle or Releasing
    pub async fn is_idle_or_releasing(&self) -> bool {
        self.call_flag(SwitchRequest::IsIdleOrReleasing).await
    }

    /// Full snapshot, or `None` if the switch has stopped
    pub async fn snapshot(&self) -> Option<TenantSnapshot> {
        let (id, rx) = self.send_request(SwitchRequest::Snapshot).await.ok()?;
        match rx.await.ok()? {
            SwitchResponse {
                id: reply_id,
                kind: ResponseKind::Snapshot(snapshot),
            } if reply_id == id => Some(snapshot),
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Register for notices from this switch
    pub async fn subscribe(
        &self,
        filter: NoticeFilter,
        sink: mpsc::UnboundedSender<SwitchNotice>,
    ) -> Result<SubscriptionId, SwitchError> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(SwitchMessage::Subscribe {
                filter,
                sink,
                response,
            })
            .await
            .map_err(|_| SwitchError::Closed(self.tenant))?;
        rx.await.map_err(|_| SwitchError::Closed(self.tenant))
    }

    /// Remove a subscription; `false` if it was unknown or the switch stopped
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let (response, rx) = oneshot::channel();
        if self
            .tx
            .send(SwitchMessage::Unsubscribe { id, response })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Ask the switch actor to stop
    pub async fn shutdown(&self) {
        let _ = self.tx.send(SwitchMessage::Shutdown).await;
    }

    // -------------------------------------------------------------------------
    // Fire-and-forget
    // -------------------------------------------------------------------------

    fn post(&self, request: SwitchRequest) -> Result<(), SwitchError> {
        let id = self.next_id();
        debug!("{} {} {:?} (no reply)", self.tenant, id, request);
        self.tx
            .try_send(SwitchMessage::Request {
                id,
                request,
                reply: None,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SwitchError::MailboxFull(self.tenant),
                mpsc::error::TrySendError::Closed(_) => SwitchError::Closed(self.tenant),
            })
    }

    /// Queue a connect without waiting for capacity or an answer
    pub fn req_connect(&self, class: DataClass) -> Result<(), SwitchError> {
        self.post(SwitchRequest::Connect(class))
    }

    /// Queue a disconnect without waiting for capacity or an answer
    pub fn req_disconnect(&self, class: DataClass) -> Result<(), SwitchError> {
        self.post(SwitchRequest::Disconnect(class))
    }

    /// Queue a force-idle without waiting for capacity or an answer
    pub fn req_cleanup_all(&self) -> Result<(), SwitchError> {
        self.post(SwitchRequest::CleanupAll)
    }

    // -------------------------------------------------------------------------
    // Blocking
    // -------------------------------------------------------------------------

    fn send_blocking(&self, request: SwitchRequest) -> Option<(RequestId, SwitchResponse)> {
        let id = self.next_id();
        let (reply, rx) = oneshot::channel();
        self.tx
            .blocking_send(SwitchMessage::Request {
                id,
                request,
                reply: Some(reply),
            })
            .ok()?;
        rx.blocking_recv().ok().map(|response| (id, response))
    }

    /// Blocking connect for callers outside the runtime
    pub fn connect_sync(&self, class: DataClass) -> RequestOutcome {
        match self.send_blocking(SwitchRequest::Connect(class)) {
            Some((id, response)) => outcome_from(id, Some(response)),
            None => RequestOutcome::Failed(FailReason::NoReply),
        }
    }

    /// Blocking disconnect for callers outside the runtime
    pub fn disconnect_sync(&self, class: DataClass) -> RequestOutcome {
        match self.send_blocking(SwitchRequest::Disconnect(class)) {
            Some((id, response)) => outcome_from(id, Some(response)),
            None => RequestOutcome::Failed(FailReason::NoReply),
        }
    }

    /// Blocking idle query; `false` if no valid answer arrives
    pub fn is_idle_sync(&self) -> bool {
        self.send_blocking(SwitchRequest::IsIdle)
            .is_some_and(|(id, response)| flag_from(id, Some(response)))
    }

    /// Blocking idle-or-releasing query; `false` if no valid answer arrives
    pub fn is_idle_or_releasing_sync(&self) -> bool {
        self.send_blocking(SwitchRequest::IsIdleOrReleasing)
            .is_some_and(|(id, response)| flag_from(id, Some(response)))
    }
}

/// Translate a reply into an outcome, rejecting missing or foreign replies
pub(crate) fn outcome_from(id: RequestId, response: Option<SwitchResponse>) -> RequestOutcome {
    match response {
        None => RequestOutcome::Failed(FailReason::NoReply),
        Some(SwitchResponse {
            id: reply_id,
            kind: ResponseKind::Outcome(outcome),
        }) if reply_id == id => outcome,
        Some(_) => RequestOutcome::Failed(FailReason::MismatchedReply),
    }
}

fn flag_from(id: RequestId, response: Option<SwitchResponse>) -> bool {
    matches!(
        response,
        Some(SwitchResponse {
            id: reply_id,
            kind: ResponseKind::Flag(true),
        }) if reply_id == id
    )
}
