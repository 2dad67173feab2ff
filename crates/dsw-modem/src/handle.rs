//! Handle for submitting commands to the modem actor

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::class::DataClass;
use crate::command::{ModemCommand, ModemEvent, RequestToken};
use crate::error::ModemError;
use crate::tenant::TenantId;

/// Clonable sender side of the modem actor's inbox
///
/// All data-path commands are fire-and-forget: the returned `Result` only
/// reports whether the command reached the modem. Outcomes arrive later on
/// the tenant's event sink.
#[derive(Debug, Clone)]
pub struct ModemHandle {
    tx: mpsc::Sender<ModemCommand>,
}

impl ModemHandle {
    /// Wrap the modem actor's command sender
    pub fn new(tx: mpsc::Sender<ModemCommand>) -> Self {
        Self { tx }
    }

    /// Create a handle together with the receiver a modem implementation reads
    pub fn channel(buffer_size: usize) -> (Self, mpsc::Receiver<ModemCommand>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (Self::new(tx), rx)
    }

    /// Register the event sink for a tenant
    pub async fn attach(
        &self,
        tenant: TenantId,
        events: mpsc::UnboundedSender<ModemEvent>,
    ) -> Result<(), ModemError> {
        self.submit(ModemCommand::Attach { tenant, events }).await
    }

    /// Request a class be brought up
    pub async fn enable_class(
        &self,
        tenant: TenantId,
        class: DataClass,
        token: RequestToken,
    ) -> Result<(), ModemError> {
        self.submit(ModemCommand::EnableClass {
            tenant,
            class,
            token,
        })
        .await
    }

    /// Request a class be torn down
    pub async fn disable_class(
        &self,
        tenant: TenantId,
        class: DataClass,
        token: RequestToken,
    ) -> Result<(), ModemError> {
        self.submit(ModemCommand::DisableClass {
            tenant,
            class,
            token,
        })
        .await
    }

    /// Detach everything the tenant holds
    pub async fn force_idle(&self, tenant: TenantId, token: RequestToken) -> Result<(), ModemError> {
        self.submit(ModemCommand::ForceIdle { tenant, token }).await
    }

    /// Ask whether the tenant's radio supports a class
    ///
    /// A closed modem answers `false`.
    pub async fn supports(&self, tenant: TenantId, class: DataClass) -> bool {
        let (response, rx) = oneshot::channel();
        if self
            .submit(ModemCommand::QuerySupport {
                tenant,
                class,
                response,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    async fn submit(&self, command: ModemCommand) -> Result<(), ModemError> {
        debug!(
            "-> modem {} {:?}",
            command.tenant(),
            command.token().map(|t| t.0)
        );
        self.tx.send(command).await.map_err(|_| ModemError::Closed)
    }
}
