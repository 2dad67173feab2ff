//! Virtual modem actor task
//!
//! This module runs a [`VirtualModem`] behind a [`ModemHandle`]. The task uses
//! a select! loop to:
//! - Accept modem commands and queue them for completion
//! - Complete queued commands in FIFO order after the configured latency
//! - Handle control commands (radio changes, fault injection, stats, shutdown)

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use dsw_modem::{DataClass, ModemCommand, ModemEvent, ModemHandle, RadioState, RequestToken, TenantId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::modem::{VirtualModem, VirtualModemConfig, VirtualModemStats};

/// Buffer size of the modem command inbox
const COMMAND_BUFFER: usize = 256;

/// Control commands for a running virtual modem
#[derive(Debug)]
pub enum VirtualModemCommand {
    /// Change a slot's radio state
    SetRadioState { tenant: TenantId, state: RadioState },
    /// Fail the next enable on a slot
    FailNextEnable(TenantId),
    /// Fail the next disable on a slot
    FailNextDisable(TenantId),
    /// Hold force-idle completions (and everything queued behind them)
    HoldForceIdle(bool),
    /// Report counters
    Stats(oneshot::Sender<VirtualModemStats>),
    /// Stop the task
    Shutdown,
}

/// Handle for steering a running virtual modem
#[derive(Debug, Clone)]
pub struct VirtualModemControl {
    tx: mpsc::Sender<VirtualModemCommand>,
}

impl VirtualModemControl {
    /// Wrap the control sender
    pub fn new(tx: mpsc::Sender<VirtualModemCommand>) -> Self {
        Self { tx }
    }

    /// Change a slot's radio state
    pub async fn set_radio_state(&self, tenant: TenantId, state: RadioState) {
        let _ = self
            .tx
            .send(VirtualModemCommand::SetRadioState { tenant, state })
            .await;
    }

    /// Fail the next enable on a slot
    pub async fn fail_next_enable(&self, tenant: TenantId) {
        let _ = self.tx.send(VirtualModemCommand::FailNextEnable(tenant)).await;
    }

    /// Fail the next disable on a slot
    pub async fn fail_next_disable(&self, tenant: TenantId) {
        let _ = self.tx.send(VirtualModemCommand::FailNextDisable(tenant)).await;
    }

    /// Hold or release force-idle completions
    pub async fn hold_force_idle(&self, hold: bool) {
        let _ = self.tx.send(VirtualModemCommand::HoldForceIdle(hold)).await;
    }

    /// Current counters, or `None` if the modem has stopped
    pub async fn stats(&self) -> Option<VirtualModemStats> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(VirtualModemCommand::Stats(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Stop the modem
    pub async fn shutdown(&self) {
        let _ = self.tx.send(VirtualModemCommand::Shutdown).await;
    }
}

#[derive(Debug)]
enum Operation {
    Enable(DataClass),
    Disable(DataClass),
    ForceIdle,
}

#[derive(Debug)]
struct Queued {
    due: Instant,
    tenant: TenantId,
    token: RequestToken,
    op: Operation,
}

/// Spawn a virtual modem on the current runtime
///
/// Returns the handle tenant switches talk to and a control handle for
/// driving the simulation.
pub fn spawn_virtual_modem(config: VirtualModemConfig) -> (ModemHandle, VirtualModemControl) {
    let (handle, cmd_rx) = ModemHandle::channel(COMMAND_BUFFER);
    let (control_tx, control_rx) = mpsc::channel(32);
    tokio::spawn(run_virtual_modem(cmd_rx, control_rx, config));
    (handle, VirtualModemControl::new(control_tx))
}

/// Run the virtual modem task
///
/// Commands complete strictly in submission order. Each completion is sent to
/// the tenant's sink, followed by `ClassConnected` for a successful enable.
pub async fn run_virtual_modem(
    mut cmd_rx: mpsc::Receiver<ModemCommand>,
    mut control_rx: mpsc::Receiver<VirtualModemCommand>,
    config: VirtualModemConfig,
) {
    let mut modem = VirtualModem::from_config(&config);
    let latency = Duration::from_millis(config.latency_ms);
    let mut sinks: HashMap<TenantId, mpsc::UnboundedSender<ModemEvent>> = HashMap::new();
    let mut queue: VecDeque<Queued> = VecDeque::new();
    let mut hold_force_idle = false;
    let mut control_open = true;

    info!("Virtual modem started with {} slots", modem.slot_count());

    loop {
        let next_due = queue
            .front()
            .filter(|q| !(hold_force_idle && matches!(q.op, Operation::ForceIdle)))
            .map(|q| q.due);

        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    debug!("Virtual modem command channel closed");
                    break;
                };
                match cmd {
                    ModemCommand::Attach { tenant, events } => {
                        if let Some(radio) = modem.radio(tenant) {
                            let _ = events.send(ModemEvent::RadioStateChanged { tenant, state: radio });
                        } else {
                            warn!("Attach from unknown slot {}", tenant);
                        }
                        sinks.insert(tenant, events);
                    }
                    ModemCommand::EnableClass { tenant, class, token } => {
                        queue.push_back(Queued { due: Instant::now() + latency, tenant, token, op: Operation::Enable(class) });
                    }
                    ModemCommand::DisableClass { tenant, class, token } => {
                        queue.push_back(Queued { due: Instant::now() + latency, tenant, token, op: Operation::Disable(class) });
                    }
                    ModemCommand::ForceIdle { tenant, token } => {
                        queue.push_back(Queued { due: Instant::now() + latency, tenant, token, op: Operation::ForceIdle });
                    }
                    ModemCommand::QuerySupport { tenant, class, response } => {
                        let _ = response.send(modem.supports(tenant, &class));
                    }
                }
            }

            ctl = control_rx.recv(), if control_open => {
                match ctl {
                    Some(VirtualModemCommand::SetRadioState { tenant, state }) => {
                        if modem.set_radio(tenant, state) {
                            info!("Virtual modem {} radio -> {}", tenant, state);
                            if let Some(sink) = sinks.get(&tenant) {
                                let _ = sink.send(ModemEvent::RadioStateChanged { tenant, state });
                            }
                        }
                    }
                    Some(VirtualModemCommand::FailNextEnable(tenant)) => modem.fail_next_enable(tenant, 1),
                    Some(VirtualModemCommand::FailNextDisable(tenant)) => modem.fail_next_disable(tenant, 1),
                    Some(VirtualModemCommand::HoldForceIdle(hold)) => {
                        debug!("Virtual modem force-idle hold {}", hold);
                        hold_force_idle = hold;
                    }
                    Some(VirtualModemCommand::Stats(response)) => {
                        let _ = response.send(modem.stats());
                    }
                    Some(VirtualModemCommand::Shutdown) => {
                        info!("Virtual modem shutdown requested");
                        break;
                    }
                    None => control_open = false,
                }
            }

            _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                complete_due(&mut modem, &mut queue, &sinks, hold_force_idle);
            }
        }
    }

    info!("Virtual modem stopped");
}

/// Complete every queued command whose time has come, in order
fn complete_due(
    modem: &mut VirtualModem,
    queue: &mut VecDeque<Queued>,
    sinks: &HashMap<TenantId, mpsc::UnboundedSender<ModemEvent>>,
    hold_force_idle: bool,
) {
    let now = Instant::now();
    while let Some(front) = queue.front() {
        if front.due > now || (hold_force_idle && matches!(front.op, Operation::ForceIdle)) {
            break;
        }
        let Some(Queued { tenant, token, op, .. }) = queue.pop_front() else {
            break;
        };

        let (result, connected) = match op {
            Operation::Enable(class) => {
                let result = modem.enable(tenant, &class);
                let connected = result.is_ok().then_some(class);
                (result, connected)
            }
            Operation::Disable(class) => (modem.disable(tenant, &class), None),
            Operation::ForceIdle => (modem.force_idle(tenant), None),
        };

        let Some(sink) = sinks.get(&tenant) else {
            warn!("Completion {} for unattached slot {}", token, tenant);
            continue;
        };
        let _ = sink.send(ModemEvent::Completed { tenant, token, result });
        if let Some(class) = connected {
            let _ = sink.send(ModemEvent::ClassConnected { tenant, class });
        }
    }
}
