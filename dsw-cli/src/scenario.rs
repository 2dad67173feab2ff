//! Scenario execution
//!
//! A scenario is a list of steps run against a fresh virtual modem and data
//! switch. Every [`SwitchEvent`] is logged while the steps run, and the
//! resulting [`ScenarioReport`] carries the final arbitrator status and the
//! modem's counters.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use dsw_modem::{DataClass, RadioState, TenantId};
use dsw_sim::{spawn_virtual_modem, VirtualModemControl, VirtualModemStats};
use dsw_switch::{ArbitratorStatus, DataSwitch, SwitchEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::settings::Settings;

/// One scenario step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScenarioStep {
    /// Ask the arbitrator to activate a class
    Activate { tenant: TenantId, class: DataClass },
    /// Ask the arbitrator to deactivate a class
    Deactivate { tenant: TenantId, class: DataClass },
    /// Change a slot's radio state on the virtual modem
    Radio { tenant: TenantId, state: RadioState },
    /// Make the slot's next enable fail
    FailNextEnable { tenant: TenantId },
    /// Sleep
    Wait { ms: u64 },
    /// Log the arbitrator status
    Status,
}

impl fmt::Display for ScenarioStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioStep::Activate { tenant, class } => write!(f, "activate {} on {}", class, tenant),
            ScenarioStep::Deactivate { tenant, class } => {
                write!(f, "deactivate {} on {}", class, tenant)
            }
            ScenarioStep::Radio { tenant, state } => write!(f, "radio {} on {}", state, tenant),
            ScenarioStep::FailNextEnable { tenant } => write!(f, "fail next enable on {}", tenant),
            ScenarioStep::Wait { ms } => write!(f, "wait {}ms", ms),
            ScenarioStep::Status => f.write_str("status"),
        }
    }
}

/// What a step produced
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub step: ScenarioStep,
    pub result: String,
}

/// Outcome of a scenario run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    /// Per-step results in execution order
    pub steps: Vec<StepRecord>,
    /// Arbitrator status after the settle period
    pub status: ArbitratorStatus,
    /// Virtual modem counters after the settle period
    pub stats: VirtualModemStats,
    /// Logged events, up to the configured limit
    pub events: Vec<String>,
    /// Events not kept, either past the limit or lost to lag
    pub events_dropped: u64,
}

impl ScenarioReport {
    /// Whether the modem ever saw two slots on the data path
    pub fn violated(&self) -> bool {
        self.stats.violations > 0
    }
}

#[derive(Debug, Default)]
struct EventLog {
    events: Vec<String>,
    dropped: u64,
}

/// Run a scenario on a fresh virtual modem
pub async fn run_scenario(settings: &Settings) -> anyhow::Result<ScenarioReport> {
    settings.validate()?;

    let (modem, control) = spawn_virtual_modem(settings.modem.clone());
    let switch = DataSwitch::start(settings.arbitrator.clone(), modem)
        .await
        .context("Failed to start data switch")?;
    let logger = tokio::spawn(log_events(
        switch.subscribe_events(),
        settings.event_log_limit,
    ));

    let mut steps = Vec::with_capacity(settings.scenario.len());
    for (index, step) in settings.scenario.iter().enumerate() {
        info!("Step {}: {}", index, step);
        let result = execute(step, &switch, &control).await?;
        debug!("Step {} -> {}", index, result);
        steps.push(StepRecord {
            index,
            step: step.clone(),
            result,
        });
    }

    if settings.settle_ms > 0 {
        tokio::time::sleep(Duration::from_millis(settings.settle_ms)).await;
    }

    let status = switch
        .arbitrator()
        .status()
        .await
        .context("Arbitrator stopped before the final status")?;
    let stats = control
        .stats()
        .await
        .context("Virtual modem stopped before reporting")?;

    switch.shutdown().await.context("Switch task failed")?;
    control.shutdown().await;
    let log = logger.await.context("Event logger failed")?;

    info!(
        "Scenario finished: owner {:?}, {} modem commands, {} violations",
        status.current_owner, stats.commands, stats.violations
    );

    Ok(ScenarioReport {
        steps,
        status,
        stats,
        events: log.events,
        events_dropped: log.dropped,
    })
}

async fn execute(
    step: &ScenarioStep,
    switch: &DataSwitch,
    control: &VirtualModemControl,
) -> anyhow::Result<String> {
    let arbitrator = switch.arbitrator();
    let result = match step {
        ScenarioStep::Activate { tenant, class } => {
            format!("{:?}", arbitrator.activate(*tenant, class.clone()).await)
        }
        ScenarioStep::Deactivate { tenant, class } => {
            format!("{:?}", arbitrator.deactivate(*tenant, class.clone()).await)
        }
        ScenarioStep::Radio { tenant, state } => {
            control.set_radio_state(*tenant, *state).await;
            format!("radio {}", state)
        }
        ScenarioStep::FailNextEnable { tenant } => {
            control.fail_next_enable(*tenant).await;
            "armed".to_string()
        }
        ScenarioStep::Wait { ms } => {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            format!("waited {}ms", ms)
        }
        ScenarioStep::Status => {
            let status = arbitrator
                .status()
                .await
                .context("Arbitrator stopped during the scenario")?;
            let json = serde_json::to_string(&status)?;
            info!("Status: {}", json);
            json
        }
    };
    Ok(result)
}

async fn log_events(mut rx: broadcast::Receiver<SwitchEvent>, limit: usize) -> EventLog {
    let mut log = EventLog::default();
    loop {
        match rx.recv().await {
            Ok(event) => {
                if event.is_failure() {
                    warn!("Event: {:?}", event);
                } else {
                    info!("Event: {:?}", event);
                }
                if log.events.len() < limit {
                    log.events.push(format!("{:?}", event));
                } else {
                    log.dropped += 1;
                }
            }
            Err(RecvError::Lagged(n)) => {
                warn!("Event log lagged, {} events lost", n);
                log.dropped += n;
            }
            Err(RecvError::Closed) => break,
        }
    }
    log
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsw_sim::VirtualModemConfig;

    fn class(label: &str) -> DataClass {
        label.parse().unwrap()
    }

    fn settings(scenario: Vec<ScenarioStep>) -> Settings {
        Settings {
            modem: VirtualModemConfig::with_slots(2),
            scenario,
            settle_ms: 100,
            ..Settings::default()
        }
    }

    #[test]
    fn test_step_json() {
        let json = r#"[
            {"step": "activate", "tenant": 1, "class": "mms"},
            {"step": "radio", "tenant": 0, "state": "off"},
            {"step": "fail_next_enable", "tenant": 0},
            {"step": "status"}
        ]"#;
        let steps: Vec<ScenarioStep> = serde_json::from_str(json).unwrap();

        assert_eq!(
            steps,
            vec![
                ScenarioStep::Activate {
                    tenant: TenantId(1),
                    class: class("mms"),
                },
                ScenarioStep::Radio {
                    tenant: TenantId(0),
                    state: RadioState::Off,
                },
                ScenarioStep::FailNextEnable { tenant: TenantId(0) },
                ScenarioStep::Status,
            ]
        );
    }

    #[test]
    fn test_unknown_class_rejected() {
        let json = r#"{"step": "activate", "tenant": 0, "class": "internet"}"#;
        assert!(serde_json::from_str::<ScenarioStep>(json).is_err());
    }

    #[test]
    fn test_step_display() {
        let step = ScenarioStep::Activate {
            tenant: TenantId(1),
            class: class("supl"),
        };
        assert_eq!(step.to_string(), "activate supl on slot1");
        assert_eq!(ScenarioStep::Wait { ms: 5 }.to_string(), "wait 5ms");
    }

    #[tokio::test]
    async fn test_handoff_scenario() {
        let report = run_scenario(&settings(vec![
            ScenarioStep::Activate {
                tenant: TenantId(0),
                class: class("default"),
            },
            ScenarioStep::Wait { ms: 100 },
            ScenarioStep::Activate {
                tenant: TenantId(1),
                class: class("mms"),
            },
        ]))
        .await
        .unwrap();

        assert_eq!(report.steps.len(), 3);
        assert_eq!(report.steps[0].result, "Started");
        assert_eq!(report.status.current_owner, Some(TenantId(1)));
        assert_eq!(report.stats.holder, Some(TenantId(1)));
        assert_eq!(report.stats.active_classes, vec![class("mms")]);
        assert!(!report.violated());
        assert!(report.events.iter().any(|e| e.contains("OwnerChanged")));
    }

    #[tokio::test]
    async fn test_default_scenario_releases_everything() {
        let mut settings = Settings::default();
        settings.modem = VirtualModemConfig::with_slots(2);

        let report = run_scenario(&settings).await.unwrap();

        assert_eq!(report.status.current_owner, None);
        assert_eq!(report.stats.holder, None);
        assert_eq!(report.stats.violations, 0);
    }

    #[tokio::test]
    async fn test_enable_failure_reported() {
        let report = run_scenario(&settings(vec![
            ScenarioStep::FailNextEnable { tenant: TenantId(0) },
            ScenarioStep::Activate {
                tenant: TenantId(0),
                class: class("default"),
            },
        ]))
        .await
        .unwrap();

        assert!(report.events.iter().any(|e| e.contains("RequestFailed")));
        assert_eq!(report.status.current_owner, None);
        assert_eq!(report.stats.holder, None);
    }

    #[tokio::test]
    async fn test_radio_off_rejects_activation() {
        let report = run_scenario(&settings(vec![
            ScenarioStep::Radio {
                tenant: TenantId(1),
                state: RadioState::Off,
            },
            ScenarioStep::Wait { ms: 50 },
            ScenarioStep::Activate {
                tenant: TenantId(1),
                class: class("default"),
            },
        ]))
        .await
        .unwrap();

        assert!(report.steps[2].result.starts_with("Failed"));
        assert_eq!(report.status.current_owner, None);
    }

    #[tokio::test]
    async fn test_event_log_limit() {
        let mut settings = settings(vec![ScenarioStep::Activate {
            tenant: TenantId(0),
            class: class("default"),
        }]);
        settings.event_log_limit = 0;

        let report = run_scenario(&settings).await.unwrap();

        assert!(report.events.is_empty());
        assert!(report.events_dropped > 0);
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_before_start() {
        let mut settings = settings(Vec::new());
        settings.arbitrator.tenant_count = 4;

        assert!(run_scenario(&settings).await.is_err());
    }
}
