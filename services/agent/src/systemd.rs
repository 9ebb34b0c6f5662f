//! Init-system connection boundary.
//!
//! The agent talks to the init system through [`SystemdConnection`], an
//! abstraction over the manager RPC API. Lifecycle calls block until the
//! init system acknowledges the job; callers needing timeouts wrap the
//! connection externally. [`MockSystemd`] implements the trait in memory
//! for tests and development.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Errors from init-system calls.
#[derive(Debug, Error)]
pub enum SystemdError {
    #[error("unsupported command {0:?}")]
    UnsupportedCommand(String),

    #[error("unit {unit}: {message}")]
    Failed { unit: String, message: String },

    #[error("connection error: {0}")]
    Connection(String),
}

/// Lifecycle commands the agent may run against a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitCommand {
    Start,
    Stop,
    Restart,
    TryRestart,
    ReloadOrRestart,
    ReloadOrTryRestart,
}

impl UnitCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::TryRestart => "try-restart",
            Self::ReloadOrRestart => "reload-or-restart",
            Self::ReloadOrTryRestart => "reload-or-try-restart",
        }
    }
}

impl fmt::Display for UnitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitCommand {
    type Err = SystemdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            // "reload" is an accepted alias: unit sources are rendered in
            // full, so a plain reload is never sufficient
            "restart" | "reload" => Ok(Self::Restart),
            "try-restart" => Ok(Self::TryRestart),
            "reload-or-restart" => Ok(Self::ReloadOrRestart),
            "reload-or-try-restart" => Ok(Self::ReloadOrTryRestart),
            other => Err(SystemdError::UnsupportedCommand(other.to_string())),
        }
    }
}

/// Connection to the init-system manager.
///
/// Lifecycle calls return once the init system reports the job complete; a
/// stuck unit blocks the calling task.
#[async_trait]
pub trait SystemdConnection: Send + Sync {
    /// Reload the init-system configuration (daemon-reload).
    async fn reload(&self) -> Result<(), SystemdError>;

    /// Run a lifecycle command against a unit and wait for completion.
    async fn run_command(&self, command: UnitCommand, unit_name: &str) -> Result<(), SystemdError>;

    /// Enable unit files so they survive reboot.
    async fn enable_unit_files(&self, paths: &[String], runtime: bool) -> Result<(), SystemdError>;

    /// Disable previously enabled unit files.
    async fn disable_unit_files(&self, names: &[String], runtime: bool)
        -> Result<(), SystemdError>;
}

/// In-memory init system for tests and development.
#[derive(Debug, Default)]
pub struct MockSystemd {
    state: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    units: BTreeMap<String, String>,
    enabled: BTreeSet<String>,
    log: Vec<String>,
    fail_units: BTreeSet<String>,
}

impl MockSystemd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every lifecycle command against `unit` fail.
    pub async fn fail_unit(&self, unit: &str) {
        self.state.lock().await.fail_units.insert(unit.to_string());
    }

    /// Active state of a unit, if any lifecycle command has touched it.
    pub async fn unit_state(&self, unit: &str) -> Option<String> {
        self.state.lock().await.units.get(unit).cloned()
    }

    /// All known unit states.
    pub async fn unit_states(&self) -> BTreeMap<String, String> {
        self.state.lock().await.units.clone()
    }

    pub async fn is_enabled(&self, unit: &str) -> bool {
        self.state.lock().await.enabled.contains(unit)
    }

    /// Recorded operations in execution order.
    pub async fn operations(&self) -> Vec<String> {
        self.state.lock().await.log.clone()
    }
}

#[async_trait]
impl SystemdConnection for MockSystemd {
    async fn reload(&self) -> Result<(), SystemdError> {
        debug!("[MOCK] daemon reload");
        self.state.lock().await.log.push("reload".to_string());
        Ok(())
    }

    async fn run_command(&self, command: UnitCommand, unit_name: &str) -> Result<(), SystemdError> {
        debug!(command = %command, unit = unit_name, "[MOCK] run command");
        let mut state = self.state.lock().await;
        state.log.push(format!("{command}:{unit_name}"));
        if state.fail_units.contains(unit_name) {
            return Err(SystemdError::Failed {
                unit: unit_name.to_string(),
                message: "injected failure".to_string(),
            });
        }
        match command {
            UnitCommand::Start | UnitCommand::Restart | UnitCommand::ReloadOrRestart => {
                state
                    .units
                    .insert(unit_name.to_string(), "active".to_string());
            }
            UnitCommand::TryRestart | UnitCommand::ReloadOrTryRestart => {
                if let Some(active) = state.units.get_mut(unit_name) {
                    *active = "active".to_string();
                }
            }
            UnitCommand::Stop => {
                state
                    .units
                    .insert(unit_name.to_string(), "inactive".to_string());
            }
        }
        Ok(())
    }

    async fn enable_unit_files(&self, paths: &[String], runtime: bool) -> Result<(), SystemdError> {
        debug!(?paths, runtime, "[MOCK] enable unit files");
        let mut state = self.state.lock().await;
        for path in paths {
            let name = path.rsplit('/').next().unwrap_or(path).to_string();
            state.log.push(format!("enable:{name}"));
            state.enabled.insert(name);
        }
        Ok(())
    }

    async fn disable_unit_files(
        &self,
        names: &[String],
        runtime: bool,
    ) -> Result<(), SystemdError> {
        debug!(?names, runtime, "[MOCK] disable unit files");
        let mut state = self.state.lock().await;
        for name in names {
            state.log.push(format!("disable:{name}"));
            state.enabled.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_command_parse() {
        assert_eq!("start".parse::<UnitCommand>().unwrap(), UnitCommand::Start);
        assert_eq!(
            "reload".parse::<UnitCommand>().unwrap(),
            UnitCommand::Restart
        );
        assert_eq!(
            "reload-or-try-restart".parse::<UnitCommand>().unwrap(),
            UnitCommand::ReloadOrTryRestart
        );
    }

    #[test]
    fn test_unit_command_rejects_unknown() {
        let err = "explode".parse::<UnitCommand>().unwrap_err();
        assert!(matches!(err, SystemdError::UnsupportedCommand(cmd) if cmd == "explode"));
    }

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let sd = MockSystemd::new();
        sd.run_command(UnitCommand::Start, "unit-1.service")
            .await
            .unwrap();
        assert_eq!(
            sd.unit_state("unit-1.service").await.as_deref(),
            Some("active")
        );

        sd.run_command(UnitCommand::Stop, "unit-1.service")
            .await
            .unwrap();
        assert_eq!(
            sd.unit_state("unit-1.service").await.as_deref(),
            Some("inactive")
        );
    }

    #[tokio::test]
    async fn test_mock_try_restart_skips_unknown_units() {
        let sd = MockSystemd::new();
        sd.run_command(UnitCommand::TryRestart, "unknown.service")
            .await
            .unwrap();
        assert!(sd.unit_state("unknown.service").await.is_none());
    }

    #[tokio::test]
    async fn test_mock_enable_disable() {
        let sd = MockSystemd::new();
        sd.enable_unit_files(&["/run/systemd/system/unit-1.service".to_string()], true)
            .await
            .unwrap();
        assert!(sd.is_enabled("unit-1.service").await);

        sd.disable_unit_files(&["unit-1.service".to_string()], true)
            .await
            .unwrap();
        assert!(!sd.is_enabled("unit-1.service").await);
    }

    #[tokio::test]
    async fn test_mock_failure_injection() {
        let sd = MockSystemd::new();
        sd.fail_unit("bad.service").await;
        let err = sd
            .run_command(UnitCommand::Start, "bad.service")
            .await
            .unwrap_err();
        assert!(matches!(err, SystemdError::Failed { unit, .. } if unit == "bad.service"));
    }
}
